// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod configuration;
pub mod controller;
pub mod pi;
pub mod port_driver;
pub mod ptp;
pub mod qos;
pub mod queue;
pub mod rational;
pub mod ring_mask;
pub mod shaper;
pub mod simulation;
pub mod socket;
pub mod sr_class;
