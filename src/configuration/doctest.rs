// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Only for writing convenient doctests

use tempfile::NamedTempFile;
pub fn generate_example_yaml() -> NamedTempFile {
    use std::io::BufWriter;
    use std::io::Write;

    let file = NamedTempFile::new().expect("Unable to create named temporary file");

    {
        let mut f = BufWriter::new(&file);
        let data = concat!(
            "version: 0.1.0\n",
            "ports:\n",
            "  eth0:\n",
            "    link_speed_bps: 100000000\n",
            "    streams:\n",
            "      - id: \"91:e0:f0:00:fe:00:00:01\"\n",
            "        class: high\n",
            "        vlan_id: 2\n",
            "        idle_slope_bps: 10000000\n",
            "        frame_size: 64\n");
        f.write_all(data.as_bytes()).expect("Unable to write data");
        f.flush().expect("Flush failed");
    }

    file
}
