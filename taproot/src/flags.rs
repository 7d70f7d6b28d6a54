/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

use std::path::PathBuf;

xflags::xflags! {
    /// Post-mortem analyzer for Go core dumps.
    cmd taproot {
        /// The core file to analyze.
        required core: PathBuf
        /// The executable that produced the core. Defaults to the one recorded in the core's
        /// file-mapping table.
        optional --exe exe: PathBuf
        /// Directory to search for the executable and shared libraries when the paths recorded
        /// in the core do not exist here.
        optional --base base: PathBuf

        /// Print process-level facts: architecture, runtime version, total mapped memory.
        cmd overview {}
        /// List the reconstructed memory mappings.
        cmd mappings {}
        /// List goroutines with their backtraces.
        cmd goroutines {}
        /// Live objects bucketed by type, largest total first.
        cmd histogram {}
        /// The memory-breakdown tree.
        cmd breakdown {}
        /// List every live object.
        cmd objects {}
        /// Write the object graph as DOT.
        cmd objgraph {
            /// Output path.
            optional out: PathBuf
        }
        /// Print the shortest root-to-object path keeping an address alive.
        cmd reachable {
            /// Object address (hex, with or without 0x).
            required addr: String
        }
        /// Hexdump process memory.
        cmd read {
            /// Address to read from (hex, with or without 0x).
            required addr: String
            /// Number of bytes (default 256).
            optional size: u64
        }
    }
}
