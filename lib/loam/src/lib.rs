/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! `loam` turns an ELF core dump (plus, when available, the executable it came from) back into a
//! process: a merged, page-indexed view of the address space, the register state of every OS
//! thread, the command line, and the raw debug data. It knows nothing about any language runtime;
//! that is the analyzer's job, one crate up.

pub mod addr;
pub mod arch;
pub mod image;
pub mod mappings;
pub mod note;
pub mod pagetable;

pub use addr::Addr;
pub use arch::{Arch, RegisterFile};
pub use image::{load, DebugData, ProcessBuilder, ProcessImage};
pub use mappings::{Mapping, Perm, Source};
pub use note::ThreadState;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file is not an ELF core of a kind we understand. Fatal at load.
    #[error("unsupported container: {0}")]
    UnsupportedContainer(String),

    /// The core's architecture has no decoder here. Fatal at load.
    #[error("unsupported architecture: ELF machine {0}")]
    UnsupportedArch(u16),

    /// A note or segment that must be intact is not. Fatal at load.
    #[error("corrupt core: {0}")]
    CorruptFormat(String),

    #[error("{}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Elf(#[from] alder::ElfError),

    /// A read touched an address no mapping covers.
    #[error("address {0} is not mapped")]
    Unmapped(Addr),

    /// Debug info was absent or unreadable at load time; raised on first use rather than up
    /// front, since many queries never need it.
    #[error("no debug info: {0}")]
    MissingDebugInfo(String),
}
