/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

use loam::Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] loam::Error),

    #[error("DWARF: {0}")]
    Dwarf(#[from] gimli::Error),

    /// The debug info and the runtime's own tables disagree about something fundamental; the
    /// analysis cannot be trusted past this point.
    #[error("corrupt image: {0}")]
    CorruptFormat(String),

    /// An internal consistency check failed. Always a bug, either here or in the dump.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("address {0} is not a live heap object")]
    NotAnObject(Addr),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Exit status for the CLI: unsupported inputs exit 2, everything else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Load(loam::Error::UnsupportedContainer(_)) | Error::Load(loam::Error::UnsupportedArch(_)) => 2,
            _ => 1,
        }
    }
}
