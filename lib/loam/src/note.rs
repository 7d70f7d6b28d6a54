/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Decoding of the `CORE`-named note records a Linux core dump carries.

use crate::{addr::Addr, arch::Arch, Error};
use scroll::{Endian, Pread};
use std::path::PathBuf;

pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_FILE: u32 = 0x46494c45;

const AT_ENTRY: u64 = 9;

/// One entry of an `NT_FILE` note: a region of the address space that was mapped from a file.
#[derive(Clone, Debug)]
pub struct FileMapping {
    pub min: Addr,
    pub max: Addr,
    pub path: PathBuf,
    /// Offset of the region within the file, in bytes.
    pub offset: u64,
}

/// An OS thread captured by an `NT_PRSTATUS` note.
#[derive(Clone, Debug)]
pub struct ThreadState {
    pub pid: u64,
    /// Raw register block, in kernel order. Renumber via [`Arch::dwarf_registers`].
    pub regs: Vec<u64>,
    pub pc: Addr,
    pub sp: Addr,
}

/// `NT_FILE`: a page-size scalar, `count` triples of `{start, end, file offset in pages}`, then a
/// packed table of null-terminated path names.
pub fn parse_file_note(desc: &[u8], endian: Endian) -> Result<Vec<FileMapping>, Error> {
    let corrupt = || Error::CorruptFormat("truncated NT_FILE note".to_string());

    let count = desc.pread_with::<u64>(0, endian).map_err(|_| corrupt())? as usize;
    let page_size = desc.pread_with::<u64>(8, endian).map_err(|_| corrupt())?;

    let strings_offset = 16 + count * 24;
    let mut strings = desc.get(strings_offset..).ok_or_else(corrupt)?;

    let mut mappings = Vec::with_capacity(count);
    for i in 0..count {
        let entry = 16 + i * 24;
        let min = desc.pread_with::<u64>(entry, endian).map_err(|_| corrupt())?;
        let max = desc.pread_with::<u64>(entry + 8, endian).map_err(|_| corrupt())?;
        let offset_pages = desc.pread_with::<u64>(entry + 16, endian).map_err(|_| corrupt())?;

        let end = strings.iter().position(|&c| c == 0).ok_or_else(corrupt)?;
        let path = PathBuf::from(String::from_utf8_lossy(&strings[..end]).into_owned());
        strings = &strings[end + 1..];

        mappings.push(FileMapping {
            min: Addr(min),
            max: Addr(max),
            path,
            offset: offset_pages * page_size,
        });
    }
    Ok(mappings)
}

/// `NT_PRSTATUS`: signal bookkeeping, the thread id at offset 32, and the register block at
/// offset 112.
pub fn parse_prstatus(desc: &[u8], endian: Endian, arch: Arch) -> Result<ThreadState, Error> {
    let corrupt = || Error::CorruptFormat("truncated NT_PRSTATUS note".to_string());

    let pid = desc.pread_with::<u32>(32, endian).map_err(|_| corrupt())? as u64;
    let mut regs = Vec::with_capacity(arch.prstatus_reg_count());
    for i in 0..arch.prstatus_reg_count() {
        regs.push(desc.pread_with::<u64>(112 + i * 8, endian).map_err(|_| corrupt())?);
    }

    let pc = Addr(regs[arch.pc_index()]);
    let sp = Addr(regs[arch.sp_index()]);
    Ok(ThreadState { pid, regs, pc, sp })
}

/// `NT_PRPSINFO`: we only want `pr_psargs`, the first 80 bytes of the command line.
pub fn parse_prpsinfo(desc: &[u8]) -> Option<String> {
    let args = desc.get(56..136)?;
    let end = args.iter().position(|&c| c == 0).unwrap_or(args.len());
    Some(String::from_utf8_lossy(&args[..end]).trim().to_string())
}

/// `NT_AUXV`: `(type, value)` pairs; we want `AT_ENTRY`, the program entry point after any PIE
/// relocation.
pub fn parse_auxv_entry_point(desc: &[u8], endian: Endian) -> Option<Addr> {
    let mut offset = 0;
    while offset + 16 <= desc.len() {
        let key = desc.pread_with::<u64>(offset, endian).ok()?;
        let value = desc.pread_with::<u64>(offset + 8, endian).ok()?;
        if key == AT_ENTRY {
            return Some(Addr(value));
        }
        if key == 0 {
            break;
        }
        offset += 16;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_note_roundtrip() {
        let mut desc = Vec::new();
        desc.extend_from_slice(&2u64.to_le_bytes());
        desc.extend_from_slice(&4096u64.to_le_bytes());
        for (min, max, off) in [(0x400000u64, 0x401000u64, 0u64), (0x7f0000000000, 0x7f0000004000, 3)] {
            desc.extend_from_slice(&min.to_le_bytes());
            desc.extend_from_slice(&max.to_le_bytes());
            desc.extend_from_slice(&off.to_le_bytes());
        }
        desc.extend_from_slice(b"/bin/prog\0/lib/libc.so.6\0");

        let mappings = parse_file_note(&desc, Endian::Little).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].path, PathBuf::from("/bin/prog"));
        assert_eq!(mappings[0].min, Addr(0x400000));
        assert_eq!(mappings[0].offset, 0);
        assert_eq!(mappings[1].path, PathBuf::from("/lib/libc.so.6"));
        assert_eq!(mappings[1].offset, 3 * 4096);
    }

    #[test]
    fn auxv_entry() {
        let mut desc = Vec::new();
        for (key, value) in [(3u64, 0x400040u64), (9, 0x401a30), (0, 0)] {
            desc.extend_from_slice(&key.to_le_bytes());
            desc.extend_from_slice(&value.to_le_bytes());
        }
        assert_eq!(parse_auxv_entry_point(&desc, Endian::Little), Some(Addr(0x401a30)));
        assert_eq!(parse_auxv_entry_point(&desc[..16], Endian::Little), None);
    }
}
