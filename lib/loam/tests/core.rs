/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! End-to-end loader test against a synthetic ELF core built byte-by-byte: mapping coverage,
//! zero-filled extensions, note decoding, and the missing-executable degradation path.

use loam::{Addr, Perm};
use std::path::PathBuf;

struct CoreBuilder {
    bytes: Vec<u8>,
}

impl CoreBuilder {
    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn pad_to(&mut self, len: usize) {
        assert!(self.bytes.len() <= len);
        self.bytes.resize(len, 0);
    }
}

fn note(out: &mut Vec<u8>, entry_type: u32, desc: &[u8]) {
    out.extend_from_slice(&5u32.to_le_bytes()); // "CORE\0"
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&entry_type.to_le_bytes());
    out.extend_from_slice(b"CORE\0\0\0\0");
    out.extend_from_slice(desc);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn prstatus(pid: u32, pc: u64, sp: u64) -> Vec<u8> {
    let mut desc = vec![0u8; 112 + 27 * 8];
    desc[32..36].copy_from_slice(&pid.to_le_bytes());
    desc[112 + 16 * 8..112 + 17 * 8].copy_from_slice(&pc.to_le_bytes()); // rip
    desc[112 + 19 * 8..112 + 20 * 8].copy_from_slice(&sp.to_le_bytes()); // rsp
    desc
}

fn prpsinfo(args: &str) -> Vec<u8> {
    let mut desc = vec![0u8; 136];
    desc[56..56 + args.len()].copy_from_slice(args.as_bytes());
    desc
}

fn auxv(entry: u64) -> Vec<u8> {
    let mut desc = Vec::new();
    for (key, value) in [(9u64, entry), (0, 0)] {
        desc.extend_from_slice(&key.to_le_bytes());
        desc.extend_from_slice(&value.to_le_bytes());
    }
    desc
}

fn file_note(min: u64, max: u64, path: &str) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&1u64.to_le_bytes());
    desc.extend_from_slice(&4096u64.to_le_bytes());
    desc.extend_from_slice(&min.to_le_bytes());
    desc.extend_from_slice(&max.to_le_bytes());
    desc.extend_from_slice(&0u64.to_le_bytes());
    desc.extend_from_slice(path.as_bytes());
    desc.push(0);
    desc
}

/// A core with one note segment, one r-x segment whose memory size exceeds its file size, and one
/// rw segment.
fn build_core() -> Vec<u8> {
    let mut notes = Vec::new();
    note(&mut notes, 1, &prstatus(1234, 0x400123, 0x7ffd000));
    note(&mut notes, 3, &prpsinfo("fakeprog --flag"));
    note(&mut notes, 6, &auxv(0x400500));
    note(&mut notes, 0x46494c45, &file_note(0x400000, 0x401000, "/taproot-test/no/such/file"));

    let notes_offset = 64 + 3 * 56;
    let text_offset = (notes_offset + notes.len() + 15) & !15;
    let data_offset = text_offset + 0x1000;

    let mut core = CoreBuilder { bytes: Vec::new() };
    // ELF header.
    core.bytes.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    core.pad_to(16);
    core.bytes.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
    core.bytes.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    core.u32(1);
    core.u64(0); // entry
    core.u64(64); // phoff
    core.u64(0); // shoff
    core.u32(0);
    core.bytes.extend_from_slice(&64u16.to_le_bytes());
    core.bytes.extend_from_slice(&56u16.to_le_bytes());
    core.bytes.extend_from_slice(&3u16.to_le_bytes());
    core.bytes.extend_from_slice(&0u16.to_le_bytes());
    core.bytes.extend_from_slice(&0u16.to_le_bytes());
    core.bytes.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(core.bytes.len(), 64);

    // PT_NOTE, then the two loadable segments.
    let phdr = |core: &mut CoreBuilder, typ: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64| {
        core.u32(typ);
        core.u32(flags);
        core.u64(offset);
        core.u64(vaddr);
        core.u64(vaddr);
        core.u64(filesz);
        core.u64(memsz);
        core.u64(0x1000);
    };
    phdr(&mut core, 4, 4, notes_offset as u64, 0, notes.len() as u64, 0);
    phdr(&mut core, 1, 5, text_offset as u64, 0x400000, 0x1000, 0x2000);
    phdr(&mut core, 1, 6, data_offset as u64, 0x500000, 0x1000, 0x1000);

    core.bytes.extend_from_slice(&notes);
    core.pad_to(text_offset);
    core.bytes.extend_from_slice(&[0xab; 0x1000]);
    core.bytes.extend_from_slice(&[0xcd; 0x1000]);
    core.bytes
}

#[test]
fn load_synthetic_core() {
    let path: PathBuf =
        std::env::temp_dir().join(format!("loam-test-core-{}", std::process::id()));
    std::fs::write(&path, build_core()).unwrap();

    let image = loam::load(&path, None, None).unwrap();

    // Mapping coverage: every byte present on disk is readable, unmapped addresses are not, and
    // the returned mappings do not overlap.
    assert!(image.readable(Addr(0x400000)));
    assert!(image.readable_n(Addr(0x400000), 0x2000));
    assert!(!image.readable(Addr(0x3ff000)));
    assert!(!image.readable(Addr(0x402000)));
    let mappings = image.mappings();
    for pair in mappings.windows(2) {
        assert!(pair[0].max <= pair[1].min);
    }

    // Bytes present in the core read back; the zero-filled extension reads as zeroes.
    assert_eq!(image.read_u8(Addr(0x400000)).unwrap(), 0xab);
    assert_eq!(image.read_u8(Addr(0x400fff)).unwrap(), 0xab);
    assert_eq!(image.read_u8(Addr(0x401800)).unwrap(), 0);
    assert_eq!(image.read_u8(Addr(0x500010)).unwrap(), 0xcd);

    // Permissions survive.
    let text = image.mapping_for(Addr(0x400000)).unwrap();
    assert_eq!(text.perm, Perm::READ | Perm::EXEC);
    assert!(image.writable(Addr(0x500000)));
    assert!(!image.writable(Addr(0x400000)));

    // The file-mapping note attached provenance to the text mapping.
    assert_eq!(
        text.orig_source.as_ref().map(|s| s.path.clone()),
        Some(PathBuf::from("/taproot-test/no/such/file"))
    );

    // Thread and process notes.
    assert_eq!(image.threads().len(), 1);
    assert_eq!(image.threads()[0].pid, 1234);
    assert_eq!(image.threads()[0].pc, Addr(0x400123));
    assert_eq!(image.threads()[0].sp, Addr(0x7ffd000));
    assert_eq!(image.args(), "fakeprog --flag");
    assert_eq!(image.executable_path(), Some("fakeprog"));
    assert_eq!(image.entry_point(), Addr(0x400500));

    // The executable cannot be found: debug info is deferred-missing, and a warning was logged.
    assert!(image.debug_data().is_err());
    assert!(!image.warnings().is_empty());

    std::fs::remove_file(&path).unwrap();
}
