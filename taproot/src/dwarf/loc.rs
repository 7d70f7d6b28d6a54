/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The location-list machinery: splitting a `.debug_loc` list into pc-ranged entries, and a small
//! stack machine that evaluates the expression programs inside them. The Go compiler emits a
//! narrow, stable subset of DWARF expressions - constant addresses, frame-base offsets, register
//! selections, and piece composition - so this does not try to be a general evaluator.

use crate::{Error, Result};
use loam::{Addr, ProcessImage, RegisterFile};
use scroll::{Endian, Pread};

/// One pc range of a location list, with its raw expression program.
#[derive(Clone, Debug)]
pub struct LocEntry {
    pub low: Addr,
    pub high: Addr,
    pub program: Vec<u8>,
}

/// Split the DWARF 4 location list at `offset` in the raw loclist blob. Base-address-selection
/// entries switch the base; ordinary entries are offsets from it. `cu_base` seeds the base, and
/// `static_base` applies the PIE relocation.
pub fn parse_loclist(
    blob: &[u8],
    offset: usize,
    cu_base: u64,
    static_base: u64,
    endian: Endian,
) -> Result<Vec<LocEntry>> {
    let corrupt = || Error::CorruptFormat(format!("truncated location list at {offset:#x}"));

    let mut entries = Vec::new();
    let mut cursor = offset;
    let mut base = cu_base;
    loop {
        let low = blob.pread_with::<u64>(cursor, endian).map_err(|_| corrupt())?;
        let high = blob.pread_with::<u64>(cursor + 8, endian).map_err(|_| corrupt())?;
        cursor += 16;

        if low == 0 && high == 0 {
            return Ok(entries);
        }
        if low == u64::MAX {
            base = high;
            continue;
        }

        let len = blob.pread_with::<u16>(cursor, endian).map_err(|_| corrupt())? as usize;
        cursor += 2;
        let program = blob.get(cursor..cursor + len).ok_or_else(corrupt)?.to_vec();
        cursor += len;

        entries.push(LocEntry {
            low: Addr(base + low + static_base),
            high: Addr(base + high + static_base),
            program,
        });
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PieceKind {
    /// The piece lives in memory at `value`.
    Address,
    /// The piece lived in a register; `value` is the register's content at unwind time.
    Register,
    /// The piece is the literal `value` (a DWARF stack value, or an optimized-out hole).
    Immediate,
}

#[derive(Clone, Copy, Debug)]
pub struct Piece {
    pub kind: PieceKind,
    pub value: u64,
    pub size: u64,
}

/// What a location program evaluates to.
#[derive(Clone, Debug)]
pub enum Location {
    /// The whole object is in memory at this address.
    Address(Addr),
    /// The object is assembled from pieces.
    Pieces(Vec<Piece>),
}

/// Evaluate a location expression against a register file and a CFA. `size` is the byte size of
/// the variable, used when a bare register selection stands for the whole object. Register
/// contents are resolved immediately - a location is only meaningful at the pc it was captured
/// at, so there is no value in keeping the register number around.
pub fn evaluate(
    program: &[u8],
    regs: &RegisterFile,
    cfa: u64,
    size: u64,
    static_base: u64,
    image: &ProcessImage,
) -> Result<Location> {
    let mut stack: Vec<u64> = Vec::new();
    let mut reg: Option<u16> = None;
    let mut stack_value = false;
    let mut pieces: Vec<Piece> = Vec::new();
    let mut cursor = Cursor { bytes: program, pos: 0 };

    while let Some(op) = cursor.next_u8() {
        match op {
            0x03 => stack.push(cursor.u64(image)?.wrapping_add(static_base)), // DW_OP_addr
            0x06 => {
                // DW_OP_deref
                let addr = stack.pop().ok_or_else(|| bad(program, "deref on empty stack"))?;
                stack.push(image.read_uint(Addr(addr)).map_err(Error::Load)?);
            }
            0x08 => stack.push(cursor.u8()? as u64),          // DW_OP_const1u
            0x09 => stack.push(cursor.u8()? as i8 as u64),    // DW_OP_const1s
            0x0a => stack.push(cursor.u16(image)? as u64),    // DW_OP_const2u
            0x0b => stack.push(cursor.u16(image)? as i16 as u64), // DW_OP_const2s
            0x0c => stack.push(cursor.u32(image)? as u64),    // DW_OP_const4u
            0x0d => stack.push(cursor.u32(image)? as i32 as u64), // DW_OP_const4s
            0x0e | 0x0f => stack.push(cursor.u64(image)?),    // DW_OP_const8u/s
            0x10 => stack.push(cursor.uleb()?),               // DW_OP_constu
            0x11 => stack.push(cursor.sleb()? as u64),        // DW_OP_consts
            0x12 => {
                // DW_OP_dup
                let top = *stack.last().ok_or_else(|| bad(program, "dup on empty stack"))?;
                stack.push(top);
            }
            0x13 => {
                stack.pop(); // DW_OP_drop
            }
            0x1a | 0x1c | 0x1e | 0x21 | 0x22 | 0x24 | 0x25 | 0x27 => {
                let b = stack.pop().ok_or_else(|| bad(program, "binary op on empty stack"))?;
                let a = stack.pop().ok_or_else(|| bad(program, "binary op on empty stack"))?;
                stack.push(match op {
                    0x1a => a & b,                 // DW_OP_and
                    0x1c => a.wrapping_sub(b),     // DW_OP_minus
                    0x1e => a.wrapping_mul(b),     // DW_OP_mul
                    0x21 => a | b,                 // DW_OP_or
                    0x22 => a.wrapping_add(b),     // DW_OP_plus
                    0x24 => a.wrapping_shl(b as u32), // DW_OP_shl
                    0x25 => a.wrapping_shr(b as u32), // DW_OP_shr
                    _ => a ^ b,                    // DW_OP_xor
                });
            }
            0x23 => {
                // DW_OP_plus_uconst
                let addend = cursor.uleb()?;
                let top = stack.pop().ok_or_else(|| bad(program, "plus_uconst on empty stack"))?;
                stack.push(top.wrapping_add(addend));
            }
            0x30..=0x4f => stack.push((op - 0x30) as u64), // DW_OP_lit0..31
            0x50..=0x6f => reg = Some((op - 0x50) as u16), // DW_OP_reg0..31
            0x70..=0x8f => {
                // DW_OP_breg0..31
                let offset = cursor.sleb()?;
                stack.push(regs.get((op - 0x70) as u16).wrapping_add(offset as u64));
            }
            0x90 => reg = Some(cursor.uleb()? as u16), // DW_OP_regx
            0x91 => {
                // DW_OP_fbreg: the frame base is the CFA for Go functions.
                let offset = cursor.sleb()?;
                stack.push(cfa.wrapping_add(offset as u64));
            }
            0x92 => {
                // DW_OP_bregx
                let regnum = cursor.uleb()? as u16;
                let offset = cursor.sleb()?;
                stack.push(regs.get(regnum).wrapping_add(offset as u64));
            }
            0x93 => {
                // DW_OP_piece: snapshot the current location as one piece and reset.
                let piece_size = cursor.uleb()?;
                let piece = match (reg, stack.last()) {
                    (Some(r), _) => Piece { kind: PieceKind::Register, value: regs.get(r), size: piece_size },
                    (None, Some(&top)) if stack_value => {
                        Piece { kind: PieceKind::Immediate, value: top, size: piece_size }
                    }
                    (None, Some(&top)) => Piece { kind: PieceKind::Address, value: top, size: piece_size },
                    // An empty piece is an optimized-out hole.
                    (None, None) => Piece { kind: PieceKind::Immediate, value: 0, size: piece_size },
                };
                pieces.push(piece);
                stack.clear();
                reg = None;
                stack_value = false;
            }
            0x9c => stack.push(cfa),   // DW_OP_call_frame_cfa
            0x9f => stack_value = true, // DW_OP_stack_value
            _ => return Err(bad(program, &format!("unsupported opcode {op:#x}"))),
        }
    }

    if !pieces.is_empty() {
        return Ok(Location::Pieces(pieces));
    }
    if let Some(r) = reg {
        return Ok(Location::Pieces(vec![Piece { kind: PieceKind::Register, value: regs.get(r), size }]));
    }
    match stack.last() {
        Some(&top) if stack_value => Ok(Location::Pieces(vec![Piece { kind: PieceKind::Immediate, value: top, size }])),
        Some(&top) => Ok(Location::Address(Addr(top))),
        None => Err(bad(program, "program produced no location")),
    }
}

fn bad(program: &[u8], what: &str) -> Error {
    Error::CorruptFormat(format!("location program {program:02x?}: {what}"))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn next_u8(&mut self) -> Option<u8> {
        let byte = self.bytes.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    fn u8(&mut self) -> Result<u8> {
        self.next_u8().ok_or_else(|| bad(self.bytes, "truncated operand"))
    }

    fn u16(&mut self, image: &ProcessImage) -> Result<u16> {
        Ok(self.scalar(2, image)? as u16)
    }

    fn u32(&mut self, image: &ProcessImage) -> Result<u32> {
        Ok(self.scalar(4, image)? as u32)
    }

    fn u64(&mut self, image: &ProcessImage) -> Result<u64> {
        self.scalar(8, image)
    }

    /// Multi-byte operands follow the image's byte order.
    fn scalar(&mut self, size: usize, image: &ProcessImage) -> Result<u64> {
        let bytes = self
            .bytes
            .get(self.pos..self.pos + size)
            .ok_or_else(|| bad(self.bytes, "truncated operand"))?;
        self.pos += size;
        let mut value: u64 = 0;
        match image.byte_order() {
            Endian::Little => {
                for (i, &b) in bytes.iter().enumerate() {
                    value |= (b as u64) << (8 * i);
                }
            }
            Endian::Big => {
                for &b in bytes {
                    value = (value << 8) | b as u64;
                }
            }
        }
        Ok(value)
    }

    fn uleb(&mut self) -> Result<u64> {
        let mut value = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn sleb(&mut self) -> Result<i64> {
        let mut value = 0i64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam::{image::ProcessBuilder, Arch, Perm};

    fn image() -> ProcessImage {
        ProcessBuilder::new(Arch::Amd64).zero_mapping(0x1000, 4096, Perm::READ).build()
    }

    fn regs() -> RegisterFile {
        let mut regs = RegisterFile::zeroed(Arch::Amd64);
        regs.set(0, 0xdead); // rax
        regs.set(3, 0xbeef); // rbx
        regs
    }

    #[test]
    fn fbreg_is_cfa_relative() {
        // DW_OP_fbreg -16
        let loc = evaluate(&[0x91, 0x70], &regs(), 0x7000, 8, 0, &image()).unwrap();
        match loc {
            Location::Address(addr) => assert_eq!(addr, Addr(0x7000 - 16)),
            other => panic!("expected address, got {other:?}"),
        }
    }

    #[test]
    fn addr_applies_static_base() {
        // DW_OP_addr 0x1000
        let mut program = vec![0x03];
        program.extend_from_slice(&0x1000u64.to_le_bytes());
        let loc = evaluate(&program, &regs(), 0, 8, 0x4000, &image()).unwrap();
        match loc {
            Location::Address(addr) => assert_eq!(addr, Addr(0x5000)),
            other => panic!("expected address, got {other:?}"),
        }
    }

    #[test]
    fn register_pieces_compose() {
        // DW_OP_reg0, DW_OP_piece 8, DW_OP_reg3, DW_OP_piece 8: a two-word value split across
        // rax and rbx - the shape the compiler emits for a slice header kept in registers.
        let loc = evaluate(&[0x50, 0x93, 0x08, 0x53, 0x93, 0x08], &regs(), 0, 16, 0, &image()).unwrap();
        match loc {
            Location::Pieces(pieces) => {
                assert_eq!(pieces.len(), 2);
                assert_eq!((pieces[0].kind, pieces[0].value, pieces[0].size), (PieceKind::Register, 0xdead, 8));
                assert_eq!((pieces[1].kind, pieces[1].value, pieces[1].size), (PieceKind::Register, 0xbeef, 8));
            }
            other => panic!("expected pieces, got {other:?}"),
        }
    }

    #[test]
    fn bare_register_covers_whole_object() {
        let loc = evaluate(&[0x50], &regs(), 0, 8, 0, &image()).unwrap();
        match loc {
            Location::Pieces(pieces) => {
                assert_eq!(pieces.len(), 1);
                assert_eq!((pieces[0].kind, pieces[0].value, pieces[0].size), (PieceKind::Register, 0xdead, 8));
            }
            other => panic!("expected pieces, got {other:?}"),
        }
    }

    #[test]
    fn stack_value_is_immediate() {
        // DW_OP_lit5 DW_OP_stack_value
        let loc = evaluate(&[0x35, 0x9f], &regs(), 0, 8, 0, &image()).unwrap();
        match loc {
            Location::Pieces(pieces) => {
                assert_eq!((pieces[0].kind, pieces[0].value), (PieceKind::Immediate, 5));
            }
            other => panic!("expected pieces, got {other:?}"),
        }
    }

    #[test]
    fn loclist_base_selection() {
        let mut blob = vec![0u8; 8]; // unrelated bytes before our list
        let offset = blob.len();
        // Base selection to 0x400000, then [0x10, 0x20) with a one-byte program.
        blob.extend_from_slice(&u64::MAX.to_le_bytes());
        blob.extend_from_slice(&0x400000u64.to_le_bytes());
        blob.extend_from_slice(&0x10u64.to_le_bytes());
        blob.extend_from_slice(&0x20u64.to_le_bytes());
        blob.extend_from_slice(&1u16.to_le_bytes());
        blob.push(0x9c);
        blob.extend_from_slice(&[0; 16]); // terminator

        let entries = parse_loclist(&blob, offset, 0, 0x1000, Endian::Little).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].low, Addr(0x401010));
        assert_eq!(entries[0].high, Addr(0x401020));
        assert_eq!(entries[0].program, vec![0x9c]);
    }
}
