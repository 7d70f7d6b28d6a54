/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The runtime's per-function pc-value tables: a sequence of `(value delta, pc delta)` pairs,
//! both varint-encoded, the value delta zig-zagged, the pc delta scaled by the architecture's
//! instruction quantum. The table assigns a value to each pc range of a function; the classic
//! uses are the frame size (`pcsp`) and the stack-map index.

use loam::{Addr, ProcessImage};

/// A fully-decoded pc-value table, as ranges of `[pc, next_pc)` offsets from function entry.
#[derive(Clone, Debug, Default)]
pub struct PcTab {
    ranges: Vec<(u64, u64, i64)>,
}

impl PcTab {
    /// Decode the stream starting at `addr` in the image's pc-table blob. `quantum` is the
    /// architecture's pc granularity.
    pub fn read(image: &ProcessImage, addr: Addr, quantum: u64) -> crate::Result<PcTab> {
        let mut tab = PcTab { ranges: Vec::new() };
        let mut cursor = addr;
        let mut value: i64 = -1;
        let mut pc: u64 = 0;
        let mut first = true;
        loop {
            let (value_delta, next) = read_varint(image, cursor)?;
            if value_delta == 0 && !first {
                break;
            }
            cursor = next;
            let (pc_delta, next) = read_varint(image, cursor)?;
            cursor = next;

            value += zigzag(value_delta);
            let next_pc = pc + pc_delta * quantum;
            tab.ranges.push((pc, next_pc, value));
            pc = next_pc;
            first = false;
        }
        Ok(tab)
    }

    /// The value at offset `off` from function entry, or `None` past the end of the table.
    pub fn find(&self, off: u64) -> Option<i64> {
        self.ranges.iter().find(|&&(lo, hi, _)| lo <= off && off < hi).map(|&(_, _, v)| v)
    }

    /// The largest value the table ever takes. The maximum frame size is occasionally more useful
    /// than the pc-exact one when a function's exact pc is suspect.
    pub fn max_value(&self) -> Option<i64> {
        self.ranges.iter().map(|&(_, _, v)| v).max()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn zigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn read_varint(image: &ProcessImage, mut addr: Addr) -> crate::Result<(u64, Addr)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = image.read_u8(addr)?;
        addr += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, addr));
        }
        shift += 7;
        if shift >= 64 {
            return Err(crate::Error::CorruptFormat(format!("unterminated varint at {addr}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam::{image::ProcessBuilder, Arch, Perm};

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn zigzag_encode(v: i64) -> u64 {
        ((v << 1) ^ (v >> 63)) as u64
    }

    /// Encode a table the way the compiler does: deltas from `value = -1, pc = 0`.
    fn encode(entries: &[(i64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut value = -1;
        for &(v, pc_delta) in entries {
            varint(zigzag_encode(v - value), &mut out);
            varint(pc_delta, &mut out);
            value = v;
        }
        out.push(0);
        out
    }

    #[test]
    fn decode_frame_size_table() {
        // A typical pcsp table: 0 for the first instruction, then 24 for the function body.
        let bytes = encode(&[(0, 1), (24, 57)]);
        let image = ProcessBuilder::new(Arch::Amd64).mapping(0x1000, Perm::READ, bytes).build();
        let tab = PcTab::read(&image, Addr(0x1000), 1).unwrap();

        assert_eq!(tab.find(0), Some(0));
        assert_eq!(tab.find(1), Some(24));
        assert_eq!(tab.find(57), Some(24));
        assert_eq!(tab.find(58), None);
        assert_eq!(tab.max_value(), Some(24));
    }

    #[test]
    fn quantum_scales_pc_deltas() {
        let bytes = encode(&[(-1, 2), (3, 4)]);
        let image = ProcessBuilder::new(Arch::Arm64).mapping(0x1000, Perm::READ, bytes).build();
        let tab = PcTab::read(&image, Addr(0x1000), 4).unwrap();

        // -1 is the "no entry" stack-map index; it covers the first two instructions.
        assert_eq!(tab.find(0), Some(-1));
        assert_eq!(tab.find(7), Some(-1));
        assert_eq!(tab.find(8), Some(3));
        assert_eq!(tab.find(23), Some(3));
        assert_eq!(tab.find(24), None);
    }
}
