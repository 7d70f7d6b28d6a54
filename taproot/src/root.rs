/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Roots: the named pointer sources the object graph grows from. A simple root is one contiguous
//! range of memory; a composite root was assembled by the location-list evaluator from pieces
//! that may live in memory, have lived in registers, or be immediate values.

use crate::dwarf::{
    loc::{Piece, PieceKind},
    types::TypeId,
};
use loam::{Addr, ProcessImage};

#[derive(Clone, Debug)]
pub enum RootKind {
    /// One contiguous range starting at the address.
    Mem(Addr),
    /// An ordered list of pieces whose sizes sum to the root's type size.
    Composite(Vec<Piece>),
}

#[derive(Clone, Debug)]
pub struct Root {
    /// Unique, assigned in creation order: globals first, then goroutine stacks.
    pub id: usize,
    pub name: String,
    pub typ: Option<TypeId>,
    pub kind: RootKind,
    /// For stack roots, which goroutine and frame (innermost = 0) owns this root.
    pub frame: Option<(usize, usize)>,
}

impl Root {
    /// The address of the root's storage, for simple roots.
    pub fn addr(&self) -> Option<Addr> {
        match &self.kind {
            RootKind::Mem(addr) => Some(*addr),
            RootKind::Composite(_) => None,
        }
    }

    /// Read the pointer-sized word at `offset` within the root's value, traversing the piece
    /// list for composite roots. Register and immediate pieces yield their captured values
    /// directly; address pieces read through memory.
    pub fn read_ptr_word(&self, image: &ProcessImage, offset: u64) -> Option<Addr> {
        match &self.kind {
            RootKind::Mem(addr) => image.read_ptr(*addr + offset).ok(),
            RootKind::Composite(pieces) => {
                let mut piece_start = 0;
                for piece in pieces {
                    if offset < piece_start + piece.size {
                        return match piece.kind {
                            PieceKind::Address => image.read_ptr(Addr(piece.value) + (offset - piece_start)).ok(),
                            PieceKind::Register | PieceKind::Immediate => Some(Addr(piece.value)),
                        };
                    }
                    piece_start += piece.size;
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam::{image::ProcessBuilder, Arch, Perm};

    #[test]
    fn composite_roots_traverse_pieces() {
        let mut bytes = vec![0; 4096];
        bytes[..8].copy_from_slice(&0x77777777u64.to_le_bytes());
        let image = ProcessBuilder::new(Arch::Amd64).mapping(0x1000, Perm::READ, bytes).build();

        let root = Root {
            id: 0,
            name: "x".to_string(),
            typ: None,
            kind: RootKind::Composite(vec![
                Piece { kind: PieceKind::Register, value: 0xabcd, size: 8 },
                Piece { kind: PieceKind::Address, value: 0x1000, size: 8 },
                Piece { kind: PieceKind::Immediate, value: 42, size: 8 },
            ]),
            frame: None,
        };

        assert_eq!(root.read_ptr_word(&image, 0), Some(Addr(0xabcd)));
        assert_eq!(root.read_ptr_word(&image, 8), Some(Addr(0x77777777)));
        assert_eq!(root.read_ptr_word(&image, 16), Some(Addr(42)));
        assert_eq!(root.read_ptr_word(&image, 24), None);
    }
}
