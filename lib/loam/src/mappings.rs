/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

use crate::addr::Addr;
use bitflags::bitflags;
use memmap2::Mmap;
use std::{fmt, path::PathBuf, sync::Arc};

pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Perm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Perm::READ) { "r" } else { "-" },
            if self.contains(Perm::WRITE) { "w" } else { "-" },
            if self.contains(Perm::EXEC) { "x" } else { "-" },
        )
    }
}

/// Where a mapping's bytes come from on disk: a file plus an offset into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    pub path: PathBuf,
    pub offset: u64,
}

/// The resolved, readable bytes of a mapping. Backing files stay memory-mapped (and therefore
/// open) for as long as any mapping referencing them is alive; regions the loader could not find
/// bytes for read as zeroes.
#[derive(Clone)]
pub enum Contents {
    Zero,
    Mapped { data: Arc<Mmap>, offset: usize },
    Owned { data: Arc<Vec<u8>>, offset: usize },
}

impl Contents {
    pub fn read(&self, offset: usize, buffer: &mut [u8]) {
        match self {
            Contents::Zero => buffer.fill(0),
            Contents::Mapped { data, offset: base } => copy_or_zero(&data[..], base + offset, buffer),
            Contents::Owned { data, offset: base } => copy_or_zero(&data[..], base + offset, buffer),
        }
    }

    /// Whether `other` carries on exactly where `self` (of length `len`) leaves off, so that a
    /// single `Contents` can serve both.
    fn abuts(&self, len: usize, other: &Contents) -> bool {
        match (self, other) {
            (Contents::Zero, Contents::Zero) => true,
            (Contents::Mapped { data: a, offset: ao }, Contents::Mapped { data: b, offset: bo }) => {
                Arc::ptr_eq(a, b) && ao + len == *bo
            }
            (Contents::Owned { data: a, offset: ao }, Contents::Owned { data: b, offset: bo }) => {
                Arc::ptr_eq(a, b) && ao + len == *bo
            }
            _ => false,
        }
    }

    fn slide(&self, by: usize) -> Contents {
        match self {
            Contents::Zero => Contents::Zero,
            Contents::Mapped { data, offset } => Contents::Mapped { data: data.clone(), offset: offset + by },
            Contents::Owned { data, offset } => Contents::Owned { data: data.clone(), offset: offset + by },
        }
    }
}

fn copy_or_zero(data: &[u8], offset: usize, buffer: &mut [u8]) {
    // The loader never creates a mapping that runs off its backing bytes, but a scrape of memory
    // truncated by the kernel can. Serve what exists and zero the rest.
    let available = data.len().saturating_sub(offset);
    let n = usize::min(available, buffer.len());
    buffer[..n].copy_from_slice(&data[offset..offset + n]);
    buffer[n..].fill(0);
}

impl fmt::Debug for Contents {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Contents::Zero => write!(f, "Zero"),
            Contents::Mapped { offset, .. } => write!(f, "Mapped(+{:#x})", offset),
            Contents::Owned { offset, .. } => write!(f, "Owned(+{:#x})", offset),
        }
    }
}

/// One merged region of the reconstructed address space: `[min, max)`, page-aligned at both ends.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub min: Addr,
    pub max: Addr,
    pub perm: Perm,

    /// The file the bytes were loaded from. For regions present in the core this is the core file
    /// itself; for regions the core omitted it is the originally-mapped file.
    pub source: Option<Source>,

    /// For copy-on-write regions whose bytes come from the core, the file that was originally
    /// mapped there.
    pub orig_source: Option<Source>,

    pub contents: Contents,
}

impl Mapping {
    pub fn size(&self) -> u64 {
        self.max.get() - self.min.get()
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.min <= addr && addr < self.max
    }

    pub(crate) fn read(&self, addr: Addr, buffer: &mut [u8]) {
        debug_assert!(self.contains(addr));
        self.contents.read(addr.distance_from(self.min) as usize, buffer);
    }
}

/// An ordered, non-overlapping set of mappings, built up by overlaying ranges in load order.
/// Later overlays win: a core segment replaces the portion of an executable seed it covers.
#[derive(Default)]
pub struct MappingSet {
    mappings: Vec<Mapping>,
}

impl MappingSet {
    pub fn new() -> MappingSet {
        MappingSet { mappings: Vec::new() }
    }

    /// Insert `new`, splitting or discarding any part of an existing mapping it overlaps.
    pub fn overlay(&mut self, new: Mapping) {
        assert!(new.min < new.max, "empty mapping at {}", new.min);
        assert!(new.min.is_aligned(PAGE_SIZE) && new.max.is_aligned(PAGE_SIZE));

        let mut split = Vec::new();
        self.mappings.retain_mut(|existing| {
            if existing.max <= new.min || existing.min >= new.max {
                return true;
            }
            // Keep the non-intersecting parts of `existing`, in up to two pieces.
            if existing.min < new.min {
                let mut before = existing.clone();
                before.max = new.min;
                split.push(before);
            }
            if existing.max > new.max {
                let mut after = existing.clone();
                let by = new.max.distance_from(existing.min) as usize;
                after.contents = after.contents.slide(by);
                if let Some(source) = &mut after.source {
                    source.offset += by as u64;
                }
                if let Some(source) = &mut after.orig_source {
                    source.offset += by as u64;
                }
                after.min = new.max;
                split.push(after);
            }
            false
        });
        self.mappings.extend(split);
        self.mappings.push(new);
    }

    /// Insert `new` only where no existing mapping covers: the range is cut around every
    /// intersecting mapping and the remaining gaps are inserted. Used for regions the core
    /// declares but carries no bytes for, which must not clobber a seeded file backing.
    pub fn overlay_gaps(&mut self, new: Mapping) {
        assert!(new.min.is_aligned(PAGE_SIZE) && new.max.is_aligned(PAGE_SIZE));

        let mut gaps = vec![(new.min, new.max)];
        for existing in &self.mappings {
            let mut next = Vec::with_capacity(gaps.len());
            for &(lo, hi) in &gaps {
                if existing.max <= lo || existing.min >= hi {
                    next.push((lo, hi));
                    continue;
                }
                if lo < existing.min {
                    next.push((lo, existing.min));
                }
                if hi > existing.max {
                    next.push((existing.max, hi));
                }
            }
            gaps = next;
        }
        for (lo, hi) in gaps {
            if lo < hi {
                let mut piece = new.clone();
                piece.min = lo;
                piece.max = hi;
                self.mappings.push(piece);
            }
        }
    }

    /// Split the mapping covering `[min, max)` at those two addresses, and hand the middle part to
    /// `update`. Ranges nothing covers are ignored.
    pub fn split_and_update(&mut self, min: Addr, max: Addr, update: impl Fn(&mut Mapping)) -> bool {
        let covering = self.mappings.iter().position(|m| m.min <= min && max <= m.max);
        let Some(index) = covering else { return false };

        let existing = self.mappings.swap_remove(index);
        let mut middle = existing.clone();
        if existing.min < min {
            let mut before = existing.clone();
            before.max = min;
            self.mappings.push(before);
            let by = min.distance_from(existing.min) as usize;
            middle.contents = middle.contents.slide(by);
            if let Some(source) = &mut middle.source {
                source.offset += by as u64;
            }
            middle.min = min;
        }
        if existing.max > max {
            let mut after = existing.clone();
            let by = max.distance_from(existing.min) as usize;
            after.contents = after.contents.slide(by);
            if let Some(source) = &mut after.source {
                source.offset += by as u64;
            }
            after.min = max;
            self.mappings.push(after);
            middle.max = max;
        }
        update(&mut middle);
        self.mappings.push(middle);
        true
    }

    /// Sort by address and merge adjacent mappings that share permissions, backing file, and
    /// contiguous contents. Called once, after all overlays.
    pub fn finish(mut self) -> Vec<Mapping> {
        self.mappings.sort_by_key(|m| m.min);

        let mut merged: Vec<Mapping> = Vec::with_capacity(self.mappings.len());
        for mapping in self.mappings {
            if let Some(last) = merged.last_mut() {
                if last.max == mapping.min
                    && last.perm == mapping.perm
                    && sources_contiguous(&last.source, &mapping.source, last.size())
                    && last.contents.abuts(last.size() as usize, &mapping.contents)
                {
                    last.max = mapping.max;
                    continue;
                }
            }
            merged.push(mapping);
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    /// Rewrap an already-resolved, non-overlapping mapping list (e.g. to re-run contents-aware
    /// merging after backing files have been attached).
    pub(crate) fn from_resolved(mappings: Vec<Mapping>) -> MappingSet {
        MappingSet { mappings }
    }
}

fn sources_contiguous(a: &Option<Source>, b: &Option<Source>, len: u64) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.path == b.path && a.offset + len == b.offset,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(min: u64, max: u64, perm: Perm) -> Mapping {
        Mapping { min: Addr(min), max: Addr(max), perm, source: None, orig_source: None, contents: Contents::Zero }
    }

    #[test]
    fn overlay_replaces_overlap() {
        let mut set = MappingSet::new();
        set.overlay(mapping(0x1000, 0x5000, Perm::READ));
        set.overlay(mapping(0x2000, 0x3000, Perm::READ | Perm::WRITE));

        let result = set.finish();
        assert_eq!(result.len(), 3);
        assert_eq!((result[0].min, result[0].max, result[0].perm), (Addr(0x1000), Addr(0x2000), Perm::READ));
        assert_eq!((result[1].min, result[1].max, result[1].perm), (Addr(0x2000), Addr(0x3000), Perm::READ | Perm::WRITE));
        assert_eq!((result[2].min, result[2].max, result[2].perm), (Addr(0x3000), Addr(0x5000), Perm::READ));
    }

    #[test]
    fn merge_adjacent_same_perm() {
        let mut set = MappingSet::new();
        set.overlay(mapping(0x1000, 0x2000, Perm::READ));
        set.overlay(mapping(0x2000, 0x3000, Perm::READ));
        set.overlay(mapping(0x4000, 0x5000, Perm::READ));

        let result = set.finish();
        assert_eq!(result.len(), 2);
        assert_eq!((result[0].min, result[0].max), (Addr(0x1000), Addr(0x3000)));
        assert_eq!((result[1].min, result[1].max), (Addr(0x4000), Addr(0x5000)));
    }

    #[test]
    fn no_merge_across_perms() {
        let mut set = MappingSet::new();
        set.overlay(mapping(0x1000, 0x2000, Perm::READ));
        set.overlay(mapping(0x2000, 0x3000, Perm::READ | Perm::EXEC));

        assert_eq!(set.finish().len(), 2);
    }

    #[test]
    fn overlay_gaps_fills_around_existing() {
        let mut set = MappingSet::new();
        set.overlay(mapping(0x2000, 0x3000, Perm::READ));
        set.overlay_gaps(mapping(0x1000, 0x5000, Perm::READ | Perm::WRITE));

        let result = set.finish();
        assert_eq!(result.len(), 3);
        assert_eq!((result[0].min, result[0].max, result[0].perm), (Addr(0x1000), Addr(0x2000), Perm::READ | Perm::WRITE));
        assert_eq!((result[1].min, result[1].max, result[1].perm), (Addr(0x2000), Addr(0x3000), Perm::READ));
        assert_eq!((result[2].min, result[2].max, result[2].perm), (Addr(0x3000), Addr(0x5000), Perm::READ | Perm::WRITE));
    }

    #[test]
    fn split_and_update_attaches_backing() {
        let mut set = MappingSet::new();
        set.overlay(mapping(0x1000, 0x4000, Perm::READ));
        let updated = set.split_and_update(Addr(0x2000), Addr(0x3000), |m| {
            m.source = Some(Source { path: PathBuf::from("/lib/libc.so"), offset: 0x1000 });
        });
        assert!(updated);

        let result = set.finish();
        assert_eq!(result.len(), 3);
        let middle = result.iter().find(|m| m.min == Addr(0x2000)).unwrap();
        assert_eq!(middle.source.as_ref().unwrap().offset, 0x1000);
        assert!(result.iter().filter(|m| m.source.is_none()).count() == 2);
    }
}
