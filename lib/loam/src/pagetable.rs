/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Page-granular address-to-mapping resolution. A lookup must be cheap - the heap walk performs
//! one per pointer read - so the structure is a five-level table indexed by fixed slices of the
//! address, and a probe is five array indexes with no comparisons.
//!
//! The address splits as `[12 | 10 | 10 | 10 | 10 | 12]`: a 4096-entry top level, three interior
//! levels, and a leaf level whose entries each cover one 4 KiB page and hold the index of the
//! mapping covering that page (offset by one, with zero meaning unmapped).

use crate::{addr::Addr, mappings::Mapping};

const LEVEL_BITS: u64 = 10;
const LEVEL_ENTRIES: usize = 1 << LEVEL_BITS;
const TOP_BITS: u64 = 12;
const TOP_ENTRIES: usize = 1 << TOP_BITS;
const PAGE_SHIFT: u64 = 12;

struct Leaf {
    entries: Box<[u32; LEVEL_ENTRIES]>,
}

impl Leaf {
    fn new() -> Leaf {
        Leaf { entries: Box::new([0; LEVEL_ENTRIES]) }
    }
}

struct Interior<T> {
    entries: Vec<Option<T>>,
}

impl<T> Interior<T> {
    fn new(len: usize) -> Interior<T> {
        Interior { entries: (0..len).map(|_| None).collect() }
    }
}

pub struct PageTable {
    top: Interior<Interior<Interior<Interior<Leaf>>>>,
}

impl PageTable {
    pub fn new() -> PageTable {
        PageTable { top: Interior::new(TOP_ENTRIES) }
    }

    /// Build the table for a sorted, merged mapping list. Entries index into that list.
    pub fn build(mappings: &[Mapping]) -> PageTable {
        let mut table = PageTable::new();
        for (index, mapping) in mappings.iter().enumerate() {
            table.insert(mapping.min, mapping.max, index as u32);
        }
        table
    }

    fn insert(&mut self, min: Addr, max: Addr, index: u32) {
        let mut page = min.get() >> PAGE_SHIFT;
        let last = (max.get() - 1) >> PAGE_SHIFT;
        while page <= last {
            let l4 = ((page >> (4 * LEVEL_BITS)) & (TOP_ENTRIES as u64 - 1)) as usize;
            let l3 = ((page >> (3 * LEVEL_BITS)) & (LEVEL_ENTRIES as u64 - 1)) as usize;
            let l2 = ((page >> (2 * LEVEL_BITS)) & (LEVEL_ENTRIES as u64 - 1)) as usize;
            let l1 = ((page >> LEVEL_BITS) & (LEVEL_ENTRIES as u64 - 1)) as usize;
            let l0 = (page & (LEVEL_ENTRIES as u64 - 1)) as usize;

            let level3 = self.top.entries[l4].get_or_insert_with(|| Interior::new(LEVEL_ENTRIES));
            let level2 = level3.entries[l3].get_or_insert_with(|| Interior::new(LEVEL_ENTRIES));
            let level1 = level2.entries[l2].get_or_insert_with(|| Interior::new(LEVEL_ENTRIES));
            let leaf = level1.entries[l1].get_or_insert_with(Leaf::new);
            leaf.entries[l0] = index + 1;

            page += 1;
        }
    }

    /// Resolve an address to the index of the mapping covering its page.
    #[inline]
    pub fn lookup(&self, addr: Addr) -> Option<usize> {
        // The five index fields plus the page offset cover all 64 address bits, so every address
        // has a well-defined (usually empty) slot.
        let page = addr.get() >> PAGE_SHIFT;
        let level3 = self.top.entries[(page >> (4 * LEVEL_BITS)) as usize].as_ref()?;
        let level2 = level3.entries[((page >> (3 * LEVEL_BITS)) & (LEVEL_ENTRIES as u64 - 1)) as usize].as_ref()?;
        let level1 = level2.entries[((page >> (2 * LEVEL_BITS)) & (LEVEL_ENTRIES as u64 - 1)) as usize].as_ref()?;
        let leaf = level1.entries[((page >> LEVEL_BITS) & (LEVEL_ENTRIES as u64 - 1)) as usize].as_ref()?;
        match leaf.entries[(page & (LEVEL_ENTRIES as u64 - 1)) as usize] {
            0 => None,
            index => Some(index as usize - 1),
        }
    }
}

impl Default for PageTable {
    fn default() -> PageTable {
        PageTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::{Contents, Perm};

    fn mapping(min: u64, max: u64) -> Mapping {
        Mapping {
            min: Addr(min),
            max: Addr(max),
            perm: Perm::READ,
            source: None,
            orig_source: None,
            contents: Contents::Zero,
        }
    }

    #[test]
    fn lookup_resolves_to_covering_mapping() {
        let mappings = vec![mapping(0x1000, 0x3000), mapping(0x7fff_ffe0_0000, 0x7fff_ffe8_0000)];
        let table = PageTable::build(&mappings);

        assert_eq!(table.lookup(Addr(0x1000)), Some(0));
        assert_eq!(table.lookup(Addr(0x2fff)), Some(0));
        assert_eq!(table.lookup(Addr(0x3000)), None);
        assert_eq!(table.lookup(Addr(0x0)), None);
        assert_eq!(table.lookup(Addr(0x7fff_ffe0_0000)), Some(1));
        assert_eq!(table.lookup(Addr(0x7fff_ffe7_ffff)), Some(1));
        assert_eq!(table.lookup(Addr(0x7fff_ffe8_0000)), None);
    }

    #[test]
    fn high_half_addresses_resolve() {
        let table = PageTable::build(&[mapping(0x1000, 0x2000)]);
        assert_eq!(table.lookup(Addr(0x8000_0000_0000_0000)), None);
        assert_eq!(table.lookup(Addr(0xffff_ffff_ffff_f000)), None);
    }
}
