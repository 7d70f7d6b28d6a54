/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The heap table: a dense, two-level description of every span-covered address. Each slot covers
//! 512 bytes and knows which span it belongs to, which of its words hold pointers, which of its
//! 8-byte granules start a marked object, and the dense index of the first object starting inside
//! it. Leaves of 2048 slots (1 MiB of address space each) hang off a sorted map, so iteration in
//! address order is the map's natural order.

use loam::Addr;
use std::collections::BTreeMap;

pub const SLOT_BYTES: u64 = 512;
pub const SLOTS_PER_LEAF: u64 = 2048;

#[derive(Clone, Copy, Debug)]
pub struct HeapInfo {
    /// Base address of the span covering this slot.
    pub base: Addr,
    /// Element size of that span's objects. Zero means the slot is not heap-covered.
    pub size: u64,
    /// One bit per 8-byte granule: an object starting there is marked reachable.
    pub mark: u64,
    /// One bit per pointer-sized word: the word holds a pointer the collector traces.
    pub ptr: u64,
    /// Dense index of the first marked object starting in this slot, or -1 before numbering (and
    /// for slots with no marked objects).
    pub first_idx: i64,
}

impl HeapInfo {
    const EMPTY: HeapInfo = HeapInfo { base: Addr::NULL, size: 0, mark: 0, ptr: 0, first_idx: -1 };
}

#[derive(Default)]
pub struct HeapTable {
    leaves: BTreeMap<u64, Box<[HeapInfo]>>,
}

fn leaf_id(addr: Addr) -> u64 {
    addr.get() / SLOT_BYTES / SLOTS_PER_LEAF
}

fn slot_index(addr: Addr) -> usize {
    ((addr.get() / SLOT_BYTES) % SLOTS_PER_LEAF) as usize
}

fn granule(addr: Addr) -> u64 {
    (addr.get() % SLOT_BYTES) / 8
}

impl HeapTable {
    pub fn new() -> HeapTable {
        HeapTable { leaves: BTreeMap::new() }
    }

    pub fn info(&self, addr: Addr) -> Option<&HeapInfo> {
        let slot = &self.leaves.get(&leaf_id(addr))?[slot_index(addr)];
        if slot.size == 0 {
            None
        } else {
            Some(slot)
        }
    }

    fn info_mut(&mut self, addr: Addr) -> &mut HeapInfo {
        let leaf = self
            .leaves
            .entry(leaf_id(addr))
            .or_insert_with(|| vec![HeapInfo::EMPTY; SLOTS_PER_LEAF as usize].into_boxed_slice());
        &mut leaf[slot_index(addr)]
    }

    /// Cover `[start, start + bytes)` with a span of `size`-byte objects.
    pub fn add_span(&mut self, start: Addr, bytes: u64, size: u64) {
        let mut addr = start;
        while addr < start + bytes {
            let slot = self.info_mut(addr);
            slot.base = start;
            slot.size = size;
            addr += SLOT_BYTES;
        }
    }

    /// The object containing `addr`, as `(base, size)`, if the address lies in a span.
    pub fn find_object(&self, addr: Addr) -> Option<(Addr, u64)> {
        let info = self.info(addr)?;
        let index = addr.distance_from(info.base) / info.size;
        Some((info.base + index * info.size, info.size))
    }

    /// Record the word at `addr` as pointer-bearing.
    pub fn set_ptr(&mut self, addr: Addr) {
        self.info_mut(addr).ptr |= 1 << granule(addr);
    }

    pub fn is_ptr(&self, addr: Addr) -> bool {
        self.info(addr).is_some_and(|info| info.ptr & (1 << granule(addr)) != 0)
    }

    /// Set the mark bit for an object starting at `addr`. Returns whether it was newly set.
    pub fn mark(&mut self, addr: Addr) -> bool {
        let slot = self.info_mut(addr);
        let bit = 1 << granule(addr);
        let newly = slot.mark & bit == 0;
        slot.mark |= bit;
        newly
    }

    pub fn is_marked(&self, addr: Addr) -> bool {
        self.info(addr).is_some_and(|info| info.mark & (1 << granule(addr)) != 0)
    }

    /// The dense index of a marked object. Only meaningful after [`HeapTable::number_objects`].
    pub fn object_index(&self, addr: Addr) -> Option<usize> {
        let info = self.info(addr)?;
        if info.first_idx < 0 || info.mark & (1 << granule(addr)) == 0 {
            return None;
        }
        let below = (info.mark & ((1u64 << granule(addr)) - 1)).count_ones() as usize;
        Some(info.first_idx as usize + below)
    }

    /// Assign `first_idx` across all slots in address order, returning the total object count.
    /// After this, [`HeapTable::object_index`] is O(1).
    pub fn number_objects(&mut self) -> usize {
        let mut count = 0;
        for leaf in self.leaves.values_mut() {
            for slot in leaf.iter_mut() {
                if slot.mark != 0 {
                    slot.first_idx = count as i64;
                    count += slot.mark.count_ones() as usize;
                }
            }
        }
        count
    }

    /// Visit every marked object in increasing address order. The callback returns whether to
    /// continue.
    pub fn for_each_marked(&self, mut f: impl FnMut(Addr, u64) -> bool) {
        for (&id, leaf) in &self.leaves {
            for (index, slot) in leaf.iter().enumerate() {
                let mut mark = slot.mark;
                while mark != 0 {
                    let bit = mark.trailing_zeros() as u64;
                    mark &= mark - 1;
                    let addr = Addr((id * SLOTS_PER_LEAF + index as u64) * SLOT_BYTES + bit * 8);
                    if !f(addr, slot.size) {
                        return;
                    }
                }
            }
        }
    }

    /// Total number of mark bits set, for cross-checking against the numbering pass.
    pub fn count_marks(&self) -> usize {
        self.leaves.values().flat_map(|leaf| leaf.iter()).map(|slot| slot.mark.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_cover_slots() {
        let mut heap = HeapTable::new();
        heap.add_span(Addr(0x10000), 8192, 64);

        assert_eq!(heap.find_object(Addr(0x10000)), Some((Addr(0x10000), 64)));
        assert_eq!(heap.find_object(Addr(0x10250)), Some((Addr(0x10240), 64)));
        assert_eq!(heap.find_object(Addr(0x11fff)), Some((Addr(0x11fc0), 64)));
        assert_eq!(heap.find_object(Addr(0x12000)), None);
        assert_eq!(heap.find_object(Addr(0xffff)), None);
    }

    #[test]
    fn numbering_is_dense_and_address_ordered() {
        let mut heap = HeapTable::new();
        heap.add_span(Addr(0x10000), 8192, 96);
        // Mark objects 0, 2, 5 (at 96-byte strides, rounded to 8-byte granules by construction).
        for index in [0u64, 2, 5] {
            assert!(heap.mark(Addr(0x10000 + index * 96)));
        }
        assert!(!heap.mark(Addr(0x10000)));

        let count = heap.number_objects();
        assert_eq!(count, 3);
        assert_eq!(count, heap.count_marks());

        assert_eq!(heap.object_index(Addr(0x10000)), Some(0));
        assert_eq!(heap.object_index(Addr(0x10000 + 2 * 96)), Some(1));
        assert_eq!(heap.object_index(Addr(0x10000 + 5 * 96)), Some(2));
        assert_eq!(heap.object_index(Addr(0x10000 + 96)), None);

        let mut seen = Vec::new();
        heap.for_each_marked(|addr, size| {
            assert_eq!(size, 96);
            seen.push(addr);
            true
        });
        assert_eq!(seen, vec![Addr(0x10000), Addr(0x10000 + 192), Addr(0x10000 + 480)]);
    }

    #[test]
    fn ptr_bits_are_per_word() {
        let mut heap = HeapTable::new();
        heap.add_span(Addr(0x20000), 4096, 32);
        heap.set_ptr(Addr(0x20008));
        heap.set_ptr(Addr(0x20200));

        assert!(heap.is_ptr(Addr(0x20008)));
        assert!(!heap.is_ptr(Addr(0x20000)));
        assert!(!heap.is_ptr(Addr(0x20010)));
        assert!(heap.is_ptr(Addr(0x20200)));
    }
}
