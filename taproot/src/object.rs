/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The query surface renderers consume: object iteration, forward and reverse pointer
//! enumeration, typing lookups, the histogram, and human-readable labels for objects and the
//! fields their pointers leave through. Iteration callbacks return `true` to continue and
//! `false` to stop; order is increasing address for objects and creation order for roots.

use crate::{
    dwarf::types::{Kind, TypeId},
    graph::{self, ReachPath, RevSource},
    process::Process,
    root::Root,
    Result,
};
use loam::Addr;

impl Process {
    /// Visit every live object in increasing address order.
    pub fn for_each_object(&self, mut f: impl FnMut(Addr, u64) -> bool) {
        self.heap.for_each_marked(|addr, size| f(addr, size));
    }

    /// Visit every root, globals first, then stacks in goroutine/frame order.
    pub fn for_each_root(&self, mut f: impl FnMut(&Root) -> bool) {
        for root in self.roots() {
            if !f(root) {
                return;
            }
        }
    }

    /// The dense index of the live object at `addr` (which may be interior).
    pub fn object_index(&self, addr: Addr) -> Option<usize> {
        let (base, _) = self.heap.find_object(addr)?;
        self.heap.object_index(base)
    }

    /// The containing live object of `addr`, as `(base, size)`.
    pub fn find_object(&self, addr: Addr) -> Option<(Addr, u64)> {
        let (base, size) = self.heap.find_object(addr)?;
        self.heap.object_index(base).map(|_| (base, size))
    }

    /// The zero-offset typing of the object at `addr`: type id and repeat count.
    pub fn type_of(&self, addr: Addr) -> Option<(TypeId, u64)> {
        let index = self.object_index(addr)?;
        self.typings().type_of(index)
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        &self.typings().typ(&self.dwarf().types, id).name
    }

    pub fn type_size(&self, id: TypeId) -> u64 {
        self.typings().typ(&self.dwarf().types, id).size
    }

    /// The display name an object buckets under: its type name, or `unk<size>` when typing never
    /// reached it.
    pub fn object_display_name(&self, addr: Addr) -> String {
        match self.type_of(addr) {
            Some((typ, repeat)) => {
                let name = self.type_name(typ);
                if repeat > 1 {
                    format!("[{repeat}]{name}")
                } else {
                    name.to_string()
                }
            }
            None => {
                let size = self.find_object(addr).map(|(_, size)| size).unwrap_or(0);
                format!("unk{size}")
            }
        }
    }

    /// Visit each outgoing pointer of the object at `base`: the byte offset it leaves from, the
    /// base of the object it lands in, and the offset within that object.
    pub fn for_each_ptr(&self, base: Addr, mut f: impl FnMut(u64, Addr, u64) -> bool) {
        let Some((base, size)) = self.heap.find_object(base) else { return };
        let ptr_size = self.image().pointer_size();
        let mut slot = base;
        while slot < base + size {
            if self.heap.is_ptr(slot) {
                if let Ok(target) = self.image().read_ptr(slot) {
                    if let Some((target_base, _)) = self.heap.find_object(target) {
                        if self.heap.object_index(target_base).is_some()
                            && !f(slot.distance_from(base), target_base, target.distance_from(target_base))
                        {
                            return;
                        }
                    }
                }
            }
            slot += ptr_size;
        }
    }

    /// Visit each pointer a root contributes: offset within the root, target object base, offset
    /// within the target.
    pub fn for_each_root_ptr(&self, root: &Root, mut f: impl FnMut(u64, Addr, u64) -> bool) {
        let ptr_size = self.image().pointer_size();
        for offset in graph::root_ptr_offsets(&self.dwarf().types, root, ptr_size) {
            if let Some(target) = root.read_ptr_word(self.image(), offset) {
                if let Some((target_base, _)) = self.heap.find_object(target) {
                    if self.heap.object_index(target_base).is_some()
                        && !f(offset, target_base, target.distance_from(target_base))
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Visit each reverse edge of the object at `base`.
    pub fn for_each_reverse_ptr(&self, base: Addr, mut f: impl FnMut(RevSource) -> bool) {
        let Some(index) = self.object_index(base) else { return };
        for &edge in self.reverse().of(index) {
            if !f(edge) {
                return;
            }
        }
    }

    /// Live objects bucketed by display name: `(name, count, total bytes)`, sorted by total
    /// bytes descending.
    pub fn histogram(&self) -> Vec<(String, u64, u64)> {
        let mut buckets: std::collections::HashMap<String, (u64, u64)> = std::collections::HashMap::new();
        self.for_each_object(|addr, size| {
            let entry = buckets.entry(self.object_display_name(addr)).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += size;
            true
        });
        let mut histogram: Vec<_> = buckets.into_iter().map(|(name, (count, total))| (name, count, total)).collect();
        histogram.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        histogram
    }

    /// The minimum-hops path from some root to the object containing `target`.
    pub fn reachable(&self, target: Addr) -> Result<Option<ReachPath>> {
        graph::reachable(self.image(), &self.heap, self.reverse(), self.n_objects(), target)
    }

    /// A `.field[index]`-style label for byte `offset` within an object typed `(typ, repeat)`.
    pub fn field_label(&self, typ: TypeId, repeat: u64, offset: u64) -> String {
        let size = self.type_size(typ);
        if size == 0 || offset >= repeat * size {
            return format!("+{offset}");
        }
        let mut label = String::new();
        let mut offset = offset;
        if repeat > 1 || offset >= size {
            label.push_str(&format!("[{}]", offset / size));
            offset %= size;
        }
        self.descend_label(typ, offset, &mut label);
        label
    }

    fn descend_label(&self, typ: TypeId, offset: u64, label: &mut String) {
        let arena = &self.dwarf().types;
        let t = self.typings().typ(arena, typ);
        match t.kind {
            Kind::Struct => {
                // The field containing the offset is the one with the largest start not past it.
                let field = t
                    .fields
                    .iter()
                    .filter(|f| f.offset <= offset)
                    .max_by_key(|f| f.offset);
                match field {
                    Some(field) => {
                        label.push('.');
                        label.push_str(&field.name);
                        if let Some(field_type) = field.typ {
                            if offset > field.offset {
                                self.descend_label(field_type, offset - field.offset, label);
                            }
                        }
                    }
                    None if offset != 0 => label.push_str(&format!("+{offset}")),
                    None => (),
                }
            }
            Kind::Array => {
                if let Some(element) = t.element {
                    let stride = self.typings().typ(arena, element).size.max(1);
                    label.push_str(&format!("[{}]", offset / stride));
                    if offset % stride != 0 {
                        self.descend_label(element, offset % stride, label);
                    }
                }
            }
            _ if offset != 0 => label.push_str(&format!("+{offset}")),
            _ => (),
        }
    }

    /// A short human description of the object at `addr`, e.g. `main.myPair @ 0xc000012345`.
    pub fn describe_object(&self, addr: Addr) -> String {
        format!("{} @ {}", self.object_display_name(addr), addr)
    }
}
