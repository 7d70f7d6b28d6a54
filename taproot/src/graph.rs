/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The object graph: marking from the roots, dense object numbering, the reverse-edge index, and
//! reachability queries over it. Everything here works purely on the heap table, the root list,
//! and raw memory - by this stage types are advisory, pointers are what the span bitmaps say
//! they are.

use crate::{
    dwarf::types::TypeArena,
    heap::HeapTable,
    root::Root,
    Error, Result,
};
use loam::{Addr, ProcessImage};
use std::collections::VecDeque;

/// Where a reverse edge comes from: a pointer slot inside another object, or a root.
#[derive(Clone, Copy, Debug)]
pub enum RevSource {
    /// Address of the pointer slot in the source object.
    Object(Addr),
    /// Root id and byte offset of the pointer within the root's value.
    Root(usize, u64),
}

/// Reverse edges in compressed-sparse-row form, keyed by destination object index.
pub struct ReverseEdges {
    offsets: Vec<usize>,
    edges: Vec<RevSource>,
}

impl ReverseEdges {
    pub fn of(&self, object_index: usize) -> &[RevSource] {
        &self.edges[self.offsets[object_index]..self.offsets[object_index + 1]]
    }
}

/// The byte offsets within a root's value that hold pointers: its type's pointer mask, or the
/// single word an untyped root occupies.
pub fn root_ptr_offsets(arena: &TypeArena, root: &Root, ptr_size: u64) -> Vec<u64> {
    match root.typ {
        Some(typ) => arena
            .ptr_mask(typ)
            .iter()
            .enumerate()
            .filter(|&(_, &is_ptr)| is_ptr)
            .map(|(word, _)| word as u64 * ptr_size)
            .collect(),
        None => vec![0],
    }
}

/// Mark every object reachable from the roots and assign dense indices. Returns the object count
/// and the total bytes of live objects.
pub fn mark(
    image: &ProcessImage,
    arena: &TypeArena,
    heap: &mut HeapTable,
    roots: &[Root],
) -> Result<(usize, u64)> {
    let ptr_size = image.pointer_size();
    let mut worklist: VecDeque<Addr> = VecDeque::new();

    for root in roots {
        for offset in root_ptr_offsets(arena, root, ptr_size) {
            if let Some(target) = root.read_ptr_word(image, offset) {
                worklist.push_back(target);
            }
        }
    }

    let mut live_bytes = 0;
    while let Some(addr) = worklist.pop_front() {
        let Some((base, size)) = heap.find_object(addr) else { continue };
        if !heap.mark(base) {
            continue;
        }
        live_bytes += size;
        let mut slot = base;
        while slot < base + size {
            if heap.is_ptr(slot) {
                if let Ok(target) = image.read_ptr(slot) {
                    if !target.is_null() {
                        worklist.push_back(target);
                    }
                }
            }
            slot += ptr_size;
        }
    }

    let marked = heap.count_marks();
    let numbered = heap.number_objects();
    if marked != numbered {
        return Err(Error::InvariantViolation(format!(
            "marked {marked} objects but numbered {numbered}"
        )));
    }
    Ok((numbered, live_bytes))
}

/// Build the reverse-edge index: two passes, one to count in-edges per destination, one to fill.
pub fn build_reverse(
    image: &ProcessImage,
    arena: &TypeArena,
    heap: &HeapTable,
    roots: &[Root],
    n_obj: usize,
) -> ReverseEdges {
    let mut counts = vec![0usize; n_obj + 1];
    each_edge(image, arena, heap, roots, &mut |index, _| counts[index + 1] += 1);
    for i in 1..counts.len() {
        counts[i] += counts[i - 1];
    }
    let offsets = counts;

    let mut cursors = offsets.clone();
    let mut edges = vec![RevSource::Object(Addr::NULL); *offsets.last().unwrap()];
    each_edge(image, arena, heap, roots, &mut |index, source| {
        edges[cursors[index]] = source;
        cursors[index] += 1;
    });

    ReverseEdges { offsets, edges }
}

/// Produce every edge of the graph, objects first and then roots, in a stable order.
fn each_edge(
    image: &ProcessImage,
    arena: &TypeArena,
    heap: &HeapTable,
    roots: &[Root],
    sink: &mut dyn FnMut(usize, RevSource),
) {
    let ptr_size = image.pointer_size();
    heap.for_each_marked(|base, size| {
        let mut slot = base;
        while slot < base + size {
            if heap.is_ptr(slot) {
                if let Ok(target) = image.read_ptr(slot) {
                    if let Some(index) = heap.find_object(target).and_then(|(b, _)| heap.object_index(b)) {
                        sink(index, RevSource::Object(slot));
                    }
                }
            }
            slot += ptr_size;
        }
        true
    });
    for root in roots {
        for offset in root_ptr_offsets(arena, root, ptr_size) {
            if let Some(target) = root.read_ptr_word(image, offset) {
                if let Some(index) = heap.find_object(target).and_then(|(b, _)| heap.object_index(b)) {
                    sink(index, RevSource::Root(root.id, offset));
                }
            }
        }
    }
}

/// A minimum-hops path from a root to a target object. `steps[i]` is an object on the path with
/// the byte offset of the pointer that leads to the next step (`None` for the target itself).
pub struct ReachPath {
    pub root: usize,
    pub root_offset: u64,
    pub steps: Vec<(Addr, Option<u64>)>,
}

/// Breadth-first search in the reverse graph from the target; the first root edge found is a
/// minimum-depth witness. The forward path is reconstructed by walking from that object back
/// toward the target, always stepping to a neighbor strictly closer to it.
pub fn reachable(
    image: &ProcessImage,
    heap: &HeapTable,
    reverse: &ReverseEdges,
    n_obj: usize,
    target: Addr,
) -> Result<Option<ReachPath>> {
    let ptr_size = image.pointer_size();
    let (target_base, _) = heap.find_object(target).ok_or(Error::NotAnObject(target))?;
    let target_index = heap.object_index(target_base).ok_or(Error::NotAnObject(target))?;

    let mut depth: Vec<i32> = vec![-1; n_obj];
    depth[target_index] = 0;
    let mut queue = VecDeque::from([target_base]);

    while let Some(base) = queue.pop_front() {
        let index = heap.object_index(base).unwrap();
        let this_depth = depth[index];
        for edge in reverse.of(index) {
            match *edge {
                RevSource::Root(root, root_offset) => {
                    // Found the nearest root; walk forward, descending the depth field.
                    let mut steps = Vec::new();
                    let mut current = base;
                    let mut current_depth = this_depth;
                    while current_depth > 0 {
                        let (egress, next) = forward_step(image, heap, &depth, current, current_depth, ptr_size)
                            .ok_or_else(|| {
                                Error::InvariantViolation(format!(
                                    "no forward edge below depth {current_depth} from {current}"
                                ))
                            })?;
                        steps.push((current, Some(egress)));
                        current = next;
                        current_depth -= 1;
                    }
                    steps.push((current, None));
                    return Ok(Some(ReachPath { root, root_offset, steps }));
                }
                RevSource::Object(slot) => {
                    let Some((source_base, _)) = heap.find_object(slot) else { continue };
                    let Some(source_index) = heap.object_index(source_base) else { continue };
                    if depth[source_index] < 0 {
                        depth[source_index] = this_depth + 1;
                        queue.push_back(source_base);
                    }
                }
            }
        }
    }
    Ok(None)
}

/// The first pointer slot of `base` whose target is strictly closer to the search target.
fn forward_step(
    image: &ProcessImage,
    heap: &HeapTable,
    depth: &[i32],
    base: Addr,
    current_depth: i32,
    ptr_size: u64,
) -> Option<(u64, Addr)> {
    let (_, size) = heap.find_object(base)?;
    let mut slot = base;
    while slot < base + size {
        if heap.is_ptr(slot) {
            if let Ok(target) = image.read_ptr(slot) {
                if let Some((target_base, _)) = heap.find_object(target) {
                    if let Some(target_index) = heap.object_index(target_base) {
                        if depth[target_index] >= 0 && depth[target_index] < current_depth {
                            return Some((slot.distance_from(base), target_base));
                        }
                    }
                }
            }
        }
        slot += ptr_size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::RootKind;
    use loam::{image::ProcessBuilder, Arch, Perm};

    /// A little heap: three 64-byte objects A, B, C in one span. The root points at A; A points
    /// into the middle of B; B points at C; C points back at A.
    fn build_graph() -> (ProcessImage, HeapTable, Vec<Root>) {
        let span = 0x10000u64;
        let (a, b, c) = (span, span + 64, span + 128);
        let mut bytes = vec![0u8; 8192];
        bytes[0..8].copy_from_slice(&(b + 8).to_le_bytes()); // A.word0 -> B+8 (interior pointer)
        bytes[(64 + 8)..(64 + 16)].copy_from_slice(&c.to_le_bytes()); // B.word1 -> C
        bytes[128..136].copy_from_slice(&a.to_le_bytes()); // C.word0 -> A

        let mut root_bytes = vec![0u8; 4096];
        root_bytes[..8].copy_from_slice(&a.to_le_bytes());

        let image = ProcessBuilder::new(Arch::Amd64)
            .mapping(span, Perm::READ | Perm::WRITE, bytes)
            .mapping(0x20000, Perm::READ | Perm::WRITE, root_bytes)
            .build();

        let mut heap = HeapTable::new();
        heap.add_span(Addr(span), 8192, 64);
        heap.set_ptr(Addr(a));
        heap.set_ptr(Addr(b + 8));
        heap.set_ptr(Addr(c));

        let roots = vec![Root {
            id: 0,
            name: "global".to_string(),
            typ: None,
            kind: RootKind::Mem(Addr(0x20000)),
            frame: None,
        }];
        (image, heap, roots)
    }

    #[test]
    fn mark_reaches_through_interior_pointers() {
        let (image, mut heap, roots) = build_graph();
        let arena = TypeArena::new(8);
        let (n_obj, live) = mark(&image, &arena, &mut heap, &roots).unwrap();

        assert_eq!(n_obj, 3);
        assert_eq!(live, 3 * 64);
        assert_eq!(heap.count_marks(), 3);
        // Dense indices follow address order: A, B, C.
        assert_eq!(heap.object_index(Addr(0x10000)), Some(0));
        assert_eq!(heap.object_index(Addr(0x10040)), Some(1));
        assert_eq!(heap.object_index(Addr(0x10080)), Some(2));
    }

    #[test]
    fn forward_and_reverse_edges_are_symmetric() {
        let (image, mut heap, roots) = build_graph();
        let arena = TypeArena::new(8);
        let (n_obj, _) = mark(&image, &arena, &mut heap, &roots).unwrap();
        let reverse = build_reverse(&image, &arena, &heap, &roots, n_obj);

        // Forward edge set, as (source slot, destination base) pairs.
        let mut forward = Vec::new();
        heap.for_each_marked(|base, size| {
            let mut slot = base;
            while slot < base + size {
                if heap.is_ptr(slot) {
                    let target = image.read_ptr(slot).unwrap();
                    if let Some((target_base, _)) = heap.find_object(target) {
                        forward.push((slot, target_base));
                    }
                }
                slot += 8;
            }
            true
        });

        // Every forward edge appears as a reverse edge of its destination, and vice versa.
        let mut reverse_count = 0;
        for index in 0..n_obj {
            for edge in reverse.of(index) {
                if let RevSource::Object(slot) = edge {
                    reverse_count += 1;
                    let expected_target = image.read_ptr(*slot).unwrap();
                    let (expected_base, _) = heap.find_object(expected_target).unwrap();
                    assert_eq!(heap.object_index(expected_base), Some(index));
                    assert!(forward.contains(&(*slot, expected_base)));
                }
            }
        }
        assert_eq!(reverse_count, forward.len());

        // The root's edge lands on A.
        let a_edges = reverse.of(0);
        assert!(a_edges.iter().any(|e| matches!(e, RevSource::Root(0, 0))));
    }

    #[test]
    fn reachable_finds_minimum_path() {
        let (image, mut heap, roots) = build_graph();
        let arena = TypeArena::new(8);
        let (n_obj, _) = mark(&image, &arena, &mut heap, &roots).unwrap();
        let reverse = build_reverse(&image, &arena, &heap, &roots, n_obj);

        // C is two hops from the root: root -> A -> B -> C.
        let path = reachable(&image, &heap, &reverse, n_obj, Addr(0x10080)).unwrap().unwrap();
        assert_eq!(path.root, 0);
        assert_eq!(path.root_offset, 0);
        let objects: Vec<_> = path.steps.iter().map(|&(addr, _)| addr).collect();
        assert_eq!(objects, vec![Addr(0x10000), Addr(0x10040), Addr(0x10080)]);
        assert_eq!(path.steps[0].1, Some(0)); // A's egress pointer is its first word
        assert_eq!(path.steps[1].1, Some(8)); // B's egress pointer is its second word
        assert_eq!(path.steps[2].1, None);

        // A is directly reachable.
        let path = reachable(&image, &heap, &reverse, n_obj, Addr(0x10000)).unwrap().unwrap();
        assert_eq!(path.steps.len(), 1);

        // An address outside the heap is an error.
        assert!(reachable(&image, &heap, &reverse, n_obj, Addr(0x20000)).is_err());
    }
}
