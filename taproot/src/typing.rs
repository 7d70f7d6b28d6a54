/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The typing engine: propagates DWARF types from the roots through the reachable heap, so that
//! as many live objects as possible carry a real type instead of `unk<size>`. An object's typing
//! has two parts: the zero-offset typing (type + repeat count from the start of the object) and
//! interior chunks for typed regions that do not reach offset zero (a slice pointing into the
//! middle of an array, a map bucket array). Where DWARF runs out - interface data words - the
//! runtime's own type descriptors take over, synthesized into word-granular struct shapes.

use crate::{
    dwarf::{
        loc::{Piece, PieceKind},
        types::{Kind, Type, TypeArena, TypeId},
        DwarfInfo, FuncVar,
    },
    heap::HeapTable,
    root::{Root, RootKind},
    rttype::{Fillers, RtTypeReader},
    runtime::modules::FuncTable,
};
use loam::{Addr, ProcessImage};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// A typed region of an object that does not start at offset zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TypeChunk {
    pub offset: u64,
    pub typ: TypeId,
    pub repeat: u64,
}

impl TypeChunk {
    fn end(&self, size: u64) -> u64 {
        self.offset + self.repeat * size
    }
}

/// The fully-propagated typings for every live object, plus the types synthesized from runtime
/// descriptors along the way (their ids continue past the DWARF arena).
pub struct HeapTypings {
    base: usize,
    pub types: Vec<Option<(TypeId, u64)>>,
    pub interior: HashMap<usize, Vec<TypeChunk>>,
    pub synth: Vec<Type>,
}

impl HeapTypings {
    /// The zero-offset typing of object `index`: type and repeat count.
    pub fn type_of(&self, index: usize) -> Option<(TypeId, u64)> {
        self.types.get(index).copied().flatten()
    }

    pub fn interior_of(&self, index: usize) -> &[TypeChunk] {
        self.interior.get(&index).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Resolve a type id against either the DWARF arena or the synthesized overflow.
    pub fn typ<'a>(&'a self, arena: &'a TypeArena, id: TypeId) -> &'a Type {
        if (id.0 as usize) < self.base {
            arena.get(id)
        } else {
            &self.synth[id.0 as usize - self.base]
        }
    }
}

pub struct TypingEngine<'a> {
    image: &'a ProcessImage,
    dwarf: &'a DwarfInfo,
    rt: &'a RtTypeReader,
    type_ranges: &'a [(Addr, Addr)],
    funcs: &'a FuncTable,
    vars: &'a HashMap<u64, Vec<FuncVar>>,
    heap: &'a HeapTable,
    fillers: Fillers,

    typings: HeapTypings,
    synth_by_descriptor: HashMap<Addr, TypeId>,
    closure_types: HashMap<String, TypeId>,
    queue: VecDeque<(Reader, TypeId, u64)>,
}

/// Where a typed value's bytes come from: object or root memory, or the piece list of a
/// composite root.
#[derive(Clone, Debug)]
enum Reader {
    Mem(Addr),
    Pieces(Vec<Piece>),
}

impl Reader {
    fn offset(&self, by: u64) -> Reader {
        match self {
            Reader::Mem(addr) => Reader::Mem(*addr + by),
            Reader::Pieces(pieces) => {
                // Drop pieces wholly before the new start; adjust the first partial one.
                let mut rest = Vec::new();
                let mut skip = by;
                for piece in pieces {
                    if skip >= piece.size {
                        skip -= piece.size;
                        continue;
                    }
                    let mut piece = *piece;
                    if skip > 0 {
                        match piece.kind {
                            PieceKind::Address => piece.value += skip,
                            PieceKind::Register | PieceKind::Immediate => piece.value >>= 8 * skip,
                        }
                        piece.size -= skip;
                        skip = 0;
                    }
                    rest.push(piece);
                }
                Reader::Pieces(rest)
            }
        }
    }

    fn word(&self, image: &ProcessImage, offset: u64) -> Option<u64> {
        match self {
            Reader::Mem(addr) => image.read_uint(*addr + offset).ok(),
            Reader::Pieces(pieces) => {
                let mut start = 0;
                for piece in pieces {
                    if offset < start + piece.size {
                        return match piece.kind {
                            PieceKind::Address => image.read_uint(Addr(piece.value) + (offset - start)).ok(),
                            _ => Some(piece.value),
                        };
                    }
                    start += piece.size;
                }
                None
            }
        }
    }

    fn byte(&self, image: &ProcessImage, offset: u64) -> Option<u8> {
        match self {
            Reader::Mem(addr) => image.read_u8(*addr + offset).ok(),
            Reader::Pieces(pieces) => {
                let mut start = 0;
                for piece in pieces {
                    if offset < start + piece.size {
                        return match piece.kind {
                            PieceKind::Address => image.read_u8(Addr(piece.value) + (offset - start)).ok(),
                            _ => Some((piece.value >> (8 * (offset - start))) as u8),
                        };
                    }
                    start += piece.size;
                }
                None
            }
        }
    }
}

impl<'a> TypingEngine<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image: &'a ProcessImage,
        dwarf: &'a DwarfInfo,
        rt: &'a RtTypeReader,
        type_ranges: &'a [(Addr, Addr)],
        funcs: &'a FuncTable,
        vars: &'a HashMap<u64, Vec<FuncVar>>,
        heap: &'a HeapTable,
        n_obj: usize,
    ) -> TypingEngine<'a> {
        TypingEngine {
            image,
            dwarf,
            rt,
            type_ranges,
            funcs,
            vars,
            heap,
            fillers: Fillers::resolve(&dwarf.types),
            typings: HeapTypings {
                base: dwarf.types.len(),
                types: vec![None; n_obj],
                interior: HashMap::new(),
                synth: Vec::new(),
            },
            synth_by_descriptor: HashMap::new(),
            closure_types: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Seed from every typed root and propagate to a fixed point.
    pub fn run(mut self, roots: &[Root]) -> HeapTypings {
        for root in roots {
            let Some(typ) = root.typ else { continue };
            let reader = match &root.kind {
                RootKind::Mem(addr) => Reader::Mem(*addr),
                RootKind::Composite(pieces) => Reader::Pieces(pieces.clone()),
            };
            self.scan_value(reader, typ);
        }

        while let Some((reader, typ, repeat)) = self.queue.pop_front() {
            let size = self.typ(typ).size;
            // A run of values with no pointers propagates nothing; skip the whole region rather
            // than walking a huge primitive array element by element.
            if !self.type_has_pointers(typ) {
                continue;
            }
            for index in 0..repeat {
                self.scan_value(reader.offset(index * size), typ);
            }
        }

        self.absorb_interior();
        debug!(
            "typed {} of {} objects ({} synthesized types)",
            self.typings.types.iter().filter(|t| t.is_some()).count(),
            self.typings.types.len(),
            self.typings.synth.len()
        );
        self.typings
    }

    fn typ(&self, id: TypeId) -> &Type {
        self.typings.typ(&self.dwarf.types, id)
    }

    fn type_has_pointers(&self, id: TypeId) -> bool {
        if (id.0 as usize) < self.typings.base {
            self.dwarf.types.has_pointers(id)
        } else {
            // Synthesized types are flat ptr/uintptr structs; a pointer field means pointers.
            self.typ(id).fields.iter().any(|f| f.typ == self.fillers.unsafe_ptr)
        }
    }

    /// Record that the memory at `addr` holds `repeat` consecutive values of `typ`, if `addr`
    /// lands in a live object. This is the `add` callback of the propagation algorithm.
    fn add(&mut self, addr: Addr, typ: TypeId, repeat: u64) {
        if addr.is_null() || repeat == 0 {
            return;
        }
        let Some((base, obj_size)) = self.heap.find_object(addr) else { return };
        let Some(index) = self.heap.object_index(base) else { return };

        let size = self.typ(typ).size;
        if size == 0 {
            return;
        }
        let offset = addr.distance_from(base);
        // Clamp the footprint to the object; a slice's capacity can round past the end of what
        // was actually allocated.
        let max_repeat = (obj_size - offset) / size;
        let repeat = repeat.min(max_repeat);
        if repeat == 0 {
            return;
        }

        if offset == 0 {
            let existing = self.typings.types[index];
            let new_footprint = repeat * size;
            let old_footprint = existing.map(|(t, r)| r * self.typ(t).size).unwrap_or(0);
            if new_footprint > old_footprint {
                self.typings.types[index] = Some((typ, repeat));
                self.queue.push_back((Reader::Mem(addr), typ, repeat));
            }
        } else {
            let chunk = TypeChunk { offset, typ, repeat };
            let chunk_size = size;
            let chunks = self.typings.interior.entry(index).or_default();
            if let Some(changed) = merge_chunk(chunks, chunk, chunk_size, |id| {
                if (id.0 as usize) < self.dwarf.types.len() {
                    self.dwarf.types.get(id).size
                } else {
                    self.typings.synth[id.0 as usize - self.dwarf.types.len()].size
                }
            }) {
                self.queue.push_back((Reader::Mem(base + changed.offset), changed.typ, changed.repeat));
            }
        }
    }

    /// Walk one value of `typ` through `reader`, dispatching on kind.
    fn scan_value(&mut self, reader: Reader, typ: TypeId) {
        let ptr_size = self.image.pointer_size();
        let t = self.typ(typ);
        let kind = t.kind;
        let element = t.element;
        let count = t.count;
        let name = t.name.clone();
        let fields: Vec<_> = t.fields.iter().map(|f| (f.offset, f.typ)).collect();

        match kind {
            Kind::Bool | Kind::Int | Kind::Uint | Kind::Float | Kind::Complex | Kind::None => (),
            Kind::Ptr => {
                if let Some(element) = element {
                    if let Some(value) = reader.word(self.image, 0) {
                        self.add(Addr(value), element, 1);
                    }
                }
            }
            Kind::String => {
                if let (Some(data), Some(len), Some(element)) =
                    (reader.word(self.image, 0), reader.word(self.image, ptr_size), element)
                {
                    self.add(Addr(data), element, len);
                }
            }
            Kind::Slice => {
                if let (Some(data), Some(cap), Some(element)) =
                    (reader.word(self.image, 0), reader.word(self.image, 2 * ptr_size), element)
                {
                    self.add(Addr(data), element, cap);
                }
            }
            Kind::Eface | Kind::Iface => self.scan_interface(&reader, kind),
            Kind::Func => self.scan_closure(&reader),
            Kind::Array => {
                if let Some(element) = element {
                    let stride = self.typ(element).size;
                    if self.type_has_pointers(element) {
                        for index in 0..count {
                            self.scan_value(reader.offset(index * stride), element);
                        }
                    }
                }
            }
            Kind::Struct => {
                self.scan_special_struct(&reader, &name);
                for (offset, field_type) in fields {
                    if let Some(field_type) = field_type {
                        self.scan_value(reader.offset(offset), field_type);
                    }
                }
            }
        }
    }

    /// Interfaces carry their own type: the first word names a runtime descriptor (through an
    /// itab for non-empty interfaces), the second is the data word.
    fn scan_interface(&mut self, reader: &Reader, kind: Kind) {
        let ptr_size = self.image.pointer_size();
        let Some(type_word) = reader.word(self.image, 0) else { return };
        let Some(data_word) = reader.word(self.image, ptr_size) else { return };
        if type_word == 0 || data_word == 0 {
            // A nil interface, or one whose value died with the frame.
            return;
        }

        let descriptor = if kind == Kind::Iface {
            match self.rt.itab_type(self.ctx(), Addr(type_word)) {
                Ok(descriptor) => descriptor,
                Err(_) => return,
            }
        } else {
            Addr(type_word)
        };
        if descriptor.is_null() {
            return;
        }

        let Ok(rt_type) = self.rt.read(self.ctx(), descriptor) else { return };
        let Some(synth) = self.synthesize(descriptor, &rt_type) else { return };
        if self.rt.direct_iface(&rt_type) {
            // The data word is the value itself. Typing it in place records an interior typing
            // of whatever object the interface header lives in.
            if let Reader::Mem(addr) = reader {
                self.add(*addr + ptr_size, synth, 1);
            }
        } else {
            self.add(Addr(data_word), synth, 1);
        }
    }

    fn scan_closure(&mut self, reader: &Reader) {
        let ptr_size = self.image.pointer_size();
        let Some(closure) = reader.word(self.image, 0) else { return };
        if closure == 0 {
            return;
        }
        let Ok(entry_pc) = self.image.read_ptr(Addr(closure)) else { return };
        let Some(func) = self.funcs.find(entry_pc) else { return };
        let func_name = func.name.clone();
        let func_entry = func.entry;

        let closure_type = self.closure_type(&func_name);
        self.add(Addr(closure), closure_type, 1);

        // A method-value wrapper's closure captures the receiver right after the code pointer;
        // the method's own first parameter says what it is.
        if let Some(method_name) = func_name.strip_suffix("-fm") {
            let receiver_type = self
                .funcs
                .by_name(method_name)
                .and_then(|method| self.vars.get(&method.entry.get()))
                .and_then(|vars| vars.iter().find(|v| v.is_param))
                .and_then(|v| v.typ);
            if let Some(receiver_type) = receiver_type {
                self.add(Addr(closure) + ptr_size, receiver_type, 1);
            }
        }
    }

    /// Map and channel headers seed typed regions for their buffers, using their embedded size
    /// fields.
    fn scan_special_struct(&mut self, reader: &Reader, name: &str) {
        if name.starts_with("hash<") {
            let (Some(b), Some(buckets)) = (self.read_field_u8(reader, name, "B"), self.read_field_word(reader, name, "buckets"))
            else {
                return;
            };
            let bucket_type = self
                .dwarf
                .types
                .by_name(name)
                .and_then(|id| self.dwarf.types.get(id).field("buckets").and_then(|f| f.typ))
                .and_then(|ptr| self.dwarf.types.get(ptr).element);
            if let Some(bucket_type) = bucket_type {
                self.add(Addr(buckets), bucket_type, 1u64 << b.min(62));
            }
        } else if name.starts_with("hchan<") {
            let (Some(len), Some(buf)) = (self.read_field_word(reader, name, "dataqsiz"), self.read_field_word(reader, name, "buf"))
            else {
                return;
            };
            let element = name
                .strip_prefix("hchan<")
                .and_then(|rest| rest.strip_suffix('>'))
                .and_then(|element| self.dwarf.types.by_name(element));
            if let Some(element) = element {
                self.add(Addr(buf), element, len);
            }
        }
    }

    fn read_field_word(&self, reader: &Reader, type_name: &str, field: &str) -> Option<u64> {
        let id = self.dwarf.types.by_name(type_name)?;
        let offset = self.dwarf.types.get(id).field(field)?.offset;
        reader.word(self.image, offset)
    }

    fn read_field_u8(&self, reader: &Reader, type_name: &str, field: &str) -> Option<u8> {
        let id = self.dwarf.types.by_name(type_name)?;
        let offset = self.dwarf.types.get(id).field(field)?.offset;
        reader.byte(self.image, offset)
    }

    fn ctx(&self) -> crate::runtime::val::Ctx<'a> {
        crate::runtime::val::Ctx { image: self.image, types: &self.dwarf.types }
    }

    /// The synthetic type for a runtime descriptor, cached by descriptor address so repeated
    /// references share one node.
    fn synthesize(&mut self, descriptor: Addr, rt_type: &crate::rttype::RtType) -> Option<TypeId> {
        if let Some(&id) = self.synth_by_descriptor.get(&descriptor) {
            return Some(id);
        }
        let name = match self.rt.name(self.image, self.type_ranges, rt_type) {
            Ok(Some(name)) => name,
            Ok(None) => format!("reflectType{:x}", descriptor.get()),
            Err(_) => return None,
        };
        // Prefer the DWARF type of the same name when there is one; it has real structure.
        if let Some(id) = self.dwarf.types.by_name(&name) {
            self.synth_by_descriptor.insert(descriptor, id);
            return Some(id);
        }
        let typ = self.rt.synthesize(self.image, rt_type, name, &self.fillers).ok()?;
        let id = TypeId((self.typings.base + self.typings.synth.len()) as u32);
        self.typings.synth.push(typ);
        self.synth_by_descriptor.insert(descriptor, id);
        Some(id)
    }

    fn closure_type(&mut self, func_name: &str) -> TypeId {
        if let Some(&id) = self.closure_types.get(func_name) {
            return id;
        }
        let ptr_size = self.image.pointer_size();
        let typ = Type {
            name: format!("closure for {func_name}"),
            size: ptr_size,
            kind: Kind::Struct,
            go_kind: 0,
            runtime_offset: None,
            element: None,
            count: 0,
            fields: vec![crate::dwarf::types::Field {
                name: "fn".to_string(),
                offset: 0,
                typ: self.fillers.uintptr,
            }],
        };
        let id = TypeId((self.typings.base + self.typings.synth.len()) as u32);
        self.typings.synth.push(typ);
        self.closure_types.insert(func_name.to_string(), id);
        id
    }

    /// Fold interior chunks that abut or overlap the zero-offset typing into it, where the types
    /// match and the chunk sits on an element boundary.
    fn absorb_interior(&mut self) {
        for (index, typing) in self.typings.types.iter_mut().enumerate() {
            let Some((typ, repeat)) = typing else { continue };
            let Some(chunks) = self.typings.interior.get_mut(&index) else { continue };
            let size = if (typ.0 as usize) < self.typings.base {
                self.dwarf.types.get(*typ).size
            } else {
                self.typings.synth[typ.0 as usize - self.typings.base].size
            };
            if size == 0 {
                continue;
            }

            let mut changed = true;
            while changed {
                changed = false;
                chunks.retain(|chunk| {
                    let absorbable =
                        chunk.typ == *typ && chunk.offset % size == 0 && chunk.offset <= *repeat * size;
                    if absorbable {
                        *repeat = (*repeat).max(chunk.end(size) / size);
                    }
                    if absorbable {
                        changed = true;
                    }
                    !absorbable
                });
            }
            if chunks.is_empty() {
                self.typings.interior.remove(&index);
            }
        }
    }
}

/// Merge a new chunk into an object's interior list, returning the chunk to (re)scan when the
/// list changed. The rules, in order: contained in an existing chunk - discard; covering an
/// existing chunk - replace it; same type on a stride-aligned offset - union; overlapping with
/// neither containing the other - the larger footprint wins (ambiguous by construction, so the
/// incumbent stays on ties); disjoint - append.
fn merge_chunk(
    chunks: &mut Vec<TypeChunk>,
    new: TypeChunk,
    new_size: u64,
    size_of: impl Fn(TypeId) -> u64,
) -> Option<TypeChunk> {
    let new_end = new.end(new_size);
    for chunk in chunks.iter_mut() {
        let size = size_of(chunk.typ);
        let (start, end) = (chunk.offset, chunk.end(size));
        if new.offset >= start && new_end <= end {
            return None;
        }
        if new.offset <= start && new_end >= end {
            *chunk = new;
            return Some(new);
        }
        if new.offset < end && new_end > start {
            if chunk.typ == new.typ && (new.offset as i64 - start as i64).rem_euclid(size as i64) == 0 {
                let union_start = start.min(new.offset);
                let union_end = end.max(new_end);
                *chunk = TypeChunk { offset: union_start, typ: chunk.typ, repeat: (union_end - union_start) / size };
                return Some(*chunk);
            }
            // Overlapping, differently typed or misaligned: keep the larger footprint.
            if new_end - new.offset > end - start {
                *chunk = new;
                return Some(new);
            }
            return None;
        }
    }
    chunks.push(new);
    Some(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_of(_: TypeId) -> u64 {
        8
    }

    fn chunk(offset: u64, typ: u32, repeat: u64) -> TypeChunk {
        TypeChunk { offset, typ: TypeId(typ), repeat }
    }

    #[test]
    fn contained_chunks_are_discarded() {
        let mut chunks = vec![chunk(16, 1, 4)];
        assert_eq!(merge_chunk(&mut chunks, chunk(24, 2, 1), 8, size_of), None);
        assert_eq!(chunks, vec![chunk(16, 1, 4)]);
    }

    #[test]
    fn covering_chunks_replace() {
        let mut chunks = vec![chunk(16, 1, 1)];
        let merged = merge_chunk(&mut chunks, chunk(8, 2, 4), 8, size_of);
        assert_eq!(merged, Some(chunk(8, 2, 4)));
        assert_eq!(chunks, vec![chunk(8, 2, 4)]);
    }

    #[test]
    fn aligned_same_type_unions() {
        // [16, 48) and [32, 64) of the same 8-byte type: slice-into-slice sharing collapses to
        // one [16, 64) chunk.
        let mut chunks = vec![chunk(16, 1, 4)];
        let merged = merge_chunk(&mut chunks, chunk(32, 1, 4), 8, size_of);
        assert_eq!(merged, Some(chunk(16, 1, 6)));
        assert_eq!(chunks, vec![chunk(16, 1, 6)]);
    }

    #[test]
    fn overlap_keeps_larger() {
        let mut chunks = vec![chunk(16, 1, 2)];
        // Differently-typed overlap, larger: wins.
        let merged = merge_chunk(&mut chunks, chunk(20, 2, 4), 8, size_of);
        assert_eq!(merged, Some(chunk(20, 2, 4)));
        // Differently-typed overlap, smaller: loses.
        assert_eq!(merge_chunk(&mut chunks, chunk(24, 3, 1), 8, size_of), None);
        assert_eq!(chunks, vec![chunk(20, 2, 4)]);
    }

    #[test]
    fn disjoint_chunks_append() {
        let mut chunks = vec![chunk(16, 1, 2)];
        let merged = merge_chunk(&mut chunks, chunk(64, 2, 2), 8, size_of);
        assert_eq!(merged, Some(chunk(64, 2, 2)));
        assert_eq!(chunks.len(), 2);
    }
}
