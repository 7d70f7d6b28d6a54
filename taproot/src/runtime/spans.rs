/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The arena and span walk: turns `runtime.mheap_` into the heap table (span extents, element
//! sizes, per-word pointer bits) plus the span-level allocation accounting the breakdown tree
//! reports. Pointer bitmaps live in one of three places depending on the span's size class; the
//! layout constants are read from the constant table so the walk follows whatever scheme the
//! dumped runtime actually used.

use crate::{
    dwarf::{ConstTable, Global},
    heap::HeapTable,
    rttype::RtTypeReader,
    runtime::val::{Ctx, Val},
    Error, Result,
};
use loam::Addr;
use tracing::{debug, warn};

pub struct HeapModel {
    pub heap: HeapTable,
    pub in_use_alloc: u64,
    pub in_use_free: u64,
    pub in_use_round: u64,
    pub manual_alloc: u64,
    pub manual_free: u64,
    /// Address ranges covered by heap arenas.
    pub arena_ranges: Vec<(Addr, Addr)>,
    /// Address ranges of the arenas' span tables (counted separately from bss).
    pub span_table_ranges: Vec<(Addr, Addr)>,
    /// Synthetic roots for objects with finalizers attached.
    pub finalizers: Vec<Global>,
}

pub fn read_heap(ctx: Ctx, mheap: Val, consts: &ConstTable, rt: &RtTypeReader) -> Result<HeapModel> {
    let page_size = consts.find("runtime.pageSize").or_else(|| consts.find("runtime._PageSize")).unwrap_or(8192) as u64;
    let state_in_use = consts.get("runtime.mSpanInUse") as u64;
    let state_manual = consts.get("runtime.mSpanManual") as u64;

    let mut model = HeapModel {
        heap: HeapTable::new(),
        in_use_alloc: 0,
        in_use_free: 0,
        in_use_round: 0,
        manual_alloc: 0,
        manual_free: 0,
        arena_ranges: Vec::new(),
        span_table_ranges: Vec::new(),
        finalizers: Vec::new(),
    };

    read_arenas(ctx, &mheap, consts, &mut model)?;

    let layout = BitmapLayout::new(ctx, consts)?;
    let finalizer_kind = consts.find("runtime._KindSpecialFinalizer");
    let allspans = mheap.field("allspans")?.slice()?;
    let mut spans = 0u64;
    for i in 0..allspans.len {
        let span_ptr = allspans.index(i)?.ptr()?;
        if span_ptr.is_null() {
            continue;
        }
        let span = allspans.index(i)?.deref()?;

        // The state byte moved into a one-field box when it became atomic; look through it.
        let state_val = span.field("state")?;
        let state = if state_val.has_field("s") { state_val.field("s")? } else { state_val }.atomic_uint()?;
        let start = Addr(span.field("startAddr")?.uint()?);
        let span_bytes = span.field("npages")?.uint()? * page_size;
        let elem_size = span.field("elemsize")?.uint()?;

        if state == state_manual {
            // A manually-managed span (stacks, mostly). Start fully allocated, then walk the
            // free list deducting each linked entry.
            model.manual_alloc += span_bytes;
            let mut link = Addr(span.field("manualFreeList")?.uint()?);
            let mut remaining = span_bytes / elem_size.max(1) + 1;
            while !link.is_null() && remaining > 0 {
                model.manual_alloc -= elem_size;
                model.manual_free += elem_size;
                link = match ctx.image.read_ptr(link) {
                    Ok(next) => next,
                    Err(_) => break,
                };
                remaining -= 1;
            }
            continue;
        }
        if state != state_in_use {
            continue;
        }
        if elem_size == 0 || span_bytes == 0 {
            warn!("in-use span at {start} with zero geometry; skipped");
            continue;
        }

        spans += 1;
        model.heap.add_span(start, span_bytes, elem_size);

        let nelems = span.field("nelems")?.uint()?;
        let freeindex = span.field("freeindex")?.uint()?;
        let alloc_bits = Addr(span.field("allocBits")?.uint()?);
        let allocated = |index: u64| -> bool {
            if index < freeindex {
                return true;
            }
            match ctx.image.read_u8(alloc_bits + index / 8) {
                Ok(byte) => byte >> (index % 8) & 1 != 0,
                Err(_) => false,
            }
        };

        for index in 0..nelems {
            if allocated(index) {
                model.in_use_alloc += elem_size;
            } else {
                model.in_use_free += elem_size;
            }
        }
        model.in_use_round += span_bytes.saturating_sub(nelems * elem_size);

        let noscan = span.field("spanclass")?.uint()? & 1 != 0;
        if !noscan {
            layout.extract(ctx, rt, &span, start, span_bytes, elem_size, nelems, &allocated, &mut model.heap)?;
        }

        if let Some(kind) = finalizer_kind {
            read_finalizers(ctx, &span, start, kind as u64, &mut model.finalizers)?;
        }
    }

    debug!(
        "walked {spans} in-use spans: {} allocated, {} free, {} roundoff",
        model.in_use_alloc, model.in_use_free, model.in_use_round
    );
    Ok(model)
}

fn read_arenas(ctx: Ctx, mheap: &Val, consts: &ConstTable, model: &mut HeapModel) -> Result<()> {
    let arena_bytes = consts.get("runtime.heapArenaBytes") as u64;
    let arena_base_offset = consts.get("runtime.arenaBaseOffset") as u64;
    let l2_count = 1u64 << consts.get("runtime.arenaL2Bits");

    let arenas = mheap.field("arenas")?;
    let l1_count = ctx.types.get(arenas.typ).count;
    for l1 in 0..l1_count {
        let l1_entry = arenas.array_index(l1)?;
        if l1_entry.ptr()?.is_null() {
            continue;
        }
        let l2_array = l1_entry.deref()?;
        for l2 in 0..l2_count {
            let arena_ptr = l2_array.array_index(l2)?.ptr()?;
            if arena_ptr.is_null() {
                continue;
            }
            let index = l1 * l2_count + l2;
            let base = Addr((index * arena_bytes).wrapping_sub(arena_base_offset));
            model.arena_ranges.push((base, base + arena_bytes));

            // The arena's span table is a flat array field; it gets its own breakdown bucket.
            let arena_type = ctx
                .types
                .get(l2_array.typ)
                .element // *heapArena
                .and_then(|p| ctx.types.get(p).element) // heapArena
                .ok_or_else(missing_arena)?;
            let arena = Val::new(ctx, arena_ptr, arena_type);
            if let Ok(spans_field) = arena.field("spans") {
                let size = ctx.types.get(spans_field.typ).size;
                model.span_table_ranges.push((spans_field.addr, spans_field.addr + size));
            }
        }
    }
    Ok(())
}

fn missing_arena() -> Error {
    Error::CorruptFormat("heap arena array has no element type".into())
}

/// Which pointer-bitmap scheme applies to a span, by element-size bucket.
struct BitmapLayout {
    min_size_for_header: u64,
    header_size: u64,
    max_small: u64,
    /// Bytes reserved at the end of a small span for inline mark bits, for runtimes that keep
    /// them there, and the element size at which that starts applying.
    inline_mark_bits: Option<(u64, u64)>,
}

impl BitmapLayout {
    fn new(ctx: Ctx, consts: &ConstTable) -> Result<BitmapLayout> {
        let min_size_for_header = consts
            .find("runtime.minSizeForMallocHeader")
            .or_else(|| consts.find("internal/runtime/gc.MinSizeForMallocHeader"))
            .ok_or_else(|| {
                Error::CorruptFormat("runtime predates malloc-header heap layout; cannot type the heap".into())
            })? as u64;
        let header_size = consts
            .find("runtime.mallocHeaderSize")
            .or_else(|| consts.find("internal/runtime/gc.MallocHeaderSize"))
            .unwrap_or(8) as u64;
        let max_small = consts
            .find("runtime.maxSmallSize")
            .or_else(|| consts.find("internal/runtime/gc.MaxSmallSize"))
            .unwrap_or(32 << 10) as u64;

        let inline_mark_bits = ctx
            .types
            .by_name("internal/runtime/gc.spanInlineMarkBits")
            .map(|id| ctx.types.get(id).size)
            .map(|size| {
                let min = consts.find("internal/runtime/gc.MinSizeForSpanInlineMarkBits").unwrap_or(16) as u64;
                (size, min)
            });

        Ok(BitmapLayout { min_size_for_header, header_size, max_small, inline_mark_bits })
    }

    #[allow(clippy::too_many_arguments)]
    fn extract(
        &self,
        ctx: Ctx,
        rt: &RtTypeReader,
        span: &Val,
        start: Addr,
        span_bytes: u64,
        elem_size: u64,
        nelems: u64,
        allocated: &dyn Fn(u64) -> bool,
        heap: &mut HeapTable,
    ) -> Result<()> {
        let ptr_size = ctx.image.pointer_size();

        if elem_size <= self.min_size_for_header {
            // Heap bits packed at the tail of the span itself: one bit per word of the whole
            // span, optionally with the inline mark-bits block after them.
            let reserved = match self.inline_mark_bits {
                Some((size, min_elem)) if elem_size >= min_elem => size,
                _ => 0,
            };
            let bitmap_bytes = span_bytes / ptr_size / 8;
            let bitmap_addr = start + span_bytes - reserved - bitmap_bytes;
            let bitmap = ctx.image.read_bytes(bitmap_addr, bitmap_bytes)?;
            for word in 0..span_bytes / ptr_size {
                if bitmap[(word / 8) as usize] >> (word % 8) & 1 != 0 {
                    heap.set_ptr(start + word * ptr_size);
                }
            }
        } else if elem_size <= self.max_small - self.header_size {
            // Each allocated slot starts with a header pointing at the runtime type of its
            // contents; the type's mask tiles across the body.
            for index in 0..nelems {
                if !allocated(index) {
                    continue;
                }
                let slot = start + index * elem_size;
                let descriptor = ctx.image.read_ptr(slot)?;
                if descriptor.is_null() {
                    continue;
                }
                let rt_type = rt.read(ctx, descriptor)?;
                self.tile(ctx, rt, &rt_type, slot + self.header_size, elem_size - self.header_size, heap)?;
            }
        } else {
            // One large object; the span records its type directly.
            if !span.has_field("largeType") {
                warn!("large span at {start} has no largeType field; object left untyped");
                return Ok(());
            }
            let descriptor = span.field("largeType")?.ptr()?;
            if descriptor.is_null() {
                return Ok(());
            }
            let rt_type = rt.read(ctx, descriptor)?;
            self.tile(ctx, rt, &rt_type, start, elem_size, heap)?;
        }
        Ok(())
    }

    /// Apply a type's pointer mask repeatedly across `len` bytes starting at `base` - one stride
    /// per tiled copy of the type.
    fn tile(
        &self,
        ctx: Ctx,
        rt: &RtTypeReader,
        rt_type: &crate::rttype::RtType,
        base: Addr,
        len: u64,
        heap: &mut HeapTable,
    ) -> Result<()> {
        if rt_type.size == 0 {
            return Ok(());
        }
        let ptr_size = ctx.image.pointer_size();
        let mask = rt.gc_mask(ctx.image, rt_type)?;
        let end = base + len;
        for copy in 0..(len / rt_type.size).max(1) {
            let tile = base + copy * rt_type.size;
            for (word, &is_ptr) in mask.iter().enumerate() {
                let slot = tile + word as u64 * ptr_size;
                if is_ptr && slot < end {
                    heap.set_ptr(slot);
                }
            }
        }
        Ok(())
    }
}

fn read_finalizers(ctx: Ctx, span: &Val, start: Addr, finalizer_kind: u64, out: &mut Vec<Global>) -> Result<()> {
    let Some(finalizer_type) = ctx.types.by_name("runtime.specialfinalizer") else { return Ok(()) };

    let mut special = span.field("specials")?;
    loop {
        let addr = special.ptr()?;
        if addr.is_null() {
            return Ok(());
        }
        let record = special.deref()?;
        let kind = record.field("kind")?.uint()?;
        if kind == finalizer_kind {
            let object = start + record.field("offset")?.uint()?;
            out.push(Global {
                name: format!("finalizer for {object}"),
                addr,
                typ: Some(finalizer_type),
            });
        }
        special = record.field("next")?;
    }
}
