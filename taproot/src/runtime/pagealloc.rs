/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Free-page accounting from the runtime's page allocator. Spans returned to the heap disappear
//! from the span walk, so the pages they covered are counted here instead: every clear bit in the
//! allocator's chunk bitmaps is a free page, split into retained and released (scavenged) totals.
//! Pages parked in per-P caches are free too, and are OR-ed in on top.

use crate::{
    dwarf::ConstTable,
    runtime::val::{Ctx, Val},
    Result,
};
use loam::Addr;

#[derive(Clone, Copy, Debug, Default)]
pub struct FreePages {
    pub retained: u64,
    pub released: u64,
}

pub fn read_free_pages(ctx: Ctx, mheap: &Val, allp: &Val, consts: &ConstTable) -> Result<FreePages> {
    let page_size = consts.find("runtime.pageSize").or_else(|| consts.find("runtime._PageSize")).unwrap_or(8192) as u64;
    let arena_base_offset = consts.get("runtime.arenaBaseOffset") as u64;
    let chunk_bytes = consts.get("runtime.pallocChunkBytes") as u64;
    let l2_bits = consts.get("runtime.pallocChunksL2Bits") as u64;

    let pages = mheap.field("pages")?;
    let chunks = pages.field("chunks")?;
    let chunk_type = ctx
        .types
        .get(chunks.typ)
        .element // *[1 << l2] pallocData
        .and_then(|p| ctx.types.get(p).element) // the array
        .and_then(|a| ctx.types.get(a).element) // pallocData
        .ok_or_else(|| crate::Error::CorruptFormat("cannot resolve pallocData type".into()))?;
    let chunk_size = ctx.types.get(chunk_type).size;
    let palloc_bits_offset = ctx.types.get(chunk_type).field("pallocBits").map(|f| f.offset).unwrap_or(0);
    let scavenged_offset = ctx.types.get(chunk_type).field("scavenged").map(|f| f.offset).unwrap_or(64);

    let chunk_index = |addr: u64| addr.wrapping_add(arena_base_offset) / chunk_bytes;
    let mut free = FreePages::default();

    let ranges = pages.field("inUse")?.field("ranges")?.slice()?;
    for i in 0..ranges.len {
        let range = ranges.index(i)?;
        let base = range.field("base")?.field("a")?.uint()?;
        let limit = range.field("limit")?.field("a")?.uint()?;
        if limit <= base {
            continue;
        }

        for index in chunk_index(base)..=chunk_index(limit - 1) {
            let l1_entry = chunks.array_index(index >> l2_bits)?;
            let l2_base = l1_entry.ptr()?;
            if l2_base.is_null() {
                continue;
            }
            let chunk = l2_base + (index & ((1 << l2_bits) - 1)) * chunk_size;
            for word in 0..8u64 {
                let alloc = ctx.image.read_u64(chunk + palloc_bits_offset + word * 8)?;
                let scavenged = ctx.image.read_u64(chunk + scavenged_offset + word * 8)?;
                let free_pages = (!alloc).count_ones() as u64;
                let released_pages = (!alloc & scavenged).count_ones() as u64;
                free.retained += (free_pages - released_pages) * page_size;
                free.released += released_pages * page_size;
            }
        }
    }

    // Pages sitting in per-P allocation caches are marked allocated in the chunk bitmaps but are
    // actually free.
    let ps = allp.slice()?;
    for i in 0..ps.len {
        let p = ps.index(i)?;
        if p.ptr()?.is_null() {
            continue;
        }
        let cache = p.deref()?.field("pcache")?;
        let bits = cache.field("cache")?.uint()?;
        let scavenged = cache.field("scav")?.uint()?;
        let free_pages = bits.count_ones() as u64;
        let released_pages = (bits & scavenged).count_ones() as u64;
        free.retained += (free_pages - released_pages) * page_size;
        free.released += released_pages * page_size;
    }

    Ok(free)
}
