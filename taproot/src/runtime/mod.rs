/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Runtime introspection: reading the dumped runtime's own data structures - modules, function
//! table, arenas, spans, page allocator, P caches, the all-goroutines list - through the DWARF
//! type layouts decoded by [`crate::dwarf`].

pub mod goroutine;
pub mod modules;
pub mod pagealloc;
pub mod spans;
pub mod val;

use crate::{
    dwarf::DwarfInfo,
    rttype::RtTypeReader,
    Error, Result,
};
use goroutine::GoroutineRec;
use loam::{Addr, ProcessImage};
use modules::{FuncTable, Module};
use pagealloc::FreePages;
use spans::HeapModel;
use val::{Ctx, Val};

pub struct RuntimeInfo {
    pub modules: Vec<Module>,
    pub funcs: FuncTable,
    pub heap: HeapModel,
    pub free_pages: FreePages,
    pub goroutines: Vec<GoroutineRec>,
    pub build_version: Option<String>,
}

impl RuntimeInfo {
    /// The `(types, etypes)` section range of each module, for resolving runtime type names.
    pub fn type_ranges(&self) -> Vec<(Addr, Addr)> {
        self.modules.iter().map(|m| (m.types, m.etypes)).collect()
    }
}

/// A typed view of a named runtime global.
pub fn global_val<'a>(ctx: Ctx<'a>, dwarf: &DwarfInfo, name: &str) -> Result<Val<'a>> {
    let global = dwarf
        .global(name)
        .ok_or_else(|| Error::CorruptFormat(format!("runtime global {name} not in debug info")))?;
    let typ = global
        .typ
        .ok_or_else(|| Error::CorruptFormat(format!("runtime global {name} has no type")))?;
    Ok(Val::new(ctx, global.addr, typ))
}

pub fn read(image: &ProcessImage, dwarf: &DwarfInfo, rt: &RtTypeReader) -> Result<RuntimeInfo> {
    let ctx = Ctx { image, types: &dwarf.types };

    let first_module = global_val(ctx, dwarf, "runtime.firstmoduledata")?;
    let (modules, funcs) = modules::read_modules(ctx, first_module, &dwarf.consts)?;

    let mheap = global_val(ctx, dwarf, "runtime.mheap_")?;
    let heap = spans::read_heap(ctx, mheap, &dwarf.consts, rt)?;

    let allp = global_val(ctx, dwarf, "runtime.allp")?;
    let free_pages = pagealloc::read_free_pages(ctx, &mheap, &allp, &dwarf.consts)?;

    let allgs = global_val(ctx, dwarf, "runtime.allgs")?;
    let goroutines = goroutine::read_goroutines(&allgs, &dwarf.consts)?;

    let build_version = global_val(ctx, dwarf, "runtime.buildVersion").and_then(|v| v.string()).ok();

    Ok(RuntimeInfo { modules, funcs, heap, free_pages, goroutines, build_version })
}
