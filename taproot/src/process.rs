/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! [`Process`] owns the whole analysis: the reconstructed image, the decoded debug info, the
//! runtime's tables, the marked heap, and the root list. Everything is built eagerly at load
//! except the two expensive indices - heap typings and reverse edges - which initialize once on
//! first use behind `OnceCell` guards so renderers can query concurrently.

use crate::{
    dwarf::{DwarfInfo, FuncVar, Global},
    graph::{self, ReverseEdges},
    heap::HeapTable,
    root::{Root, RootKind},
    rttype::RtTypeReader,
    runtime::{self, val::Ctx, RuntimeInfo},
    stats::Stats,
    typing::{HeapTypings, TypingEngine},
    unwind::{Goroutine, Unwinder},
    Result,
};
use loam::{Addr, Mapping, Perm, ProcessImage};
use once_cell::sync::OnceCell;
use std::{collections::HashMap, path::Path};
use tracing::info;

pub struct Process {
    image: ProcessImage,
    dwarf: DwarfInfo,
    rt: RtTypeReader,
    runtime: RuntimeInfo,
    vars: HashMap<u64, Vec<FuncVar>>,
    pub(crate) heap: HeapTable,
    stats: Stats,
    roots: Vec<Root>,
    goroutines: Vec<Goroutine>,
    n_obj: usize,
    warnings: Vec<String>,

    typings: OnceCell<HeapTypings>,
    reverse: OnceCell<ReverseEdges>,
}

impl Process {
    pub fn load(core: &Path, exe: Option<&Path>, base: Option<&Path>) -> Result<Process> {
        let image = loam::load(core, exe, base)?;
        let mut dwarf = DwarfInfo::new(&image)?;
        let ctx = Ctx { image: &image, types: &dwarf.types };
        let rt = RtTypeReader::new(ctx, &dwarf.consts)?;
        let mut runtime = runtime::read(&image, &dwarf, &rt)?;
        let vars = dwarf.resolve_vars(&image, |pc| runtime.funcs.find(pc).map(|f| (f.entry, f.end)))?;

        let mut heap = std::mem::take(&mut runtime.heap.heap);

        // Finalizer specials become globals; so do the pointer words the module bitmaps know
        // about but no DWARF variable covers.
        for finalizer in std::mem::take(&mut runtime.heap.finalizers) {
            dwarf.push_global(finalizer);
        }
        bitmap_globals(&image, &mut dwarf, &runtime)?;

        // Roots, in their defined order: globals first (by creation order), then goroutine
        // stacks as the unwinder walks them.
        let mut roots: Vec<Root> = Vec::new();
        for global in &dwarf.globals {
            let id = roots.len();
            roots.push(Root {
                id,
                name: global.name.clone(),
                typ: global.typ,
                kind: RootKind::Mem(global.addr),
                frame: None,
            });
        }

        let mut unwinder = Unwinder::new(&image, &dwarf, &runtime, &vars);
        let goroutines = unwinder.unwind_all(0, &mut roots);
        let mut warnings = unwinder.warnings;

        let (n_obj, live_bytes) = graph::mark(&image, &dwarf.types, &mut heap, &roots)?;
        info!("marked {n_obj} live objects ({live_bytes} bytes)");

        let stats = build_stats(&image, &runtime, live_bytes);
        warnings.extend(image.warnings().iter().cloned());

        Ok(Process {
            image,
            dwarf,
            rt,
            runtime,
            vars,
            heap,
            stats,
            roots,
            goroutines,
            n_obj,
            warnings,
            typings: OnceCell::new(),
            reverse: OnceCell::new(),
        })
    }

    pub fn image(&self) -> &ProcessImage {
        &self.image
    }

    pub fn dwarf(&self) -> &DwarfInfo {
        &self.dwarf
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn goroutines(&self) -> &[Goroutine] {
        &self.goroutines
    }

    pub fn roots(&self) -> &[Root] {
        &self.roots
    }

    pub fn root(&self, id: usize) -> &Root {
        &self.roots[id]
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn build_version(&self) -> Option<&str> {
        self.runtime.build_version.as_deref()
    }

    pub fn func_name(&self, pc: Addr) -> Option<&str> {
        self.runtime.funcs.find(pc).map(|f| f.name.as_str())
    }

    pub fn n_objects(&self) -> usize {
        self.n_obj
    }

    /// The heap typing table, computed on first use.
    pub(crate) fn typings(&self) -> &HeapTypings {
        self.typings.get_or_init(|| {
            let type_ranges = self.runtime.type_ranges();
            TypingEngine::new(
                &self.image,
                &self.dwarf,
                &self.rt,
                &type_ranges,
                &self.runtime.funcs,
                &self.vars,
                &self.heap,
                self.n_obj,
            )
            .run(&self.roots)
        })
    }

    /// The reverse-edge index, computed on first use.
    pub(crate) fn reverse(&self) -> &ReverseEdges {
        self.reverse
            .get_or_init(|| graph::build_reverse(&self.image, &self.dwarf.types, &self.heap, &self.roots, self.n_obj))
    }
}

/// Synthesize roots for global pointer words the module bitmaps mark but no DWARF global covers.
fn bitmap_globals(image: &ProcessImage, dwarf: &mut DwarfInfo, runtime: &RuntimeInfo) -> Result<()> {
    let ptr_size = image.pointer_size();

    // The extent each DWARF global covers, sorted, for overlap checks.
    let mut covered: Vec<(Addr, Addr)> = dwarf
        .globals
        .iter()
        .map(|g| {
            let size = g.typ.map(|t| dwarf.types.get(t).size).unwrap_or(ptr_size).max(ptr_size);
            (g.addr, g.addr + size)
        })
        .collect();
    covered.sort();
    let is_covered = |addr: Addr| {
        let index = covered.partition_point(|&(lo, _)| lo <= addr);
        index > 0 && addr < covered[index - 1].1
    };

    let unsafe_ptr = dwarf.types.by_name("unsafe.Pointer");
    let mut extras = Vec::new();
    for module in &runtime.modules {
        for (mask, start) in [(&module.gcdata_mask, module.data), (&module.gcbss_mask, module.bss)] {
            for bit in 0..mask.n {
                if !mask.bit(image, bit)? {
                    continue;
                }
                let addr = start + bit as u64 * ptr_size;
                if is_covered(addr) {
                    continue;
                }
                extras.push(Global { name: format!("unnamed global {addr}"), addr, typ: unsafe_ptr });
            }
        }
    }
    for extra in extras {
        dwarf.push_global(extra);
    }
    Ok(())
}

/// The memory-breakdown tree: one classification pass over the process mappings, plus the
/// span-level accounting from the heap walk.
fn build_stats(image: &ProcessImage, runtime: &RuntimeInfo, live_bytes: u64) -> Stats {
    let heap_model = &runtime.heap;

    let mut text = 0;
    let mut readonly = 0;
    let mut data = 0;
    let mut bss = 0;
    let mut span_table = 0;
    for mapping in image.mappings() {
        let size = mapping.size();
        let perm = mapping.perm;
        if perm == Perm::EXEC {
            // Execute-only regions are unreadable by definition; they are left out of the total.
            continue;
        }
        if perm.contains(Perm::EXEC) {
            text += size;
        } else if !perm.contains(Perm::WRITE) {
            readonly += size;
        } else {
            // Writable. Portions covered by heap arenas are accounted by the span walk; the
            // arenas' span tables get their own bucket; copy-on-write file mappings are data,
            // anonymous memory is bss.
            let arena_overlap = overlap(mapping, &heap_model.arena_ranges);
            let table_overlap = overlap(mapping, &heap_model.span_table_ranges);
            span_table += table_overlap;
            let rest = size - arena_overlap - table_overlap;
            if mapping.orig_source.is_some() {
                data += rest;
            } else {
                bss += rest;
            }
        }
    }

    let garbage = heap_model.in_use_alloc.saturating_sub(live_bytes);
    let heap = Stats::branch(
        "heap",
        vec![
            Stats::branch(
                "in use spans",
                vec![
                    Stats::branch(
                        "alloc",
                        vec![Stats::leaf("live", live_bytes), Stats::leaf("garbage", garbage)],
                    ),
                    Stats::leaf("free", heap_model.in_use_free),
                    Stats::leaf("round", heap_model.in_use_round),
                ],
            ),
            Stats::branch(
                "manual spans",
                vec![
                    Stats::leaf("alloc", heap_model.manual_alloc),
                    Stats::leaf("free", heap_model.manual_free),
                ],
            ),
            Stats::branch(
                "free spans",
                vec![
                    Stats::leaf("retained", runtime.free_pages.retained),
                    Stats::leaf("released", runtime.free_pages.released),
                ],
            ),
        ],
    );

    Stats::branch(
        "all",
        vec![
            Stats::leaf("text", text),
            Stats::leaf("readonly", readonly),
            Stats::leaf("data", data),
            Stats::leaf("bss", bss),
            Stats::leaf("span table", span_table),
            heap,
        ],
    )
}

fn overlap(mapping: &Mapping, ranges: &[(Addr, Addr)]) -> u64 {
    ranges
        .iter()
        .map(|&(lo, hi)| {
            let start = mapping.min.max(lo);
            let end = mapping.max.min(hi);
            if start < end {
                end.distance_from(start)
            } else {
                0
            }
        })
        .sum()
}
