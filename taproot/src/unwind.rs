/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The stack unwinder and root enumerator. Each goroutine record is run through a status state
//! machine to find its resume point, then walked frame by frame: frame extents from the pcsp
//! table, pointer liveness from the stack maps, named roots from DWARF variable locations, and
//! anonymous roots for live slots no variable claims. Unwinding stops at `runtime.goexit`,
//! switches stacks at `runtime.systemstack`, and climbs through signal handlers at
//! `runtime.sigtrampgo` by re-seeding registers from the saved `ucontext`.

use crate::{
    dwarf::{
        loc::{self, Location, PieceKind},
        DwarfInfo, FuncVar,
    },
    root::{Root, RootKind},
    runtime::{goroutine::GoroutineRec, modules::FuncInfo, RuntimeInfo},
    Error, Result,
};
use loam::{Addr, ProcessImage, RegisterFile};
use std::collections::HashMap;
use tracing::warn;

pub struct Frame {
    pub func_name: String,
    pub entry: Addr,
    pub pc: Addr,
    /// Stack extent: `[min, max)`, where `max - min` is the frame size plus the pushed return
    /// address.
    pub min: Addr,
    pub max: Addr,
    /// Ids (into the process root list) of the roots owned by this frame.
    pub roots: Vec<usize>,
}

pub struct Goroutine {
    pub rec: GoroutineRec,
    pub stack_size: u64,
    /// Innermost first. Each frame is the parent of the one before it.
    pub frames: Vec<Frame>,
}

struct Status {
    idle: u64,
    runnable: u64,
    running: u64,
    syscall: u64,
    waiting: u64,
    dead: u64,
}

pub struct Unwinder<'a> {
    image: &'a ProcessImage,
    dwarf: &'a DwarfInfo,
    runtime: &'a RuntimeInfo,
    vars: &'a HashMap<u64, Vec<FuncVar>>,
    status: Status,
    unsafe_ptr: Option<crate::dwarf::types::TypeId>,
    pub warnings: Vec<String>,
}

impl<'a> Unwinder<'a> {
    pub fn new(
        image: &'a ProcessImage,
        dwarf: &'a DwarfInfo,
        runtime: &'a RuntimeInfo,
        vars: &'a HashMap<u64, Vec<FuncVar>>,
    ) -> Unwinder<'a> {
        let consts = &dwarf.consts;
        Unwinder {
            image,
            dwarf,
            runtime,
            vars,
            status: Status {
                idle: consts.get("runtime._Gidle") as u64,
                runnable: consts.get("runtime._Grunnable") as u64,
                running: consts.get("runtime._Grunning") as u64,
                syscall: consts.get("runtime._Gsyscall") as u64,
                waiting: consts.get("runtime._Gwaiting") as u64,
                dead: consts.get("runtime._Gdead") as u64,
            },
            unsafe_ptr: dwarf.types.by_name("unsafe.Pointer"),
            warnings: Vec::new(),
        }
    }

    /// Unwind every goroutine, appending stack roots to `roots` in frame order. Dead goroutines
    /// are omitted entirely; goroutines in states with no resumable stack come back frameless.
    pub fn unwind_all(&mut self, goroutine_index_base: usize, roots: &mut Vec<Root>) -> Vec<Goroutine> {
        let mut out = Vec::new();
        for rec in self.runtime.goroutines.clone() {
            if rec.status == self.status.dead {
                continue;
            }
            let index = goroutine_index_base + out.len();
            match self.unwind_one(&rec, index, roots) {
                Ok(Some(goroutine)) => out.push(goroutine),
                Ok(None) => (),
                Err(error) => {
                    self.warnings.push(format!("goroutine {}: {error}", rec.goid));
                    out.push(Goroutine { rec, stack_size: 0, frames: Vec::new() });
                }
            }
        }
        out
    }

    fn unwind_one(
        &mut self,
        rec: &GoroutineRec,
        g_index: usize,
        roots: &mut Vec<Root>,
    ) -> Result<Option<Goroutine>> {
        let status = rec.status;
        let arch = self.image.arch();

        let mut regs = RegisterFile::zeroed(arch);
        let resume = if status == self.status.idle {
            None
        } else if status == self.status.runnable || status == self.status.waiting {
            Some((rec.sched_pc, rec.sched_sp))
        } else if status == self.status.running {
            // Take state from the OS thread driving this goroutine's M. With no attached thread
            // there is nothing to resume from; the goroutine is dropped.
            let thread = rec.m_procid.and_then(|procid| self.image.threads().iter().find(|t| t.pid == procid));
            match thread {
                Some(thread) => {
                    regs = arch.dwarf_registers(&thread.regs);
                    Some((thread.pc, thread.sp))
                }
                None => return Ok(None),
            }
        } else if status == self.status.syscall {
            Some((rec.syscall_pc, rec.syscall_sp))
        } else {
            // An in-between state (copystack, preempted, or something newer); there is nothing
            // stable to walk.
            None
        };

        let Some((mut pc, mut sp)) = resume else {
            return Ok(Some(Goroutine { rec: rec.clone(), stack_size: 0, frames: Vec::new() }));
        };

        let stack_size = if rec.stack_hi > sp { rec.stack_hi.distance_from(sp) } else { 0 };
        let mut frames = Vec::new();
        loop {
            let Some(func) = self.runtime.funcs.find(pc) else {
                self.warnings.push(format!("goroutine {}: no function for pc {pc}; backtrace truncated", rec.goid));
                break;
            };

            let frame = match self.read_frame(func, pc, sp, &regs, (g_index, frames.len()), roots) {
                Ok(frame) => frame,
                Err(error) => {
                    self.warnings.push(format!(
                        "goroutine {}: cannot decode frame for {} at {pc}: {error}; backtrace truncated",
                        rec.goid, func.name
                    ));
                    break;
                }
            };
            let max = frame.max;
            let name = frame.func_name.clone();
            frames.push(frame);

            if name == "runtime.goexit" {
                break;
            }
            if name == "runtime.systemstack" {
                // The scheduler record still holds the user stack this call switched away from.
                pc = rec.sched_pc;
                sp = rec.sched_sp;
                continue;
            }
            if name == "runtime.sigtrampgo" {
                match self.unwind_signal_frame(func, pc, max, &regs) {
                    Ok((new_regs, new_pc, new_sp)) => {
                        regs = new_regs;
                        pc = new_pc;
                        sp = new_sp;
                        continue;
                    }
                    Err(error) => {
                        self.warnings
                            .push(format!("goroutine {}: {error}; backtrace truncated", rec.goid));
                        break;
                    }
                }
            }

            let return_pc = match self.image.arch().has_link_register() {
                // On amd64 the return address sits just below the frame top.
                false => self.image.read_ptr(max - self.image.pointer_size())?,
                true if frames.len() == 1 && func.frame_size.find(pc.distance_from(func.entry)).unwrap_or(0) == 0 => {
                    // A leaf that has not yet spilled the link register.
                    Addr(regs.get(self.image.arch().link_register().unwrap_or(30)))
                }
                true => self.image.read_ptr(max - self.image.pointer_size())?,
            };
            if return_pc.is_null() {
                break;
            }
            sp = max;
            pc = return_pc;
        }

        Ok(Some(Goroutine { rec: rec.clone(), stack_size, frames }))
    }

    fn read_frame(
        &mut self,
        func: &FuncInfo,
        pc: Addr,
        sp: Addr,
        regs: &RegisterFile,
        frame_id: (usize, usize),
        roots: &mut Vec<Root>,
    ) -> Result<Frame> {
        let ptr_size = self.image.pointer_size();
        let off = pc.distance_from(func.entry);
        let size = func.frame_size.find(off).unwrap_or(0).max(0) as u64;
        let min = sp;
        let max = sp + size + ptr_size;

        let mut live = stack_map_slots(self.image, func, off, max)?;
        let mut frame_roots = Vec::new();

        // Named roots from DWARF variable locations. Whatever they claim is no longer anonymous.
        if let Some(vars) = self.vars.get(&func.entry.get()) {
            for var in vars {
                let Some(entry) = var.entries.iter().find(|e| e.low <= pc && pc < e.high) else { continue };
                let var_size = var.typ.map(|t| self.dwarf.types.get(t).size).unwrap_or(ptr_size);
                let location = match loc::evaluate(
                    &entry.program,
                    regs,
                    max.get(),
                    var_size,
                    self.image.static_base(),
                    self.image,
                ) {
                    Ok(location) => location,
                    Err(error) => {
                        warn!("variable {}: {error}", var.name);
                        continue;
                    }
                };

                let kind = match location {
                    Location::Address(addr) => {
                        claim(&mut live, addr, var_size);
                        RootKind::Mem(addr)
                    }
                    Location::Pieces(pieces) => {
                        for piece in &pieces {
                            if piece.kind == PieceKind::Address {
                                claim(&mut live, Addr(piece.value), piece.size);
                            }
                        }
                        RootKind::Composite(pieces)
                    }
                };
                let id = roots.len();
                roots.push(Root { id, name: var.name.clone(), typ: var.typ, kind, frame: Some(frame_id) });
                frame_roots.push(id);
            }
        }

        // Anything still live is a pointer the compiler told the collector about but DWARF has no
        // name for. Sorted for determinism.
        live.sort();
        for (index, slot) in live.into_iter().enumerate() {
            let id = roots.len();
            roots.push(Root {
                id,
                name: format!("unk{index}"),
                typ: self.unsafe_ptr,
                kind: RootKind::Mem(slot),
                frame: Some(frame_id),
            });
            frame_roots.push(id);
        }

        Ok(Frame { func_name: func.name.clone(), entry: func.entry, pc, min, max, roots: frame_roots })
    }

    /// Recover the interrupted frame from a signal trampoline: dereference the trampoline's
    /// `ctx` argument to the `ucontext` and pull every preserved register out of the embedded
    /// `mcontext`.
    fn unwind_signal_frame(
        &self,
        func: &FuncInfo,
        pc: Addr,
        max: Addr,
        regs: &RegisterFile,
    ) -> Result<(RegisterFile, Addr, Addr)> {
        let vars = self
            .vars
            .get(&func.entry.get())
            .ok_or_else(|| Error::CorruptFormat("no variables for runtime.sigtrampgo".into()))?;
        let ctx_var = vars
            .iter()
            .find(|v| v.name == "ctx")
            .ok_or_else(|| Error::CorruptFormat("runtime.sigtrampgo has no ctx variable".into()))?;
        let entry = ctx_var
            .entries
            .iter()
            .find(|e| e.low <= pc && pc < e.high)
            .ok_or_else(|| Error::CorruptFormat("ctx not live at signal trampoline pc".into()))?;

        let ptr_size = self.image.pointer_size();
        let location =
            loc::evaluate(&entry.program, regs, max.get(), ptr_size, self.image.static_base(), self.image)?;
        let ctx = match location {
            Location::Address(addr) => self.image.read_ptr(addr)?,
            Location::Pieces(pieces) => match pieces.first() {
                Some(piece) if piece.kind == PieceKind::Address => {
                    self.image.read_ptr(Addr(piece.value))?
                }
                Some(piece) => Addr(piece.value),
                None => return Err(Error::CorruptFormat("empty location for ctx".into())),
            },
        };
        self.image.arch().unwind_signal_frame(self.image, ctx).map_err(Error::Load)
    }
}

/// The live pointer slots at `off` within the function, from its stack maps. The stack-map index
/// for the pc picks a row (`-1` and absent both mean row zero); argument slots sit at the frame
/// top and above, local slots below the saved pc/fp pair.
fn stack_map_slots(image: &ProcessImage, func: &FuncInfo, off: u64, max: Addr) -> Result<Vec<Addr>> {
    let ptr_size = image.pointer_size();
    let index = func.stackmap_index.find(off).unwrap_or(-1).max(0);
    let mut live = Vec::new();

    for (map, args) in [(func.locals_map, false), (func.args_map, true)] {
        if map.is_null() {
            continue;
        }
        let n = image.read_i32(map)? as i64;
        let nbit = image.read_i32(map + 4)? as i64;
        if index >= n || nbit == 0 {
            continue;
        }
        let row = map + 8 + (index * ((nbit + 7) / 8)) as u64;
        let base = if args { max } else { max - 16 - nbit as u64 * ptr_size };
        for bit in 0..nbit {
            let byte = image.read_u8(row + (bit / 8) as u64)?;
            if byte >> (bit % 8) & 1 != 0 {
                live.push(base + bit as u64 * ptr_size);
            }
        }
    }
    Ok(live)
}

/// Remove `[addr, addr + size)` from the set of unclaimed live slots.
fn claim(live: &mut Vec<Addr>, addr: Addr, size: u64) {
    live.retain(|&slot| slot < addr || slot >= addr + size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::pctab::PcTab;
    use loam::{image::ProcessBuilder, Perm};

    /// Two stack-map rows of three bits each, for both locals and arguments, and a stack-map
    /// index table that selects row 1 past pc offset 16.
    fn fixture() -> (ProcessImage, FuncInfo) {
        let mut bytes = vec![0u8; 4096];
        // Locals map at 0x1000: n=2, nbit=3, rows 0b101 and 0b010.
        bytes[0..4].copy_from_slice(&2i32.to_le_bytes());
        bytes[4..8].copy_from_slice(&3i32.to_le_bytes());
        bytes[8] = 0b101;
        bytes[9] = 0b010;
        // Args map at 0x1100: n=2, nbit=2, rows 0b01 and 0b11.
        bytes[0x100..0x104].copy_from_slice(&2i32.to_le_bytes());
        bytes[0x104..0x108].copy_from_slice(&2i32.to_le_bytes());
        bytes[0x108] = 0b01;
        bytes[0x109] = 0b11;
        // Stack-map index pc table at 0x1200: -1 for [0, 16), 1 from there on.
        let mut pctab = Vec::new();
        for (delta, pc) in [(0u64, 16u64), (4, 64)] {
            pctab.push(delta as u8);
            pctab.push(pc as u8);
        }
        pctab.push(0);
        bytes[0x200..0x200 + pctab.len()].copy_from_slice(&pctab);

        let image = ProcessBuilder::new(loam::Arch::Amd64).mapping(0x1000, Perm::READ, bytes).build();
        let stackmap_index = PcTab::read(&image, Addr(0x1200), 1).unwrap();
        let func = FuncInfo {
            entry: Addr(0x400000),
            end: Addr(0x400080),
            name: "main.work".to_string(),
            frame_size: PcTab::default(),
            stackmap_index,
            args_map: Addr(0x1100),
            locals_map: Addr(0x1000),
        };
        (image, func)
    }

    #[test]
    fn missing_index_uses_row_zero() {
        let (image, func) = fixture();
        let max = Addr(0x7000);
        let live = stack_map_slots(&image, &func, 0, max).unwrap();

        // Locals row 0 is 0b101: bits 0 and 2, based at max - 16 - 3*8 = 0x6fd8.
        // Args row 0 is 0b01: bit 0 at max.
        assert_eq!(live, vec![Addr(0x6fd8), Addr(0x6fd8 + 16), Addr(0x7000)]);
    }

    #[test]
    fn index_table_selects_row() {
        let (image, func) = fixture();
        let max = Addr(0x7000);
        let live = stack_map_slots(&image, &func, 32, max).unwrap();

        // Row 1: locals 0b010 (bit 1), args 0b11 (bits 0 and 1).
        assert_eq!(live, vec![Addr(0x6fd8 + 8), Addr(0x7000), Addr(0x7008)]);
    }

    #[test]
    fn claimed_ranges_leave_the_live_set() {
        let mut live = vec![Addr(0x100), Addr(0x108), Addr(0x110), Addr(0x200)];
        claim(&mut live, Addr(0x108), 16);
        assert_eq!(live, vec![Addr(0x100), Addr(0x200)]);
    }
}
