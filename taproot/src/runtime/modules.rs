/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! The runtime's module list and function table. Every loaded module (the main executable, plus
//! any plugins) hangs off `runtime.firstmoduledata`; each carries its section extents, the
//! pointer masks for its data and bss, and the packed function table the runtime itself uses for
//! traceback - which is also where frame sizes and stack maps come from.

use crate::{
    dwarf::{pctab::PcTab, ConstTable},
    runtime::val::{Ctx, Val},
    Error, Result,
};
use loam::Addr;
use std::collections::HashMap;
use tracing::debug;

/// `runtime.bitvector`: a bit count and a byte pointer.
#[derive(Clone, Copy, Debug)]
pub struct BitVector {
    pub n: i64,
    pub data: Addr,
}

impl BitVector {
    pub fn bit(&self, image: &loam::ProcessImage, index: i64) -> Result<bool> {
        debug_assert!(index < self.n);
        let byte = image.read_u8(self.data + (index / 8) as u64)?;
        Ok(byte >> (index % 8) & 1 != 0)
    }
}

#[derive(Clone, Debug)]
pub struct Module {
    pub text: Addr,
    pub etext: Addr,
    pub types: Addr,
    pub etypes: Addr,
    pub data: Addr,
    pub edata: Addr,
    pub bss: Addr,
    pub ebss: Addr,
    pub gcdata_mask: BitVector,
    pub gcbss_mask: BitVector,
    pub minpc: Addr,
    pub maxpc: Addr,
}

pub struct FuncInfo {
    pub entry: Addr,
    /// One past the function's last byte, as the runtime sees it: the next function's entry (so
    /// inter-function padding belongs to the function before it).
    pub end: Addr,
    pub name: String,
    /// Frame size by pc offset (the `pcsp` table).
    pub frame_size: PcTab,
    /// Stack-map index by pc offset.
    pub stackmap_index: PcTab,
    /// Argument and local stack maps (`runtime.stackmap` records); null when absent.
    pub args_map: Addr,
    pub locals_map: Addr,
}

pub struct FuncTable {
    funcs: Vec<FuncInfo>,
    by_name: HashMap<String, usize>,
}

impl FuncTable {
    /// The function whose range contains `pc`.
    pub fn find(&self, pc: Addr) -> Option<&FuncInfo> {
        let index = self.funcs.partition_point(|f| f.entry <= pc).checked_sub(1)?;
        let func = &self.funcs[index];
        (pc < func.end).then_some(func)
    }

    pub fn by_name(&self, name: &str) -> Option<&FuncInfo> {
        self.by_name.get(name).map(|&index| &self.funcs[index])
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

/// Read the module chain and its function tables.
pub fn read_modules(ctx: Ctx, first: Val, consts: &ConstTable) -> Result<(Vec<Module>, FuncTable)> {
    let pcdata_stackmap = consts.get("runtime._PCDATA_StackMapIndex");
    let funcdata_args = consts.get("runtime._FUNCDATA_ArgsPointerMaps");
    let funcdata_locals = consts.get("runtime._FUNCDATA_LocalsPointerMaps");
    let quantum = ctx.image.arch().pc_quantum();

    let mut modules = Vec::new();
    let mut funcs = Vec::new();
    let mut module_val = Some(first);
    while let Some(val) = module_val {
        let module = Module {
            text: val.field("text")?.ptr()?,
            etext: val.field("etext")?.ptr()?,
            types: val.field("types")?.ptr()?,
            etypes: val.field("etypes")?.ptr()?,
            data: val.field("data")?.ptr()?,
            edata: val.field("edata")?.ptr()?,
            bss: val.field("bss")?.ptr()?,
            ebss: val.field("ebss")?.ptr()?,
            gcdata_mask: bitvector(&val.field("gcdatamask")?)?,
            gcbss_mask: bitvector(&val.field("gcbssmask")?)?,
            minpc: val.field("minpc")?.ptr()?,
            maxpc: val.field("maxpc")?.ptr()?,
        };
        read_funcs(ctx, &val, &module, quantum, pcdata_stackmap, funcdata_args, funcdata_locals, &mut funcs)?;
        modules.push(module);

        let next = val.field("next")?;
        module_val = match next.ptr()? {
            addr if addr.is_null() => None,
            _ => Some(next.deref()?),
        };
    }

    funcs.sort_by_key(|f: &FuncInfo| f.entry);
    let by_name = funcs.iter().enumerate().map(|(index, f)| (f.name.clone(), index)).collect();
    debug!("read {} modules, {} functions", modules.len(), funcs.len());
    Ok((modules, FuncTable { funcs, by_name }))
}

fn bitvector(val: &Val) -> Result<BitVector> {
    Ok(BitVector { n: val.field("n")?.int()?, data: val.field("bytedata")?.ptr()? })
}

#[allow(clippy::too_many_arguments)]
fn read_funcs(
    ctx: Ctx,
    module: &Val,
    extents: &Module,
    quantum: u64,
    pcdata_stackmap: i64,
    funcdata_args: i64,
    funcdata_locals: i64,
    out: &mut Vec<FuncInfo>,
) -> Result<()> {
    let image = ctx.image;
    let ftab = module.field("ftab")?.slice()?;
    let pclntable = module.field("pclntable")?.slice()?.data;
    let pctab = if module.has_field("pctab") { module.field("pctab")?.slice()?.data } else { pclntable };
    let funcnametab =
        if module.has_field("funcnametab") { module.field("funcnametab")?.slice()?.data } else { pclntable };
    let gofunc = if module.has_field("gofunc") { Some(module.field("gofunc")?.ptr()?) } else { None };

    let func_type = ctx
        .types
        .by_name("runtime._func")
        .ok_or_else(|| Error::CorruptFormat("no runtime._func type in debug info".into()))?;
    let func_type_size = ctx.types.get(func_type).size;

    // The last table entry is a sentinel that only marks the end of the text range.
    let count = ftab.len.saturating_sub(1);
    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count {
        let ftab_entry = ftab.index(i)?;
        let entry = if ftab_entry.has_field("entryoff") {
            extents.text + ftab_entry.field("entryoff")?.uint()?
        } else {
            Addr(ftab_entry.field("entry")?.uint()?)
        };
        entries.push((entry, ftab_entry.field("funcoff")?.uint()?));
    }

    for (i, &(entry, funcoff)) in entries.iter().enumerate() {
        let end = entries.get(i + 1).map(|&(next, _)| next).unwrap_or(extents.maxpc);
        let func = Val::new(ctx, pclntable + funcoff, func_type);

        let name_off = if func.has_field("nameOff") {
            func.field("nameOff")?.int()?
        } else {
            func.field("nameoff")?.int()?
        };
        let name = read_func_name(image, funcnametab + name_off as u64)?;

        let pcsp = func.field("pcsp")?.uint()?;
        let frame_size =
            if pcsp != 0 { PcTab::read(image, pctab + pcsp, quantum)? } else { PcTab::default() };

        let npcdata = func.field("npcdata")?.uint()?;
        let pcdata_base = func.addr + func_type_size;
        let stackmap_index = if (pcdata_stackmap as u64) < npcdata {
            let offset = image.read_u32(pcdata_base + pcdata_stackmap as u64 * 4)?;
            if offset != 0 { PcTab::read(image, pctab + offset as u64, quantum)? } else { PcTab::default() }
        } else {
            PcTab::default()
        };

        let nfuncdata = func.field("nfuncdata")?.uint()?;
        let funcdata_base = pcdata_base + npcdata * 4;
        let funcdata = |index: i64| -> Result<Addr> {
            if index as u64 >= nfuncdata {
                return Ok(Addr::NULL);
            }
            match gofunc {
                // Offsets from the module's go:func.* symbol; !0 means no data.
                Some(gofunc) => {
                    let offset = image.read_u32(funcdata_base + index as u64 * 4)?;
                    if offset == u32::MAX {
                        Ok(Addr::NULL)
                    } else {
                        Ok(gofunc + offset as u64)
                    }
                }
                // Older layout: full pointers, aligned up to pointer size.
                None => {
                    let aligned = funcdata_base.align_up(image.pointer_size());
                    image.read_ptr(aligned + index as u64 * image.pointer_size()).map_err(Error::Load)
                }
            }
        };

        out.push(FuncInfo {
            entry,
            end,
            name,
            frame_size,
            stackmap_index,
            args_map: funcdata(funcdata_args)?,
            locals_map: funcdata(funcdata_locals)?,
        });
    }
    Ok(())
}

fn read_func_name(image: &loam::ProcessImage, addr: Addr) -> Result<String> {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        let byte = image.read_u8(cursor)?;
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(byte);
        cursor += 1;
        if bytes.len() > 4096 {
            return Err(Error::CorruptFormat(format!("unterminated function name at {addr}")));
        }
    }
}
