/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Reading the runtime's own type descriptors (`internal/abi.Type`) out of the heap and static
//! data. These matter twice: allocation headers and `largeType` pointers describe pointer layouts
//! of heap objects, and interface data words are typed at runtime through them. DWARF tells us
//! the descriptor struct's layout; flag constants come from the constant table with hardcoded
//! fallbacks for runtimes old enough not to name them.

use crate::{
    dwarf::{
        types::{Field, Kind, Type, TypeId},
        ConstTable,
    },
    runtime::val::{Ctx, Val},
    Error, Result,
};
use loam::{Addr, ProcessImage};

/// A decoded runtime type descriptor.
#[derive(Clone, Copy, Debug)]
pub struct RtType {
    pub addr: Addr,
    pub size: u64,
    /// Bytes of the type's prefix that can contain pointers.
    pub ptr_bytes: u64,
    pub tflag: u64,
    pub kind: u64,
    pub gc_data: Addr,
    pub name_off: i64,
}

pub struct RtTypeReader {
    abi_type: TypeId,
    itab_type_offset: u64,
    tflag_extra_star: u64,
    tflag_direct_iface: Option<u64>,
    tflag_gcmask_on_demand: Option<u64>,
    kind_direct_iface: u64,
    kind_gc_prog: Option<u64>,
}

impl RtTypeReader {
    pub fn new(ctx: Ctx, consts: &ConstTable) -> Result<RtTypeReader> {
        let abi_type = ctx
            .types
            .by_name("internal/abi.Type")
            .or_else(|| ctx.types.by_name("runtime._type"))
            .ok_or_else(|| Error::CorruptFormat("no runtime type descriptor type in debug info".into()))?;
        let itab = ctx.types.by_name("internal/abi.ITab").or_else(|| ctx.types.by_name("runtime.itab"));
        let itab_type_offset = itab
            .and_then(|id| {
                let typ = ctx.types.get(id);
                typ.field("Type").or_else(|| typ.field("_type")).map(|f| f.offset)
            })
            .unwrap_or(ctx.image.pointer_size());

        Ok(RtTypeReader {
            abi_type,
            itab_type_offset,
            tflag_extra_star: consts.find("internal/abi.TFlagExtraStar").unwrap_or(1 << 1) as u64,
            tflag_direct_iface: consts.find("internal/abi.TFlagDirectIface").map(|v| v as u64),
            tflag_gcmask_on_demand: consts.find("internal/abi.TFlagGCMaskOnDemand").map(|v| v as u64),
            kind_direct_iface: consts
                .find("internal/abi.KindDirectIface")
                .or_else(|| consts.find("runtime.kindDirectIface"))
                .unwrap_or(1 << 5) as u64,
            kind_gc_prog: consts
                .find("internal/abi.KindGCProg")
                .or_else(|| consts.find("runtime.kindGCProg"))
                .map(|v| v as u64),
        })
    }

    /// Decode the descriptor at `addr`. Field names moved when the descriptor migrated from
    /// `runtime._type` to `internal/abi.Type`; both spellings are accepted.
    pub fn read(&self, ctx: Ctx, addr: Addr) -> Result<RtType> {
        let val = Val::new(ctx, addr, self.abi_type);
        let field = |new: &str, old: &str| -> Result<Val> {
            if val.has_field(new) {
                val.field(new)
            } else {
                val.field(old)
            }
        };

        Ok(RtType {
            addr,
            size: field("Size_", "size")?.uint()?,
            ptr_bytes: field("PtrBytes", "ptrdata")?.uint()?,
            tflag: field("TFlag", "tflag")?.uint()?,
            kind: field("Kind_", "kind")?.uint()?,
            gc_data: field("GCData", "gcdata")?.ptr()?,
            name_off: field("Str", "str")?.int()?,
        })
    }

    /// Follow an itab to the concrete type it carries.
    pub fn itab_type(&self, ctx: Ctx, itab: Addr) -> Result<Addr> {
        ctx.image.read_ptr(itab + self.itab_type_offset).map_err(Error::Load)
    }

    /// Whether values of this type are stored directly in interface data words.
    pub fn direct_iface(&self, rt: &RtType) -> bool {
        match self.tflag_direct_iface {
            Some(bit) => rt.tflag & bit != 0,
            None => rt.kind & self.kind_direct_iface != 0,
        }
    }

    /// The per-word pointer mask from the descriptor's GC data. GC programs were pre-unrolled
    /// long before the core formats this tool reads; a descriptor still demanding one is refused.
    pub fn gc_mask(&self, image: &ProcessImage, rt: &RtType) -> Result<Vec<bool>> {
        if self.tflag_gcmask_on_demand.is_some_and(|bit| rt.tflag & bit != 0)
            || self.kind_gc_prog.is_some_and(|bit| rt.kind & bit != 0)
        {
            return Err(Error::CorruptFormat(format!(
                "type descriptor at {} uses a GC program; expected a pre-unrolled mask",
                rt.addr
            )));
        }

        // The mask only describes the pointer-bearing prefix (`PtrBytes`); everything past it is
        // pointer-free by definition, so callers treat a short mask as trailing zeroes.
        let words = rt.ptr_bytes / image.pointer_size();
        if rt.gc_data.is_null() || words == 0 {
            return Ok(Vec::new());
        }
        let bytes = image.read_bytes(rt.gc_data, (words + 7) / 8)?;
        let mut mask = Vec::with_capacity(words as usize);
        for word in 0..words {
            mask.push(bytes[(word / 8) as usize] >> (word % 8) & 1 != 0);
        }
        Ok(mask)
    }

    /// Resolve the descriptor's name through the module's type-data section. Returns `None` for
    /// reflect-constructed types, which live outside every module.
    pub fn name(
        &self,
        image: &ProcessImage,
        type_ranges: &[(Addr, Addr)],
        rt: &RtType,
    ) -> Result<Option<String>> {
        let Some(&(types, _)) = type_ranges.iter().find(|&&(lo, hi)| lo <= rt.addr && rt.addr < hi) else {
            return Ok(None);
        };

        // Name encoding: one flag byte, a varint length, then the bytes.
        let mut cursor = types + rt.name_off as u64 + 1;
        let mut len: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = image.read_u8(cursor)?;
            cursor += 1;
            len |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let bytes = image.read_bytes(cursor, len)?;
        let mut name = String::from_utf8_lossy(&bytes).into_owned();
        if rt.tflag & self.tflag_extra_star != 0 {
            name = name.trim_start_matches('*').to_string();
        }
        Ok(Some(name))
    }

    /// Build an analyzer type from a runtime descriptor: a struct of pointer-sized words, each
    /// either the pointer filler or the uintptr filler according to the GC mask. That loses the
    /// original field structure, but it is exactly as much as the collector itself knows. Fields
    /// stop at the pointer-bearing prefix; the (possibly enormous) pointer-free tail contributes
    /// only to the size.
    pub fn synthesize(
        &self,
        image: &ProcessImage,
        rt: &RtType,
        name: String,
        fillers: &Fillers,
    ) -> Result<Type> {
        let ptr_size = image.pointer_size();
        let mask = self.gc_mask(image, rt)?;
        let words = (rt.size / ptr_size).min(mask.len() as u64);
        let mut fields = Vec::with_capacity(words as usize);
        for word in 0..words {
            let is_ptr = mask.get(word as usize).copied().unwrap_or(false);
            fields.push(Field {
                name: format!("f{word}"),
                offset: word * ptr_size,
                typ: if is_ptr { fillers.unsafe_ptr } else { fillers.uintptr },
            });
        }
        Ok(Type {
            name,
            size: rt.size,
            kind: Kind::Struct,
            go_kind: 0,
            runtime_offset: None,
            element: None,
            count: 0,
            fields,
        })
    }
}

/// The two word-filler types used by synthesized struct shapes.
pub struct Fillers {
    pub unsafe_ptr: Option<TypeId>,
    pub uintptr: Option<TypeId>,
}

impl Fillers {
    pub fn resolve(types: &crate::dwarf::types::TypeArena) -> Fillers {
        Fillers { unsafe_ptr: types.by_name("unsafe.Pointer"), uintptr: types.by_name("uintptr") }
    }
}
