/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! A typed view over raw process memory. `Val` pairs an address with a DWARF type and navigates
//! the runtime's own data structures by field name, so none of the introspection code hardcodes
//! struct offsets - the executable's debug info is the single source of layout truth, which is
//! what keeps this working across runtime releases that move fields around.

use crate::{
    dwarf::types::{Kind, TypeArena, TypeId},
    Error, Result,
};
use loam::{Addr, ProcessImage};

/// Everything a [`Val`] needs to chase pointers: the process memory and the type graph.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub image: &'a ProcessImage,
    pub types: &'a TypeArena,
}

#[derive(Clone, Copy)]
pub struct Val<'a> {
    pub ctx: Ctx<'a>,
    pub addr: Addr,
    pub typ: TypeId,
}

impl<'a> Val<'a> {
    pub fn new(ctx: Ctx<'a>, addr: Addr, typ: TypeId) -> Val<'a> {
        Val { ctx, addr, typ }
    }

    fn type_name(&self) -> &str {
        &self.ctx.types.get(self.typ).name
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.ctx.types.get(self.typ).field(name).is_some()
    }

    pub fn field(&self, name: &str) -> Result<Val<'a>> {
        let typ = self.ctx.types.get(self.typ);
        let field = typ
            .field(name)
            .ok_or_else(|| Error::CorruptFormat(format!("type {} has no field {name}", typ.name)))?;
        let field_type = field
            .typ
            .ok_or_else(|| Error::CorruptFormat(format!("field {}.{name} has unknown type", typ.name)))?;
        Ok(Val { ctx: self.ctx, addr: self.addr + field.offset, typ: field_type })
    }

    /// Follow a pointer, producing a view of the pointee.
    pub fn deref(&self) -> Result<Val<'a>> {
        let typ = self.ctx.types.get(self.typ);
        if typ.kind != Kind::Ptr {
            return Err(Error::CorruptFormat(format!("dereferencing non-pointer {}", typ.name)));
        }
        let element = typ
            .element
            .ok_or_else(|| Error::CorruptFormat(format!("dereferencing {} with no element", typ.name)))?;
        Ok(Val { ctx: self.ctx, addr: self.ptr()?, typ: element })
    }

    pub fn ptr(&self) -> Result<Addr> {
        self.ctx.image.read_ptr(self.addr).map_err(Error::Load)
    }

    /// Read this value as an unsigned integer of its own declared size.
    pub fn uint(&self) -> Result<u64> {
        let image = self.ctx.image;
        match self.ctx.types.get(self.typ).size {
            1 => Ok(image.read_u8(self.addr)? as u64),
            2 => Ok(image.read_u16(self.addr)? as u64),
            4 => Ok(image.read_u32(self.addr)? as u64),
            8 => Ok(image.read_u64(self.addr)?),
            size => Err(Error::CorruptFormat(format!("{}-byte integer {}", size, self.type_name()))),
        }
    }

    pub fn int(&self) -> Result<i64> {
        let image = self.ctx.image;
        match self.ctx.types.get(self.typ).size {
            1 => Ok(image.read_u8(self.addr)? as i8 as i64),
            2 => Ok(image.read_u16(self.addr)? as i16 as i64),
            4 => Ok(image.read_u32(self.addr)? as i32 as i64),
            8 => Ok(image.read_u64(self.addr)? as i64),
            size => Err(Error::CorruptFormat(format!("{}-byte integer {}", size, self.type_name()))),
        }
    }

    /// An atomic wrapper (`atomic.Uint32` and friends) or a plain integer; either way, the value.
    pub fn atomic_uint(&self) -> Result<u64> {
        if self.has_field("value") {
            self.field("value")?.uint()
        } else {
            self.uint()
        }
    }

    /// Read a slice header: `(data, len, cap)` plus the element type.
    pub fn slice(&self) -> Result<SliceVal<'a>> {
        let typ = self.ctx.types.get(self.typ);
        if typ.kind != Kind::Slice {
            return Err(Error::CorruptFormat(format!("{} is not a slice", typ.name)));
        }
        let ptr_size = self.ctx.image.pointer_size();
        let data = self.ctx.image.read_ptr(self.addr)?;
        let len = self.ctx.image.read_uint(self.addr + ptr_size)?;
        let cap = self.ctx.image.read_uint(self.addr + 2 * ptr_size)?;
        Ok(SliceVal { ctx: self.ctx, data, len, cap, element: typ.element })
    }

    /// Read a Go string.
    pub fn string(&self) -> Result<String> {
        let data = self.ctx.image.read_ptr(self.addr)?;
        let len = self.ctx.image.read_uint(self.addr + self.ctx.image.pointer_size())?;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.ctx.image.read_bytes(data, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Element `index` of an array value.
    pub fn array_index(&self, index: u64) -> Result<Val<'a>> {
        let typ = self.ctx.types.get(self.typ);
        let element = typ
            .element
            .ok_or_else(|| Error::CorruptFormat(format!("indexing {} with no element type", typ.name)))?;
        let stride = self.ctx.types.get(element).size;
        Ok(Val { ctx: self.ctx, addr: self.addr + index * stride, typ: element })
    }
}

#[derive(Clone, Copy)]
pub struct SliceVal<'a> {
    ctx: Ctx<'a>,
    pub data: Addr,
    pub len: u64,
    pub cap: u64,
    pub element: Option<TypeId>,
}

impl<'a> SliceVal<'a> {
    pub fn index(&self, index: u64) -> Result<Val<'a>> {
        let element =
            self.element.ok_or_else(|| Error::CorruptFormat("indexing slice with no element type".into()))?;
        let stride = self.ctx.types.get(element).size;
        Ok(Val { ctx: self.ctx, addr: self.data + index * stride, typ: element })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::types::{Field, Type, TypeArena};
    use loam::{image::ProcessBuilder, Arch, Perm, ProcessImage};

    fn simple(name: &str, size: u64, kind: Kind) -> Type {
        Type {
            name: name.to_string(),
            size,
            kind,
            go_kind: 0,
            runtime_offset: None,
            element: None,
            count: 0,
            fields: Vec::new(),
        }
    }

    /// A struct `{ count uint32; next *node }` laid out at 0x1000, with `next` pointing at a
    /// second copy at 0x1100 whose count differs.
    fn fixture() -> (ProcessImage, TypeArena, TypeId) {
        let mut types = TypeArena::new(8);
        let uint32 = types.add(simple("uint32", 4, Kind::Uint));
        let node = types.add(simple("main.node", 16, Kind::Struct));
        let node_ptr = types.add(Type { element: Some(node), ..simple("*main.node", 8, Kind::Ptr) });
        types.get_mut(node).fields = vec![
            Field { name: "count".to_string(), offset: 0, typ: Some(uint32) },
            Field { name: "next".to_string(), offset: 8, typ: Some(node_ptr) },
        ];

        let mut bytes = vec![0u8; 4096];
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        bytes[8..16].copy_from_slice(&0x1100u64.to_le_bytes());
        bytes[0x100..0x104].copy_from_slice(&9u32.to_le_bytes());
        let image = ProcessBuilder::new(Arch::Amd64).mapping(0x1000, Perm::READ, bytes).build();
        (image, types, node)
    }

    #[test]
    fn fields_and_derefs_follow_dwarf_layout() {
        let (image, types, node) = fixture();
        let ctx = Ctx { image: &image, types: &types };
        let val = Val::new(ctx, loam::Addr(0x1000), node);

        assert_eq!(val.field("count").unwrap().uint().unwrap(), 7);
        assert!(val.has_field("next"));
        assert!(!val.has_field("prev"));
        assert!(val.field("prev").is_err());

        let next = val.field("next").unwrap().deref().unwrap();
        assert_eq!(next.addr, loam::Addr(0x1100));
        assert_eq!(next.field("count").unwrap().uint().unwrap(), 9);
        assert_eq!(next.field("next").unwrap().ptr().unwrap(), loam::Addr(0));
    }

    #[test]
    fn atomic_wrappers_are_transparent() {
        let (image, mut types, node) = fixture();
        let uint32 = types.by_name("uint32").unwrap();
        let wrapped = types.add(Type {
            fields: vec![Field { name: "value".to_string(), offset: 0, typ: Some(uint32) }],
            ..simple("atomic.Uint32", 4, Kind::Struct)
        });
        let ctx = Ctx { image: &image, types: &types };

        assert_eq!(Val::new(ctx, loam::Addr(0x1000), wrapped).atomic_uint().unwrap(), 7);
        // A plain integer takes the direct path.
        let plain = Val::new(ctx, loam::Addr(0x1000), node).field("count").unwrap();
        assert_eq!(plain.atomic_uint().unwrap(), 7);
    }
}
