/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Decoding of the executable's DWARF: the type graph, the compile-time constant table, global
//! variables, and per-function variable locations. Unit and DIE traversal is `gimli`'s; the
//! Go-specific attributes, the location-list segmentation, and the pc-value tables are decoded
//! here.
//!
//! Only compilation units produced by the Go compiler are read; anything else (cgo-compiled C,
//! assembly shims from other toolchains) is skipped wholesale, children included.

pub mod loc;
pub mod pctab;
pub mod types;

use crate::{Error, Result};
use gimli::{constants, AttributeValue, DwAt, EndianSlice, RunTimeEndian};
use loam::{Addr, ProcessImage};
use std::collections::HashMap;
use tracing::debug;
use types::{Kind, Type, TypeArena, TypeId};

/// `DW_AT_go_kind`: the runtime kind of the type, in the runtime's own numbering.
const DW_AT_GO_KIND: DwAt = DwAt(0x2900);
/// `DW_AT_go_runtime_type`: offset of the matching runtime type descriptor from the module's
/// type-data base.
const DW_AT_GO_RUNTIME_TYPE: DwAt = DwAt(0x2904);

const GO_PRODUCER: &str = "Go cmd/compile";

/// A named compile-time constant from the runtime's compilation unit.
pub struct ConstTable {
    map: HashMap<String, i64>,
}

impl ConstTable {
    /// Look up a constant that must exist. A core encoded against a runtime that does not define
    /// it is not recoverable, so absence panics rather than limping on.
    pub fn get(&self, name: &str) -> i64 {
        match self.map.get(name) {
            Some(&value) => value,
            None => panic!("runtime constant {name} not present in debug info"),
        }
    }

    pub fn find(&self, name: &str) -> Option<i64> {
        self.map.get(name).copied()
    }
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub addr: Addr,
    pub typ: Option<TypeId>,
}

/// A local or parameter of some function, with its pc-ranged location programs.
#[derive(Clone, Debug)]
pub struct FuncVar {
    pub name: String,
    pub is_param: bool,
    pub typ: Option<TypeId>,
    pub entries: Vec<loc::LocEntry>,
}

struct RawVar {
    name: String,
    is_param: bool,
    typ_ref: Option<u64>,
    loc_offset: usize,
}

struct RawSubprogram {
    low: u64,
    high: Option<u64>,
    cu_base: u64,
    vars: Vec<RawVar>,
}

/// Per-type wiring recorded in the first pass and applied in the second.
struct Wiring {
    id: TypeId,
    tag: gimli::DwTag,
    elem_ref: Option<u64>,
    field_refs: Vec<Option<u64>>,
}

pub struct DwarfInfo {
    pub types: TypeArena,
    pub consts: ConstTable,
    pub globals: Vec<Global>,
    type_by_offset: HashMap<u64, TypeId>,
    subprograms: Vec<RawSubprogram>,
}

impl DwarfInfo {
    pub fn new(image: &ProcessImage) -> Result<DwarfInfo> {
        let debug = image.debug_data().map_err(Error::Load)?;
        let endian = match image.byte_order() {
            scroll::Endian::Little => RunTimeEndian::Little,
            scroll::Endian::Big => RunTimeEndian::Big,
        };
        let dwarf = gimli::Dwarf::load(|id| -> core::result::Result<_, gimli::Error> {
            let name = id.name().trim_start_matches(".debug_");
            Ok(EndianSlice::new(debug.section(name), endian))
        })?;

        let mut builder = Builder {
            image,
            types: TypeArena::new(image.pointer_size()),
            type_by_offset: HashMap::new(),
            wiring: Vec::new(),
            consts: HashMap::new(),
            globals: Vec::new(),
            subprograms: Vec::new(),
        };

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            builder.walk_unit(&dwarf, &unit)?;
        }
        builder.finish()
    }

    pub fn type_for_offset(&self, offset: u64) -> Option<TypeId> {
        self.type_by_offset.get(&offset).copied()
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Attach synthetic globals discovered outside the DWARF (finalizer specials, bitmap-only
    /// globals). They participate in root enumeration like any other.
    pub fn push_global(&mut self, global: Global) {
        self.globals.push(global);
    }

    /// Resolve the per-function variable table against the runtime's function table. The two
    /// views describe the same functions and must agree exactly on their extents; a disagreement
    /// means the executable does not match the core.
    pub fn resolve_vars(
        &self,
        image: &ProcessImage,
        func_extent: impl Fn(Addr) -> Option<(Addr, Addr)>,
    ) -> Result<HashMap<u64, Vec<FuncVar>>> {
        let debug = image.debug_data().map_err(Error::Load)?;
        let blob = debug.loc_blob();
        let mut vars: HashMap<u64, Vec<FuncVar>> = HashMap::new();

        for sub in &self.subprograms {
            let Some(high) = sub.high else { continue };
            let low = Addr(sub.low + image.static_base());
            let high = Addr(high + image.static_base());
            let Some((entry, end)) = func_extent(low) else { continue };
            // The runtime rounds a function's extent up to the next function's entry, so the
            // DWARF range must start exactly at the entry and fit inside; anything else means the
            // executable does not match the core.
            if entry != low || high > end {
                return Err(Error::CorruptFormat(format!(
                    "DWARF function [{low}, {high}) disagrees with runtime function table [{entry}, {end})"
                )));
            }

            let mut list = Vec::with_capacity(sub.vars.len());
            for var in &sub.vars {
                let entries = match loc::parse_loclist(
                    blob,
                    var.loc_offset,
                    sub.cu_base,
                    image.static_base(),
                    image.byte_order(),
                ) {
                    Ok(entries) => entries,
                    Err(error) => {
                        debug!("bad location list for {}: {error}", var.name);
                        continue;
                    }
                };
                list.push(FuncVar {
                    name: var.name.clone(),
                    is_param: var.is_param,
                    typ: var.typ_ref.and_then(|r| self.type_for_offset(r)),
                    entries,
                });
            }
            vars.insert(entry.get(), list);
        }
        Ok(vars)
    }
}

struct Builder<'i> {
    image: &'i ProcessImage,
    types: TypeArena,
    type_by_offset: HashMap<u64, TypeId>,
    wiring: Vec<Wiring>,
    consts: HashMap<String, i64>,
    globals: Vec<Global>,
    subprograms: Vec<RawSubprogram>,
}

type Reader<'a> = EndianSlice<'a, RunTimeEndian>;
type Unit<'a> = gimli::Unit<Reader<'a>>;
type Die<'a, 'u> = gimli::DebuggingInformationEntry<'u, 'u, Reader<'a>>;

impl Builder<'_> {
    fn walk_unit(&mut self, dwarf: &gimli::Dwarf<Reader>, unit: &Unit) -> Result<()> {
        let mut entries = unit.entries();
        let Some((_, root)) = entries.next_dfs()? else { return Ok(()) };
        let producer = match root.attr_value(constants::DW_AT_producer)? {
            Some(value) => dwarf.attr_string(unit, value)?.to_string_lossy().into_owned(),
            None => String::new(),
        };
        if !producer.contains(GO_PRODUCER) {
            return Ok(());
        }
        let cu_base = match root.attr_value(constants::DW_AT_low_pc)? {
            Some(AttributeValue::Addr(a)) => a,
            _ => 0,
        };

        // One pass over the unit's tree. A context stack tracks which type or subprogram each
        // entry is nested inside; lexical blocks are transparent, so a variable in a block still
        // attaches to its function.
        let mut stack: Vec<Ctx> = Vec::new();
        let mut depth: isize = 0;

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            stack.truncate((depth - 1).max(0) as usize);
            let enclosing = stack.iter().rev().find(|c| !matches!(c, Ctx::Other));

            let ctx = match entry.tag() {
                tag if is_type_tag(tag) => Ctx::Type(self.visit_type(dwarf, unit, entry, tag)?),
                constants::DW_TAG_constant => {
                    self.visit_constant(dwarf, unit, entry)?;
                    Ctx::Other
                }
                constants::DW_TAG_subprogram => match self.visit_subprogram(entry, cu_base)? {
                    Some(index) => Ctx::Subprogram(index),
                    None => Ctx::Other,
                },
                tag @ (constants::DW_TAG_variable | constants::DW_TAG_formal_parameter) => {
                    match enclosing {
                        Some(&Ctx::Subprogram(index)) => self.visit_local(dwarf, unit, entry, index)?,
                        // Parameters of function *types* are not variables of anything.
                        Some(&Ctx::Type(_)) => (),
                        None if tag == constants::DW_TAG_variable => self.visit_global(dwarf, unit, entry)?,
                        _ => (),
                    }
                    Ctx::Other
                }
                constants::DW_TAG_member => {
                    if let Some(&Ctx::Type(index)) = enclosing {
                        self.visit_member(dwarf, unit, entry, index)?;
                    }
                    Ctx::Other
                }
                constants::DW_TAG_subrange_type => {
                    if let Some(&Ctx::Type(index)) = enclosing {
                        if let Some(count) = entry.attr(constants::DW_AT_count)?.and_then(|a| a.udata_value()) {
                            let id = self.wiring[index].id;
                            self.types.get_mut(id).count = count;
                        }
                    }
                    Ctx::Other
                }
                _ => Ctx::Other,
            };
            stack.push(ctx);
        }
        Ok(())
    }

    fn visit_type(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        unit: &Unit,
        entry: &Die,
        tag: gimli::DwTag,
    ) -> Result<usize> {
        let name = self.name_of(dwarf, unit, entry)?.unwrap_or_default();
        let size = entry.attr(constants::DW_AT_byte_size)?.and_then(|a| a.udata_value()).unwrap_or(0);
        let go_kind = entry.attr(DW_AT_GO_KIND)?.and_then(|a| a.udata_value()).unwrap_or(0);
        let runtime_offset = entry.attr(DW_AT_GO_RUNTIME_TYPE)?.and_then(|a| a.udata_value());

        let kind = match tag {
            constants::DW_TAG_base_type => {
                match entry.attr(constants::DW_AT_encoding)?.and_then(|a| a.udata_value()).unwrap_or(0) {
                    0x02 => Kind::Bool,
                    0x03 => Kind::Complex,
                    0x04 => Kind::Float,
                    0x05 | 0x06 => Kind::Int,
                    0x07 | 0x08 => Kind::Uint,
                    _ => Kind::None,
                }
            }
            constants::DW_TAG_pointer_type => Kind::Ptr,
            constants::DW_TAG_array_type => Kind::Array,
            constants::DW_TAG_structure_type => Kind::Struct,
            constants::DW_TAG_subroutine_type => Kind::Func,
            // Typedefs temporarily carry `None`; the second pass copies the underlying shape in.
            constants::DW_TAG_typedef => Kind::None,
            _ => Kind::None,
        };

        let id = self.types.add(Type {
            name,
            size,
            kind,
            go_kind,
            runtime_offset,
            element: None,
            count: 0,
            fields: Vec::new(),
        });
        if let Some(offset) = global_offset(unit, entry) {
            self.type_by_offset.insert(offset, id);
        }
        self.wiring.push(Wiring { id, tag, elem_ref: self.type_ref(unit, entry)?, field_refs: Vec::new() });
        Ok(self.wiring.len() - 1)
    }

    fn visit_member(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        unit: &Unit,
        entry: &Die,
        parent: usize,
    ) -> Result<()> {
        let name = self.name_of(dwarf, unit, entry)?.unwrap_or_default();
        let offset =
            entry.attr(constants::DW_AT_data_member_location)?.and_then(|a| a.udata_value()).unwrap_or(0);
        let typ_ref = self.type_ref(unit, entry)?;

        let id = self.wiring[parent].id;
        self.types.get_mut(id).fields.push(types::Field { name, offset, typ: None });
        self.wiring[parent].field_refs.push(typ_ref);
        Ok(())
    }

    fn visit_constant(&mut self, dwarf: &gimli::Dwarf<Reader>, unit: &Unit, entry: &Die) -> Result<()> {
        let Some(name) = self.name_of(dwarf, unit, entry)? else { return Ok(()) };
        let value = match entry.attr_value(constants::DW_AT_const_value)? {
            Some(AttributeValue::Sdata(v)) => v,
            Some(AttributeValue::Udata(v)) => v as i64,
            Some(AttributeValue::Data1(v)) => v as i64,
            Some(AttributeValue::Data2(v)) => v as i64,
            Some(AttributeValue::Data4(v)) => v as i64,
            Some(AttributeValue::Data8(v)) => v as i64,
            _ => return Ok(()),
        };
        self.consts.insert(name, value);
        Ok(())
    }

    /// A compilation-unit-level variable with a one-opcode `DW_OP_addr` location is a global.
    /// Read-only symbols are rejected: they cannot hold heap pointers at runtime, and the
    /// data sections the collector traces are all writable.
    fn visit_global(&mut self, dwarf: &gimli::Dwarf<Reader>, unit: &Unit, entry: &Die) -> Result<()> {
        let Some(name) = self.name_of(dwarf, unit, entry)? else { return Ok(()) };
        // DWARF 4+ wraps the expression in an exprloc; version 2 producers used plain blocks.
        let program = match entry.attr_value(constants::DW_AT_location)? {
            Some(AttributeValue::Exprloc(expression)) => expression.0,
            Some(AttributeValue::Block(block)) => block,
            _ => return Ok(()),
        };
        let program = program.slice();
        if program.len() != 9 || program[0] != 0x03 {
            return Ok(());
        }
        let raw = match self.image.byte_order() {
            scroll::Endian::Little => u64::from_le_bytes(program[1..9].try_into().unwrap()),
            scroll::Endian::Big => u64::from_be_bytes(program[1..9].try_into().unwrap()),
        };
        let addr = Addr(raw.wrapping_add(self.image.static_base()));
        if !self.image.writable(addr) {
            return Ok(());
        }
        let typ = self.type_ref(unit, entry)?.and_then(|r| self.type_by_offset.get(&r).copied());
        self.globals.push(Global { name, addr, typ });
        Ok(())
    }

    fn visit_subprogram(&mut self, entry: &Die, cu_base: u64) -> Result<Option<usize>> {
        let low = match entry.attr_value(constants::DW_AT_low_pc)? {
            Some(AttributeValue::Addr(a)) => a,
            _ => return Ok(None),
        };
        // `high_pc` is either an address or (more usually) a data-form offset from `low_pc`.
        let high = match entry.attr(constants::DW_AT_high_pc)? {
            Some(attr) => match attr.value() {
                AttributeValue::Addr(a) => Some(a),
                _ => attr.udata_value().map(|offset| low + offset),
            },
            None => None,
        };
        self.subprograms.push(RawSubprogram { low, high, cu_base, vars: Vec::new() });
        Ok(Some(self.subprograms.len() - 1))
    }

    fn visit_local(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        unit: &Unit,
        entry: &Die,
        parent: usize,
    ) -> Result<()> {
        let Some(name) = self.name_of(dwarf, unit, entry)? else { return Ok(()) };
        // Only variables described by a location list matter here: a variable that never lives
        // anywhere observable produces no roots.
        let loc_offset = match entry.attr_value(constants::DW_AT_location)? {
            Some(AttributeValue::SecOffset(offset)) => offset,
            Some(AttributeValue::LocationListsRef(r)) => r.0,
            _ => return Ok(()),
        };
        let typ_ref = self.type_ref(unit, entry)?;
        let is_param = entry.tag() == constants::DW_TAG_formal_parameter;
        self.subprograms[parent].vars.push(RawVar { name, is_param, typ_ref, loc_offset });
        Ok(())
    }

    fn name_of(&self, dwarf: &gimli::Dwarf<Reader>, unit: &Unit, entry: &Die) -> Result<Option<String>> {
        match entry.attr_value(constants::DW_AT_name)? {
            Some(value) => Ok(Some(dwarf.attr_string(unit, value)?.to_string_lossy().into_owned())),
            None => Ok(None),
        }
    }

    /// Resolve a `DW_AT_type` reference to a section-global DIE offset.
    fn type_ref(&self, unit: &Unit, entry: &Die) -> Result<Option<u64>> {
        match entry.attr_value(constants::DW_AT_type)? {
            Some(AttributeValue::UnitRef(offset)) => {
                Ok(offset.to_debug_info_offset(&unit.header).map(|o| o.0 as u64))
            }
            Some(AttributeValue::DebugInfoRef(offset)) => Ok(Some(offset.0 as u64)),
            _ => Ok(None),
        }
    }

    /// Wire cross-references, copy typedefs, and compute derived sizes.
    fn finish(mut self) -> Result<DwarfInfo> {
        let resolve = |by_offset: &HashMap<u64, TypeId>, r: Option<u64>| r.and_then(|r| by_offset.get(&r).copied());

        // Wire element and field references.
        for wiring in &self.wiring {
            let element = resolve(&self.type_by_offset, wiring.elem_ref);
            let typ = self.types.get_mut(wiring.id);
            if wiring.tag != gimli::constants::DW_TAG_structure_type {
                typ.element = element;
            }
            for (index, field_ref) in wiring.field_refs.iter().enumerate() {
                typ.fields[index].typ = resolve(&self.type_by_offset, *field_ref);
            }
        }

        // The runtime describes strings and slices as plain structs; recognize them by their
        // runtime kind and promote the payload pointer's element.
        for wiring in &self.wiring {
            let typ = self.types.get(wiring.id);
            if typ.kind != Kind::Struct {
                continue;
            }
            match typ.go_kind {
                types::go_kind::STRING => {
                    let element = typ.field("str").and_then(|f| f.typ).and_then(|p| self.types.get(p).element);
                    let typ = self.types.get_mut(wiring.id);
                    typ.kind = Kind::String;
                    typ.element = element;
                }
                types::go_kind::SLICE => {
                    let element =
                        typ.field("array").and_then(|f| f.typ).and_then(|p| self.types.get(p).element);
                    let typ = self.types.get_mut(wiring.id);
                    typ.kind = Kind::Slice;
                    typ.element = element;
                }
                _ => (),
            }
        }

        // Copy the underlying shape into each typedef, preserving the alias name. The well-known
        // interface headers become first-class kinds of their own.
        let ptr_size = self.types.ptr_size();
        for wiring in &self.wiring {
            if wiring.tag != gimli::constants::DW_TAG_typedef {
                continue;
            }
            let mut seen = vec![wiring.id];
            let mut cursor = self.types.get(wiring.id).element;
            let underlying = loop {
                match cursor {
                    Some(id) if self.types.get(id).kind == Kind::None && self.types.get(id).element.is_some() => {
                        if seen.contains(&id) {
                            break None;
                        }
                        seen.push(id);
                        cursor = self.types.get(id).element;
                    }
                    other => break other,
                }
            };
            let Some(underlying) = underlying else { continue };

            let source = self.types.get(underlying).clone();
            let alias = self.types.get_mut(wiring.id);
            alias.size = source.size;
            alias.count = source.count;
            alias.fields = source.fields;
            alias.element = source.element;
            if alias.go_kind == 0 {
                alias.go_kind = source.go_kind;
            }
            alias.kind = match source.name.as_str() {
                "runtime.eface" => Kind::Eface,
                "runtime.iface" => Kind::Iface,
                _ => source.kind,
            };
            if matches!(alias.kind, Kind::Eface | Kind::Iface) {
                alias.size = 2 * ptr_size;
            }
        }

        // Derived sizes: arrays from their element, pointers and functions from the target's
        // pointer width.
        for index in 0..self.types.len() {
            let id = TypeId(index as u32);
            let size = self.size_of(id, &mut Vec::new());
            self.types.get_mut(id).size = size;
        }

        debug!("decoded {} types, {} constants, {} globals", self.types.len(), self.consts.len(), self.globals.len());

        Ok(DwarfInfo {
            types: self.types,
            consts: ConstTable { map: self.consts },
            globals: self.globals,
            type_by_offset: self.type_by_offset,
            subprograms: self.subprograms,
        })
    }

    fn size_of(&self, id: TypeId, visiting: &mut Vec<TypeId>) -> u64 {
        if visiting.contains(&id) {
            return 0;
        }
        let typ = self.types.get(id);
        match typ.kind {
            Kind::Array => {
                visiting.push(id);
                let element = typ.element.map(|e| self.size_of(e, visiting)).unwrap_or(0);
                visiting.pop();
                typ.count * element
            }
            Kind::Ptr | Kind::Func if typ.size == 0 => self.types.ptr_size(),
            _ => typ.size,
        }
    }
}

/// Which kind of DIE the entries above the current one are.
enum Ctx {
    /// A type under construction; `usize` indexes [`Builder::wiring`].
    Type(usize),
    /// A subprogram; `usize` indexes [`Builder::subprograms`].
    Subprogram(usize),
    Other,
}

fn is_type_tag(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        constants::DW_TAG_base_type
            | constants::DW_TAG_pointer_type
            | constants::DW_TAG_array_type
            | constants::DW_TAG_structure_type
            | constants::DW_TAG_subroutine_type
            | constants::DW_TAG_typedef
    )
}

fn global_offset(unit: &Unit, entry: &Die) -> Option<u64> {
    entry.offset().to_debug_info_offset(&unit.header).map(|o| o.0 as u64)
}
