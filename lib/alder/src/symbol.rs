use bit_field::BitField;
use scroll_derive::Pread;

pub enum SymbolBinding {
    /// Only visible inside the object file that defines it.
    Local,

    /// Global symbol - visible to all object files.
    Global,

    /// Global scope, but with a lower precedence than global symbols.
    Weak,

    /// Environment-specific use.
    Os(u8),

    /// Processor-specific use.
    Proc(u8),
}

pub enum SymbolType {
    NoType,
    Object,
    Func,
    Section,
    File,
    Common,
    Tls,
    Os(u8),
    Proc(u8),
}

#[derive(Clone, Debug, Pread)]
#[repr(C)]
pub struct Symbol {
    /// The offset into the string table, in bytes, to the symbol name. If this is `0`, the symbol
    /// doesn't have a name.
    pub name: u32,
    pub info: u8,
    _other: u8,
    pub section_table_index: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn binding(&self) -> SymbolBinding {
        match self.info.get_bits(4..8) {
            0 => SymbolBinding::Local,
            1 => SymbolBinding::Global,
            2 => SymbolBinding::Weak,
            value @ 10..=12 => SymbolBinding::Os(value),
            value @ 13..=15 => SymbolBinding::Proc(value),
            _ => SymbolBinding::Local,
        }
    }

    pub fn symbol_type(&self) -> SymbolType {
        match self.info.get_bits(0..4) {
            0 => SymbolType::NoType,
            1 => SymbolType::Object,
            2 => SymbolType::Func,
            3 => SymbolType::Section,
            4 => SymbolType::File,
            5 => SymbolType::Common,
            6 => SymbolType::Tls,
            value @ 10..=12 => SymbolType::Os(value),
            value @ 13..=15 => SymbolType::Proc(value),
            _ => SymbolType::NoType,
        }
    }
}
