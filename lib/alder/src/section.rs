use crate::{from_utf8_null_terminated, Elf};
use scroll_derive::Pread;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SectionType {
    Null,
    ProgBits,
    SymTab,
    StrTab,
    Rela,
    Hash,
    Dynamic,
    Note,
    NoBits,
    Rel,
    ShLib,
    DynSym,
    InitArray,
    FiniArray,
    PreinitArray,
    Group,
    SymTabShndx,
    Os(u32),
    Proc(u32),
    User(u32),
    Unknown(u32),
}

#[derive(Clone, Debug, Pread)]
#[repr(C)]
pub struct SectionHeader {
    pub name_offset: u32,
    pub section_type: u32,
    pub flags: u64,
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub address_alignment: u64,
    pub entry_size: u64,
}

impl SectionHeader {
    pub fn section_type(&self) -> SectionType {
        match self.section_type {
            0 => SectionType::Null,
            1 => SectionType::ProgBits,
            2 => SectionType::SymTab,
            3 => SectionType::StrTab,
            4 => SectionType::Rela,
            5 => SectionType::Hash,
            6 => SectionType::Dynamic,
            7 => SectionType::Note,
            8 => SectionType::NoBits,
            9 => SectionType::Rel,
            10 => SectionType::ShLib,
            11 => SectionType::DynSym,
            14 => SectionType::InitArray,
            15 => SectionType::FiniArray,
            16 => SectionType::PreinitArray,
            17 => SectionType::Group,
            18 => SectionType::SymTabShndx,
            0x60000000..=0x6fffffff => SectionType::Os(self.section_type),
            0x70000000..=0x7fffffff => SectionType::Proc(self.section_type),
            0x80000000..=0xffffffff => SectionType::User(self.section_type),
            other => SectionType::Unknown(other),
        }
    }

    /// Look up this section's name in the section-name string table. `None` if the ELF has no
    /// string table, or the name runs off it.
    pub fn name<'e>(&self, elf: &Elf<'e>) -> Option<&'e str> {
        let string_table = elf.sections().nth(elf.header().string_table_index as usize)?;
        if string_table.section_type() != SectionType::StrTab {
            return None;
        }

        let data = string_table.data(elf)?;
        from_utf8_null_terminated(data.get(self.name_offset as usize..)?).ok()
    }

    /// The section's bytes within the file. `NoBits` sections occupy no file space.
    pub fn data<'e>(&self, elf: &Elf<'e>) -> Option<&'e [u8]> {
        if self.section_type() == SectionType::NoBits {
            return None;
        }
        elf.bytes().get(self.offset as usize..(self.offset + self.size) as usize)
    }
}
