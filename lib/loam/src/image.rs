/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Loading a core file (plus, optionally, the executable that produced it) into a [`ProcessImage`].

use crate::{
    addr::Addr,
    arch::Arch,
    mappings::{Contents, Mapping, MappingSet, Perm, Source, PAGE_SIZE},
    note,
    pagetable::PageTable,
    Error,
};
use alder::{
    header::ObjectType,
    program::{ProgramHeader, SegmentType},
    Elf,
};
use memmap2::Mmap;
use scroll::Endian;
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::warn;

/// The debug sections extracted from the executable, plus its symbol table. Section contents are
/// copied out so the image does not pin the executable's mapping.
pub struct DebugData {
    sections: HashMap<String, Vec<u8>>,
}

impl DebugData {
    /// The raw bytes of `.debug_<name>`, or an empty slice if the section is absent.
    pub fn section(&self, name: &str) -> &[u8] {
        self.sections.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The raw location-list blob: `.debug_loc`, or `.debug_loclists` for DWARF 5 producers.
    pub fn loc_blob(&self) -> &[u8] {
        let loc = self.section("loc");
        if loc.is_empty() {
            self.section("loclists")
        } else {
            loc
        }
    }
}

/// The read-only reconstruction of the crashed process: merged mappings, a paged lookup table,
/// per-thread register sets, and the debug data needed to interpret it all. Everything downstream
/// of the loader borrows this.
pub struct ProcessImage {
    arch: Arch,
    endian: Endian,
    mappings: Vec<Mapping>,
    page_table: PageTable,
    threads: Vec<note::ThreadState>,
    args: String,
    entry_point: Addr,
    static_base: u64,
    symbols: HashMap<String, Addr>,
    debug: Result<DebugData, String>,
    warnings: Vec<String>,
}

impl ProcessImage {
    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn byte_order(&self) -> Endian {
        self.endian
    }

    pub fn pointer_size(&self) -> u64 {
        self.arch.pointer_size()
    }

    /// The PIE load offset: the difference between link-time and run-time addresses.
    pub fn static_base(&self) -> u64 {
        self.static_base
    }

    pub fn entry_point(&self) -> Addr {
        self.entry_point
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    /// The executable's path: the argv[0] prefix of the process-info note's command line.
    pub fn executable_path(&self) -> Option<&str> {
        self.args.split_whitespace().next()
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn threads(&self) -> &[note::ThreadState] {
        &self.threads
    }

    pub fn symbols(&self) -> &HashMap<String, Addr> {
        &self.symbols
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Debug info is allowed to be missing at load time; the failure surfaces on first use.
    pub fn debug_data(&self) -> Result<&DebugData, Error> {
        self.debug.as_ref().map_err(|reason| Error::MissingDebugInfo(reason.clone()))
    }

    pub fn mapping_for(&self, addr: Addr) -> Option<&Mapping> {
        self.mappings.get(self.page_table.lookup(addr)?)
    }

    /// Whether the page containing `addr` is mapped readable.
    pub fn readable(&self, addr: Addr) -> bool {
        self.mapping_for(addr).is_some_and(|m| m.perm.contains(Perm::READ))
    }

    /// Whether every byte of `[addr, addr + len)` is readable. Walks across adjacent mappings.
    pub fn readable_n(&self, addr: Addr, len: u64) -> bool {
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            let Some(mapping) = self.mapping_for(addr) else { return false };
            if !mapping.perm.contains(Perm::READ) {
                return false;
            }
            let chunk = u64::min(remaining, mapping.max.distance_from(addr));
            addr += chunk;
            remaining -= chunk;
        }
        true
    }

    /// Whether the page containing `addr` is mapped writable (in the dumped process, not here).
    pub fn writable(&self, addr: Addr) -> bool {
        self.mapping_for(addr).is_some_and(|m| m.perm.contains(Perm::WRITE))
    }

    /// Fill `buffer` from process memory at `addr`. Fails if any byte is unreadable.
    pub fn read_at(&self, addr: Addr, buffer: &mut [u8]) -> Result<(), Error> {
        let mut addr = addr;
        let mut buffer = buffer;
        while !buffer.is_empty() {
            let mapping = self.mapping_for(addr).ok_or(Error::Unmapped(addr))?;
            if !mapping.perm.contains(Perm::READ) {
                return Err(Error::Unmapped(addr));
            }
            let chunk = u64::min(buffer.len() as u64, mapping.max.distance_from(addr)) as usize;
            let (head, tail) = std::mem::take(&mut buffer).split_at_mut(chunk);
            mapping.read(addr, head);
            addr += chunk as u64;
            buffer = tail;
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: Addr, len: u64) -> Result<Vec<u8>, Error> {
        let mut buffer = vec![0; len as usize];
        self.read_at(addr, &mut buffer)?;
        Ok(buffer)
    }

    pub fn read_u8(&self, addr: Addr) -> Result<u8, Error> {
        let mut buffer = [0; 1];
        self.read_at(addr, &mut buffer)?;
        Ok(buffer[0])
    }

    pub fn read_u16(&self, addr: Addr) -> Result<u16, Error> {
        let mut buffer = [0; 2];
        self.read_at(addr, &mut buffer)?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(buffer),
            Endian::Big => u16::from_be_bytes(buffer),
        })
    }

    pub fn read_u32(&self, addr: Addr) -> Result<u32, Error> {
        let mut buffer = [0; 4];
        self.read_at(addr, &mut buffer)?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(buffer),
            Endian::Big => u32::from_be_bytes(buffer),
        })
    }

    pub fn read_u64(&self, addr: Addr) -> Result<u64, Error> {
        let mut buffer = [0; 8];
        self.read_at(addr, &mut buffer)?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(buffer),
            Endian::Big => u64::from_be_bytes(buffer),
        })
    }

    pub fn read_i32(&self, addr: Addr) -> Result<i32, Error> {
        Ok(self.read_u32(addr)? as i32)
    }

    pub fn read_i64(&self, addr: Addr) -> Result<i64, Error> {
        Ok(self.read_u64(addr)? as i64)
    }

    /// Read one pointer-sized word as an address.
    pub fn read_ptr(&self, addr: Addr) -> Result<Addr, Error> {
        match self.pointer_size() {
            4 => Ok(Addr(self.read_u32(addr)? as u64)),
            _ => Ok(Addr(self.read_u64(addr)?)),
        }
    }

    /// Read one pointer-sized word as an unsigned integer.
    pub fn read_uint(&self, addr: Addr) -> Result<u64, Error> {
        Ok(self.read_ptr(addr)?.get())
    }

    /// Read one pointer-sized word as a signed integer.
    pub fn read_int(&self, addr: Addr) -> Result<i64, Error> {
        match self.pointer_size() {
            4 => Ok(self.read_u32(addr)? as i32 as i64),
            _ => Ok(self.read_u64(addr)? as i64),
        }
    }
}

/// Load a core file. `exe` overrides the executable path recorded in the core; `base` is
/// prepended to recorded absolute paths whose files do not exist here (a dump from another
/// machine, unpacked under a sysroot).
pub fn load(core_path: &Path, exe: Option<&Path>, base: Option<&Path>) -> Result<ProcessImage, Error> {
    Loader { core_path, exe, base, warnings: Vec::new(), files: HashMap::new() }.load()
}

struct Loader<'a> {
    core_path: &'a Path,
    exe: Option<&'a Path>,
    base: Option<&'a Path>,
    warnings: Vec<String>,
    files: HashMap<PathBuf, Option<Arc<Mmap>>>,
}

impl Loader<'_> {
    fn load(mut self) -> Result<ProcessImage, Error> {
        let core_data = self.map_file(self.core_path)?;
        let core = Elf::new(&core_data[..])?;
        if core.object_type() != ObjectType::Core {
            return Err(Error::UnsupportedContainer(format!(
                "{} is not an ELF core file ({:?})",
                self.core_path.display(),
                core.object_type()
            )));
        }
        let arch = Arch::from_elf_machine(core.header().machine_type)
            .ok_or(Error::UnsupportedArch(core.header().machine_type))?;
        let endian = core.endian();

        // Note records first: the auxv entry point determines the PIE load offset, which the
        // executable's seed mappings need.
        let mut threads = Vec::new();
        let mut args = String::new();
        let mut auxv_entry = None;
        let mut file_notes = Vec::new();
        for segment in core.segments().filter(|s| s.segment_type() == SegmentType::Note) {
            for entry in core.notes(&segment) {
                if entry.name != b"CORE" {
                    continue;
                }
                match entry.entry_type {
                    note::NT_PRSTATUS => threads.push(note::parse_prstatus(entry.desc, endian, arch)?),
                    note::NT_PRPSINFO => args = note::parse_prpsinfo(entry.desc).unwrap_or_default(),
                    note::NT_AUXV => auxv_entry = note::parse_auxv_entry_point(entry.desc, endian),
                    note::NT_FILE => file_notes = note::parse_file_note(entry.desc, endian)?,
                    _ => (),
                }
            }
        }

        // Identify the executable: an explicit override, or whichever file the entry point lands
        // in according to the core's file-mapping table.
        let exe_path: Option<PathBuf> = match self.exe {
            Some(path) => Some(path.to_path_buf()),
            None => auxv_entry.and_then(|entry| {
                file_notes.iter().find(|f| f.min <= entry && entry < f.max).map(|f| f.path.clone())
            }),
        };
        let exe_data = match &exe_path {
            Some(path) => match self.resolve(path) {
                Some(resolved) => Some((path.clone(), self.map_file(&resolved)?)),
                None => {
                    self.warn(format!("executable {} not found; no debug info", path.display()));
                    None
                }
            },
            None => None,
        };
        let exe_elf = match &exe_data {
            Some((path, data)) => match Elf::new(&data[..]) {
                Ok(elf) => Some((path.clone(), elf)),
                Err(error) => {
                    self.warn(format!("cannot parse executable {}: {error}", path.display()));
                    None
                }
            },
            None => None,
        };

        // PIEs link at zero and get relocated by the kernel; the auxv entry point tells us where
        // to. Fixed-position executables get a base of zero.
        let (entry_point, static_base) = match (&exe_elf, auxv_entry) {
            (Some((_, elf)), Some(entry)) => {
                let base = if elf.object_type() == ObjectType::Dynamic {
                    entry.get().wrapping_sub(elf.entry_point())
                } else {
                    0
                };
                (entry, base)
            }
            (Some((_, elf)), None) => (Addr(elf.entry_point()), 0),
            (None, entry) => (entry.unwrap_or(Addr::NULL), 0),
        };

        let mut set = MappingSet::new();

        // Seed mappings from the executable's loadable segments; the core overlays them below, so
        // these only survive where the kernel chose not to dump (typically text).
        if let Some((path, elf)) = &exe_elf {
            for segment in elf.segments().filter(|s| s.segment_type() == SegmentType::Load) {
                if segment.file_size == 0 {
                    continue;
                }
                let min = Addr(segment.virtual_address.wrapping_add(static_base)).align_down(PAGE_SIZE);
                let skew = Addr(segment.virtual_address.wrapping_add(static_base)).distance_from(min);
                let max = Addr(segment.virtual_address.wrapping_add(static_base) + segment.file_size).align_up(PAGE_SIZE);
                set.overlay(Mapping {
                    min,
                    max,
                    perm: segment_perm(&segment),
                    source: Some(Source { path: path.clone(), offset: segment.offset.saturating_sub(skew) }),
                    orig_source: None,
                    contents: Contents::Zero,
                });
            }
        }

        // Mappings from the core's own loadable segments. Where the in-memory size exceeds the
        // on-file size the kernel dumped nothing; the tail reads as zeroes unless a file note
        // later attaches a backing.
        for segment in core.segments().filter(|s| s.segment_type() == SegmentType::Load) {
            let perm = segment_perm(&segment);
            if segment.file_size > 0 {
                set.overlay(Mapping {
                    min: Addr(segment.virtual_address),
                    max: Addr(segment.virtual_address + segment.file_size).align_up(PAGE_SIZE),
                    perm,
                    source: Some(Source { path: self.core_path.to_path_buf(), offset: segment.offset }),
                    orig_source: None,
                    contents: Contents::Zero,
                });
            }
            if segment.mem_size > segment.file_size {
                // The kernel recorded the region but dumped no bytes (file-backed text, or a
                // trailing zero region). Only fill where nothing else - the executable's seed
                // mappings in particular - already provides bytes.
                set.overlay_gaps(Mapping {
                    min: Addr(segment.virtual_address + segment.file_size).align_up(PAGE_SIZE),
                    max: Addr(segment.virtual_address + segment.mem_size).align_up(PAGE_SIZE),
                    perm,
                    source: None,
                    orig_source: None,
                    contents: Contents::Zero,
                });
            }
        }

        // The file-mapping note tells us which file each region came from. For regions the core
        // carries bytes for, that is provenance (and the pre-copy source of copy-on-write data);
        // for regions it does not, it is the only place bytes can come from at all.
        let core_path = self.core_path.to_path_buf();
        for file_mapping in &file_notes {
            if file_mapping.min >= file_mapping.max {
                continue;
            }
            let attached = set.split_and_update(file_mapping.min, file_mapping.max, |mapping| {
                let backed_by_core = mapping.source.as_ref().is_some_and(|s| s.path == core_path);
                let source = Source { path: file_mapping.path.clone(), offset: file_mapping.offset };
                if backed_by_core {
                    mapping.orig_source = Some(source);
                } else {
                    mapping.source = Some(source);
                }
            });
            if !attached {
                self.warn(format!(
                    "file mapping {} [{}, {}) covers no loaded segment; ignored",
                    file_mapping.path.display(),
                    file_mapping.min,
                    file_mapping.max
                ));
            }
        }

        let mut mappings = set.finish();
        self.resolve_contents(&mut mappings)?;
        let mappings = MappingSet::from_resolved(mappings).finish();
        let page_table = PageTable::build(&mappings);

        let (debug, symbols) = match &exe_elf {
            Some((_, elf)) => {
                let symbols = read_symbols(elf, static_base);
                (read_debug_sections(elf), symbols)
            }
            None => (Err("no executable available".to_string()), HashMap::new()),
        };

        Ok(ProcessImage {
            arch,
            endian,
            mappings,
            page_table,
            threads,
            args,
            entry_point,
            static_base,
            symbols,
            debug,
            warnings: self.warnings,
        })
    }

    /// Attach actual bytes to every mapping: a slice of the memory-mapped backing file, or zeroes
    /// where there is no backing to be had.
    fn resolve_contents(&mut self, mappings: &mut [Mapping]) -> Result<(), Error> {
        let core_path = self.core_path.to_path_buf();
        for mapping in mappings {
            let Some(source) = mapping.source.clone() else { continue };
            let from_core = source.path == core_path;

            let data = match self.resolve(&source.path).and_then(|resolved| self.map_file_cached(&resolved)) {
                Some(data) => data,
                None if from_core => {
                    return Err(Error::CorruptFormat("core file became unreadable mid-load".to_string()))
                }
                None => {
                    self.warn(format!("cannot read {}; region served as zeroes", source.path.display()));
                    continue;
                }
            };

            let end = source.offset + mapping.size();
            if end > data.len() as u64 {
                if from_core {
                    return Err(Error::CorruptFormat(format!(
                        "segment at {} extends past the end of the core file",
                        mapping.min
                    )));
                }
                self.warn(format!(
                    "{} is shorter than the region mapped from it; tail served as zeroes",
                    source.path.display()
                ));
            }
            if !from_core && mapping.perm.contains(Perm::WRITE) {
                self.warn(format!(
                    "writable region at {} is not in the core; serving possibly-stale bytes from {}",
                    mapping.min,
                    source.path.display()
                ));
            }
            mapping.contents = Contents::Mapped { data, offset: source.offset as usize };
        }
        Ok(())
    }

    /// `path` itself if it exists, else `base/path` with the root stripped.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        if let Some(base) = self.base {
            let relative: PathBuf = path.components().skip_while(|c| !matches!(c, std::path::Component::Normal(_))).collect();
            let candidate = base.join(relative);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn map_file(&mut self, path: &Path) -> Result<Arc<Mmap>, Error> {
        let file = File::open(path).map_err(|error| Error::Io(path.to_path_buf(), error))?;
        let data = unsafe { Mmap::map(&file) }.map_err(|error| Error::Io(path.to_path_buf(), error))?;
        let data = Arc::new(data);
        self.files.insert(path.to_path_buf(), Some(data.clone()));
        Ok(data)
    }

    fn map_file_cached(&mut self, path: &Path) -> Option<Arc<Mmap>> {
        if let Some(cached) = self.files.get(path) {
            return cached.clone();
        }
        let mapped = self.map_file(path).ok();
        self.files.insert(path.to_path_buf(), mapped.clone());
        mapped
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

fn segment_perm(segment: &ProgramHeader) -> Perm {
    let mut perm = Perm::empty();
    if segment.is_readable() {
        perm |= Perm::READ;
    }
    if segment.is_writable() {
        perm |= Perm::WRITE;
    }
    if segment.is_executable() {
        perm |= Perm::EXEC;
    }
    perm
}

fn read_symbols(elf: &Elf, static_base: u64) -> HashMap<String, Addr> {
    let mut symbols = HashMap::new();
    for symbol in elf.symbols() {
        if let Some(name) = elf.symbol_name(&symbol) {
            if !name.is_empty() {
                symbols.insert(name.to_string(), Addr(symbol.value.wrapping_add(static_base)));
            }
        }
    }
    symbols
}

const DEBUG_SECTIONS: &[&str] = &[
    "abbrev",
    "addr",
    "info",
    "line",
    "line_str",
    "loc",
    "loclists",
    "ranges",
    "rnglists",
    "str",
    "str_offsets",
];

fn read_debug_sections(elf: &Elf) -> Result<DebugData, String> {
    let mut sections = HashMap::new();
    for name in DEBUG_SECTIONS {
        let dotted = format!(".debug_{name}");
        if let Some(section) = elf.section_by_name(&dotted) {
            if let Some(data) = section.data(elf) {
                sections.insert((*name).to_string(), data.to_vec());
            }
        } else if elf.section_by_name(&format!(".zdebug_{name}")).is_some() {
            return Err(format!("compressed debug section .zdebug_{name} is not supported"));
        }
    }
    if sections.get("info").map(|v| v.is_empty()).unwrap_or(true) {
        return Err("executable has no .debug_info".to_string());
    }
    Ok(DebugData { sections })
}

/// Assembles a synthetic [`ProcessImage`] directly from parts. This is how the test suites build
/// images without shipping binary core files, and is also useful to tools that scrape memory from
/// somewhere other than a core.
pub struct ProcessBuilder {
    arch: Arch,
    endian: Endian,
    static_base: u64,
    args: String,
    set: MappingSet,
    threads: Vec<note::ThreadState>,
}

impl ProcessBuilder {
    pub fn new(arch: Arch) -> ProcessBuilder {
        ProcessBuilder {
            arch,
            endian: Endian::Little,
            static_base: 0,
            args: String::new(),
            set: MappingSet::new(),
            threads: Vec::new(),
        }
    }

    /// Add a mapping at `min` with the given bytes, zero-padded up to a whole number of pages.
    pub fn mapping(mut self, min: u64, perm: Perm, mut bytes: Vec<u8>) -> ProcessBuilder {
        assert!(Addr(min).is_aligned(PAGE_SIZE));
        let len = Addr(bytes.len() as u64).align_up(PAGE_SIZE).get();
        bytes.resize(len as usize, 0);
        self.set.overlay(Mapping {
            min: Addr(min),
            max: Addr(min + len),
            perm,
            source: None,
            orig_source: None,
            contents: Contents::Owned { data: Arc::new(bytes), offset: 0 },
        });
        self
    }

    pub fn zero_mapping(mut self, min: u64, len: u64, perm: Perm) -> ProcessBuilder {
        assert!(Addr(min).is_aligned(PAGE_SIZE));
        self.set.overlay(Mapping {
            min: Addr(min),
            max: Addr(min + len).align_up(PAGE_SIZE),
            perm,
            source: None,
            orig_source: None,
            contents: Contents::Zero,
        });
        self
    }

    pub fn thread(mut self, pid: u64, regs: Vec<u64>) -> ProcessBuilder {
        let pc = Addr(regs.get(self.arch.pc_index()).copied().unwrap_or(0));
        let sp = Addr(regs.get(self.arch.sp_index()).copied().unwrap_or(0));
        self.threads.push(note::ThreadState { pid, regs, pc, sp });
        self
    }

    pub fn build(self) -> ProcessImage {
        let mappings = self.set.finish();
        let page_table = PageTable::build(&mappings);
        ProcessImage {
            arch: self.arch,
            endian: self.endian,
            mappings,
            page_table,
            threads: self.threads,
            args: self.args,
            entry_point: Addr::NULL,
            static_base: self.static_base,
            symbols: HashMap::new(),
            debug: Err("synthetic image".to_string()),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_cross_mapping_boundaries() {
        let image = ProcessBuilder::new(Arch::Amd64)
            .mapping(0x1000, Perm::READ, vec![0xab; 4096])
            .mapping(0x2000, Perm::READ, vec![0xcd; 4096])
            .build();

        let mut buffer = [0; 4];
        image.read_at(Addr(0x1ffe), &mut buffer).unwrap();
        assert_eq!(buffer, [0xab, 0xab, 0xcd, 0xcd]);

        assert!(image.readable_n(Addr(0x1000), 8192));
        assert!(!image.readable_n(Addr(0x1000), 8193));
        assert!(image.read_at(Addr(0x3000), &mut buffer).is_err());
    }

    #[test]
    fn scalar_reads_follow_byte_order() {
        let mut bytes = vec![0; 4096];
        bytes[..8].copy_from_slice(&0x1122334455667788u64.to_le_bytes());
        let image = ProcessBuilder::new(Arch::Amd64).mapping(0x1000, Perm::READ, bytes).build();

        assert_eq!(image.read_u64(Addr(0x1000)).unwrap(), 0x1122334455667788);
        assert_eq!(image.read_u32(Addr(0x1000)).unwrap(), 0x55667788);
        assert_eq!(image.read_ptr(Addr(0x1000)).unwrap(), Addr(0x1122334455667788));
    }

    #[test]
    fn unreadable_perms_fail_reads() {
        let image = ProcessBuilder::new(Arch::Amd64).zero_mapping(0x5000, 4096, Perm::empty()).build();
        assert!(!image.readable(Addr(0x5000)));
        assert!(image.read_u8(Addr(0x5000)).is_err());
    }
}
