/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Human-readable output for the CLI subcommands.

use colored::Colorize;
use eyre::{eyre, Result};
use loam::Addr;
use taproot::{stats::Stats, Process};

pub fn parse_addr(s: &str) -> Result<Addr> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16)
        .map(Addr)
        .map_err(|_| eyre!("cannot parse {s} as a hex address"))
}

/// `2732032` -> `2.6 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn overview(process: &Process) {
    let image = process.image();
    let byte_order = match image.byte_order() {
        scroll::Endian::Little => "little-endian",
        scroll::Endian::Big => "big-endian",
    };
    println!("{:>12} {}", "arch".bold(), image.arch().name());
    println!("{:>12} {}", "pointer size".bold(), image.pointer_size());
    println!("{:>12} {}", "byte order".bold(), byte_order);
    if let Some(exe) = image.executable_path() {
        println!("{:>12} {}", "exe".bold(), exe);
    }
    if let Some(version) = process.build_version() {
        println!("{:>12} {}", "runtime".bold(), version);
    }
    println!("{:>12} {}", "memory".bold(), format_bytes(process.stats().value));
    println!("{:>12} {}", "objects".bold(), process.n_objects());
    println!("{:>12} {}", "goroutines".bold(), process.goroutines().len());
}

pub fn mappings(process: &Process) {
    println!("{:>18} {:>18} {:>5} {:>12}  {}", "min".bold(), "max".bold(), "perm", "size", "source");
    for mapping in process.image().mappings() {
        let source = match &mapping.source {
            Some(source) => format!("{} @ {:#x}", source.path.display(), source.offset),
            None => String::new(),
        };
        println!(
            "{:>#18x} {:>#18x} {:>5} {:>12}  {}",
            mapping.min.get(),
            mapping.max.get(),
            mapping.perm.to_string(),
            format_bytes(mapping.size()),
            source
        );
    }
}

fn status_name(process: &Process, status: u64) -> &'static str {
    let consts = &process.dwarf().consts;
    let matches = |name: &str| consts.find(name) == Some(status as i64);
    if matches("runtime._Gidle") {
        "idle"
    } else if matches("runtime._Grunnable") {
        "runnable"
    } else if matches("runtime._Grunning") {
        "running"
    } else if matches("runtime._Gsyscall") {
        "syscall"
    } else if matches("runtime._Gwaiting") {
        "waiting"
    } else {
        "unknown"
    }
}

pub fn goroutines(process: &Process) {
    for goroutine in process.goroutines() {
        println!(
            "{} {} [{}] {} of stack in use",
            "goroutine".bold(),
            goroutine.rec.goid,
            status_name(process, goroutine.rec.status),
            format_bytes(goroutine.stack_size),
        );
        for frame in &goroutine.frames {
            println!("    {} pc={}", frame.func_name, frame.pc);
        }
    }
}

pub fn histogram(process: &Process) {
    println!("{:>8} {:>12} {:>14}  {}", "count".bold(), "size", "total", "type");
    for (name, count, total) in process.histogram() {
        println!("{:>8} {:>12} {:>14}  {}", count, total / count, total, name);
    }
}

pub fn breakdown(process: &Process) {
    fn node(stats: &Stats, depth: usize) {
        println!("{:indent$}{:<20} {:>14}", "", stats.name, format_bytes(stats.value), indent = depth * 2);
        for child in &stats.children {
            node(child, depth + 1);
        }
    }
    node(process.stats(), 0);
}

pub fn objects(process: &Process) {
    process.for_each_object(|addr, size| {
        println!("{:>#18x} {:>10} {}", addr.get(), size, process.object_display_name(addr));
        true
    });
}

/// The root's printable description: `<function>.<name>` for stack roots, the bare name for
/// globals.
pub fn root_description(process: &Process, root_id: usize) -> String {
    let root = process.root(root_id);
    match root.frame {
        Some((goroutine, frame)) => {
            let func = &process.goroutines()[goroutine].frames[frame].func_name;
            format!("{func}.{}", root.name)
        }
        None => root.name.clone(),
    }
}

pub fn reachable(process: &Process, addr: Addr) -> Result<()> {
    let Some(path) = process.reachable(addr)? else {
        println!("{addr} is not reachable from any root");
        return Ok(());
    };
    let root = process.root(path.root);

    // For a stack root, name the goroutine's ancestor frames, outermost first, so the path reads
    // from the program's entry down to the object.
    if let Some((goroutine, frame)) = root.frame {
        let frames = &process.goroutines()[goroutine].frames;
        for ancestor in frames[frame + 1..].iter().rev() {
            println!("{}", ancestor.func_name);
        }
    }

    let offset_label = match (root.typ, path.root_offset) {
        (Some(typ), offset) => process.field_label(typ, 1, offset),
        (None, 0) => String::new(),
        (None, offset) => format!("+{offset}"),
    };
    print!("{}{} → ", root_description(process, path.root), offset_label);

    for (index, &(obj, egress)) in path.steps.iter().enumerate() {
        if index > 0 {
            print!(" → ");
        }
        print!("{}", process.describe_object(obj));
        if let (Some(egress), Some((typ, repeat))) = (egress, process.type_of(obj)) {
            print!("{}", process.field_label(typ, repeat, egress));
        } else if let Some(egress) = egress {
            print!("+{egress}");
        }
    }
    println!();
    Ok(())
}

pub fn read(process: &Process, addr: Addr, size: u64) -> Result<()> {
    let bytes = process.image().read_bytes(addr, size).map_err(|e| eyre!("{e}"))?;
    for (row, chunk) in bytes.chunks(16).enumerate() {
        print!("{:#18x}  ", addr.get() + row as u64 * 16);
        for (i, byte) in chunk.iter().enumerate() {
            print!("{byte:02x} ");
            if i == 7 {
                print!(" ");
            }
        }
        for _ in chunk.len()..16 {
            print!("   ");
        }
        print!(" |");
        for &byte in chunk {
            let c = if (0x20..0x7f).contains(&byte) { byte as char } else { '.' };
            print!("{c}");
        }
        println!("|");
    }
    Ok(())
}

pub fn warnings(process: &Process) {
    for warning in process.warnings() {
        eprintln!("{} {warning}", "warning:".yellow().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(2_732_032), "2.6 MB");
        assert_eq!(format_bytes(3 << 30), "3.0 GB");
    }

    #[test]
    fn address_parsing() {
        assert_eq!(parse_addr("0xc000012345").unwrap(), Addr(0xc000012345));
        assert_eq!(parse_addr("c000012345").unwrap(), Addr(0xc000012345));
        assert!(parse_addr("not-an-address").is_err());
    }
}
