/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! DOT output for `objgraph`: objects as `o<hex>`, global roots as `r<id>`, frames as `f<hex>`,
//! edges labeled with the field the pointer leaves through. Pointers into the middle of an
//! object carry the destination offset on the head label.

use eyre::Result;
use std::{collections::HashSet, io::Write};
use taproot::Process;

pub fn write_objgraph(process: &Process, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "digraph {{")?;

    // Roots and their edges. Stack roots hang off one node per frame; globals stand alone.
    let mut frame_nodes: HashSet<u64> = HashSet::new();
    process.for_each_root(|root| {
        let source = match root.frame {
            Some((goroutine, frame)) => {
                let frame = &process.goroutines()[goroutine].frames[frame];
                let id = frame.min.get();
                if frame_nodes.insert(id) {
                    let _ = writeln!(out, "  f{id:x} [label=\"{}\",shape=rectangle];", frame.func_name);
                }
                format!("f{id:x}")
            }
            None => {
                let _ = writeln!(out, "  r{} [label=\"{}\",shape=hexagon];", root.id, root.name);
                format!("r{}", root.id)
            }
        };
        process.for_each_root_ptr(root, |offset, target, target_offset| {
            let label = match root.typ {
                Some(typ) => format!("{}{}", root.name, process.field_label(typ, 1, offset)),
                None => root.name.clone(),
            };
            let head = head_label(target_offset);
            let _ = writeln!(out, "  {source} -> o{:x} [label=\"{label}\"{head}];", target.get());
            true
        });
        true
    });

    // Objects and object-to-object edges.
    process.for_each_object(|addr, size| {
        let _ = writeln!(
            out,
            "  o{:x} [label=\"{}\\n{size} bytes\"];",
            addr.get(),
            process.object_display_name(addr)
        );
        process.for_each_ptr(addr, |offset, target, target_offset| {
            let label = match process.type_of(addr) {
                Some((typ, repeat)) => process.field_label(typ, repeat, offset),
                None => format!("+{offset}"),
            };
            let head = head_label(target_offset);
            let _ = writeln!(out, "  o{:x} -> o{:x} [label=\"{label}\"{head}];", addr.get(), target.get());
            true
        });
        true
    });

    writeln!(out, "}}")?;
    Ok(())
}

fn head_label(target_offset: u64) -> String {
    if target_offset == 0 {
        String::new()
    } else {
        format!(",headlabel=\"+{target_offset}\"")
    }
}
