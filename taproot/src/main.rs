/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

mod dot;
mod flags;
mod render;

use eyre::Result;
use std::{fs::File, io::BufWriter, process::exit};
use taproot::Process;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let flags = flags::Taproot::from_env_or_exit();

    let process = match Process::load(&flags.core, flags.exe.as_deref(), flags.base.as_deref()) {
        Ok(process) => process,
        Err(error) => {
            eprintln!("error: {error}");
            exit(error.exit_code());
        }
    };

    match &flags.subcommand {
        flags::TaprootCmd::Overview(_) => render::overview(&process),
        flags::TaprootCmd::Mappings(_) => render::mappings(&process),
        flags::TaprootCmd::Goroutines(_) => render::goroutines(&process),
        flags::TaprootCmd::Histogram(_) => render::histogram(&process),
        flags::TaprootCmd::Breakdown(_) => render::breakdown(&process),
        flags::TaprootCmd::Objects(_) => render::objects(&process),
        flags::TaprootCmd::Objgraph(cmd) => {
            let path = cmd.out.clone().unwrap_or_else(|| "objgraph.dot".into());
            let mut out = BufWriter::new(File::create(&path)?);
            dot::write_objgraph(&process, &mut out)?;
            println!("wrote {}", path.display());
        }
        flags::TaprootCmd::Reachable(cmd) => render::reachable(&process, render::parse_addr(&cmd.addr)?)?,
        flags::TaprootCmd::Read(cmd) => {
            render::read(&process, render::parse_addr(&cmd.addr)?, cmd.size.unwrap_or(256))?
        }
    }

    render::warnings(&process);
    Ok(())
}
