/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Reading the all-goroutines list. This only captures what the scheduler records say; turning a
//! record into frames and roots is the unwinder's job.

use crate::{
    dwarf::ConstTable,
    runtime::val::Val,
    Result,
};
use loam::Addr;

/// One `runtime.g` record, with the handful of fields the unwinder consumes.
#[derive(Clone, Debug)]
pub struct GoroutineRec {
    pub addr: Addr,
    pub goid: u64,
    /// Status word with the scan bit already cleared.
    pub status: u64,
    pub stack_lo: Addr,
    pub stack_hi: Addr,
    pub sched_sp: Addr,
    pub sched_pc: Addr,
    pub syscall_sp: Addr,
    pub syscall_pc: Addr,
    /// The OS thread id of the M this goroutine is attached to, if any.
    pub m_procid: Option<u64>,
}

pub fn read_goroutines(allgs: &Val, consts: &ConstTable) -> Result<Vec<GoroutineRec>> {
    let scan_bit = consts.get("runtime._Gscan") as u64;

    let list = allgs.slice()?;
    let mut goroutines = Vec::with_capacity(list.len as usize);
    for i in 0..list.len {
        if list.index(i)?.ptr()?.is_null() {
            continue;
        }
        let g = list.index(i)?.deref()?;

        let stack = g.field("stack")?;
        let sched = g.field("sched")?;
        let m_ptr = g.field("m")?.ptr()?;
        let m_procid = if m_ptr.is_null() {
            None
        } else {
            Some(g.field("m")?.deref()?.field("procid")?.uint()?)
        };

        goroutines.push(GoroutineRec {
            addr: g.addr,
            goid: g.field("goid")?.uint()?,
            status: g.field("atomicstatus")?.atomic_uint()? & !scan_bit,
            stack_lo: Addr(stack.field("lo")?.uint()?),
            stack_hi: Addr(stack.field("hi")?.uint()?),
            sched_sp: Addr(sched.field("sp")?.uint()?),
            sched_pc: Addr(sched.field("pc")?.uint()?),
            syscall_sp: Addr(g.field("syscallsp")?.uint()?),
            syscall_pc: Addr(g.field("syscallpc")?.uint()?),
            m_procid,
        });
    }
    Ok(goroutines)
}
