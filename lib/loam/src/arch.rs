/*
 * Copyright 2025, Isaac Woods
 * SPDX-License-Identifier: MPL-2.0
 */

//! Architecture-specific knowledge: how the kernel lays registers out in `NT_PRSTATUS` records,
//! how DWARF numbers registers, and where a signal handler's `ucontext` keeps the interrupted
//! frame's registers.

use crate::{addr::Addr, image::ProcessImage, Error};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn from_elf_machine(machine: u16) -> Option<Arch> {
        match machine {
            alder::header::MACHINE_X86_64 => Some(Arch::Amd64),
            alder::header::MACHINE_AARCH64 => Some(Arch::Arm64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    pub fn pointer_size(self) -> u64 {
        8
    }

    /// The instruction-length quantum pc-delta tables are encoded in.
    pub fn pc_quantum(self) -> u64 {
        match self {
            Arch::Amd64 => 1,
            Arch::Arm64 => 4,
        }
    }

    /// Number of 64-bit words in this architecture's `NT_PRSTATUS` register block.
    pub fn prstatus_reg_count(self) -> usize {
        match self {
            // r15 r14 r13 r12 rbp rbx r11 r10 r9 r8 rax rcx rdx rsi rdi orig_rax rip cs eflags
            // rsp ss fs_base gs_base ds es fs gs
            Arch::Amd64 => 27,
            // x0-x30 sp pc pstate
            Arch::Arm64 => 34,
        }
    }

    pub fn pc_index(self) -> usize {
        match self {
            Arch::Amd64 => 16,
            Arch::Arm64 => 32,
        }
    }

    pub fn sp_index(self) -> usize {
        match self {
            Arch::Amd64 => 19,
            Arch::Arm64 => 31,
        }
    }

    /// Whether the architecture saves the return address in a link register rather than pushing
    /// it on the stack.
    pub fn has_link_register(self) -> bool {
        match self {
            Arch::Amd64 => false,
            Arch::Arm64 => true,
        }
    }

    /// The DWARF number of the link register, where there is one.
    pub fn link_register(self) -> Option<u16> {
        match self {
            Arch::Amd64 => None,
            Arch::Arm64 => Some(30),
        }
    }

    /// One past the largest DWARF register number general-purpose registers use.
    pub fn dwarf_reg_count(self) -> usize {
        match self {
            Arch::Amd64 => 17,
            Arch::Arm64 => 32,
        }
    }

    /// Renumber a raw `NT_PRSTATUS` register block into DWARF numbering.
    pub fn dwarf_registers(self, raw: &[u64]) -> RegisterFile {
        let mut file = RegisterFile::zeroed(self);
        match self {
            Arch::Amd64 => {
                const FROM_PRSTATUS: [usize; 17] = [10, 12, 11, 5, 13, 14, 4, 19, 9, 8, 7, 6, 3, 2, 1, 0, 16];
                for (dwarf, &slot) in FROM_PRSTATUS.iter().enumerate() {
                    file.set(dwarf as u16, raw.get(slot).copied().unwrap_or(0));
                }
            }
            Arch::Arm64 => {
                for dwarf in 0..32 {
                    file.set(dwarf as u16, raw.get(dwarf).copied().unwrap_or(0));
                }
            }
        }
        file
    }

    /// Recover the interrupted frame's state from the `ucontext` a signal handler was given. Used
    /// when unwinding through the runtime's signal trampoline. Returns the register file plus the
    /// interrupted pc and sp.
    pub fn unwind_signal_frame(self, image: &ProcessImage, ctx: Addr) -> Result<(RegisterFile, Addr, Addr), Error> {
        let mut file = RegisterFile::zeroed(self);
        match self {
            Arch::Amd64 => {
                // `ucontext_t.uc_mcontext.gregs` holds r8-r15, rdi, rsi, rbp, rbx, rdx, rax, rcx,
                // rsp, rip, eflags, ... in that order.
                let gregs = ctx + 40;
                let reg = |i: u64| image.read_u64(gregs + i * 8);
                for i in 0..8 {
                    file.set((8 + i) as u16, reg(i as u64)?);
                }
                file.set(5, reg(8)?); // rdi
                file.set(4, reg(9)?); // rsi
                file.set(6, reg(10)?); // rbp
                file.set(3, reg(11)?); // rbx
                file.set(1, reg(12)?); // rdx
                file.set(0, reg(13)?); // rax
                file.set(2, reg(14)?); // rcx
                file.set(7, reg(15)?); // rsp
                file.set(16, reg(16)?); // rip
                Ok((file, Addr(reg(16)?), Addr(reg(15)?)))
            }
            Arch::Arm64 => {
                // `uc_mcontext` sits at +176; within it fault_address is followed by x0-x30, sp,
                // pc, pstate.
                let mcontext = ctx + 176;
                for i in 0..31 {
                    file.set(i as u16, image.read_u64(mcontext + 8 + i * 8)?);
                }
                let sp = image.read_u64(mcontext + 8 + 31 * 8)?;
                let pc = image.read_u64(mcontext + 8 + 32 * 8)?;
                file.set(31, sp);
                Ok((file, Addr(pc), Addr(sp)))
            }
        }
    }
}

/// General-purpose registers in DWARF numbering, as consumed by location-list programs. A
/// goroutine with no OS thread attached evaluates against a zeroed file.
#[derive(Clone, Debug)]
pub struct RegisterFile {
    regs: Vec<u64>,
}

impl RegisterFile {
    pub fn zeroed(arch: Arch) -> RegisterFile {
        RegisterFile { regs: vec![0; arch.dwarf_reg_count()] }
    }

    pub fn get(&self, reg: u16) -> u64 {
        self.regs.get(reg as usize).copied().unwrap_or(0)
    }

    pub fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amd64_prstatus_renumbering() {
        // Distinct values per slot so a wrong index is caught.
        let raw: Vec<u64> = (0..27).map(|i| 0x100 + i).collect();
        let file = Arch::Amd64.dwarf_registers(&raw);
        assert_eq!(file.get(0), 0x10a); // rax is slot 10
        assert_eq!(file.get(6), 0x104); // rbp is slot 4
        assert_eq!(file.get(7), 0x113); // rsp is slot 19
        assert_eq!(file.get(16), 0x110); // rip is slot 16
        assert_eq!(file.get(8), 0x109); // r8 is slot 9
        assert_eq!(file.get(15), 0x100); // r15 is slot 0
    }
}
