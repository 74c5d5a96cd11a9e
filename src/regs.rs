//! Register canonicalization and the captured machine context for x86-64

use iced_x86::Register;
use serde::{Deserialize, Serialize};

/// Sentinel register used to track taint on the program counter.
///
/// Never produced by operand surveying (branches are handled by their own
/// rules), so it cannot collide with a real operand register. [`canon`]
/// round-trips it.
pub const REG_PC: Register = Register::RIP;

/// The stack pointer in canonical form
pub const REG_STACK: Register = Register::RSP;

/// Map any 8/16/32-bit general purpose sub-register onto its 64-bit parent.
///
/// All other inputs (including [`REG_PC`]) pass through unchanged. Shadow
/// state is keyed exclusively on the output of this function so that e.g. a
/// write to `al` and a read of `rax` observe the same taint.
#[must_use]
pub const fn canon(reg: Register) -> Register {
    match reg {
        Register::AL | Register::AH | Register::AX | Register::EAX => Register::RAX,
        Register::BL | Register::BH | Register::BX | Register::EBX => Register::RBX,
        Register::CL | Register::CH | Register::CX | Register::ECX => Register::RCX,
        Register::DL | Register::DH | Register::DX | Register::EDX => Register::RDX,
        Register::SPL | Register::SP | Register::ESP => Register::RSP,
        Register::BPL | Register::BP | Register::EBP => Register::RBP,
        Register::SIL | Register::SI | Register::ESI => Register::RSI,
        Register::DIL | Register::DI | Register::EDI => Register::RDI,
        Register::R8L | Register::R8W | Register::R8D => Register::R8,
        Register::R9L | Register::R9W | Register::R9D => Register::R9,
        Register::R10L | Register::R10W | Register::R10D => Register::R10,
        Register::R11L | Register::R11W | Register::R11D => Register::R11,
        Register::R12L | Register::R12W | Register::R12D => Register::R12,
        Register::R13L | Register::R13W | Register::R13D => Register::R13,
        Register::R14L | Register::R14W | Register::R14D => Register::R14,
        Register::R15L | Register::R15W | Register::R15D => Register::R15,
        Register::EIP => Register::RIP,
        _ => reg,
    }
}

/// The 16 general purpose registers in the order they appear in the crash
/// report, along with their report names
pub(crate) const GPRS: [(Register, &str); 16] = [
    (Register::RAX, "rax"),
    (Register::RBX, "rbx"),
    (Register::RCX, "rcx"),
    (Register::RDX, "rdx"),
    (Register::RSP, "rsp"),
    (Register::RBP, "rbp"),
    (Register::RSI, "rsi"),
    (Register::RDI, "rdi"),
    (Register::R8, "r8"),
    (Register::R9, "r9"),
    (Register::R10, "r10"),
    (Register::R11, "r11"),
    (Register::R12, "r12"),
    (Register::R13, "r13"),
    (Register::R14, "r14"),
    (Register::R15, "r15"),
];

/// General purpose register state captured from the guest thread that is
/// about to execute (or has just faulted on) an instrumented instruction.
///
/// The DBI glue fills this from the host's machine context; the taint engine
/// only ever reads it, primarily to resolve memory operand addresses.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct MachineContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl MachineContext {
    /// Read the full-width value of the register family containing `reg`
    #[must_use]
    pub fn get(&self, reg: Register) -> u64 {
        match canon(reg) {
            Register::RAX => self.rax,
            Register::RBX => self.rbx,
            Register::RCX => self.rcx,
            Register::RDX => self.rdx,
            Register::RSP => self.rsp,
            Register::RBP => self.rbp,
            Register::RSI => self.rsi,
            Register::RDI => self.rdi,
            Register::R8 => self.r8,
            Register::R9 => self.r9,
            Register::R10 => self.r10,
            Register::R11 => self.r11,
            Register::R12 => self.r12,
            Register::R13 => self.r13,
            Register::R14 => self.r14,
            Register::R15 => self.r15,
            Register::RIP => self.rip,
            _ => 0,
        }
    }

    /// Read the value of `reg` truncated to the width used for address
    /// generation (a 32-bit base register only contributes 32 bits)
    #[must_use]
    pub fn address_value(&self, reg: Register) -> u64 {
        let full = self.get(reg);
        match reg.size() {
            4 => u64::from(full as u32),
            _ => full,
        }
    }
}
