//! Operand inspection: deciding whether a decoded operand carries taint and
//! applying or clearing taint across its full byte width

use iced_x86::{Instruction, Register, UsedMemory};

use crate::addrs::VirtAddr;
use crate::regs::MachineContext;
use crate::shadow::ShadowState;

/// A memory reference of the form `base + index * scale + displacement`
///
/// The displacement is a constant: its value participates in address
/// generation but it is never consulted for taint. For RIP-relative
/// references the decoder has already folded the absolute target into the
/// displacement, so the base is dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemRef {
    /// Base register, `Register::None` if absent
    pub base: Register,

    /// Index register, `Register::None` if absent
    pub index: Register,

    /// Scale applied to the index register
    pub scale: u32,

    /// Constant displacement (absolute address for RIP-relative forms)
    pub displacement: u64,

    /// Width of the access in bytes
    pub size: usize,
}

impl MemRef {
    /// Build the memory reference for the explicit memory operand of `instr`
    #[must_use]
    pub fn from_instruction(instr: &Instruction) -> Self {
        Self::parts(
            instr.memory_base(),
            instr.memory_index(),
            instr.memory_index_scale(),
            instr.memory_displacement64(),
            instr.memory_size().size(),
        )
    }

    /// Build the memory reference for an implicit or explicit access
    /// surveyed by the instruction info factory
    #[must_use]
    pub fn from_used_memory(mem: &UsedMemory) -> Self {
        Self::parts(
            mem.base(),
            mem.index(),
            mem.scale(),
            mem.displacement(),
            mem.memory_size().size(),
        )
    }

    fn parts(base: Register, index: Register, scale: u32, displacement: u64, size: usize) -> Self {
        // The decoder reports RIP-relative operands with the absolute target
        // already in the displacement
        let base = if base == Register::RIP {
            Register::None
        } else {
            base
        };

        MemRef {
            base,
            index,
            scale,
            displacement,
            size,
        }
    }

    /// Resolve the effective address against the captured register state
    #[must_use]
    pub fn effective_address(&self, ctx: &MachineContext) -> VirtAddr {
        let mut addr = self.displacement;

        if self.base != Register::None {
            addr = addr.wrapping_add(ctx.address_value(self.base));
        }

        if self.index != Register::None {
            addr = addr.wrapping_add(
                ctx.address_value(self.index)
                    .wrapping_mul(u64::from(self.scale)),
            );
        }

        VirtAddr(addr)
    }
}

/// A source or destination operand relevant to taint propagation
///
/// Immediates and direct branch targets are never represented; they cannot
/// carry taint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A general purpose register (any width)
    Reg(Register),

    /// A memory access
    Mem(MemRef),
}

impl Operand {
    /// Check whether this operand currently carries taint.
    ///
    /// A register operand is tainted if its canonical family is tainted. A
    /// memory operand is tainted if any byte of the accessed range is
    /// tainted, or if any register used to generate the address is tainted.
    #[must_use]
    pub fn is_tainted(&self, ctx: &MachineContext, shadow: &ShadowState) -> bool {
        match self {
            Operand::Reg(reg) => shadow.tr_has(*reg),
            Operand::Mem(mem) => {
                let addr = mem.effective_address(ctx);
                if shadow.tm_has_range(addr, mem.size) {
                    return true;
                }

                // Tainted address generation taints the access itself
                if mem.base != Register::None && shadow.tr_has(mem.base) {
                    return true;
                }
                if mem.index != Register::None && shadow.tr_has(mem.index) {
                    return true;
                }

                false
            }
        }
    }

    /// Mark this operand as tainted across its full width
    pub fn taint(&self, ctx: &MachineContext, shadow: &mut ShadowState) {
        match self {
            Operand::Reg(reg) => shadow.tr_add(*reg),
            Operand::Mem(mem) => {
                let addr = mem.effective_address(ctx);
                shadow.tm_add_range(addr, mem.size);
            }
        }
    }

    /// Clear taint from this operand across its full width. Returns `true`
    /// if anything was cleared.
    pub fn untaint(&self, ctx: &MachineContext, shadow: &mut ShadowState) -> bool {
        match self {
            Operand::Reg(reg) => shadow.tr_remove(*reg),
            Operand::Mem(mem) => {
                let addr = mem.effective_address(ctx);
                shadow.tm_remove_range(addr, mem.size)
            }
        }
    }
}
