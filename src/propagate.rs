//! Instruction-level taint propagation
//!
//! [`TaintEngine::propagate`] runs on the guest thread immediately before
//! each application instruction. It spreads taint from source operands to
//! destination operands, wipes destinations whose sources are clean, and
//! applies the handful of instruction-specific rules that do not fit the
//! generic model (`xor r, r`, `xchg`, `push`/`pop`, and the branch family).

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, Mnemonic, OpAccess,
    OpKind,
};

use std::ops::Range;

use crate::addrs::VirtAddr;
use crate::host::GuestMemory;
use crate::operand::{MemRef, Operand};
use crate::regs::{canon, MachineContext, REG_PC, REG_STACK};
use crate::shadow::ShadowState;
use crate::trace::TraceRing;

/// Maximum length of an x86-64 instruction
const MAX_INSN_LEN: usize = 15;

/// Returns `true` if the access reads its operand
const fn reads(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Returns `true` if the access writes its operand
const fn writes(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Collect the source and destination operands of `instr`, including the
/// implicit ones (stack slots of `push`/`call`, the stack pointer itself).
///
/// The program counter never appears in the result; branch instructions get
/// their own rules and PC-relative reads are constants by the time the
/// decoder reports them.
pub(crate) fn survey(
    factory: &mut InstructionInfoFactory,
    instr: &Instruction,
) -> (Vec<Operand>, Vec<Operand>) {
    let info = factory.info(instr);

    let mut sources = Vec::new();
    let mut dests = Vec::new();

    for used in info.used_registers() {
        if canon(used.register()) == REG_PC {
            continue;
        }

        let op = Operand::Reg(used.register());
        if reads(used.access()) {
            sources.push(op);
        }
        if writes(used.access()) {
            dests.push(op);
        }
    }

    for used in info.used_memory() {
        let op = Operand::Mem(MemRef::from_used_memory(used));
        if reads(used.access()) {
            sources.push(op);
        }
        if writes(used.access()) {
            dests.push(op);
        }
    }

    (sources, dests)
}

/// Decode the instruction at `pc`, reading its bytes from guest memory
pub(crate) fn decode_at(memory: &dyn GuestMemory, pc: VirtAddr) -> Option<Instruction> {
    let mut bytes = [0u8; MAX_INSN_LEN];
    memory.read(pc, &mut bytes).ok()?;

    let mut decoder = Decoder::with_ip(64, &bytes, pc.0, DecoderOptions::NONE);
    let instr = decoder.decode();

    (!instr.is_invalid()).then_some(instr)
}

/// Shadow state, trace rings, and the propagation rules that drive them
///
/// One engine exists per process, owned by the run coordinator behind its
/// instrumentation lock; every guest thread's callbacks are serialized
/// through it.
pub struct TaintEngine {
    /// Tainted registers and memory bytes
    pub(crate) shadow: ShadowState,

    /// Last module-local program counters executed
    pub(crate) last_insns: TraceRing,

    /// Last resolved call targets from module-local call sites
    pub(crate) last_calls: TraceRing,

    /// Address range of the instrumented primary module
    module: Range<u64>,

    /// Reused operand surveying allocation
    factory: InstructionInfoFactory,
}

impl Default for TaintEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaintEngine {
    /// Create an engine with empty shadow state and no module range
    #[must_use]
    pub fn new() -> Self {
        Self {
            shadow: ShadowState::new(),
            last_insns: TraceRing::new(),
            last_calls: TraceRing::new(),
            module: 0..0,
            factory: InstructionInfoFactory::new(),
        }
    }

    /// Set the `[start, end)` range of the instrumented primary module.
    /// Only program counters inside this range are admitted to the trace
    /// rings.
    pub fn set_module(&mut self, module: Range<u64>) {
        self.module = module;
    }

    /// The tainted register/memory sets
    #[must_use]
    pub fn shadow(&self) -> &ShadowState {
        &self.shadow
    }

    /// Propagate taint for the instruction about to execute at `pc`
    ///
    /// `ctx` is the machine context of the executing guest thread captured
    /// before the instruction runs; `memory` provides the instruction bytes
    /// and is also consulted for effective address resolution of the
    /// operands.
    pub fn propagate(&mut self, pc: VirtAddr, ctx: &MachineContext, memory: &dyn GuestMemory) {
        if self.module.contains(&pc.0) {
            self.last_insns.push(pc.0);
        }

        // The generic rule can only untaint destinations when nothing is
        // tainted, which is a no-op
        if self.shadow.is_empty() {
            return;
        }

        let Some(instr) = decode_at(memory, pc) else {
            return;
        };

        // Record resolved targets of module-local memory-indirect calls
        if matches!(
            instr.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        ) && instr.op0_kind() == OpKind::Memory
            && self.module.contains(&pc.0)
        {
            let target = MemRef::from_instruction(&instr).effective_address(ctx);
            self.last_calls.push(target.0);
        }

        if self.handle_specific(&instr, ctx) {
            return;
        }

        self.propagate_generic(&instr, ctx, false);
    }

    /// Dispatch to instruction-specific handling for things that don't fit
    /// the general model of tainted operand -> tainted result. Returns
    /// `true` if the instruction was fully handled.
    fn handle_specific(&mut self, instr: &Instruction, ctx: &MachineContext) -> bool {
        if self.handle_branches(instr, ctx) {
            return true;
        }

        match instr.mnemonic() {
            Mnemonic::Push | Mnemonic::Pop => {
                self.propagate_generic(instr, ctx, true);
                true
            }
            Mnemonic::Xor => self.handle_xor(instr),
            Mnemonic::Xchg => self.handle_xchg(instr),
            _ => false,
        }
    }

    /// `xor r, r` of the same canonical register always produces zero, so
    /// the destination is clean regardless of its previous state
    fn handle_xor(&mut self, instr: &Instruction) -> bool {
        if instr.op_count() == 2
            && instr.op0_kind() == OpKind::Register
            && instr.op1_kind() == OpKind::Register
        {
            let reg0 = canon(instr.op0_register());
            let reg1 = canon(instr.op1_register());

            if reg0 == reg1 {
                self.shadow.tr_remove(reg0);
                return true;
            }
        }

        false
    }

    /// `xchg` between a tainted and an untainted register swaps the taint
    fn handle_xchg(&mut self, instr: &Instruction) -> bool {
        if instr.op_count() == 2
            && instr.op0_kind() == OpKind::Register
            && instr.op1_kind() == OpKind::Register
        {
            let reg0 = canon(instr.op0_register());
            let reg1 = canon(instr.op1_register());

            let tainted0 = self.shadow.tr_has(reg0);
            let tainted1 = self.shadow.tr_has(reg1);

            if tainted0 && !tainted1 {
                self.shadow.tr_remove(reg0);
                self.shadow.tr_add(reg1);
                return true;
            } else if tainted1 && !tainted0 {
                self.shadow.tr_remove(reg1);
                self.shadow.tr_add(reg0);
                return true;
            }
        }

        false
    }

    /// Special cases for tainting / untainting the program counter across
    /// the branch family. Returns `true` for any branch-family instruction.
    fn handle_branches(&mut self, instr: &Instruction, ctx: &MachineContext) -> bool {
        let flow = instr.flow_control();

        let is_ret = flow == FlowControl::Return;
        let is_direct = matches!(
            flow,
            FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call
        );
        let is_indirect = matches!(flow, FlowControl::IndirectBranch | FlowControl::IndirectCall);
        let is_call = matches!(flow, FlowControl::Call | FlowControl::IndirectCall);

        if !is_ret && !is_direct && !is_indirect {
            return false;
        }

        let pc_tainted = self.shadow.tr_has(REG_PC);

        // A call with a tainted program counter saves a tainted return
        // address; mark the pushed slot so a later ret restores the taint
        if is_call && pc_tainted {
            let info = self.factory.info(instr);
            if let Some(slot) = info.used_memory().iter().find(|m| writes(m.access())) {
                let slot = Operand::Mem(MemRef::from_used_memory(slot));
                slot.taint(ctx, &mut self.shadow);
            }
        }

        // Control transfers to a statically known target
        if is_direct && pc_tainted {
            self.shadow.tr_remove(REG_PC);
        }

        // A branch through a tainted register hands control to the attacker
        if is_indirect {
            for i in 0..instr.op_count() {
                if instr.op_kind(i) != OpKind::Register {
                    continue;
                }

                let reg = canon(instr.op_register(i));
                if reg != REG_STACK && self.shadow.tr_has(reg) {
                    self.shadow.tr_add(REG_PC);
                }
            }
        }

        // A return derives the next program counter from its sources,
        // including the restored return slot
        if is_ret {
            let (sources, _dests) = survey(&mut self.factory, instr);
            let tainted = sources.iter().any(|op| op.is_tainted(ctx, &self.shadow));

            if tainted {
                self.shadow.tr_add(REG_PC);
            } else {
                self.shadow.tr_remove(REG_PC);
            }
        }

        true
    }

    /// The generic rule: any tainted source taints every destination, no
    /// tainted source wipes every destination. `skip_stack` keeps the stack
    /// pointer out of the destination set for `push`/`pop`.
    fn propagate_generic(&mut self, instr: &Instruction, ctx: &MachineContext, skip_stack: bool) {
        let (sources, dests) = survey(&mut self.factory, instr);

        let tainted = sources.iter().any(|op| op.is_tainted(ctx, &self.shadow));

        for op in dests {
            if skip_stack {
                if let Operand::Reg(reg) = op {
                    if canon(reg) == REG_STACK {
                        continue;
                    }
                }
            }

            if tainted {
                op.taint(ctx, &mut self.shadow);
            } else {
                op.untaint(ctx, &mut self.shadow);
            }
        }
    }
}
