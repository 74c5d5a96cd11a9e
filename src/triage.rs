//! Exception triage: classify the crashing instruction, correlate it with
//! taint state, and produce the crash artifacts
//!
//! Triage runs once per process, on the faulting guest thread. It is
//! strictly read-only with respect to shadow state: the report reflects the
//! taint reachable on that thread at fault time. Scoring is an ordered
//! first-match table; earlier rows have priority.

use iced_x86::InstructionInfoFactory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::addrs::VirtAddr;
use crate::host::{GuestMemory, Platform};
use crate::propagate::{decode_at, survey, TaintEngine};
use crate::regs::{MachineContext, GPRS, REG_PC, REG_STACK};
use crate::server::CrashPaths;
use crate::shadow::{ShadowState, TaintedExtent};
use crate::trace::TRACE_LEN;

/// Errors while writing crash artifacts. Any of these aborts the tracer;
/// a partial report is worse than no report.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not open the crash report file
    #[error("Could not open the crash file {path}")]
    CrashFileOpen {
        /// Path the server assigned for the report
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// Could not write the crash report file
    #[error("Could not write to the crash file {path}")]
    CrashFileWrite {
        /// Path the server assigned for the report
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// Could not encode the crash report as JSON
    #[error("Could not encode the crash report")]
    ReportEncode(#[from] serde_json::Error),

    /// Could not open the memory dump file
    #[error("Could not open the dump file {path}")]
    MinidumpOpen {
        /// Path the server assigned for the dump
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// The platform dump facility failed
    #[error("Could not write the dump file {path}")]
    MinidumpWrite {
        /// Path the server assigned for the dump
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },
}

/// Hardware exception kinds the triage engine distinguishes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionCode {
    /// Read or write of an inaccessible address
    AccessViolation,

    /// Execution of an undefined or privileged opcode
    IllegalInstruction,

    /// Integer division by zero
    IntegerDivideByZero,

    /// Breakpoint instruction. Could indicate execution of non-instructions,
    /// but usually just indicates a debugger.
    Breakpoint,

    /// Synthesized for redirected fast-fail paths
    FastFail,

    /// Synthesized for heap-verifier stop messages
    HeapCorruption,

    /// Any other exception, carrying the raw OS code
    Other(u32),
}

impl ExceptionCode {
    /// Map a raw OS exception code onto a known kind
    #[must_use]
    pub fn from_raw(code: u32) -> Self {
        match code {
            0xc000_0005 => ExceptionCode::AccessViolation,
            0xc000_001d => ExceptionCode::IllegalInstruction,
            0xc000_0094 => ExceptionCode::IntegerDivideByZero,
            0x8000_0003 => ExceptionCode::Breakpoint,
            0xc000_0409 => ExceptionCode::FastFail,
            0xc000_0374 => ExceptionCode::HeapCorruption,
            other => ExceptionCode::Other(other),
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionCode::AccessViolation => write!(f, "EXCEPTION_ACCESS_VIOLATION"),
            ExceptionCode::IllegalInstruction => write!(f, "EXCEPTION_ILLEGAL_INSTRUCTION"),
            ExceptionCode::IntegerDivideByZero => write!(f, "EXCEPTION_INT_DIVIDE_BY_ZERO"),
            ExceptionCode::Breakpoint => write!(f, "EXCEPTION_BREAKPOINT"),
            ExceptionCode::FastFail => write!(f, "EXCEPTION_FAIL_FAST"),
            ExceptionCode::HeapCorruption => write!(f, "EXCEPTION_HEAP_CORRUPTION"),
            ExceptionCode::Other(code) => write!(f, "EXCEPTION_{code:#010x}"),
        }
    }
}

/// The exception record copied verbatim at fault entry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Exception kind
    pub code: ExceptionCode,

    /// Faulting address
    pub address: VirtAddr,
}

/// Application state captured atomically when the fault is delivered
///
/// The context must reflect the application's view of the thread, not the
/// instrumentation's; the glue switches state before filling it in. Owned
/// by triage for the remainder of the process lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionSnapshot {
    /// OS thread id of the faulting thread
    pub thread_id: u32,

    /// Full machine context at the fault
    pub context: MachineContext,

    /// The exception record
    pub record: ExceptionRecord,
}

/// Classification of the crashing instruction
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Classification {
    /// Whether the faulting address is a readable code address
    pub code_readable: bool,

    /// Disassembly of the faulting instruction, empty when undecodable
    pub disassembly: String,

    /// The instruction is a return
    pub is_ret: bool,

    /// Unconditional or conditional direct branch, or direct call
    pub is_direct: bool,

    /// Branch through a register or memory operand
    pub is_indirect: bool,

    /// Call of any form
    pub is_call: bool,

    /// The instruction writes memory
    pub mem_write: bool,

    /// The instruction reads memory
    pub mem_read: bool,

    /// Some source operand is tainted
    pub tainted_src: bool,

    /// Some destination operand is tainted
    pub tainted_dst: bool,
}

/// One row of the scoring matrix
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Verdict {
    /// Reason string stored in the report
    pub reason: &'static str,

    /// Severity in `[0, 100]`, higher is more actionable
    pub score: u8,
}

/// Inspect the faulting instruction and the taint state around it
pub(crate) fn classify(
    memory: &dyn GuestMemory,
    snapshot: &ExceptionSnapshot,
    shadow: &ShadowState,
) -> Classification {
    let mut cls = Classification::default();

    let location = snapshot.record.address;
    cls.code_readable = memory.is_readable(location);
    if !cls.code_readable {
        return cls;
    }

    let Some(instr) = decode_at(memory, location) else {
        return cls;
    };

    cls.disassembly = instr.to_string();

    use iced_x86::FlowControl;
    let flow = instr.flow_control();
    cls.is_ret = flow == FlowControl::Return;
    cls.is_direct = matches!(
        flow,
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call
    );
    cls.is_indirect = matches!(flow, FlowControl::IndirectBranch | FlowControl::IndirectCall);
    cls.is_call = matches!(flow, FlowControl::Call | FlowControl::IndirectCall);

    let mut factory = InstructionInfoFactory::new();
    let (sources, dests) = survey(&mut factory, &instr);

    cls.mem_read = sources.iter().any(|op| matches!(op, crate::operand::Operand::Mem(_)));
    cls.mem_write = dests.iter().any(|op| matches!(op, crate::operand::Operand::Mem(_)));

    let ctx = &snapshot.context;
    cls.tainted_src = sources.iter().any(|op| op.is_tainted(ctx, shadow));
    cls.tainted_dst = dests.iter().any(|op| op.is_tainted(ctx, shadow));

    cls
}

/// Apply the scoring matrix. First matching row wins; the matrix is a
/// function of its inputs.
pub(crate) fn score(
    code: ExceptionCode,
    cls: &Classification,
    pc_tainted: bool,
    stack_tainted: bool,
) -> Verdict {
    // Executing unmapped memory is the strongest signal there is when the
    // program counter came from input bytes
    if !cls.code_readable {
        return if pc_tainted {
            Verdict {
                reason: "oob execution tainted pc",
                score: 100,
            }
        } else {
            Verdict {
                reason: "oob execution",
                score: 50,
            }
        };
    }

    if code == ExceptionCode::IllegalInstruction {
        return if pc_tainted {
            Verdict {
                reason: "illegal instruction tainted pc",
                score: 100,
            }
        } else {
            Verdict {
                reason: "illegal instruction",
                score: 50,
            }
        };
    }

    if code == ExceptionCode::IntegerDivideByZero {
        return Verdict {
            reason: "divide by zero",
            score: 50,
        };
    }

    if code == ExceptionCode::Breakpoint {
        return Verdict {
            reason: "breakpoint",
            score: 25,
        };
    }

    if cls.is_direct || cls.is_indirect || cls.is_call {
        return if pc_tainted {
            Verdict {
                reason: "branching tainted pc",
                score: 75,
            }
        } else {
            Verdict {
                reason: "branching",
                score: 25,
            }
        };
    }

    if cls.is_ret {
        return if pc_tainted || stack_tainted {
            Verdict {
                reason: "return with taint",
                score: 100,
            }
        } else {
            Verdict {
                reason: "return",
                score: 75,
            }
        };
    }

    if cls.mem_write {
        // If what we're writing or where we're writing it to are
        // potentially attacker controlled, that's worse than a plain
        // invalid write
        return if cls.tainted_src || cls.tainted_dst {
            Verdict {
                reason: "tainted write",
                score: 75,
            }
        } else {
            Verdict {
                reason: "write",
                score: 50,
            }
        };
    }

    if cls.mem_read {
        return if cls.tainted_src {
            Verdict {
                reason: "tainted read",
                score: 75,
            }
        } else {
            Verdict {
                reason: "read",
                score: 25,
            }
        };
    }

    Verdict {
        reason: "unknown",
        score: 50,
    }
}

/// One register entry of the crash report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegReport {
    /// Register name
    pub reg: String,

    /// Register value at fault time
    pub value: u64,

    /// Whether the register family was tainted
    pub tainted: bool,
}

/// The crash report written to the server-assigned crash path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Severity in `[0, 100]`
    pub score: u8,

    /// Matched scoring matrix row
    pub reason: String,

    /// Exception name
    pub exception: String,

    /// Faulting address
    pub location: u64,

    /// Disassembly of the faulting instruction
    pub instruction: String,

    /// Program counter taint at fault time
    pub pc_tainted: bool,

    /// Stack pointer taint at fault time
    pub stack_tainted: bool,

    /// The faulting instruction is a return
    pub is_ret: bool,

    /// The faulting instruction is an indirect branch or call
    pub is_indirect: bool,

    /// The faulting instruction is a direct branch or call
    pub is_direct: bool,

    /// The faulting instruction is a call of any form
    pub is_call: bool,

    /// The faulting instruction writes memory
    pub mem_write: bool,

    /// The faulting instruction reads memory
    pub mem_read: bool,

    /// Some source operand was tainted
    pub tainted_src: bool,

    /// Some destination operand was tainted
    pub tainted_dst: bool,

    /// The 16 general purpose registers followed by `rip`
    pub regs: Vec<RegReport>,

    /// Last resolved module-local call targets, oldest first
    pub last_calls: [u64; TRACE_LEN],

    /// Last module-local program counters, oldest first
    pub last_insns: [u64; TRACE_LEN],

    /// Coalesced tainted memory extents in ascending address order
    pub tainted_addrs: Vec<TaintedExtent>,
}

/// Assemble the crash report from the engine state and the fault snapshot
pub(crate) fn build_report(
    engine: &TaintEngine,
    snapshot: &ExceptionSnapshot,
    cls: &Classification,
    verdict: Verdict,
) -> CrashReport {
    let shadow = engine.shadow();
    let pc_tainted = shadow.tr_has(REG_PC);
    let stack_tainted = shadow.tr_has(REG_STACK);

    let mut regs: Vec<RegReport> = GPRS
        .iter()
        .map(|(reg, name)| RegReport {
            reg: (*name).to_string(),
            value: snapshot.context.get(*reg),
            tainted: shadow.tr_has(*reg),
        })
        .collect();

    regs.push(RegReport {
        reg: "rip".to_string(),
        value: snapshot.record.address.0,
        tainted: pc_tainted,
    });

    CrashReport {
        score: verdict.score,
        reason: verdict.reason.to_string(),
        exception: snapshot.record.code.to_string(),
        location: snapshot.record.address.0,
        instruction: cls.disassembly.clone(),
        pc_tainted,
        stack_tainted,
        is_ret: cls.is_ret,
        is_indirect: cls.is_indirect,
        is_direct: cls.is_direct,
        is_call: cls.is_call,
        mem_write: cls.mem_write,
        mem_read: cls.mem_read,
        tainted_src: cls.tainted_src,
        tainted_dst: cls.tainted_dst,
        regs,
        last_calls: engine.last_calls.snapshot(),
        last_insns: engine.last_insns.snapshot(),
        tainted_addrs: shadow.tainted_extents(),
    }
}

/// Write the JSON report and the full-memory dump to the server-assigned
/// paths. Both writes are best-effort but fatal on failure.
pub(crate) fn write_artifacts(
    report: &CrashReport,
    snapshot: &ExceptionSnapshot,
    paths: &CrashPaths,
    platform: &dyn Platform,
) -> Result<(), Error> {
    let json = serde_json::to_string(report)?;

    let mut crash_file = File::create(&paths.crash_path).map_err(|source| Error::CrashFileOpen {
        path: paths.crash_path.clone(),
        source,
    })?;

    crash_file
        .write_all(json.as_bytes())
        .map_err(|source| Error::CrashFileWrite {
            path: paths.crash_path.clone(),
            source,
        })?;

    let mut dump_file =
        File::create(&paths.mem_dump_path).map_err(|source| Error::MinidumpOpen {
            path: paths.mem_dump_path.clone(),
            source,
        })?;

    platform
        .write_minidump(&mut dump_file, snapshot)
        .map_err(|source| Error::MinidumpWrite {
            path: paths.mem_dump_path.clone(),
            source,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagate::tests::TestMemory;
    use iced_x86::Register;

    fn snapshot_at(code: ExceptionCode, address: u64) -> ExceptionSnapshot {
        ExceptionSnapshot {
            thread_id: 0x1234,
            context: MachineContext {
                rip: address,
                ..MachineContext::default()
            },
            record: ExceptionRecord {
                code,
                address: VirtAddr(address),
            },
        }
    }

    #[test]
    fn matrix_rows_are_ordered_first_match_wins() {
        let clean = Classification {
            code_readable: true,
            ..Classification::default()
        };

        // Unreadable code address dominates everything else
        let oob = Classification::default();
        assert_eq!(
            score(ExceptionCode::Breakpoint, &oob, true, true),
            Verdict {
                reason: "oob execution tainted pc",
                score: 100
            }
        );
        assert_eq!(
            score(ExceptionCode::AccessViolation, &oob, false, false).reason,
            "oob execution"
        );

        // Exception code rows precede instruction classification rows
        let ret = Classification {
            code_readable: true,
            is_ret: true,
            mem_read: true,
            ..Classification::default()
        };
        assert_eq!(
            score(ExceptionCode::IllegalInstruction, &ret, true, false),
            Verdict {
                reason: "illegal instruction tainted pc",
                score: 100
            }
        );
        assert_eq!(
            score(ExceptionCode::IntegerDivideByZero, &ret, false, false).reason,
            "divide by zero"
        );
        assert_eq!(
            score(ExceptionCode::Breakpoint, &clean, false, false),
            Verdict {
                reason: "breakpoint",
                score: 25
            }
        );

        // Return rows outrank the memory rows the ret also matches
        assert_eq!(
            score(ExceptionCode::AccessViolation, &ret, false, true),
            Verdict {
                reason: "return with taint",
                score: 100
            }
        );
        assert_eq!(
            score(ExceptionCode::AccessViolation, &ret, false, false),
            Verdict {
                reason: "return",
                score: 75
            }
        );

        // Branch rows
        let branch = Classification {
            code_readable: true,
            is_indirect: true,
            mem_read: true,
            ..Classification::default()
        };
        assert_eq!(
            score(ExceptionCode::AccessViolation, &branch, true, false),
            Verdict {
                reason: "branching tainted pc",
                score: 75
            }
        );
        assert_eq!(
            score(ExceptionCode::AccessViolation, &branch, false, false).score,
            25
        );

        // Write rows precede read rows
        let write = Classification {
            code_readable: true,
            mem_write: true,
            mem_read: true,
            tainted_dst: true,
            ..Classification::default()
        };
        assert_eq!(
            score(ExceptionCode::AccessViolation, &write, false, false),
            Verdict {
                reason: "tainted write",
                score: 75
            }
        );

        let read = Classification {
            code_readable: true,
            mem_read: true,
            tainted_src: true,
            ..Classification::default()
        };
        assert_eq!(
            score(ExceptionCode::AccessViolation, &read, false, false),
            Verdict {
                reason: "tainted read",
                score: 75
            }
        );
        assert_eq!(
            score(ExceptionCode::AccessViolation, &clean, false, false).reason,
            "unknown"
        );
    }

    #[test]
    fn classify_flags_a_tainted_read() {
        // mov rax, [rbx] faulting with rbx pointing at unmapped memory
        let memory = TestMemory::with_code(0x1000, &[0x48, 0x8b, 0x03]);

        let mut snapshot = snapshot_at(ExceptionCode::AccessViolation, 0x1000);
        snapshot.context.rbx = 0xdead_0000;

        let mut shadow = ShadowState::new();
        shadow.tr_add(Register::RBX);

        let cls = classify(&memory, &snapshot, &shadow);
        assert!(cls.code_readable);
        assert!(cls.mem_read);
        assert!(!cls.mem_write);
        assert!(cls.tainted_src);
        assert!(!cls.is_ret);

        let verdict = score(ExceptionCode::AccessViolation, &cls, false, false);
        assert_eq!(verdict.reason, "tainted read");
        assert_eq!(verdict.score, 75);
    }

    #[test]
    fn classify_does_not_decode_unreadable_locations() {
        let memory = TestMemory::with_code(0x1000, &[0x90]);
        let snapshot = snapshot_at(ExceptionCode::AccessViolation, 0xbad0_0000);

        let cls = classify(&memory, &snapshot, &ShadowState::new());
        assert!(!cls.code_readable);
        assert!(cls.disassembly.is_empty());
    }

    #[test]
    fn report_lists_all_gprs_then_rip() {
        let mut engine = TaintEngine::new();
        engine.shadow.tr_add(Register::RCX);
        engine.shadow.tr_add(REG_PC);
        engine.shadow.tm_add_range(VirtAddr(0x5000), 4);
        engine.last_insns.push(0x1111);

        let snapshot = snapshot_at(ExceptionCode::Breakpoint, 0x4242);
        let cls = Classification {
            code_readable: true,
            disassembly: "int3".to_string(),
            ..Classification::default()
        };
        let verdict = score(snapshot.record.code, &cls, true, false);

        let report = build_report(&engine, &snapshot, &cls, verdict);

        assert_eq!(report.reason, "breakpoint");
        assert_eq!(report.score, 25);
        assert_eq!(report.exception, "EXCEPTION_BREAKPOINT");
        assert_eq!(report.location, 0x4242);
        assert_eq!(report.regs.len(), 17);

        let rip = report.regs.last().unwrap();
        assert_eq!(rip.reg, "rip");
        assert_eq!(rip.value, 0x4242);
        assert!(rip.tainted);

        let rcx = &report.regs[2];
        assert_eq!(rcx.reg, "rcx");
        assert!(rcx.tainted);

        assert_eq!(report.last_insns, [0, 0, 0, 0, 0x1111]);
        assert_eq!(
            report.tainted_addrs,
            vec![TaintedExtent {
                start: 0x5000,
                size: 4
            }]
        );

        // The report round-trips through JSON
        let json = serde_json::to_string(&report).unwrap();
        let parsed: CrashReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn triage_never_mutates_shadow_state() {
        let mut engine = TaintEngine::new();
        engine.shadow.tr_add(Register::RBX);
        engine.shadow.tm_add_range(VirtAddr(0x3000), 16);

        let before = engine.shadow().clone();

        let memory = TestMemory::with_code(0x1000, &[0x48, 0x8b, 0x03]);
        let mut snapshot = snapshot_at(ExceptionCode::AccessViolation, 0x1000);
        snapshot.context.rbx = 0x3000;

        let cls = classify(&memory, &snapshot, engine.shadow());
        let verdict = score(snapshot.record.code, &cls, false, false);
        let _report = build_report(&engine, &snapshot, &cls, verdict);

        assert_eq!(*engine.shadow(), before);
    }
}
