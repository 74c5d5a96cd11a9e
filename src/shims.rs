//! Shims for process-suicide paths that would otherwise bypass exception
//! triage
//!
//! `__fastfail` first probes `IsProcessorFeaturePresent` for fast-fail
//! support and, when it is unavailable, falls back to raising an exception
//! through `UnhandledExceptionFilter`. Forcing the probe to report "not
//! available" keeps the target on the filterable path, and the filter hook
//! then routes the exception into triage instead of letting the process
//! silently terminate. Heap-verifier stop messages get the same treatment.

use crate::regs::MachineContext;
use crate::triage::{ExceptionCode, ExceptionRecord, ExceptionSnapshot};

/// Processor feature index probed by `__fastfail` support checks
pub const PF_FASTFAIL_AVAILABLE: u32 = 23;

/// What a shimmed entry point does when it is hit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShimKind {
    /// Rewrite the result of the processor-feature probe
    FeatureProbe,

    /// Route the filter invocation into exception triage
    ExceptionFilter,

    /// Route a verifier stop message into exception triage
    VerifierStop,
}

/// One shimmed host entry point
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShimSpec {
    /// Exported symbol to wrap
    pub symbol: &'static str,

    /// How the wrapper behaves
    pub kind: ShimKind,
}

/// Shims installed when the base system library loads
pub const FASTFAIL_SHIMS: &[ShimSpec] = &[
    ShimSpec {
        symbol: "IsProcessorFeaturePresent",
        kind: ShimKind::FeatureProbe,
    },
    ShimSpec {
        symbol: "UnhandledExceptionFilter",
        kind: ShimKind::ExceptionFilter,
    },
];

/// Shims installed when the application verifier provider loads
pub const VERIFIER_SHIMS: &[ShimSpec] = &[
    ShimSpec {
        symbol: "VerifierStopMessage",
        kind: ShimKind::VerifierStop,
    },
    ShimSpec {
        symbol: "VerifierStopMessageEx",
        kind: ShimKind::VerifierStop,
    },
];

/// The shims to install for a freshly loaded module, if any
#[must_use]
pub fn shims_for_module(module_name: &str) -> &'static [ShimSpec] {
    if module_name.eq_ignore_ascii_case("KERNELBASE.DLL") {
        FASTFAIL_SHIMS
    } else if module_name.eq_ignore_ascii_case("VERIFIER.DLL") {
        VERIFIER_SHIMS
    } else {
        &[]
    }
}

/// Rewritten result of the processor-feature probe: fast-fail support is
/// always reported absent so the target raises a filterable exception
#[must_use]
pub fn override_feature_probe(feature: u32, real_result: bool) -> bool {
    if feature == PF_FASTFAIL_AVAILABLE {
        false
    } else {
        real_result
    }
}

/// Build an exception snapshot for a redirected suicide path. The faulting
/// address is the program counter of the captured context.
#[must_use]
pub fn synthesize_exception(
    thread_id: u32,
    context: MachineContext,
    code: ExceptionCode,
) -> ExceptionSnapshot {
    ExceptionSnapshot {
        thread_id,
        context,
        record: ExceptionRecord {
            code,
            address: crate::addrs::VirtAddr(context.rip),
        },
    }
}
