//! # Taintrace
//!
//! Instruction-level taint tracking and crash triage for fuzzing replay
//!
//! Taintrace is the core of a DBI client that replays a recorded input
//! mutation against a native target, follows the delivered bytes through
//! registers and memory at instruction granularity, and scores any
//! resulting hardware exception by severity.
//!
//! The instrumentation framework, the fuzzing server's wire protocol, and
//! the platform dump facility are collaborators behind traits; the glue
//! that owns them drives a [`Tracer`] through its callback surface:
//!
//! * [`Tracer::init`] - bring-up: load the target configuration, register
//!   the run and pid with the server
//! * [`Tracer::propagate`] - basic-block insertion event, once per
//!   application instruction
//! * [`Tracer::on_module_load`] - reports which input hooks and
//!   suicide-path shims to install for a loaded module
//! * [`Tracer::on_read_pre`] / [`Tracer::on_read_post`] /
//!   [`Tracer::on_map_view_post`] - the interception hook pairs
//! * [`Tracer::on_exception`] - classify, score, dump, terminate
//! * [`Tracer::on_exit`] - end-of-run record and server teardown
//!
//! # Example
//!
//! ```rust,ignore
//! let args = CommandLineArgs::parse_from(client_args);
//! let tracer = Tracer::init(args, server, platform, memory)?;
//!
//! // Registered as the basic-block insertion event by the glue:
//! tracer.propagate(VirtAddr(pc), &ctx);
//!
//! // Registered as the exception event:
//! tracer.on_exception(&snapshot);
//! ```
//!
//! ## Roadmap of the repo:
//!
//! * [`regs`] - register canonicalization and the captured machine context
//! * [`shadow`] - tainted register set and tainted byte set
//! * [`operand`] - operand-level taint queries against a machine context
//! * [`propagate`] - the per-instruction propagation rules
//! * [`trace`] - rings of recent module-local program counters
//! * [`intercept`] - the input primitive hook catalog and replay
//! * [`triage`] - exception scoring matrix and crash report
//! * [`shims`] - fastfail / verifier suicide-path redirection
//! * [`tracer`] - the run coordinator tying it all together

#![deny(missing_docs)]

pub mod addrs;
pub use addrs::VirtAddr;

pub mod cmdline;
pub use cmdline::CommandLineArgs;

pub mod config;
pub use config::TargetConfig;

pub mod host;
pub use host::{GuestMemory, Platform};

pub mod intercept;
pub use intercept::{ClientRead, HookKind, HookSpec, HookedEntry};

pub mod operand;

pub mod propagate;
pub use propagate::TaintEngine;

pub mod regs;
pub use regs::MachineContext;

pub mod server;
pub use server::{CrashPaths, Server};

pub mod shadow;
pub use shadow::{ShadowState, TaintedExtent};

pub mod shims;

pub mod trace;

pub mod tracer;
pub use tracer::{ModuleHooks, ModuleInfo, Tracer};

pub mod triage;
pub use triage::{CrashReport, ExceptionCode, ExceptionRecord, ExceptionSnapshot};

pub mod utils;

/// Import the most important types in one go.
/// ```
/// use taintrace::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        CommandLineArgs, ExceptionCode, ExceptionRecord, ExceptionSnapshot, GuestMemory,
        MachineContext, Platform, Server, Tracer, VirtAddr,
    };
}
