//! Run coordinator: bring-up, the callback surface the DBI glue drives, and
//! orderly teardown
//!
//! The glue owns the instrumentation framework; the coordinator owns
//! everything else. Bring-up order: parse options, load the target
//! configuration, open the server connection, assign the run id, register
//! the process, then hand the [`Tracer`] to the glue so it can register the
//! basic-block, module-load, thread, exception, and exit events against it.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use uuid::Uuid;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::addrs::VirtAddr;
use crate::cmdline::CommandLineArgs;
use crate::config::TargetConfig;
use crate::host::{GuestMemory, Platform};
use crate::intercept::{CallCounters, HookSpec};
use crate::propagate::TaintEngine;
use crate::regs::{MachineContext, REG_PC, REG_STACK};
use crate::server::Server;
use crate::shims::{shims_for_module, ShimSpec};
use crate::triage::{self, CrashReport, ExceptionSnapshot};

/// A module the DBI host observed loading into the target process
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Preferred module name, e.g. `target.exe` or `KERNELBASE.DLL`
    pub name: String,

    /// Base address the module is loaded at
    pub base: VirtAddr,

    /// Size of the loaded image
    pub size: usize,
}

/// Instrumentation the glue should install for a freshly loaded module
#[derive(Debug)]
pub struct ModuleHooks {
    /// Input interception hook pairs to wrap
    pub hooks: Vec<&'static HookSpec>,

    /// Suicide-path shims to wrap
    pub shims: &'static [ShimSpec],
}

/// End-of-run record emitted as one JSONL line
#[derive(Serialize)]
struct RunRecord<'a> {
    success: bool,
    run_id: String,
    message: &'a str,
}

/// The tracer client state shared by every instrumentation callback
///
/// Callbacks arrive on arbitrary guest threads; all shadow-state access is
/// serialized through the engine lock, and the replay stream through its
/// own mutex.
pub struct Tracer {
    /// Parsed command line options
    pub(crate) options: CommandLineArgs,

    /// Parsed target configuration
    pub(crate) config: TargetConfig,

    /// Shadow state, trace rings, and propagation rules
    pub(crate) engine: Mutex<TaintEngine>,

    /// Connection to the fuzzing server, present until the exit callback
    /// closes it
    pub(crate) server: Mutex<Option<Box<dyn Server>>>,

    /// Host platform services
    pub(crate) platform: Box<dyn Platform + Send + Sync>,

    /// Target process address space
    pub(crate) memory: Box<dyn GuestMemory + Send + Sync>,

    /// Per-entry-point call counters
    pub(crate) counters: Mutex<CallCounters>,

    /// Index of the next replay byte stream to request. Held across the
    /// server RPC so replay bytes are delivered in request order.
    pub(crate) mutate_count: Mutex<u32>,

    /// Whether exception triage has run
    pub(crate) crashed: AtomicBool,
}

impl Tracer {
    /// Bring up the tracer: load the target configuration and register the
    /// run with the server
    ///
    /// # Errors
    ///
    /// * The target configuration cannot be loaded
    /// * The server rejects the run id or pid registration
    pub fn init(
        args: CommandLineArgs,
        mut server: Box<dyn Server>,
        platform: Box<dyn Platform + Send + Sync>,
        memory: Box<dyn GuestMemory + Send + Sync>,
    ) -> Result<Self> {
        // At minimum info level so the end-of-run record has company
        let _ = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .try_init();

        let config = TargetConfig::load(&args.target)
            .with_context(|| format!("Failed to load targets from {}", args.target.display()))?;

        let run_id = args.replay.unwrap_or_else(Uuid::nil);
        server.assign_run_id(run_id).context("Failed to assign run id")?;

        server
            .register_pid(platform.process_id(), true)
            .context("Failed to register pid with the server")?;

        log::info!(
            "tracer initializing: replay={} no_mutate={} no_taint={}",
            args.replay.is_some(),
            args.no_mutate,
            args.no_taint
        );

        Ok(Self::from_parts(args, config, server, platform, memory))
    }

    /// Assemble a tracer from already-initialized collaborators
    pub(crate) fn from_parts(
        options: CommandLineArgs,
        config: TargetConfig,
        server: Box<dyn Server>,
        platform: Box<dyn Platform + Send + Sync>,
        memory: Box<dyn GuestMemory + Send + Sync>,
    ) -> Self {
        Self {
            options,
            config,
            engine: Mutex::new(TaintEngine::new()),
            server: Mutex::new(Some(server)),
            platform,
            memory,
            counters: Mutex::new(CallCounters::default()),
            mutate_count: Mutex::new(0),
            crashed: AtomicBool::new(false),
        }
    }

    /// Whether this run is replaying a recorded mutation
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.options.replay.is_some()
    }

    /// Whether exception triage has run
    #[must_use]
    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// The run id as stored by the orchestrator, empty outside replay mode
    fn run_id_string(&self) -> String {
        self.options
            .replay
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    /// Basic-block insertion callback: propagate taint for the instruction
    /// about to execute at `pc` on the calling guest thread
    pub fn propagate(&self, pc: VirtAddr, ctx: &MachineContext) {
        if self.options.no_taint {
            return;
        }

        let mut engine = self.engine.lock().unwrap();
        engine.propagate(pc, ctx, &*self.memory);
    }

    /// Module-load callback: latch the primary module range and report
    /// which hooks and shims the glue should install
    pub fn on_module_load(&self, module: &ModuleInfo) -> ModuleHooks {
        // Assume the target executable is the one .exe in the process
        if module.name.to_ascii_lowercase().ends_with(".exe") {
            let start = module.base.0;
            let end = start + module.size as u64;

            log::info!("primary module {} at {start:#x}..{end:#x}", module.name);
            self.engine.lock().unwrap().set_module(start..end);
        }

        let shims = shims_for_module(&module.name);
        if !shims.is_empty() {
            log::info!("loading suicide-path mitigations for {}", module.name);
        }

        ModuleHooks {
            hooks: self.hooks_for_module(&module.name),
            shims,
        }
    }

    /// Thread creation callback
    pub fn on_thread_init(&self, thread_id: u32) {
        log::debug!("tracer#on_thread_init: {thread_id}");
    }

    /// Thread teardown callback
    pub fn on_thread_exit(&self, thread_id: u32) {
        log::debug!("tracer#on_thread_exit: {thread_id}");
    }

    /// Exception callback. Classifies and scores the fault, writes the
    /// crash artifacts, and terminates the process. Never returns control
    /// to the guest: exit code 1 after a successful dump, abort on any
    /// triage I/O failure.
    pub fn on_exception(&self, snapshot: &ExceptionSnapshot) -> ! {
        match self.run_triage(snapshot) {
            Ok(report) => {
                log::info!(
                    "tracer#on_exception: {} (score {})",
                    report.reason,
                    report.score
                );
                std::process::exit(1);
            }
            Err(err) => {
                log::error!("tracer#on_exception: {err:#}");
                std::process::abort();
            }
        }
    }

    /// Run exception triage and write the crash artifacts
    pub(crate) fn run_triage(&self, snapshot: &ExceptionSnapshot) -> Result<CrashReport> {
        self.crashed.store(true, Ordering::SeqCst);

        let engine = self.engine.lock().unwrap();

        let pc_tainted = engine.shadow().tr_has(REG_PC);
        let stack_tainted = engine.shadow().tr_has(REG_STACK);

        let cls = triage::classify(&*self.memory, snapshot, engine.shadow());
        let verdict = triage::score(snapshot.record.code, &cls, pc_tainted, stack_tainted);
        let report = triage::build_report(&engine, snapshot, &cls, verdict);

        let paths = {
            let mut server = self.server.lock().unwrap();
            let server = server
                .as_mut()
                .ok_or_else(|| anyhow!("Server connection already closed"))?;

            server.request_crash_paths(self.platform.process_id())?
        };

        triage::write_artifacts(&report, snapshot, &paths, &*self.platform)?;

        Ok(report)
    }

    /// Exit callback: emit the end-of-run record and close the server
    /// connection. The connection is closed exactly once even if the glue
    /// delivers the event twice.
    pub fn on_exit(&self) {
        let crashed = self.crashed();

        if !crashed {
            log::info!("tracer#on_exit: target did NOT crash on replay");
        }

        let record = RunRecord {
            success: crashed,
            run_id: self.run_id_string(),
            message: if crashed {
                "replay caused a crash"
            } else {
                "replay did not cause a crash"
            },
        };

        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(err) => log::error!("tracer#on_exit: failed to encode run record: {err}"),
        }

        if let Some(mut server) = self.server.lock().unwrap().take() {
            if let Err(err) = server.close() {
                log::warn!("tracer#on_exit: failed to close server connection: {err:#}");
            }
        }
    }
}
