//! Interception of the host input primitives: replaying recorded mutations
//! into returned buffers and marking them tainted
//!
//! Each wrapped entry point gets a (pre, post) hook pair. The pre hook
//! captures a [`ClientRead`] record identifying the call; the post hook
//! decides whether the call instance is targeted, marks the returned buffer
//! tainted, and in replay mode overwrites it with the stored mutation. The
//! record is owned by the hook pair and dropped on every exit path.

use anyhow::{anyhow, Result};

use std::collections::HashMap;

use crate::addrs::VirtAddr;
use crate::tracer::Tracer;
use crate::utils::hexdigest;

/// A host entry point the tracer knows how to wrap
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum HookedEntry {
    ReadFile,
    InternetReadFile,
    ReadEventLogA,
    ReadEventLogW,
    WinHttpWebSocketReceive,
    WinHttpReadData,
    Recv,
    FreadS,
    Fread,
    Read,
    MapViewOfFile,
    RegQueryValueExA,
    RegQueryValueExW,
}

impl HookedEntry {
    /// Exported symbol name to wrap
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            HookedEntry::ReadFile => "ReadFile",
            HookedEntry::InternetReadFile => "InternetReadFile",
            HookedEntry::ReadEventLogA => "ReadEventLogA",
            HookedEntry::ReadEventLogW => "ReadEventLogW",
            HookedEntry::WinHttpWebSocketReceive => "WinHttpWebSocketReceive",
            HookedEntry::WinHttpReadData => "WinHttpReadData",
            HookedEntry::Recv => "recv",
            HookedEntry::FreadS => "fread_s",
            HookedEntry::Fread => "fread",
            HookedEntry::Read => "_read",
            HookedEntry::MapViewOfFile => "MapViewOfFile",
            HookedEntry::RegQueryValueExA => "RegQueryValueExA",
            HookedEntry::RegQueryValueExW => "RegQueryValueExW",
        }
    }

    /// Name used for targeting and call counting. The A/W variants of an
    /// entry point count as one.
    #[must_use]
    pub fn target_name(&self) -> &'static str {
        match self {
            HookedEntry::ReadEventLogA | HookedEntry::ReadEventLogW => "ReadEventLog",
            HookedEntry::RegQueryValueExA | HookedEntry::RegQueryValueExW => "RegQueryValueEx",
            other => other.symbol(),
        }
    }

    /// Modules this entry point is expected to be exported from
    #[must_use]
    pub fn expected_modules(&self) -> &'static [&'static str] {
        match self {
            HookedEntry::ReadFile | HookedEntry::MapViewOfFile => {
                &["KERNEL32.DLL", "KERNELBASE.DLL"]
            }
            HookedEntry::InternetReadFile => &["WININET.DLL"],
            HookedEntry::ReadEventLogA | HookedEntry::ReadEventLogW => &["ADVAPI32.DLL"],
            HookedEntry::WinHttpWebSocketReceive | HookedEntry::WinHttpReadData => {
                &["WINHTTP.DLL"]
            }
            HookedEntry::Recv => &["WS2_32.DLL"],
            HookedEntry::FreadS | HookedEntry::Fread | HookedEntry::Read => {
                &["UCRTBASE.DLL", "MSVCRT.DLL"]
            }
            HookedEntry::RegQueryValueExA | HookedEntry::RegQueryValueExW => {
                &["ADVAPI32.DLL", "KERNELBASE.DLL"]
            }
        }
    }
}

/// Which post hook an entry point uses
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookKind {
    /// The generic post hook: buffer pointer and length were captured by
    /// the pre hook
    Generic,

    /// `MapViewOfFile`: the buffer is the return value and the length may
    /// need a region query
    MapView,
}

/// One row of the hook catalog
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HookSpec {
    /// The wrapped entry point
    pub entry: HookedEntry,

    /// Which post hook handles it
    pub kind: HookKind,
}

/// The always-installed hook catalog
pub const HOOKS: &[HookSpec] = &[
    HookSpec {
        entry: HookedEntry::ReadFile,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::InternetReadFile,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::ReadEventLogA,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::ReadEventLogW,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::WinHttpWebSocketReceive,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::WinHttpReadData,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::Recv,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::FreadS,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::Fread,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::Read,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::MapViewOfFile,
        kind: HookKind::MapView,
    },
];

/// Hooks additionally installed with `--registry`
pub const REGISTRY_HOOKS: &[HookSpec] = &[
    HookSpec {
        entry: HookedEntry::RegQueryValueExA,
        kind: HookKind::Generic,
    },
    HookSpec {
        entry: HookedEntry::RegQueryValueExW,
        kind: HookKind::Generic,
    },
];

/// Per-entry-point call counters, keyed by targeting name
#[derive(Debug, Default)]
pub struct CallCounters {
    counts: HashMap<&'static str, u64>,
}

impl CallCounters {
    /// Number of completed calls of the entry point so far
    #[must_use]
    pub fn current(&self, function: &'static str) -> u64 {
        self.counts.get(function).copied().unwrap_or(0)
    }

    /// Record one completed call of the entry point
    pub fn increment(&mut self, function: &'static str) {
        *self.counts.entry(function).or_insert(0) += 1;
    }
}

/// State captured by a pre hook about one in-flight call
///
/// Exactly one record exists per outstanding interception. It travels from
/// the pre hook to the matching post hook as the wrap user data and is
/// dropped there on every path.
#[derive(Debug, Clone)]
pub struct ClientRead {
    /// The wrapped entry point
    pub entry: HookedEntry,

    /// Destination buffer observed at call time (the return value for
    /// `MapViewOfFile`, filled in by the post hook)
    pub buffer: VirtAddr,

    /// Requested byte count, 0 when the caller did not specify one
    pub len: usize,

    /// Argument-identity hash from the hashing policy, when available
    pub arg_hash: Option<String>,
}

impl Tracer {
    /// The catalog rows the glue should wrap in a freshly loaded module:
    /// entries exported from that module whose targeting name the
    /// configuration selects
    #[must_use]
    pub fn hooks_for_module(&self, module_name: &str) -> Vec<&'static HookSpec> {
        let registry = self.options.registry;

        HOOKS
            .iter()
            .chain(registry.then_some(REGISTRY_HOOKS).into_iter().flatten())
            .filter(|spec| {
                spec.entry
                    .expected_modules()
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(module_name))
            })
            .filter(|spec| self.config.selects_function(spec.entry.target_name()))
            .collect()
    }

    /// Pre hook: capture the identity of an in-flight call
    #[must_use]
    pub fn on_read_pre(
        &self,
        entry: HookedEntry,
        buffer: VirtAddr,
        len: usize,
        arg_hash: Option<String>,
    ) -> ClientRead {
        ClientRead {
            entry,
            buffer,
            len,
            arg_hash,
        }
    }

    /// Generic post hook: mark the returned buffer tainted and, in replay
    /// mode, overwrite it with the stored mutation
    ///
    /// # Errors
    ///
    /// * The replay RPC or the buffer overwrite fails. This is fatal for
    ///   the run; the caller aborts the tracer.
    pub fn on_read_post(&self, record: ClientRead) -> Result<()> {
        let function = record.entry.target_name();

        // Identify whether this call instance is the one we want to target
        let targeted = {
            let mut counters = self.counters.lock().unwrap();
            let index = counters.current(function);
            let targeted = self
                .config
                .is_targeted(function, index, record.arg_hash.as_deref());
            counters.increment(function);
            targeted
        };

        if !targeted {
            return Ok(());
        }

        log::debug!(
            "targeted {} call: buffer={:#x} len={:#x}",
            function,
            record.buffer.0,
            record.len
        );

        // The delivered bytes are attacker controlled from here on
        self.engine
            .lock()
            .unwrap()
            .shadow
            .tm_add_range(record.buffer, record.len);

        // Fetch the stored mutation from the fuzzing run and write it over
        // whatever the real call produced. The mutex linearizes the replay
        // stream across guest threads.
        if self.is_replay() {
            let mut mutate_count = self.mutate_count.lock().unwrap();

            if self.options.no_mutate {
                log::debug!("user requested replay WITHOUT mutation");
            } else {
                let mut bytes = vec![0_u8; record.len];

                let mut server = self.server.lock().unwrap();
                server
                    .as_mut()
                    .ok_or_else(|| anyhow!("Server connection already closed"))?
                    .request_replay(*mutate_count, &mut bytes)?;

                self.memory.write(record.buffer, &bytes)?;
            }

            *mutate_count += 1;
        }

        Ok(())
    }

    /// `MapViewOfFile` post hook: the mapped address is only known after
    /// the call, and the argument hash is derived from the mapped file's
    /// resolved path together with the region size
    ///
    /// # Errors
    ///
    /// * The replay RPC or the buffer overwrite fails
    pub fn on_map_view_post(&self, mut record: ClientRead, mapped_at: VirtAddr) -> Result<()> {
        record.buffer = mapped_at;

        // When the caller mapped "the whole file" the size comes from the
        // platform, not the arguments
        if record.len == 0 {
            match self.platform.region_size(mapped_at) {
                Some(size) => record.len = size,
                None => {
                    log::warn!(
                        "Couldn't query mapped region at {mapped_at:#x?}, assuming uninteresting"
                    );
                    self.counters.lock().unwrap().increment(record.entry.target_name());
                    return Ok(());
                }
            }
        }

        let Some(path) = self.platform.mapped_file_path(mapped_at) else {
            log::warn!(
                "Couldn't get filename for memory map (size={}), assuming uninteresting",
                record.len
            );
            self.counters.lock().unwrap().increment(record.entry.target_name());
            return Ok(());
        };

        record.arg_hash = Some(hexdigest(&(path.to_string_lossy().into_owned(), record.len)));

        self.on_read_post(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::doubles::*;

    #[test]
    fn non_targeted_calls_leave_no_trace() {
        let dir = scratch_dir("nontarget");
        let (tracer, log) = test_tracer(
            replay_args(false),
            config_targeting(&["fread"]),
            SharedMemory::new(0x3000, 0x100),
            dir,
        );

        let record = tracer.on_read_pre(HookedEntry::ReadFile, VirtAddr(0x3000), 16, None);
        tracer.on_read_post(record).unwrap();

        // No taint, no replay RPC, no mutation index consumed
        assert!(tracer.engine.lock().unwrap().shadow().is_empty());
        assert!(log.lock().unwrap().iter().all(|l| !l.starts_with("request_replay")));
        assert_eq!(*tracer.mutate_count.lock().unwrap(), 0);

        // The call was still counted
        assert_eq!(tracer.counters.lock().unwrap().current("ReadFile"), 1);
    }

    #[test]
    fn targeted_replay_overwrites_and_taints_the_buffer() {
        let dir = scratch_dir("replay");
        let memory = SharedMemory::new(0x3000, 0x100);

        let (tracer, log) = test_tracer(
            replay_args(false),
            config_targeting(&["ReadFile"]),
            memory,
            dir,
        );

        let record = tracer.on_read_pre(HookedEntry::ReadFile, VirtAddr(0x3010), 16, None);
        tracer.on_read_post(record).unwrap();

        {
            let engine = tracer.engine.lock().unwrap();
            assert!(engine.shadow().tm_has_range(VirtAddr(0x3010), 16));
            assert!(!engine.shadow().tm_has(VirtAddr(0x3020)));
        }

        // Mutation 0 was written into the buffer
        let memory = &tracer.memory;
        let mut buf = vec![0_u8; 16];
        memory.read(VirtAddr(0x3010), &mut buf).unwrap();
        assert_eq!(buf, vec![0xf0; 16]);

        assert_eq!(*tracer.mutate_count.lock().unwrap(), 1);
        assert!(log.lock().unwrap().iter().any(|l| l == "request_replay 0 16"));

        // The next targeted read gets the next mutation index
        let record = tracer.on_read_pre(HookedEntry::ReadFile, VirtAddr(0x3040), 4, None);
        tracer.on_read_post(record).unwrap();
        assert!(log.lock().unwrap().iter().any(|l| l == "request_replay 1 4"));
        assert_eq!(*tracer.mutate_count.lock().unwrap(), 2);
    }

    #[test]
    fn no_mutate_still_taints_and_advances_the_stream() {
        let dir = scratch_dir("nomutate");
        let (tracer, log) = test_tracer(
            replay_args(true),
            config_targeting(&["recv"]),
            SharedMemory::new(0x3000, 0x100),
            dir,
        );

        let record = tracer.on_read_pre(HookedEntry::Recv, VirtAddr(0x3000), 8, None);
        tracer.on_read_post(record).unwrap();

        assert!(tracer
            .engine
            .lock()
            .unwrap()
            .shadow()
            .tm_has_range(VirtAddr(0x3000), 8));
        assert!(log.lock().unwrap().iter().all(|l| !l.starts_with("request_replay")));
        assert_eq!(*tracer.mutate_count.lock().unwrap(), 1);
    }

    #[test]
    fn observation_runs_taint_without_talking_to_the_server() {
        let dir = scratch_dir("observe");
        let mut args = replay_args(false);
        args.replay = None;

        let (tracer, log) = test_tracer(
            args,
            config_targeting(&["_read"]),
            SharedMemory::new(0x3000, 0x100),
            dir,
        );

        let record = tracer.on_read_pre(HookedEntry::Read, VirtAddr(0x3000), 4, None);
        tracer.on_read_post(record).unwrap();

        assert!(tracer
            .engine
            .lock()
            .unwrap()
            .shadow()
            .tm_has_range(VirtAddr(0x3000), 4));
        assert!(log.lock().unwrap().iter().all(|l| !l.starts_with("request_replay")));
        assert_eq!(*tracer.mutate_count.lock().unwrap(), 0);
    }

    #[test]
    fn call_index_targeting_skips_earlier_instances() {
        let dir = scratch_dir("callindex");
        let config = serde_json::from_str(
            r#"{ "functions": [{
                "function": "fread",
                "selected": true,
                "call_indices": [1]
            }] }"#,
        )
        .unwrap();

        let (tracer, _log) = test_tracer(
            replay_args(false),
            config,
            SharedMemory::new(0x3000, 0x100),
            dir,
        );

        // Call 0 is not targeted
        let record = tracer.on_read_pre(HookedEntry::Fread, VirtAddr(0x3000), 4, None);
        tracer.on_read_post(record).unwrap();
        assert!(tracer.engine.lock().unwrap().shadow().is_empty());

        // Call 1 is
        let record = tracer.on_read_pre(HookedEntry::Fread, VirtAddr(0x3000), 4, None);
        tracer.on_read_post(record).unwrap();
        assert!(tracer
            .engine
            .lock()
            .unwrap()
            .shadow()
            .tm_has_range(VirtAddr(0x3000), 4));
    }

    #[test]
    fn map_view_resolves_size_and_hashes_the_file_identity() {
        let dir = scratch_dir("mapview");
        let (tracer, log) = test_tracer(
            replay_args(false),
            config_targeting(&["MapViewOfFile"]),
            SharedMemory::new(0x3000, 0x2000),
            dir,
        );

        // Caller mapped the whole file: length comes from the region query
        let record = tracer.on_read_pre(HookedEntry::MapViewOfFile, VirtAddr(0), 0, None);
        tracer.on_map_view_post(record, VirtAddr(0x3000)).unwrap();

        // TestPlatform reports a 0x1000 byte region
        let engine = tracer.engine.lock().unwrap();
        assert!(engine.shadow().tm_has_range(VirtAddr(0x3000), 0x1000));
        assert!(!engine.shadow().tm_has(VirtAddr(0x4000)));
        drop(engine);

        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l == &format!("request_replay 0 {}", 0x1000)));
    }

    #[test]
    fn unresolvable_mappings_are_uninteresting() {
        let dir = scratch_dir("badmap");
        let memory = SharedMemory::new(0x3000, 0x100);

        let (server, log) = TestServer::new(dir);
        let platform = TestPlatform {
            mapped_path: None,
            ..TestPlatform::default()
        };
        let tracer = crate::tracer::Tracer::from_parts(
            replay_args(false),
            config_targeting(&["MapViewOfFile"]),
            Box::new(server),
            Box::new(platform),
            Box::new(memory),
        );

        let record = tracer.on_read_pre(HookedEntry::MapViewOfFile, VirtAddr(0), 16, None);
        tracer.on_map_view_post(record, VirtAddr(0x3000)).unwrap();

        // No taint, no replay, but the call instance was consumed
        assert!(tracer.engine.lock().unwrap().shadow().is_empty());
        assert!(log.lock().unwrap().iter().all(|l| !l.starts_with("request_replay")));
        assert_eq!(
            tracer.counters.lock().unwrap().current("MapViewOfFile"),
            1
        );
    }

    #[test]
    fn hook_catalog_is_filtered_by_module_and_configuration() {
        let dir = scratch_dir("catalog");
        let mut args = replay_args(false);
        args.registry = true;

        let (tracer, _log) = test_tracer(
            args,
            config_targeting(&["ReadFile", "RegQueryValueEx"]),
            SharedMemory::new(0x3000, 0x100),
            dir,
        );

        let kernel32 = tracer.hooks_for_module("kernel32.dll");
        assert_eq!(kernel32.len(), 1);
        assert_eq!(kernel32[0].entry, HookedEntry::ReadFile);

        // Both registry variants hook under one targeting name
        let advapi = tracer.hooks_for_module("advapi32.dll");
        let entries: Vec<_> = advapi.iter().map(|s| s.entry).collect();
        assert_eq!(
            entries,
            vec![HookedEntry::RegQueryValueExA, HookedEntry::RegQueryValueExW]
        );

        // Nothing selected from this module
        assert!(tracer.hooks_for_module("winhttp.dll").is_empty());
    }

    #[test]
    fn registry_hooks_require_the_flag() {
        let dir = scratch_dir("noregistry");
        let (tracer, _log) = test_tracer(
            replay_args(false),
            config_targeting(&["RegQueryValueEx"]),
            SharedMemory::new(0x3000, 0x100),
            dir,
        );

        assert!(tracer.hooks_for_module("advapi32.dll").is_empty());
    }
}
