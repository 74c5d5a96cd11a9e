//! Abstract RPC surface of the fuzzing server
//!
//! The wire protocol is owned by the glue that opens the connection; the
//! core only relies on the calls below. A connection is opened before
//! [`Tracer::init`](crate::tracer::Tracer::init) runs and closed exactly
//! once from the exit callback.

use anyhow::Result;
use uuid::Uuid;

use std::path::PathBuf;

/// Artifact paths assigned by the server for a crashing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashPaths {
    /// Where the JSON crash report is written
    pub crash_path: PathBuf,

    /// Where the full-memory dump is written
    pub mem_dump_path: PathBuf,
}

/// An open connection to the fuzzing server
pub trait Server: Send {
    /// Associate this connection with the run being replayed
    ///
    /// # Errors
    ///
    /// * The server rejects or cannot store the run id
    fn assign_run_id(&mut self, run_id: Uuid) -> Result<()>;

    /// Register the instrumented process under the current run
    ///
    /// # Errors
    ///
    /// * The server rejects the registration
    fn register_pid(&mut self, pid: u32, is_tracer: bool) -> Result<()>;

    /// Write mutation `index` of the current run into `dest`
    ///
    /// Must be deterministic per `(run_id, index)`: replaying the same run
    /// twice delivers identical bytes in identical order.
    ///
    /// # Errors
    ///
    /// * The server has no stored mutation for this index
    fn request_replay(&mut self, index: u32, dest: &mut [u8]) -> Result<()>;

    /// Ask where crash artifacts for `pid` should be written
    ///
    /// # Errors
    ///
    /// * The server cannot provide artifact paths
    fn request_crash_paths(&mut self, pid: u32) -> Result<CrashPaths>;

    /// Close the connection
    ///
    /// # Errors
    ///
    /// * The close handshake fails
    fn close(&mut self) -> Result<()>;
}
