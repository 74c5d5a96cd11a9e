//! Traits implemented by the DBI glue to give the core access to the target
//! process and the host platform
//!
//! The instrumentation framework itself is an external collaborator: the
//! core never talks to it directly, it only reads guest memory to decode
//! instructions, writes replay bytes into guest buffers, and asks the
//! platform for the services exception triage needs.

use anyhow::Result;

use std::fs::File;
use std::path::PathBuf;

use crate::addrs::VirtAddr;
use crate::triage::ExceptionSnapshot;

/// Byte-level access to the address space of the instrumented process
pub trait GuestMemory {
    /// Read `buf.len()` bytes starting at `addr`
    ///
    /// # Errors
    ///
    /// * Any byte of the range is unmapped or unreadable
    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<()>;

    /// Write `bytes` starting at `addr`
    ///
    /// # Errors
    ///
    /// * Any byte of the range is unmapped or unwritable
    fn write(&self, addr: VirtAddr, bytes: &[u8]) -> Result<()>;

    /// Check whether at least one byte at `addr` can be read
    fn is_readable(&self, addr: VirtAddr) -> bool;
}

/// Host platform services used by the interceptor and exception triage
pub trait Platform {
    /// OS process id of the instrumented process
    fn process_id(&self) -> u32;

    /// OS thread id of the calling thread
    fn current_thread_id(&self) -> u32;

    /// Size of the mapped region containing `addr`, if any
    fn region_size(&self, addr: VirtAddr) -> Option<usize>;

    /// Resolved path of the file mapped at `addr`, if any
    fn mapped_file_path(&self, addr: VirtAddr) -> Option<PathBuf>;

    /// Write a full-memory dump of the current process into `file`
    ///
    /// The dump must reflect the application's view of the process: the
    /// caller has already switched the context in `snapshot` away from
    /// instrumentation state.
    ///
    /// # Errors
    ///
    /// * The platform dump facility fails
    fn write_minidump(&self, file: &mut File, snapshot: &ExceptionSnapshot) -> std::io::Result<()>;
}
