//! Command line arguments

use clap::Parser;
use uuid::Uuid;

use std::path::PathBuf;

/// Command line options of the tracer client
///
/// The options are forwarded by the DBI glue; semantics follow the fuzzing
/// pipeline's contract: a run either replays a recorded mutation against
/// the target (`--replay`) or merely observes it with taint tracking.
#[derive(Parser, Debug, Clone)]
#[clap(name = "taintrace")]
pub struct CommandLineArgs {
    /// Path to the target configuration describing which entry points are
    /// of interest and which call instances within them are targeted
    #[clap(short, long)]
    pub target: PathBuf,

    /// The run id for a crash to replay
    #[clap(short, long)]
    pub replay: Option<Uuid>,

    /// Don't use the mutated buffer when replaying (input buffers are
    /// still marked tainted)
    #[clap(long)]
    pub no_mutate: bool,

    /// Do not do instruction level instrumentation. Mostly used to debug
    /// if taint tracking is too slow.
    #[clap(long)]
    pub no_taint: bool,

    /// Additionally hook the registry value query entry points
    #[clap(long)]
    pub registry: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_required() {
        assert!(CommandLineArgs::try_parse_from(["taintrace"]).is_err());
        assert!(CommandLineArgs::try_parse_from(["taintrace", "-t", "targets.json"]).is_ok());
    }

    #[test]
    fn replay_takes_a_uuid() {
        let args = CommandLineArgs::try_parse_from([
            "taintrace",
            "-t",
            "targets.json",
            "-r",
            "9b3f80ad-5a9a-4e5a-a6bb-1b9a5d4ce392",
            "--no-mutate",
        ])
        .unwrap();

        assert!(args.replay.is_some());
        assert!(args.no_mutate);
        assert!(!args.no_taint);

        assert!(CommandLineArgs::try_parse_from([
            "taintrace",
            "-t",
            "targets.json",
            "-r",
            "not-a-uuid"
        ])
        .is_err());
    }
}
