//! Probe command implementation.

use crate::Format;
use serde::Serialize;
use sqlfile_core::{probe, FileLockDescriptor, LockState, ProcessFilter};
use std::path::Path;
use tracing::debug;

/// Lock probe result.
#[derive(Debug, Serialize)]
pub struct ProbeResult {
    /// Database path.
    pub path: String,
    /// Process asked about, if any.
    pub pid: Option<u32>,
    /// Classification name.
    pub state: String,
    /// Numeric file-control code.
    pub code: i32,
}

/// Runs the probe command.
pub fn run(path: &Path, pid: Option<u32>, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let filter = pid.map_or(ProcessFilter::AnyProcess, ProcessFilter::Pid);
    let desc = FileLockDescriptor::new(path).filter(filter);
    let state = probe(&desc);
    debug!(path = %path.display(), ?filter, %state, "probe finished");

    let result = ProbeResult {
        path: path.display().to_string(),
        pid,
        state: state.to_string(),
        code: state.code(),
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result, state),
    }

    Ok(())
}

fn print_text_output(result: &ProbeResult, state: LockState) {
    let target = match result.pid {
        Some(pid) => format!("process {pid}"),
        None => "any process".to_string(),
    };
    match state {
        LockState::Unlocked => println!("{}: unlocked (no lock held by {target})", result.path),
        LockState::LockedByTarget => println!("{}: locked by {target}", result.path),
        LockState::NotADatabase => println!("{}: not a database", result.path),
        LockState::Error => println!("{}: error (lock state could not be determined)", result.path),
    }
}
