//! Hold command implementation.
//!
//! Takes a lock on a database and keeps it until stdin reaches EOF. The
//! `ready <pid>` line tells a supervising process the lock is in place.

use crate::CliError;
use sqlfile_core::{Config, Connection, LockLevel};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Runs the hold command.
pub fn run(path: &Path, level: LockLevel) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(CliError::NotFound(path.to_path_buf()).into());
    }

    let conn = Connection::open_with_config(path, Config::default().create_if_missing(false))?;
    conn.hold_lock(level)?;
    info!(path = %path.display(), ?level, "lock acquired");

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "ready {}", std::process::id())?;
    stdout.flush()?;
    drop(stdout);

    let mut sink = Vec::new();
    io::stdin().lock().read_to_end(&mut sink)?;
    debug!(bytes = sink.len(), "stdin closed");

    conn.release_lock()?;
    info!(path = %path.display(), "lock released");
    Ok(())
}
