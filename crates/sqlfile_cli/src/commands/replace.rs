//! Replace command implementation.

use crate::CliError;
use sqlfile_core::{Config, Connection, ReplaceError};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Runs the replace command.
pub fn run(dest: &Path, source: &Path) -> Result<(), Box<dyn std::error::Error>> {
    for path in [dest, source] {
        if !path.is_file() {
            return Err(CliError::NotFound(path.to_path_buf()).into());
        }
    }

    let config = Config::default()
        .create_if_missing(false)
        .busy_timeout(Duration::from_millis(500));
    let source_conn = Connection::open_with_config(source, config.clone().read_only(true))?;
    let dest_conn = Connection::open_with_config(dest, config)?;

    match dest_conn.replace(&source_conn) {
        Ok(()) => {}
        Err(ReplaceError::LockUnavailable) => {
            return Err(CliError::Locked(dest.to_path_buf()).into());
        }
        Err(e) => return Err(e.into()),
    }

    let header = dest_conn.header()?;
    let rows = dest_conn.row_count()?;
    info!(dest = %dest.display(), source = %source.display(), rows, "replace finished");

    println!("✓ Replaced {} with {}", dest.display(), source.display());
    println!("  Rows:      {rows}");
    println!("  Page size: {}", header.page_size);

    Ok(())
}
