//! Truncate command implementation.

use crate::CliError;
use sqlfile_core::{AutoVacuum, Config, Connection, JournalMode, TruncateError, TruncateOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Runs the truncate command.
///
/// With no header option the file is left at zero bytes. Any of `wal`,
/// `page_size` or `auto_vacuum` asks for a fresh empty-database header.
pub fn run(
    path: &Path,
    wal: bool,
    page_size: Option<u32>,
    auto_vacuum: Option<AutoVacuum>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(CliError::NotFound(path.to_path_buf()).into());
    }

    let options = build_options(wal, page_size, auto_vacuum, force);
    let config = Config::default()
        .create_if_missing(false)
        .busy_timeout(Duration::ZERO);
    let conn = Connection::open_with_config(path, config)?;

    match conn.truncate(options) {
        Ok(()) => {}
        Err(TruncateError::LockUnavailable) => {
            return Err(CliError::Locked(path.to_path_buf()).into());
        }
        Err(e) => return Err(e.into()),
    }

    let header = conn.header()?;
    info!(path = %path.display(), page_size = header.page_size, "truncated");

    println!("✓ Truncated {}", path.display());
    match options {
        Some(opts) if opts.initializes_header() => {
            println!("  Page size:    {}", header.page_size);
            println!("  Journal mode: {}", header.journal_mode());
            println!("  Auto-vacuum:  {}", header.auto_vacuum());
        }
        _ => println!("  File is now empty"),
    }

    Ok(())
}

fn build_options(
    wal: bool,
    page_size: Option<u32>,
    auto_vacuum: Option<AutoVacuum>,
    force: bool,
) -> Option<TruncateOptions> {
    if !wal && page_size.is_none() && auto_vacuum.is_none() && !force {
        return None;
    }
    let mut options = TruncateOptions::new().force(force);
    if wal {
        options = options.journal_mode(JournalMode::Wal);
    }
    if let Some(size) = page_size {
        options = options.page_size(size);
    }
    if let Some(mode) = auto_vacuum {
        options = options.auto_vacuum(mode);
    }
    Some(options)
}
