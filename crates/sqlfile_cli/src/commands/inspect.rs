//! Inspect command implementation.

use crate::{CliError, Format};
use serde::Serialize;
use sqlfile_core::{Config, Connection, DatabaseFileSet, ProcessFilter};
use sqlfile_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Main file size in bytes.
    pub main_size: u64,
    /// Rollback journal size, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_size: Option<u64>,
    /// Write-ahead log size, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_size: Option<u64>,
    /// Shared-memory file size, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<u64>,
    /// Header as readers see it.
    pub header: HeaderInfo,
    /// Pages in the main file.
    pub page_count: u64,
    /// Number of rows.
    pub row_count: usize,
    /// Lock state for any process.
    pub lock_state: String,
}

/// Selected header fields.
#[derive(Debug, Serialize)]
pub struct HeaderInfo {
    /// Page size in bytes.
    pub page_size: u32,
    /// `rollback` or `wal`.
    pub journal_mode: String,
    /// `off`, `full` or `incremental`.
    pub auto_vacuum: String,
    /// File change counter.
    pub change_counter: u32,
    /// User version.
    pub user_version: u32,
    /// Application id.
    pub application_id: u32,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(CliError::NotFound(path.to_path_buf()).into());
    }

    // Sizes are read before the connection exists: closing a second
    // descriptor on the main file would drop its record locks.
    let files = DatabaseFileSet::discover(path);
    let main_size = file_size(path)?.unwrap_or(0);
    let journal_size = optional_size(files.journal())?;
    let wal_size = optional_size(files.wal())?;
    let shm_size = optional_size(files.shm())?;

    let config = Config::default().create_if_missing(false).read_only(true);
    let conn = Connection::open_with_config(path, config)?;
    let header = conn.header()?;
    let row_count = conn.row_count()?;
    let lock_state = conn.lock_state(ProcessFilter::AnyProcess);

    let result = InspectResult {
        path: path.display().to_string(),
        main_size,
        journal_size,
        wal_size,
        shm_size,
        page_count: main_size / u64::from(header.page_size),
        header: HeaderInfo {
            page_size: header.page_size,
            journal_mode: header.journal_mode().to_string(),
            auto_vacuum: header.auto_vacuum().to_string(),
            change_counter: header.change_counter,
            user_version: header.user_version,
            application_id: header.application_id,
        },
        row_count,
        lock_state: lock_state.to_string(),
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }

    Ok(())
}

fn optional_size(path: Option<&Path>) -> Result<Option<u64>, Box<dyn std::error::Error>> {
    match path {
        Some(path) => file_size(path),
        None => Ok(None),
    }
}

fn file_size(path: &Path) -> Result<Option<u64>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Ok(None);
    }
    let backend = FileBackend::open_existing(path, true)?;
    Ok(Some(backend.size()?))
}

fn print_text_output(result: &InspectResult) {
    println!("sqlfile Database Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Header:");
    println!("  Page size:      {}", result.header.page_size);
    println!("  Journal mode:   {}", result.header.journal_mode);
    println!("  Auto-vacuum:    {}", result.header.auto_vacuum);
    println!("  Change counter: {}", result.header.change_counter);
    println!("  User version:   {}", result.header.user_version);
    println!("  Application id: {}", result.header.application_id);
    println!();
    println!("Content:");
    println!("  Pages: {}", result.page_count);
    println!("  Rows:  {}", result.row_count);
    println!();
    println!("Files:");
    println!("  Main:    {}", format_size(result.main_size));
    for (name, size) in [
        ("Journal", result.journal_size),
        ("WAL", result.wal_size),
        ("SHM", result.shm_size),
    ] {
        if let Some(size) = size {
            println!("  {name:<8} {}", format_size(size));
        }
    }
    println!();
    println!("Lock state: {}", result.lock_state);
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
