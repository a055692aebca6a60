//! sqlfile CLI
//!
//! Command-line tools for inspecting and maintaining SQLite-format
//! database files.
//!
//! # Commands
//!
//! - `probe` - Report whether a process holds a lock on a database
//! - `truncate` - Empty a database, optionally writing a fresh header
//! - `replace` - Overwrite one database with another's content
//! - `inspect` - Display header fields and auxiliary files
//! - `hold` - Take a lock and keep it until stdin closes

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use sqlfile_core::{AutoVacuum, LockLevel};
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// sqlfile command-line database tools.
#[derive(Parser)]
#[command(name = "sqlfile")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format shared by the reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// JSON
    Json,
}

/// Auto-vacuum policy argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AutoVacuumArg {
    Off,
    Full,
    Incremental,
}

impl From<AutoVacuumArg> for AutoVacuum {
    fn from(arg: AutoVacuumArg) -> Self {
        match arg {
            AutoVacuumArg::Off => Self::Off,
            AutoVacuumArg::Full => Self::Full,
            AutoVacuumArg::Incremental => Self::Incremental,
        }
    }
}

/// Lock level argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LevelArg {
    Shared,
    Reserved,
    Exclusive,
}

impl From<LevelArg> for LockLevel {
    fn from(arg: LevelArg) -> Self {
        match arg {
            LevelArg::Shared => Self::Shared,
            LevelArg::Reserved => Self::Reserved,
            LevelArg::Exclusive => Self::Exclusive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether a process holds a lock on a database
    Probe {
        /// Main database file
        path: PathBuf,

        /// Only count locks held by this process
        #[arg(long)]
        pid: Option<u32>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Empty a database, optionally writing a fresh header
    Truncate {
        /// Main database file
        path: PathBuf,

        /// Initialize in WAL mode
        #[arg(long)]
        wal: bool,

        /// Page size of the new header (1024, 2048, 4096 or 8192)
        #[arg(long)]
        page_size: Option<u32>,

        /// Auto-vacuum policy of the new header
        #[arg(long, value_enum)]
        auto_vacuum: Option<AutoVacuumArg>,

        /// Truncate even if other connections hold the file
        #[arg(long)]
        force: bool,
    },

    /// Overwrite a database with another's content
    Replace {
        /// Database to overwrite
        dest: PathBuf,

        /// Database to copy from
        source: PathBuf,
    },

    /// Display header fields and auxiliary files
    Inspect {
        /// Main database file
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Take a lock, print `ready <pid>`, and hold it until stdin closes
    Hold {
        /// Main database file
        path: PathBuf,

        /// Lock level to hold
        #[arg(short, long, value_enum, default_value = "shared")]
        level: LevelArg,
    },

    /// Show version information
    Version,
}

/// Failures reported by the commands themselves.
#[derive(Debug, Error)]
pub enum CliError {
    /// No database at the given path.
    #[error("no database found at {0}")]
    NotFound(PathBuf),

    /// The operation was refused because the file is in use.
    #[error("{0} is locked by another connection; retry later or use --force")]
    Locked(PathBuf),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Probe { path, pid, format } => {
            commands::probe::run(&path, pid, format)?;
        }
        Commands::Truncate {
            path,
            wal,
            page_size,
            auto_vacuum,
            force,
        } => {
            commands::truncate::run(&path, wal, page_size, auto_vacuum.map(Into::into), force)?;
        }
        Commands::Replace { dest, source } => {
            commands::replace::run(&dest, &source)?;
        }
        Commands::Inspect { path, format } => {
            commands::inspect::run(&path, format)?;
        }
        Commands::Hold { path, level } => {
            commands::hold::run(&path, level.into())?;
        }
        Commands::Version => {
            println!("sqlfile CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("sqlfile Core v{}", sqlfile_core::VERSION);
        }
    }

    Ok(())
}
