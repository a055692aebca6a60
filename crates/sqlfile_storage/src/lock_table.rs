//! Reader for the kernel's table of held file locks.
//!
//! `F_GETLK` reports at most one conflicting lock per query, and never one
//! held by the caller's own process. When a caller needs to know whether a
//! *particular* process holds a range, it has to look at every holder. On
//! Linux the kernel publishes them in `/proc/locks`:
//!
//! ```text
//! 1: POSIX  ADVISORY  WRITE 4242 08:01:1835263 1073741824 1073741824
//! 1: -> POSIX  ADVISORY  WRITE 4243 08:01:1835263 1073741824 1073741824
//! 2: OFDLCK ADVISORY  READ  -1 00:2e:91 0 EOF
//! ```
//!
//! Lines with `->` describe blocked waiters and are skipped. Device numbers
//! are printed as hexadecimal `major:minor`.

use crate::error::{StorageError, StorageResult};
use crate::range_lock::RangeLockKind;
use tracing::debug;

/// Kind of lock a table entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClass {
    /// Process-owned `fcntl` record lock.
    Posix,
    /// Open-file-description record lock.
    Ofd,
    /// Whole-file `flock(2)` lock.
    Flock,
    /// Lease, delegation or another class this reader does not model.
    Other,
}

/// One held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    /// Lock class.
    pub class: LockClass,
    /// Shared or exclusive.
    pub kind: RangeLockKind,
    /// Owning process; `None` when the kernel reports no owner.
    pub pid: Option<u32>,
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Inode number.
    pub inode: u64,
    /// First locked byte.
    pub start: u64,
    /// Last locked byte (inclusive); `None` means to end of file.
    pub end: Option<u64>,
}

impl LockEntry {
    /// Returns true if this entry covers any byte of `[start, start + len)`.
    ///
    /// A zero `len` means "to end of file".
    #[must_use]
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        let reaches = self.end.map_or(true, |end| end >= start);
        let begins_before = len == 0 || self.start < start.saturating_add(len);
        reaches && begins_before
    }

    /// Returns true if this entry is on the file identified by `dev`/`ino`.
    #[must_use]
    pub fn is_on(&self, dev: u64, ino: u64) -> bool {
        let (major, minor) = dev_major_minor(dev);
        self.major == major && self.minor == minor && self.inode == ino
    }
}

/// Splits a Linux `dev_t` into its major and minor numbers.
#[must_use]
pub fn dev_major_minor(dev: u64) -> (u64, u64) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major, minor)
}

fn malformed(line: &str) -> StorageError {
    StorageError::MalformedLockTable(line.to_string())
}

/// Parses one line of the table.
///
/// Returns `Ok(None)` for waiter lines.
///
/// # Errors
///
/// Returns [`StorageError::MalformedLockTable`] if the line does not have
/// the expected shape.
pub fn parse_line(line: &str) -> StorageResult<Option<LockEntry>> {
    let mut fields = line.split_whitespace();

    let id = fields.next().ok_or_else(|| malformed(line))?;
    if !id.ends_with(':') {
        return Err(malformed(line));
    }

    let class = fields.next().ok_or_else(|| malformed(line))?;
    if class == "->" {
        return Ok(None);
    }
    let class = match class {
        "POSIX" => LockClass::Posix,
        "OFDLCK" => LockClass::Ofd,
        "FLOCK" => LockClass::Flock,
        _ => LockClass::Other,
    };

    // ADVISORY / MANDATORY / ACTIVE / BREAKING ...
    fields.next().ok_or_else(|| malformed(line))?;

    let kind = match fields.next().ok_or_else(|| malformed(line))? {
        "READ" => RangeLockKind::Read,
        _ => RangeLockKind::Write,
    };

    let pid_field = fields.next().ok_or_else(|| malformed(line))?;
    let pid: i64 = pid_field.parse().map_err(|_| malformed(line))?;
    let pid = u32::try_from(pid).ok().filter(|p| *p > 0);

    let location = fields.next().ok_or_else(|| malformed(line))?;
    let mut parts = location.split(':');
    let (Some(major), Some(minor), Some(inode), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed(line));
    };
    let major = u64::from_str_radix(major, 16).map_err(|_| malformed(line))?;
    let minor = u64::from_str_radix(minor, 16).map_err(|_| malformed(line))?;
    let inode: u64 = inode.parse().map_err(|_| malformed(line))?;

    let start: u64 = fields
        .next()
        .ok_or_else(|| malformed(line))?
        .parse()
        .map_err(|_| malformed(line))?;
    let end = match fields.next().ok_or_else(|| malformed(line))? {
        "EOF" => None,
        n => Some(n.parse().map_err(|_| malformed(line))?),
    };

    Ok(Some(LockEntry {
        class,
        kind,
        pid,
        major,
        minor,
        inode,
        start,
        end,
    }))
}

/// Parses a whole table, skipping waiters and unparseable lines.
#[must_use]
pub fn parse(text: &str) -> Vec<LockEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_line(line) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping lock table line");
                None
            }
        })
        .collect()
}

/// Reads the running kernel's lock table.
///
/// # Errors
///
/// Returns [`StorageError::Unsupported`] on platforms without one, or an
/// I/O error if it cannot be read.
pub fn read_system_table() -> StorageResult<Vec<LockEntry>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let text = std::fs::read_to_string("/proc/locks")?;
        Ok(parse(&text))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        Err(StorageError::Unsupported("kernel lock table"))
    }
}

/// Returns every record lock held on `[start, start + len)` of the file
/// identified by `dev`/`ino`.
///
/// # Errors
///
/// See [`read_system_table`].
pub fn holders(dev: u64, ino: u64, start: u64, len: u64) -> StorageResult<Vec<LockEntry>> {
    Ok(read_system_table()?
        .into_iter()
        .filter(|e| matches!(e.class, LockClass::Posix | LockClass::Ofd))
        .filter(|e| e.is_on(dev, ino) && e.overlaps(start, len))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
1: POSIX  ADVISORY  WRITE 4242 08:01:1835263 1073741824 1073741824
1: -> POSIX  ADVISORY  WRITE 4243 08:01:1835263 1073741824 1073741824
2: OFDLCK ADVISORY  READ  -1 00:2e:91 0 EOF
3: FLOCK  ADVISORY  WRITE 77 fd:00:5 0 EOF
4: POSIX  ADVISORY  READ  4242 08:01:1835263 1073741826 1073742335
";

    #[test]
    fn parses_posix_entry() {
        let entry = parse_line("1: POSIX  ADVISORY  WRITE 4242 08:01:1835263 1073741824 1073741824")
            .unwrap()
            .unwrap();
        assert_eq!(entry.class, LockClass::Posix);
        assert_eq!(entry.kind, RangeLockKind::Write);
        assert_eq!(entry.pid, Some(4242));
        assert_eq!((entry.major, entry.minor, entry.inode), (8, 1, 1_835_263));
        assert_eq!(entry.start, 0x4000_0000);
        assert_eq!(entry.end, Some(0x4000_0000));
    }

    #[test]
    fn ofd_entry_has_no_owner_and_hex_device() {
        let entry = parse_line("2: OFDLCK ADVISORY  READ  -1 00:2e:91 0 EOF")
            .unwrap()
            .unwrap();
        assert_eq!(entry.class, LockClass::Ofd);
        assert_eq!(entry.pid, None);
        assert_eq!(entry.minor, 0x2e);
        assert_eq!(entry.end, None);
    }

    #[test]
    fn waiter_lines_are_skipped() {
        assert_eq!(
            parse_line("1: -> POSIX  ADVISORY  WRITE 4243 08:01:1835263 0 0").unwrap(),
            None
        );
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e.pid != Some(4243)));
    }

    #[test]
    fn malformed_lines_error() {
        assert!(matches!(
            parse_line("1: POSIX ADVISORY WRITE abc 08:01:1 0 EOF"),
            Err(StorageError::MalformedLockTable(_))
        ));
        assert!(parse_line("garbage").is_err());
        assert!(parse_line("1: POSIX ADVISORY WRITE 1 08:01 0 EOF").is_err());
    }

    #[test]
    fn overlap_is_inclusive_of_end() {
        let entry = parse_line("4: POSIX  ADVISORY  READ  1 08:01:9 100 109")
            .unwrap()
            .unwrap();
        assert!(entry.overlaps(109, 1));
        assert!(entry.overlaps(90, 11));
        assert!(!entry.overlaps(110, 5));
        assert!(!entry.overlaps(90, 10));
        assert!(entry.overlaps(0, 0));
    }

    #[test]
    fn dev_split_matches_glibc_encoding() {
        assert_eq!(dev_major_minor(0x0801), (8, 1));
        assert_eq!(dev_major_minor(0xfd00), (0xfd, 0));
        // major 259, minor 3 with the extended encoding
        assert_eq!(dev_major_minor(0x10303), (259, 3));
        // minor above 255 moves into the high bits
        assert_eq!(dev_major_minor((0x100 << 12) | 0x0800), (8, 0x100));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_table_shows_our_own_lock() {
        use crate::range_lock;
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held.db");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        assert!(range_lock::try_lock(&file, RangeLockKind::Write, 500, 2).unwrap());

        let meta = file.metadata().unwrap();
        let found = holders(meta.dev(), meta.ino(), 501, 1).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, Some(std::process::id()));
        assert!(holders(meta.dev(), meta.ino(), 502, 10).unwrap().is_empty());

        range_lock::unlock(&file, 500, 2).unwrap();
    }
}
