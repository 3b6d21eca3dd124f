//! Append-only journal backing the disk store.
//!
//! ```text
//! photo-pipeline.disk-store
//! 1
//! <app id>
//!
//! DIRTY 5d41402abc4b2a76b9719d911017c592
//! CLEAN 5d41402abc4b2a76b9719d911017c592 8342
//! READ 5d41402abc4b2a76b9719d911017c592
//! REMOVE 5d41402abc4b2a76b9719d911017c592
//! ```
//!
//! `DIRTY` marks an edit in progress and must be followed by `CLEAN` (publish)
//! or `REMOVE` (abort). A `DIRTY` without either means the process died
//! mid-write; the partial file is deleted on the next open.

use crate::errors::{CacheError, CacheResult};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TEMP: &str = "journal.tmp";
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
pub const MAGIC: &str = "photo-pipeline.disk-store";
pub const VERSION: &str = "1";

const MAX_KEY_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Dirty(String),
    Clean(String, u64),
    Remove(String),
    Read(String),
}

impl JournalOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Dirty(k) | Self::Clean(k, _) | Self::Remove(k) | Self::Read(k) => k,
        }
    }

    /// Parse one journal line; `line_no` is only used for error reporting.
    pub fn parse(line: &str, line_no: usize) -> CacheResult<Self> {
        let mut parts = line.split(' ');
        let op = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .filter(|k| is_valid_key(k))
            .ok_or_else(|| CacheError::corrupt(line_no, format!("bad key in '{line}'")))?
            .to_string();

        let parsed = match op {
            "DIRTY" => Self::Dirty(key),
            "REMOVE" => Self::Remove(key),
            "READ" => Self::Read(key),
            "CLEAN" => {
                let length = parts
                    .next()
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or_else(|| CacheError::corrupt(line_no, format!("bad length in '{line}'")))?;
                Self::Clean(key, length)
            }
            other => return Err(CacheError::corrupt(line_no, format!("unknown op '{other}'"))),
        };

        if parts.next().is_some() {
            return Err(CacheError::corrupt(line_no, format!("trailing data in '{line}'")));
        }
        Ok(parsed)
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dirty(k) => write!(f, "DIRTY {k}"),
            Self::Clean(k, len) => write!(f, "CLEAN {k} {len}"),
            Self::Remove(k) => write!(f, "REMOVE {k}"),
            Self::Read(k) => write!(f, "READ {k}"),
        }
    }
}

/// Keys double as file names inside the cache directory.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with(JOURNAL_FILE)
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

pub fn write_header<W: Write>(writer: &mut W, app_id: u32) -> io::Result<()> {
    writeln!(writer, "{MAGIC}")?;
    writeln!(writer, "{VERSION}")?;
    writeln!(writer, "{app_id}")?;
    writeln!(writer)
}

#[derive(Debug, Default)]
pub struct JournalReplay {
    pub ops: Vec<JournalOp>,
    /// The last line had no terminating newline and was ignored
    pub truncated: bool,
}

/// Read and validate a journal. A header mismatch is reported as corruption.
pub fn read_journal(path: &Path, app_id: u32) -> CacheResult<JournalReplay> {
    let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData => CacheError::corrupt(0, "journal is not UTF-8"),
        _ => CacheError::Io(e),
    })?;

    let mut lines: Vec<&str> = contents.split('\n').collect();
    // A complete journal ends with '\n', leaving an empty final segment
    let truncated = lines.last().is_some_and(|last| !last.is_empty());
    lines.pop();

    let expected_app_id = app_id.to_string();
    let header = [MAGIC, VERSION, expected_app_id.as_str(), ""];
    for (index, expected) in header.iter().enumerate() {
        match lines.get(index) {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return Err(CacheError::corrupt(
                    index + 1,
                    format!("header mismatch: expected '{expected}', found '{actual}'"),
                ));
            }
            None => return Err(CacheError::corrupt(index + 1, "truncated header")),
        }
    }

    let ops = lines
        .iter()
        .enumerate()
        .skip(header.len())
        .map(|(index, line)| JournalOp::parse(line, index + 1))
        .collect::<CacheResult<Vec<_>>>()?;

    Ok(JournalReplay { ops, truncated })
}
