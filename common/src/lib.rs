// Copyright 2025 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::Drain;
use tempfile::NamedTempFile;
use thiserror::Error;

mod class;
mod config;

pub use class::*;
pub use config::*;

/// Errors surfaced by the dedup table engine.
///
/// `NotFound` is the only variant the engine treats as an expected outcome;
/// everything else aborts the transaction group it happened in.
#[derive(Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DdtError {
    #[error("Entry or object not found")]
    NotFound,

    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Dedup entry limit of {limit} reached")]
    OutOfEntries { limit: usize },

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Unable to decode record: {0}")]
    RecordDecode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not a dedup block pointer: {0}")]
    BadBlockPointer(String),

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("Write to txg {requested} while txg {open} is open")]
    TxgMismatch { open: u64, requested: u64 },

    #[error("Receive channel disconnected")]
    RecvDisconnected,
}

impl DdtError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DdtError::NotFound)
    }

    /// True for errors that leave the pool's dedup state inconsistent. The
    /// owner of the transaction group must abort it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DdtError::NotFound
                | DdtError::OutOfEntries { .. }
                | DdtError::InvalidConfig(_)
                | DdtError::BadBlockPointer(_)
        )
    }
}

impl From<std::io::Error> for DdtError {
    fn from(e: std::io::Error) -> Self {
        DdtError::IoError(format!("{:?}", e))
    }
}

impl From<bincode::Error> for DdtError {
    fn from(e: bincode::Error) -> Self {
        DdtError::RecordDecode(e.to_string())
    }
}

#[macro_export]
macro_rules! ddt_bail {
    ($i:ident) => { return Err($crate::DdtError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::DdtError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::DdtError::$i(format!($fmt, $($arg)*)))
    };
}

pub fn build_logger() -> slog::Logger {
    build_logger_with_level(slog::Level::Info)
}

pub fn build_logger_with_level(level: slog::Level) -> slog::Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .chan_size(32768)
            .build()
            .filter_level(level)
            .fuse()
    } else {
        let drain = slog_bunyan::with_name("ddt", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .chan_size(32768)
            .build()
            .filter_level(level)
            .fuse()
    };

    slog::Logger::root(main_drain, slog::o!())
}

pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

/// Write `data` next to `file` and rename it into place, so a reader never
/// sees a partially written snapshot.
pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let Some(dir) = file.parent() else {
        bail!("{:?} has no parent directory", file);
    };
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let mut tmpf = NamedTempFile::new_in(dir)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}
