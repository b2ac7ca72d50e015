// Copyright 2023 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Drain;
use thiserror::Error;

mod group;
pub use group::*;

/// Sentinel for "no LBA": an idle checkpoint, or a chunk that has no
/// address.
pub const LBA_INVALID: u64 = u64::MAX;

/// Sentinel for "no chunk index".
pub const CHUNK_INDEX_INVALID: u64 = u64::MAX;

/// Sentinel for an unused rebuild checkpoint entry.
pub const POSITION_INVALID: u32 = u32::MAX;

/// Maximum number of member positions a needs-rebuild bitmask can hold.
pub const MAX_WIDTH: u32 = 16;

/// Failures surfaced by the chunk metadata engine.
///
/// The variants fall in four groups.  Range and configuration errors are
/// detected before any I/O is issued and are never worth retrying.  The
/// service errors are translations of what the metadata service returned.
/// The invariant errors mean some caller upstream has a logic bug.
#[derive(
    Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize, JsonSchema,
)]
pub enum RaidMetaError {
    #[error("LBA out of range: {0}")]
    LbaOutOfRange(String),

    #[error("Chunk out of range: {0}")]
    ChunkOutOfRange(String),

    #[error("Chunk range spans user data and paged metadata: {0}")]
    RangeSpansBoundary(String),

    #[error("Journal range exceeded: {0}")]
    JournalRangeExceeded(String),

    #[error("Metadata of metadata slot overflow: {0}")]
    SlotOverflow(String),

    #[error("Chunk count exceeds request limit: {0}")]
    ChunkCountExceeded(String),

    #[error("Refusing partial metadata of metadata slot clear: {0}")]
    PartialSlotClear(String),

    #[error("Invalid group configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid rebuild position: {0}")]
    InvalidPosition(String),

    #[error("Metadata service busy, retry: {0}")]
    Retryable(String),

    #[error("Metadata I/O failed, not retryable: {0}")]
    NotRetryable(String),

    #[error("Metadata request canceled")]
    Canceled,

    #[error("Generic failure: {0}")]
    GenericFailure(String),

    #[error("Needs rebuild bits not justified by non-paged state: {0}")]
    RebuildBitsValidation(String),

    #[error("Non-paged layout error: {0}")]
    LayoutError(String),

    #[error("Paged reconstruction failed: {0}")]
    ReconstructFailed(String),
}

impl RaidMetaError {
    /// Only transient service conditions are worth another attempt; the
    /// caller owns the retry cadence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaidMetaError::Retryable(_))
    }

    /// Errors that indicate a bug upstream rather than a storage fault.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            RaidMetaError::RebuildBitsValidation(_)
                | RaidMetaError::InvalidPosition(_)
                | RaidMetaError::LayoutError(_)
        )
    }
}

impl From<std::io::Error> for RaidMetaError {
    fn from(e: std::io::Error) -> Self {
        RaidMetaError::GenericFailure(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for RaidMetaError {
    fn from(e: anyhow::Error) -> Self {
        RaidMetaError::GenericFailure(format!("{:?}", e))
    }
}

impl From<bincode::ErrorKind> for RaidMetaError {
    fn from(e: bincode::ErrorKind) -> Self {
        RaidMetaError::LayoutError(format!("{:?}", e))
    }
}

impl From<Box<bincode::ErrorKind>> for RaidMetaError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        RaidMetaError::LayoutError(format!("{:?}", e))
    }
}

#[macro_export]
macro_rules! raid_bail {
    ($i:ident) => { return Err(RaidMetaError::$i) };
    ($i:ident, $str:expr) => {
        return Err(RaidMetaError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err(RaidMetaError::$i(format!($fmt, $($arg)*)))
    };
}

/// Build a terminal logger at the default (info) level.
pub fn build_logger() -> slog::Logger {
    build_logger_with_level(slog::Level::Info)
}

pub fn build_logger_with_level(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(level)
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn read_toml<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => {
            bail!("open {:?}: file not found", file)
        }
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    toml::from_str(&buf).with_context(|| anyhow!("parse {:?}", file))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RaidMetaError::Retryable("busy".into()).is_retryable());
        assert!(!RaidMetaError::NotRetryable("io".into()).is_retryable());
        assert!(!RaidMetaError::Canceled.is_retryable());
        assert!(!RaidMetaError::GenericFailure("x".into()).is_retryable());
    }

    #[test]
    fn invariant_classification() {
        assert!(RaidMetaError::RebuildBitsValidation("x".into())
            .is_invariant_violation());
        assert!(RaidMetaError::InvalidPosition("x".into())
            .is_invariant_violation());
        assert!(!RaidMetaError::SlotOverflow("x".into())
            .is_invariant_violation());
    }

    fn bail_with_format(n: u64) -> Result<(), RaidMetaError> {
        if n > 3 {
            raid_bail!(ChunkOutOfRange, "chunk {} > {}", n, 3);
        }
        if n == 3 {
            raid_bail!(Canceled);
        }
        Ok(())
    }

    #[test]
    fn bail_macro_forms() {
        assert_eq!(bail_with_format(1), Ok(()));
        assert_eq!(bail_with_format(3), Err(RaidMetaError::Canceled));
        assert_eq!(
            bail_with_format(9),
            Err(RaidMetaError::ChunkOutOfRange("chunk 9 > 3".to_string()))
        );
    }

    #[test]
    fn read_toml_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let res: Result<GroupOptions> = read_toml(dir.path().join("nope"));
        assert!(res.is_err());
    }
}
