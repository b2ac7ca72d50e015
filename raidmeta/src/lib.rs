// Copyright 2023 Oxide Computer Company

use std::sync::Arc;

pub use raidmeta_common::{
    build_logger, build_logger_with_level, raid_bail, GroupDefinition,
    GroupOptions, JournalRange, RaidMetaError, CHUNK_INDEX_INVALID,
    LBA_INVALID, MAX_WIDTH, POSITION_INVALID, RECORDS_PER_METADATA_BLOCK,
};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};

pub mod chunk;
pub mod checkpoint;
pub mod in_memory;
pub mod mdd;
pub mod nonpaged;
pub mod paged;
pub mod raid_group;
pub mod reconstruct;
pub mod record;
pub mod service;

pub use checkpoint::{
    choose_persist_mode, CheckpointEngine, CheckpointOutcome, PersistMode,
};
pub use chunk::ChunkArea;
pub use in_memory::{InMemoryMetadata, InMemoryVerifier, ServiceStats};
pub use mdd::MddMap;
pub use nonpaged::{
    GroupFlag, NonPagedField, NonPagedRecord, NonPagedStore, VerifyKind,
};
pub use paged::{BlockOpcode, IoContext, PagedAccessor};
pub use raid_group::{ConditionSet, LifecycleCondition, RaidGroup};
pub use reconstruct::{
    set_paged_bits_from_nonpaged, ReconstructContext, ReconstructState,
    Reconstructor, ScanAccumulator,
};
pub use record::{PagedChunkRecord, VerifyBits};
pub use service::{
    BlockVerifier, KeyGeneration, MetadataService, MetadataStatus, PagedOp,
    PagedRequest, VerifyReport,
};

/// Slots in the non-paged metadata of metadata array.
pub const MDD_SLOTS: usize = 14;

/// Rebuild checkpoint entries held in the non-paged record.
pub const MAX_REBUILD_POSITIONS: usize = 2;

#[cfg(test)]
pub(crate) fn csl() -> Logger {
    use slog::Drain;
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}
