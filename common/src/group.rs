// Copyright 2023 Oxide Computer Company
use anyhow::{bail, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::*;

/*
 * All capacities here are in blocks, and unless the name says otherwise
 * they are per-disk.  A RAID group of `data_disks` data positions exports
 * `exported_disk_capacity * data_disks` blocks to its user; the paged
 * metadata follows the user area on every disk.
 *
 *   per disk:  |<-- exported (user) -->|<-- paged -->|  ...  |<- journal ->|
 *   chunks:    0 ....... exported_chunks ...... total_chunks
 *
 * The journal, when there is one, lives outside the chunk accounting.
 */

pub const DEFAULT_CHUNK_SIZE: u64 = 0x800;

/// Bytes of record data in one metadata block.
pub const METADATA_BLOCK_DATA_SIZE: u64 = 512;

/// Bytes in the wire form of one paged chunk record.
pub const CHUNK_ENTRY_SIZE: u64 = 4;

/// Paged records that fit in one metadata block.
pub const RECORDS_PER_METADATA_BLOCK: u64 =
    METADATA_BLOCK_DATA_SIZE / CHUNK_ENTRY_SIZE;

pub const DEFAULT_PEER_UPDATE_INTERVAL_MS: u64 = 30_000;
pub const MIN_PEER_UPDATE_INTERVAL_MS: u64 = 1_000;

pub const DEFAULT_MAX_CHUNKS_PER_REQUEST: u64 = 0x100;

/// Per-disk journal area, outside of normal capacity accounting.
#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct JournalRange {
    pub start: u64,
    pub blocks: u64,
}

impl JournalRange {
    /// Last LBA that belongs to the journal (inclusive).
    pub fn end(&self) -> u64 {
        self.start + self.blocks - 1
    }

    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.start && lba <= self.end()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(default)]
pub struct GroupOptions {
    /**
     * UUID for this raid group
     */
    pub uuid: Uuid,

    /**
     * Number of member positions.
     */
    pub width: u32,

    /**
     * Number of positions holding user data.
     */
    pub data_disks: u32,

    /**
     * Blocks per chunk.  Must be a power of 2.
     */
    pub chunk_size: u64,

    /**
     * Per-disk blocks exported as user data.
     */
    pub exported_disk_capacity: u64,

    /**
     * Per-disk blocks of paged metadata after the user area.
     */
    pub paged_disk_capacity: u64,

    /**
     * Redundant copies of the paged region.
     */
    pub paged_copies: u32,

    pub journal: Option<JournalRange>,

    /**
     * Raw mirror groups have no paged metadata; every chunk is tracked in
     * the non-paged metadata of metadata.
     */
    pub has_paged_metadata: bool,

    pub encrypted: bool,

    pub peer_update_interval_ms: u64,

    pub max_chunks_per_request: u64,

    /**
     * The 4K drive format has been committed for this system.
     */
    pub four_k_committed: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        GroupOptions {
            uuid: Uuid::nil(),
            width: 3,
            data_disks: 2,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exported_disk_capacity: DEFAULT_CHUNK_SIZE * 64,
            paged_disk_capacity: DEFAULT_CHUNK_SIZE * 4,
            paged_copies: 2,
            journal: None,
            has_paged_metadata: true,
            encrypted: false,
            peer_update_interval_ms: DEFAULT_PEER_UPDATE_INTERVAL_MS,
            max_chunks_per_request: DEFAULT_MAX_CHUNKS_PER_REQUEST,
            four_k_committed: false,
        }
    }
}

impl GroupOptions {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.width > MAX_WIDTH {
            bail!("width must be 1..={}, not {}", MAX_WIDTH, self.width);
        }

        if self.data_disks == 0 || self.data_disks > self.width {
            bail!(
                "data disks must be 1..={}, not {}",
                self.width,
                self.data_disks
            );
        }

        if !self.chunk_size.is_power_of_two() {
            bail!("chunk size must be a power of two, not {}", self.chunk_size);
        }

        if self.exported_disk_capacity % self.chunk_size != 0 {
            bail!(
                "exported capacity {} is not a multiple of chunk size {}",
                self.exported_disk_capacity,
                self.chunk_size
            );
        }

        if self.paged_disk_capacity % self.chunk_size != 0 {
            bail!(
                "paged capacity {} is not a multiple of chunk size {}",
                self.paged_disk_capacity,
                self.chunk_size
            );
        }

        if self.has_paged_metadata && self.paged_disk_capacity == 0 {
            bail!("a group with paged metadata needs paged capacity");
        }

        if self.paged_copies == 0 {
            bail!("paged copies must be at least 1");
        }

        if let Some(journal) = self.journal {
            if journal.blocks == 0 {
                bail!("journal must be at least 1 block");
            }
            let capacity =
                self.exported_disk_capacity + self.paged_disk_capacity;
            if journal.start < capacity {
                bail!(
                    "journal start {} overlaps chunk capacity {}",
                    journal.start,
                    capacity
                );
            }
            if journal.start.checked_add(journal.blocks).is_none() {
                bail!("journal range overflows");
            }
        }

        if self.max_chunks_per_request == 0 {
            bail!("max chunks per request must be at least 1");
        }

        Ok(())
    }
}

/// Validated, immutable geometry of one RAID group.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GroupDefinition {
    uuid: Uuid,
    width: u32,
    data_disks: u32,
    chunk_size: u64,
    exported_disk_capacity: u64,
    paged_disk_capacity: u64,
    paged_copies: u32,
    journal: Option<JournalRange>,
    has_paged_metadata: bool,
    encrypted: bool,
    peer_update_interval_ms: u64,
    max_chunks_per_request: u64,
    four_k_committed: bool,
}

impl GroupDefinition {
    pub fn from_options(opts: &GroupOptions) -> Result<Self> {
        opts.validate()?;
        Ok(GroupDefinition {
            uuid: opts.uuid,
            width: opts.width,
            data_disks: opts.data_disks,
            chunk_size: opts.chunk_size,
            exported_disk_capacity: opts.exported_disk_capacity,
            paged_disk_capacity: opts.paged_disk_capacity,
            paged_copies: opts.paged_copies,
            journal: opts.journal,
            has_paged_metadata: opts.has_paged_metadata,
            encrypted: opts.encrypted,
            peer_update_interval_ms: opts.peer_update_interval_ms,
            max_chunks_per_request: opts.max_chunks_per_request,
            four_k_committed: opts.four_k_committed,
        })
    }

    /// Load and validate a group definition from a toml file.
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let opts: GroupOptions = read_toml(path)?;
        GroupDefinition::from_options(&opts)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn data_disks(&self) -> u32 {
        self.data_disks
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn exported_disk_capacity(&self) -> u64 {
        self.exported_disk_capacity
    }

    pub fn paged_disk_capacity(&self) -> u64 {
        self.paged_disk_capacity
    }

    /// Per-disk capacity covered by chunk accounting.
    pub fn disk_capacity(&self) -> u64 {
        self.exported_disk_capacity + self.paged_disk_capacity
    }

    pub fn journal(&self) -> Option<JournalRange> {
        self.journal
    }

    pub fn has_paged_metadata(&self) -> bool {
        self.has_paged_metadata
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn four_k_committed(&self) -> bool {
        self.four_k_committed
    }

    pub fn max_chunks_per_request(&self) -> u64 {
        self.max_chunks_per_request
    }

    /// Interval after which a checkpoint move is pushed to the peer.  The
    /// configured value is honored down to one second.
    pub fn peer_update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.peer_update_interval_ms.max(MIN_PEER_UPDATE_INTERVAL_MS),
        )
    }

    pub fn set_peer_update_interval_ms(&mut self, ms: u64) {
        self.peer_update_interval_ms = ms;
    }

    pub fn exported_chunks(&self) -> u64 {
        self.exported_disk_capacity / self.chunk_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.disk_capacity() / self.chunk_size
    }

    /// Paged metadata chunks on each data disk.
    pub fn paged_chunks_per_data_disk(&self) -> u64 {
        self.paged_metadata_capacity()
            / u64::from(self.data_disks)
            / self.chunk_size
    }

    /// Raid-relative start of the paged metadata.
    pub fn paged_metadata_start_lba(&self) -> u64 {
        self.exported_disk_capacity * u64::from(self.data_disks)
    }

    /// Raid-relative capacity of one copy of the paged metadata.
    pub fn paged_metadata_capacity(&self) -> u64 {
        self.paged_disk_capacity * u64::from(self.data_disks)
    }

    /// Offset between the redundant copies of the paged metadata.
    pub fn paged_mirror_offset(&self) -> u64 {
        self.paged_metadata_capacity()
    }

    /// Raid-relative blocks consumed by every copy of the paged region.
    pub fn paged_region_blocks(&self) -> u64 {
        self.paged_metadata_capacity() * u64::from(self.paged_copies)
    }

    /// Metadata block, relative to the paged region, holding the record
    /// for `chunk_index`.
    pub fn metadata_lba(&self, chunk_index: u64) -> u64 {
        (chunk_index * CHUNK_ENTRY_SIZE) / METADATA_BLOCK_DATA_SIZE
    }
}

impl Default for GroupDefinition {
    fn default() -> GroupDefinition {
        // The default options always validate.
        let opts = GroupOptions::default();
        GroupDefinition {
            uuid: opts.uuid,
            width: opts.width,
            data_disks: opts.data_disks,
            chunk_size: opts.chunk_size,
            exported_disk_capacity: opts.exported_disk_capacity,
            paged_disk_capacity: opts.paged_disk_capacity,
            paged_copies: opts.paged_copies,
            journal: opts.journal,
            has_paged_metadata: opts.has_paged_metadata,
            encrypted: opts.encrypted,
            peer_update_interval_ms: opts.peer_update_interval_ms,
            max_chunks_per_request: opts.max_chunks_per_request,
            four_k_committed: opts.four_k_committed,
        }
    }
}
