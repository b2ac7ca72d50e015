// Copyright 2023 Oxide Computer Company
//! The collaborators this crate drives: the metadata service that stores
//! paged and non-paged metadata, and the block layer used to verify user
//! data during a rekey.
use super::*;

use std::ops::Range;

/// Status returned by the metadata service for a failed request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum MetadataStatus {
    Busy,
    Timeout,
    Aborted,
    IoCorrectable,
    IoRetryable,
    IoNotRetryable,
    IoUncorrectable,
    Failure,
    Cancelled,
    /// Anything the service does not classify.
    Other,
}

impl MetadataStatus {
    /// Map a service status onto the error a caller sees.  A correctable
    /// I/O error is a success: the service already fixed it.
    pub fn translate(self) -> Result<(), RaidMetaError> {
        match self {
            MetadataStatus::IoCorrectable => Ok(()),
            MetadataStatus::Busy
            | MetadataStatus::Timeout
            | MetadataStatus::Aborted
            | MetadataStatus::IoRetryable => {
                Err(RaidMetaError::Retryable(self.to_string()))
            }
            MetadataStatus::IoNotRetryable
            | MetadataStatus::Failure
            | MetadataStatus::IoUncorrectable => {
                Err(RaidMetaError::NotRetryable(self.to_string()))
            }
            MetadataStatus::Cancelled => Err(RaidMetaError::Canceled),
            MetadataStatus::Other => {
                Err(RaidMetaError::GenericFailure(self.to_string()))
            }
        }
    }
}

/// How a paged update combines with what is already on disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum PagedOp {
    /// OR the record into each chunk.
    Set,
    /// Clear the record's bits from each chunk.
    Clear,
    /// Replace each chunk with the record.
    Write,
}

/// One bounded request against the paged metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedRequest {
    pub start: u64,
    pub count: u64,

    /// Raid-relative LBA range to hold the stripe lock on for the
    /// duration of the request.
    pub stripe: Range<u64>,
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Largest chunk count a single paged request may carry.
    fn max_chunks_per_request(&self) -> u64;

    async fn paged_read(
        &self,
        req: &PagedRequest,
    ) -> Result<Vec<PagedChunkRecord>, MetadataStatus>;

    /// Apply `record` to every chunk of `req` (a write with repeat count).
    ///
    /// When the request covers exactly one chunk the service returns the
    /// chunk's record as it stands after the update.
    async fn paged_update(
        &self,
        req: &PagedRequest,
        op: PagedOp,
        record: PagedChunkRecord,
    ) -> Result<Option<PagedChunkRecord>, MetadataStatus>;

    /// Write `record` to every chunk of `req` as a single write with
    /// repeat count.  The request is not bound by
    /// [`MetadataService::max_chunks_per_request`].
    async fn paged_write_repeat(
        &self,
        req: &PagedRequest,
        record: PagedChunkRecord,
    ) -> Result<(), MetadataStatus>;

    /// Read every chunk of `req`, let `rewrite` produce its replacement,
    /// and write the result back.  Chunks that cannot be read are handed
    /// to `rewrite` as invalid records rather than failing the request.
    async fn paged_write_verify(
        &self,
        req: &PagedRequest,
        rewrite: &mut (dyn FnMut(u64, PagedChunkRecord) -> PagedChunkRecord
                  + Send),
    ) -> Result<(), MetadataStatus>;

    /// Invoke `observe` once per resident record of `req`, in chunk order.
    async fn paged_scan(
        &self,
        req: &PagedRequest,
        observe: &mut (dyn FnMut(u64, PagedChunkRecord) + Send),
    ) -> Result<(), MetadataStatus>;

    /// Read the whole persisted non-paged image.
    async fn nonpaged_read(&self) -> Result<Vec<u8>, MetadataStatus>;

    /// Synchronously persist `data` at `offset`; the peer sees it too.
    async fn nonpaged_write_persist(
        &self,
        offset: usize,
        data: &[u8],
    ) -> Result<(), MetadataStatus>;

    /// Set a checkpoint and push it to the peer.
    async fn nonpaged_force_set_checkpoint(
        &self,
        offset: usize,
        value: u64,
    ) -> Result<(), MetadataStatus>;

    /// Move a checkpoint locally, without telling the peer.
    async fn nonpaged_increment_checkpoint(
        &self,
        offset: usize,
        value: u64,
    ) -> Result<(), MetadataStatus>;

    /// OR `data` into `repeat` consecutive elements of `data.len()` bytes
    /// starting at `offset`, and persist them.
    async fn nonpaged_set_bits(
        &self,
        offset: usize,
        data: &[u8],
        repeat: usize,
    ) -> Result<(), MetadataStatus>;

    /// The inverse of [`MetadataService::nonpaged_set_bits`].
    async fn nonpaged_clear_bits(
        &self,
        offset: usize,
        data: &[u8],
        repeat: usize,
    ) -> Result<(), MetadataStatus>;

    /// Acquire the group-wide distributed non-paged lock.
    async fn acquire_np_lock(&self) -> Result<(), MetadataStatus>;

    async fn release_np_lock(&self);

    /// Memory for a scan or verify round.  Suspends until it is available.
    async fn allocate(&self, chunks: u64) -> Result<(), MetadataStatus>;
}

/// Which key a verify read should decrypt with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum KeyGeneration {
    Current,
    New,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Blocks with uncorrectable, multi-bit checksum errors.
    pub u_crc_multi_count: u64,
    /// Blocks with correctable checksum errors.
    pub c_crc_count: u64,
}

#[async_trait]
pub trait BlockVerifier: Send + Sync {
    /// Read-only verify of `blocks` blocks at per-disk `lba`.
    async fn verify_read_only(
        &self,
        lba: u64,
        blocks: u64,
        key: KeyGeneration,
    ) -> Result<VerifyReport, RaidMetaError>;
}
