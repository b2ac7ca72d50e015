// Copyright 2023 Oxide Computer Company
//! Reads and updates of per-chunk records.  User data records go through
//! the metadata service in bounded requests; records for the paged region
//! itself come from the metadata of metadata in the non-paged record.
use super::*;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::chunk::{classify, ChunkRange};
use crate::raid_group::ConditionSet;

/// The block operation an I/O context was last used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum BlockOpcode {
    Read,
    Write,
    WriteNoncached,
    RekeyWrite,
    Zero,
    Verify,
    Rebuild,
}

/// The caller's in-flight I/O state that a single chunk update may fill in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoContext {
    pub prior_op: Option<BlockOpcode>,
    pub chunk_info: Option<PagedChunkRecord>,
}

impl IoContext {
    pub fn new(prior_op: BlockOpcode) -> Self {
        IoContext {
            prior_op: Some(prior_op),
            chunk_info: None,
        }
    }

    fn wants_chunk_info(&self) -> bool {
        matches!(
            self.prior_op,
            Some(
                BlockOpcode::Write
                    | BlockOpcode::WriteNoncached
                    | BlockOpcode::RekeyWrite
            )
        )
    }

    /*
     * Keep the record a single chunk update produced, so the I/O does not
     * have to read it back.  A context that already holds a record has
     * been used for another chunk; it is dropped rather than trusted.
     */
    fn cache_chunk_info(&mut self, record: PagedChunkRecord) {
        if !self.wants_chunk_info() {
            return;
        }
        self.chunk_info = match self.chunk_info {
            None => Some(record),
            Some(_) => None,
        };
    }
}

enum UpdateState {
    Set { offset: u64, remaining: u64 },
    Done,
}

pub struct PagedAccessor {
    log: Logger,
    def: GroupDefinition,
    service: Arc<dyn MetadataService>,
    store: Arc<NonPagedStore>,
    mdd: MddMap,
    conditions: Arc<ConditionSet>,

    /// Debug override: accept rebuild bits the non-paged state does not
    /// justify.
    skip_nr_validation: AtomicBool,
}

impl PagedAccessor {
    pub fn new(
        log: &Logger,
        service: Arc<dyn MetadataService>,
        store: Arc<NonPagedStore>,
        conditions: Arc<ConditionSet>,
    ) -> Self {
        let def = store.definition().clone();
        PagedAccessor {
            log: log.new(o!("component" => "paged")),
            mdd: MddMap::new(&def),
            def,
            service,
            store,
            conditions,
            skip_nr_validation: AtomicBool::new(false),
        }
    }

    pub fn mdd(&self) -> &MddMap {
        &self.mdd
    }

    pub fn set_skip_nr_validation(&self, skip: bool) {
        if skip {
            warn!(self.log, "rebuild bit validation disabled");
        }
        self.skip_nr_validation.store(skip, Ordering::SeqCst);
    }

    fn max_chunks(&self) -> u64 {
        self.service.max_chunks_per_request().max(1)
    }

    /// Build a request for `range`, holding the stripe lock on the raid
    /// LBAs it covers.
    fn request(&self, range: ChunkRange) -> PagedRequest {
        let per_chunk = self.def.chunk_size() * u64::from(self.def.data_disks());
        PagedRequest {
            start: range.start,
            count: range.count,
            stripe: range.start * per_chunk..range.end() * per_chunk,
        }
    }

    /// Turn a service failure into the caller's error.  A non-retryable
    /// failure also means the paged metadata may be damaged: raise the
    /// conditions that degrade the group and re-verify it.
    pub fn handle_metadata_error(
        &self,
        status: MetadataStatus,
    ) -> Result<(), RaidMetaError> {
        let res = status.translate();
        match &res {
            Err(RaidMetaError::NotRetryable(_)) => {
                warn!(
                    self.log,
                    "paged metadata failed with {}, degrading group", status
                );
                self.conditions.raise(LifecycleCondition::ClusteredActivate);
                self.conditions
                    .raise(LifecycleCondition::SetupForVerifyPagedMetadata);
                self.conditions
                    .raise(LifecycleCondition::EvalRebuildLoggingActivate);
            }
            Err(e) => {
                warn!(self.log, "paged metadata failed: {}", e);
            }
            Ok(()) => {}
        }
        res
    }

    fn reject_journal(&self, range: ChunkRange) -> RaidMetaError {
        RaidMetaError::ChunkOutOfRange(format!(
            "journal chunks {:#x}+{:#x} have no paged records",
            range.start, range.count
        ))
    }

    /// Records for `range`, one per chunk.
    pub async fn read(
        &self,
        range: ChunkRange,
    ) -> Result<Vec<PagedChunkRecord>, RaidMetaError> {
        match classify(&self.def, range)? {
            ChunkArea::UserData => self.read_paged(range).await,
            ChunkArea::PagedMetadata => {
                if range.count > MDD_SLOTS as u64 {
                    raid_bail!(
                        ChunkCountExceeded,
                        "{} metadata chunks in one read, max {}",
                        range.count,
                        MDD_SLOTS
                    );
                }
                self.mdd.populate(&self.store.snapshot(), range)
            }
            ChunkArea::Journal => Err(self.reject_journal(range)),
        }
    }

    async fn read_paged(
        &self,
        range: ChunkRange,
    ) -> Result<Vec<PagedChunkRecord>, RaidMetaError> {
        let mut out = Vec::with_capacity(range.count as usize);
        let mut offset = range.start;
        while offset < range.end() {
            let count = (range.end() - offset).min(self.max_chunks());
            let req = self.request(ChunkRange::new(offset, count));
            match self.service.paged_read(&req).await {
                Ok(records) => out.extend(records),
                Err(s) => {
                    self.handle_metadata_error(s)?;
                    // Corrected, but nothing came back
                    raid_bail!(Retryable, "paged read returned {}", s);
                }
            }
            offset += count;
        }
        Ok(out)
    }

    /// Reject rebuild bits that the non-paged state would not produce for
    /// this range.
    fn validate_nr_bits(
        &self,
        range: ChunkRange,
        record: &PagedChunkRecord,
    ) -> Result<(), RaidMetaError> {
        if self.skip_nr_validation.load(Ordering::SeqCst)
            || record.needs_rebuild == 0
        {
            return Ok(());
        }
        let allowed = self.store.determine_nr_bits(range)?;
        if record.needs_rebuild & !allowed != 0 {
            error!(
                self.log,
                "chunks {:#x}+{:#x}: rebuild bits {:#x} not in {:#x}",
                range.start,
                range.count,
                record.needs_rebuild,
                allowed
            );
            raid_bail!(
                RebuildBitsValidation,
                "bits {:#x} not justified by {:#x}",
                record.needs_rebuild,
                allowed
            );
        }
        Ok(())
    }

    /// Apply `record` to every chunk of `range`.
    ///
    /// A single chunk set hands its resulting record to `ctx` when the
    /// context's last operation was a user write.
    pub async fn update(
        &self,
        range: ChunkRange,
        op: PagedOp,
        record: PagedChunkRecord,
        ctx: Option<&mut IoContext>,
    ) -> Result<(), RaidMetaError> {
        if op == PagedOp::Set {
            self.validate_nr_bits(range, &record)?;
        }

        match classify(&self.def, range)? {
            ChunkArea::UserData => {
                self.update_paged(range, op, record, ctx).await
            }
            ChunkArea::PagedMetadata => {
                self.write_chunk_info_using_nonpaged(range, op, record).await
            }
            ChunkArea::Journal => Err(self.reject_journal(range)),
        }
    }

    async fn update_paged(
        &self,
        range: ChunkRange,
        op: PagedOp,
        record: PagedChunkRecord,
        mut ctx: Option<&mut IoContext>,
    ) -> Result<(), RaidMetaError> {
        let max = self.max_chunks();
        let mut state = UpdateState::Set {
            offset: range.start,
            remaining: range.count,
        };

        loop {
            let (offset, remaining) = match state {
                UpdateState::Set { offset, remaining } => (offset, remaining),
                UpdateState::Done => break,
            };
            let count = remaining.min(max);
            let req = self.request(ChunkRange::new(offset, count));
            let after = match self.service.paged_update(&req, op, record).await
            {
                Ok(after) => after,
                Err(s) => {
                    self.handle_metadata_error(s)?;
                    None
                }
            };

            if range.count == 1 && op == PagedOp::Set {
                if let (Some(ctx), Some(after)) = (ctx.as_deref_mut(), after) {
                    ctx.cache_chunk_info(after);
                }
            }

            state = if count >= remaining {
                UpdateState::Done
            } else {
                debug!(
                    self.log,
                    "paged {} continues at {:#x}",
                    op,
                    offset + count
                );
                UpdateState::Set {
                    offset: offset + count,
                    remaining: remaining - count,
                }
            };
        }
        Ok(())
    }

    /// Updates to the paged region land in the metadata of metadata.
    pub async fn write_chunk_info_using_nonpaged(
        &self,
        range: ChunkRange,
        op: PagedOp,
        record: PagedChunkRecord,
    ) -> Result<(), RaidMetaError> {
        if range.count > self.mdd.metadata_chunks() {
            raid_bail!(
                ChunkCountExceeded,
                "{} chunks, only {} metadata chunks",
                range.count,
                self.mdd.metadata_chunks()
            );
        }

        match op {
            PagedOp::Set => self.np_set_bits(record).await,
            PagedOp::Clear => {
                let n = self.mdd.clearable_slot_count(range)?;
                let first = self.mdd.physical_to_slot(range.start)?;
                self.store
                    .clear_mdd_bits(first, n as usize, record)
                    .await
            }
            PagedOp::Write => {
                let first = self.mdd.physical_to_slot(range.start)?;
                let last = self.mdd.physical_to_slot(range.last())?;
                self.store
                    .write_mdd_slots(first, last - first + 1, record)
                    .await
            }
        }
    }

    /*
     * A set marks every slot in use; the rebuild checkpoints filter the
     * bits back out per chunk on read.
     */
    async fn np_set_bits(
        &self,
        record: PagedChunkRecord,
    ) -> Result<(), RaidMetaError> {
        let slots = self.mdd.slot_count()?;
        let already = (0..slots).all(|slot| {
            self.store
                .mdd_slot(slot)
                .is_some_and(|r| r.contains(&record))
        });
        if already {
            debug!(self.log, "mdd slots already marked {:#x}", record.to_wire());
            return Ok(());
        }
        self.store.set_mdd_bits(0, slots, record).await
    }

    /// Write the default record to every user chunk.
    pub async fn write_default_paged(&self) -> Result<(), RaidMetaError> {
        if !self.def.has_paged_metadata() || self.def.exported_chunks() == 0 {
            return Ok(());
        }
        let range = ChunkRange::new(0, self.def.exported_chunks());
        let req = self.request(range);
        if let Err(s) = self
            .service
            .paged_write_repeat(&req, PagedChunkRecord::initialized())
            .await
        {
            self.handle_metadata_error(s)?;
        }
        info!(self.log, "wrote default paged metadata for {} chunks", range.count);
        Ok(())
    }

    /// Invoke `observe` once per record of `range`, in chunk order.
    pub async fn scan(
        &self,
        range: ChunkRange,
        observe: &mut (dyn FnMut(u64, PagedChunkRecord) + Send),
    ) -> Result<(), RaidMetaError> {
        let mut offset = range.start;
        while offset < range.end() {
            let count = (range.end() - offset).min(self.max_chunks());
            let req = self.request(ChunkRange::new(offset, count));
            if let Err(s) = self.service.paged_scan(&req, observe).await {
                self.handle_metadata_error(s)?;
            }
            offset += count;
        }
        Ok(())
    }

    /// Rewrite every record of `range` through `rewrite`, carrying on past
    /// records that cannot be read.
    pub async fn write_verify(
        &self,
        range: ChunkRange,
        rewrite: &mut (dyn FnMut(u64, PagedChunkRecord) -> PagedChunkRecord
                  + Send),
    ) -> Result<(), RaidMetaError> {
        let mut offset = range.start;
        while offset < range.end() {
            let count = (range.end() - offset).min(self.max_chunks());
            let req = self.request(ChunkRange::new(offset, count));
            if let Err(s) = self.service.paged_write_verify(&req, rewrite).await
            {
                self.handle_metadata_error(s)?;
            }
            offset += count;
        }
        Ok(())
    }
}
