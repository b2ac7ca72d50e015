// Copyright 2023 Oxide Computer Company
use super::*;

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::chunk::{chunk_range, classify, ChunkRange};

/// Follow-up work the group's lifecycle owes after a metadata failure.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum LifecycleCondition {
    /// Drop to the degraded state and re-activate with the peer.
    ClusteredActivate,
    /// Re-verify the paged metadata.
    SetupForVerifyPagedMetadata,
    /// Decide whether a lost drive should start rebuild logging.
    EvalRebuildLoggingActivate,
}

/// The conditions raised on a group and not yet picked up.
#[derive(Debug, Default)]
pub struct ConditionSet {
    raised: Mutex<BTreeSet<LifecycleCondition>>,
}

impl ConditionSet {
    fn raised(&self) -> MutexGuard<'_, BTreeSet<LifecycleCondition>> {
        self.raised.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false if `cond` was already pending.
    pub fn raise(&self, cond: LifecycleCondition) -> bool {
        self.raised().insert(cond)
    }

    pub fn contains(&self, cond: LifecycleCondition) -> bool {
        self.raised().contains(&cond)
    }

    pub fn pending(&self) -> Vec<LifecycleCondition> {
        self.raised().iter().copied().collect()
    }

    /// Hand every pending condition to the caller.
    pub fn take(&self) -> Vec<LifecycleCondition> {
        std::mem::take(&mut *self.raised()).into_iter().collect()
    }
}

/**
 * One group's chunk metadata: the non-paged store, the checkpoint engine,
 * the paged accessor and the reconstruction machine, sharing one metadata
 * service.
 *
 * Ranges passed in are per-disk LBAs.
 */
pub struct RaidGroup {
    log: Logger,
    def: GroupDefinition,
    store: Arc<NonPagedStore>,
    engine: Arc<CheckpointEngine>,
    paged: Arc<PagedAccessor>,
    reconstructor: Reconstructor,
    conditions: Arc<ConditionSet>,
}

impl RaidGroup {
    /// Attach to a group's existing metadata.
    pub async fn open(
        log: &Logger,
        def: GroupDefinition,
        service: Arc<dyn MetadataService>,
        verifier: Arc<dyn BlockVerifier>,
    ) -> Result<RaidGroup, RaidMetaError> {
        let log = log.new(o!("group" => def.uuid().to_string()));
        let store =
            Arc::new(NonPagedStore::load(&log, def.clone(), service.clone()).await?);
        let conditions = Arc::new(ConditionSet::default());
        let paged = Arc::new(PagedAccessor::new(
            &log,
            service.clone(),
            store.clone(),
            conditions.clone(),
        ));
        let engine = Arc::new(CheckpointEngine::new(&log, store.clone()));
        let reconstructor = Reconstructor::new(
            &log,
            service,
            verifier,
            paged.clone(),
            engine.clone(),
        );

        info!(
            log,
            "opened group: {} chunks exported, {} total, nonpaged {}",
            def.exported_chunks(),
            def.total_chunks(),
            if store.is_initialized() {
                "initialized"
            } else {
                "blank"
            }
        );
        Ok(RaidGroup {
            log,
            def,
            store,
            engine,
            paged,
            reconstructor,
            conditions,
        })
    }

    /// Open a new group and write its default metadata.
    pub async fn create(
        log: &Logger,
        def: GroupDefinition,
        service: Arc<dyn MetadataService>,
        verifier: Arc<dyn BlockVerifier>,
    ) -> Result<RaidGroup, RaidMetaError> {
        let group = RaidGroup::open(log, def, service, verifier).await?;
        group.store.set_default_nonpaged().await?;
        group.paged.write_default_paged().await?;
        info!(group.log, "created group");
        Ok(group)
    }

    pub fn definition(&self) -> &GroupDefinition {
        &self.def
    }

    pub fn store(&self) -> &Arc<NonPagedStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<CheckpointEngine> {
        &self.engine
    }

    pub fn paged(&self) -> &Arc<PagedAccessor> {
        &self.paged
    }

    pub fn reconstructor(&self) -> &Reconstructor {
        &self.reconstructor
    }

    pub fn conditions(&self) -> &Arc<ConditionSet> {
        &self.conditions
    }

    fn range(&self, lba: u64, blocks: u64) -> Result<ChunkRange, RaidMetaError> {
        chunk_range(&self.def, lba, blocks)
    }

    pub fn classify(
        &self,
        lba: u64,
        blocks: u64,
    ) -> Result<ChunkArea, RaidMetaError> {
        classify(&self.def, self.range(lba, blocks)?)
    }

    pub async fn read_chunk_info(
        &self,
        lba: u64,
        blocks: u64,
    ) -> Result<Vec<PagedChunkRecord>, RaidMetaError> {
        self.paged.read(self.range(lba, blocks)?).await
    }

    /// Mark the chunks under `lba` for a `kind` verify and make sure a
    /// pass will visit them.
    pub async fn mark_for_verify(
        &self,
        kind: VerifyKind,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let range = self.range(lba, blocks)?;
        let record = PagedChunkRecord::with_verify(kind.verify_bits());
        self.paged.update(range, PagedOp::Set, record, None).await?;
        self.engine.mark_for_verify(kind).await
    }

    /// The `kind` pass finished the chunks under `lba`.
    pub async fn verify_complete(
        &self,
        kind: VerifyKind,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let range = self.range(lba, blocks)?;
        let record = PagedChunkRecord::with_verify(kind.verify_bits());
        self.paged.update(range, PagedOp::Clear, record, None).await?;
        self.engine.update_verify_checkpoint(kind, lba, blocks).await
    }

    /// Mark the chunks under `lba` as needing rebuild on `positions`.
    pub async fn mark_needs_rebuild(
        &self,
        lba: u64,
        blocks: u64,
        positions: u16,
        ctx: Option<&mut IoContext>,
    ) -> Result<(), RaidMetaError> {
        let range = self.range(lba, blocks)?;
        let record = PagedChunkRecord::with_needs_rebuild(positions);
        self.paged.update(range, PagedOp::Set, record, ctx).await
    }

    /// `position` is rebuilt for the chunks under `lba`.
    pub async fn rebuild_complete(
        &self,
        position: u32,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        if position >= self.def.width() {
            raid_bail!(
                InvalidPosition,
                "position {} >= width {}",
                position,
                self.def.width()
            );
        }
        let range = self.range(lba, blocks)?;
        let record = PagedChunkRecord::with_needs_rebuild(1 << position);
        self.paged.update(range, PagedOp::Clear, record, None).await?;
        self.engine
            .update_rebuild_checkpoint(position, lba, blocks)
            .await
    }

    pub async fn reconstruct_paged(
        &self,
        lba: u64,
        blocks: u64,
    ) -> Result<(), RaidMetaError> {
        self.reconstructor.start(lba, blocks).await
    }

    pub async fn reconstruct_all_paged(&self) -> Result<(), RaidMetaError> {
        self.reconstructor.reconstruct_all_paged().await
    }
}
