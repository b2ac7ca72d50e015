// Copyright 2023 Oxide Computer Company
//! Regenerate paged records from the non-paged record when the paged
//! region can no longer be trusted.
//!
//! For an encrypted group the records are first scanned to find how far
//! the rekey got, and any unreadable records past that point are settled
//! by verifying the data under the new key.  Then every bad record in the
//! target range is rewritten from the non-paged checkpoints.
use super::*;

use strum::IntoEnumIterator;
use tokio::sync::Mutex;

use crate::chunk::{
    chunk_range, chunk_range_to_lba_range, classify, user_range_for_paged_range,
    ChunkRange,
};

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
pub enum ReconstructState {
    Invalid,
    ScanPaged,
    Verify,
    ReconstructPaged,
    Done,
}

/// What a scan of the paged region found.  Rebuilt from scratch every
/// time a scan runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanAccumulator {
    /// The run of unreadable records after the last rekeyed chunk.
    pub first_invalid: Option<u64>,
    pub last_invalid: Option<u64>,

    pub first_non_rekeyed: Option<u64>,
    pub last_rekeyed: Option<u64>,
}

impl ScanAccumulator {
    pub fn observe(&mut self, chunk: u64, record: PagedChunkRecord) {
        if !record.valid {
            if self.first_invalid.is_none() {
                self.first_invalid = Some(chunk);
            }
            self.last_invalid = Some(chunk);
        } else if !record.rekey {
            if self.first_non_rekeyed.is_none() {
                self.first_non_rekeyed = Some(chunk);
            }
        } else {
            // Anything unreadable before a rekeyed chunk was rekeyed too
            self.first_invalid = None;
            self.last_invalid = None;
            self.last_rekeyed = Some(chunk);
        }
    }

    /// The rekey checkpoint the scan justifies: just past the last chunk
    /// seen rekeyed.
    pub fn rekey_checkpoint(&self, chunk_size: u64) -> Option<u64> {
        self.last_rekeyed.map(|c| (c + 1) * chunk_size)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReconstructContext {
    pub state: ReconstructState,

    /// Per-disk range of paged metadata being reconstructed.
    pub verify_start: u64,
    pub verify_blocks: u64,

    /// Rekey checkpoint when reconstruction began.
    pub orig_rekey_checkpoint: u64,

    pub scan: ScanAccumulator,
}

/**
 * The paged record for every chunk of `range` as the non-paged record
 * describes it.
 *
 * A verify pass needs the range if its checkpoint is inside it, or if
 * the checkpoint has moved on to the paged region.  A position needs
 * rebuilding if it is rebuild logging, or its rebuild checkpoint is at
 * or before the range or already in the paged region.  The range is
 * rekeyed only if it lies wholly below the rekey checkpoint.  An empty
 * range is rejected.
 */
pub fn set_paged_bits_from_nonpaged(
    def: &GroupDefinition,
    np: &NonPagedRecord,
    range: ChunkRange,
) -> Result<PagedChunkRecord, RaidMetaError> {
    let (start_lba, end_lba) = chunk_range_to_lba_range(def, range)?;
    let paged_start = def.exported_disk_capacity();
    let mut record = PagedChunkRecord::initialized();

    for kind in VerifyKind::iter() {
        let c = np.verify_checkpoint(kind);
        if c == LBA_INVALID {
            continue;
        }
        if (start_lba..=end_lba).contains(&c) || c >= paged_start {
            record.verify.insert(kind.verify_bits());
        }
    }

    let rekey = np.encryption.rekey_checkpoint;
    record.rekey =
        rekey != LBA_INVALID && rekey != 0 && start_lba < rekey && end_lba < rekey;

    record.needs_rebuild = np.rebuild_info.rebuild_logging_bitmask;
    for c in np.rebuild_info.checkpoints.iter() {
        if c.checkpoint == LBA_INVALID || c.position >= MAX_WIDTH {
            continue;
        }
        if c.checkpoint <= start_lba || c.checkpoint >= paged_start {
            record.needs_rebuild |= 1 << c.position;
        }
    }
    Ok(record)
}

/// Drives one paged reconstruction at a time to completion.
pub struct Reconstructor {
    log: Logger,
    def: GroupDefinition,
    service: Arc<dyn MetadataService>,
    verifier: Arc<dyn BlockVerifier>,
    paged: Arc<PagedAccessor>,
    engine: Arc<CheckpointEngine>,

    /// Present from the first start until the machine reaches Done.
    context: Mutex<Option<ReconstructContext>>,
}

impl Reconstructor {
    pub fn new(
        log: &Logger,
        service: Arc<dyn MetadataService>,
        verifier: Arc<dyn BlockVerifier>,
        paged: Arc<PagedAccessor>,
        engine: Arc<CheckpointEngine>,
    ) -> Self {
        let def = engine.store().definition().clone();
        Reconstructor {
            log: log.new(o!("component" => "reconstruct")),
            def,
            service,
            verifier,
            paged,
            engine,
            context: Mutex::new(None),
        }
    }

    fn store(&self) -> &Arc<NonPagedStore> {
        self.engine.store()
    }

    pub async fn context(&self) -> Option<ReconstructContext> {
        *self.context.lock().await
    }

    pub async fn state(&self) -> ReconstructState {
        self.context
            .lock()
            .await
            .map(|c| c.state)
            .unwrap_or(ReconstructState::Invalid)
    }

    /// Set up a reconstruction of the paged metadata at per-disk
    /// `verify_start`.  A reconstruction already under way is left as is,
    /// so a caller retrying after a failure resumes where it stopped.
    pub async fn begin(
        &self,
        verify_start: u64,
        verify_blocks: u64,
    ) -> Result<ReconstructState, RaidMetaError> {
        if !self.def.has_paged_metadata() {
            raid_bail!(InvalidConfig, "group has no paged metadata");
        }

        let mut context = self.context.lock().await;
        if let Some(ctx) = context.as_ref() {
            if ctx.verify_start != verify_start
                || ctx.verify_blocks != verify_blocks
            {
                warn!(
                    self.log,
                    "resuming reconstruct of {:#x}+{:#x}, not {:#x}+{:#x}",
                    ctx.verify_start,
                    ctx.verify_blocks,
                    verify_start,
                    verify_blocks
                );
            }
            return Ok(ctx.state);
        }

        let state = if self.def.encrypted() {
            ReconstructState::ScanPaged
        } else {
            ReconstructState::ReconstructPaged
        };
        let ctx = ReconstructContext {
            state,
            verify_start,
            verify_blocks,
            orig_rekey_checkpoint: self.store().rekey_checkpoint(),
            scan: ScanAccumulator::default(),
        };
        info!(
            self.log,
            "reconstruct paged {:#x}+{:#x} from {}",
            verify_start,
            verify_blocks,
            state
        );
        *context = Some(ctx);
        Ok(state)
    }

    /// Reconstruct the paged metadata at per-disk `verify_start` and run
    /// the machine until it is done.  On failure the context is kept for
    /// the next call.
    pub async fn start(
        &self,
        verify_start: u64,
        verify_blocks: u64,
    ) -> Result<(), RaidMetaError> {
        self.begin(verify_start, verify_blocks).await?;
        loop {
            match self.step().await? {
                ReconstructState::Invalid => return Ok(()),
                state => debug!(self.log, "reconstruct now {}", state),
            }
        }
    }

    /// Reconstruct the whole paged region.
    pub async fn reconstruct_all_paged(&self) -> Result<(), RaidMetaError> {
        self.start(
            self.def.exported_disk_capacity(),
            self.def.paged_disk_capacity(),
        )
        .await
    }

    /// Run the current state once and return the state it left behind.
    /// Done releases the context and reports Invalid.
    pub async fn step(&self) -> Result<ReconstructState, RaidMetaError> {
        let mut guard = self.context.lock().await;
        let Some(ctx) = guard.as_mut() else {
            return Ok(ReconstructState::Invalid);
        };

        let next = match ctx.state {
            ReconstructState::ScanPaged => self.scan_paged(ctx).await?,
            ReconstructState::Verify => self.verify(ctx).await?,
            ReconstructState::ReconstructPaged => {
                self.reconstruct_paged(ctx).await?
            }
            ReconstructState::Done => {
                info!(
                    self.log,
                    "reconstruct paged {:#x}+{:#x} done",
                    ctx.verify_start,
                    ctx.verify_blocks
                );
                *guard = None;
                return Ok(ReconstructState::Invalid);
            }
            ReconstructState::Invalid => {
                error!(self.log, "reconstruct context in state Invalid");
                ReconstructState::Done
            }
        };
        ctx.state = next;
        Ok(next)
    }

    async fn allocate(&self, chunks: u64) -> Result<(), RaidMetaError> {
        if let Err(s) = self.service.allocate(chunks).await {
            warn!(self.log, "reconstruct allocation failed: {}", s);
            s.translate()?;
        }
        Ok(())
    }

    /*
     * Find how far the rekey got: the scan starts at the rekey checkpoint
     * and runs to the end of the user chunks.  The checkpoint moves up to
     * the last rekeyed chunk; unreadable records past it still have to be
     * verified.
     */
    async fn scan_paged(
        &self,
        ctx: &mut ReconstructContext,
    ) -> Result<ReconstructState, RaidMetaError> {
        let chunk_size = self.def.chunk_size();
        let exported = self.def.exported_chunks();
        let rekey = self.store().rekey_checkpoint();
        let first = if rekey == LBA_INVALID {
            0
        } else {
            rekey / chunk_size
        };

        ctx.scan = ScanAccumulator::default();
        if first < exported {
            let range = ChunkRange::new(first, exported - first);
            self.allocate(range.count).await?;
            let mut acc = ScanAccumulator::default();
            self.paged
                .scan(range, &mut |chunk, record| acc.observe(chunk, record))
                .await?;
            ctx.scan = acc;
        }
        info!(
            self.log,
            "reconstruct scan from chunk {:#x}: {:?}", first, ctx.scan
        );

        if let Some(new) = ctx.scan.rekey_checkpoint(chunk_size) {
            if rekey == LBA_INVALID || new > rekey {
                self.engine.advance_rekey_checkpoint(new).await?;
                info!(
                    self.log,
                    "rekey checkpoint {:#x} -> {:#x}", rekey, new
                );
            }
        }

        Ok(if ctx.scan.first_invalid.is_some() {
            ReconstructState::Verify
        } else {
            ReconstructState::ReconstructPaged
        })
    }

    /*
     * Read the chunk at the rekey checkpoint with the new key.  If it
     * reads, it was rekeyed and the checkpoint moves past it.  If most of
     * it fails, the data is still under the old key and the checkpoint
     * stays where it is.
     */
    async fn verify(
        &self,
        ctx: &mut ReconstructContext,
    ) -> Result<ReconstructState, RaidMetaError> {
        let chunk_size = self.def.chunk_size();
        let Some(last_invalid) = ctx.scan.last_invalid else {
            return Ok(ReconstructState::ReconstructPaged);
        };
        let lba = self.store().rekey_checkpoint();
        if lba == LBA_INVALID || lba > last_invalid * chunk_size {
            return Ok(ReconstructState::ReconstructPaged);
        }

        self.allocate(1).await?;
        let report = match self
            .verifier
            .verify_read_only(lba, chunk_size, KeyGeneration::New)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(self.log, "reconstruct verify at {:#x} failed: {}", lba, e);
                return Err(e);
            }
        };

        if report.u_crc_multi_count > chunk_size / 2 {
            info!(
                self.log,
                "chunk at {:#x} still under the old key ({} bad blocks)",
                lba,
                report.u_crc_multi_count
            );
            return Ok(ReconstructState::ReconstructPaged);
        }

        debug!(
            self.log,
            "chunk at {:#x} reads with the new key ({} correctable)",
            lba,
            report.c_crc_count
        );
        self.engine.advance_rekey_checkpoint(lba + chunk_size).await?;
        Ok(ReconstructState::Verify)
    }

    async fn reconstruct_paged(
        &self,
        ctx: &mut ReconstructContext,
    ) -> Result<ReconstructState, RaidMetaError> {
        let paged_range =
            chunk_range(&self.def, ctx.verify_start, ctx.verify_blocks)?;
        if classify(&self.def, paged_range)? != ChunkArea::PagedMetadata {
            error!(
                self.log,
                "reconstruct range {:#x}+{:#x} is not paged metadata",
                ctx.verify_start,
                ctx.verify_blocks
            );
            raid_bail!(
                ReconstructFailed,
                "chunks {:#x}+{:#x} are user data",
                paged_range.start,
                paged_range.count
            );
        }

        let exported = self.def.exported_chunks();
        let user = user_range_for_paged_range(&self.def, paged_range)?;
        if user.start >= exported {
            return Ok(ReconstructState::Done);
        }
        let user = ChunkRange::new(user.start, user.count.min(exported - user.start));

        self.store().acquire_np_lock().await?;
        let res = self.update_nonpaged_if_needed(user).await;
        self.store().release_np_lock().await;
        if res? {
            info!(
                self.log,
                "reset nonpaged checkpoints for chunks {:#x}+{:#x}",
                user.start,
                user.count
            );
        }

        let np = self.store().snapshot();
        let degraded = self.store().degraded_bitmask();
        let def = &self.def;
        let mut rebuilt = 0u64;
        let mut failure = None;
        self.paged
            .write_verify(user, &mut |chunk, record| {
                let extra = record.needs_rebuild & !degraded;
                if record.valid && extra == 0 {
                    return record;
                }
                let one = ChunkRange::new(chunk, 1);
                match set_paged_bits_from_nonpaged(def, &np, one) {
                    Ok(r) => {
                        rebuilt += 1;
                        r
                    }
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                        record
                    }
                }
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }

        info!(
            self.log,
            "rebuilt {} of {} paged records", rebuilt, user.count
        );
        Ok(ReconstructState::Done)
    }

    /// Reset every rebuild and verify checkpoint that falls inside the
    /// user chunks `range` back to the start of the range, and persist the
    /// record if anything moved.  The caller holds the NP lock.
    pub async fn update_nonpaged_if_needed(
        &self,
        range: ChunkRange,
    ) -> Result<bool, RaidMetaError> {
        let (start, end) = chunk_range_to_lba_range(&self.def, range)?;
        let in_range =
            |c: u64| c != LBA_INVALID && c != start && (start..=end).contains(&c);

        let mut rec = self.store().snapshot();
        let mut changed = false;
        for kind in VerifyKind::iter() {
            if in_range(rec.verify_checkpoint(kind)) {
                rec.set_verify_checkpoint(kind, start);
                changed = true;
            }
        }
        for c in rec.rebuild_info.checkpoints.iter_mut() {
            if c.position != POSITION_INVALID && in_range(c.checkpoint) {
                c.checkpoint = start;
                changed = true;
            }
        }

        if changed {
            self.store().write_persist_record(&rec).await?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::in_memory::{InMemoryMetadata, InMemoryVerifier};
    use crate::raid_group::ConditionSet;

    struct Harness {
        md: Arc<InMemoryMetadata>,
        verifier: Arc<InMemoryVerifier>,
        store: Arc<NonPagedStore>,
        recon: Reconstructor,
    }

    fn encrypted_def() -> GroupDefinition {
        let opts = GroupOptions {
            encrypted: true,
            ..Default::default()
        };
        GroupDefinition::from_options(&opts).unwrap()
    }

    async fn harness_for(def: GroupDefinition) -> Harness {
        let md = Arc::new(InMemoryMetadata::new(&def));
        let store = Arc::new(
            NonPagedStore::load(&csl(), def, md.clone()).await.unwrap(),
        );
        store.set_default_nonpaged().await.unwrap();
        let paged = Arc::new(PagedAccessor::new(
            &csl(),
            md.clone(),
            store.clone(),
            Arc::new(ConditionSet::default()),
        ));
        let engine = Arc::new(CheckpointEngine::new(&csl(), store.clone()));
        let verifier = Arc::new(InMemoryVerifier::new());
        let recon = Reconstructor::new(
            &csl(),
            md.clone(),
            verifier.clone(),
            paged,
            engine,
        );
        Harness {
            md,
            verifier,
            store,
            recon,
        }
    }

    fn rekeyed() -> PagedChunkRecord {
        PagedChunkRecord {
            rekey: true,
            ..PagedChunkRecord::initialized()
        }
    }

    /*
     * Chunks 0..10 rekeyed, 10..13 unreadable, the rest not yet rekeyed:
     *
     *   | rekeyed (10) | bad (3) | not rekeyed ... |
     *   0              10        13                64
     */
    fn lay_out_rekey(md: &InMemoryMetadata) {
        for chunk in 0..10 {
            md.set_record(chunk, rekeyed());
        }
        md.invalidate(10..13);
    }

    #[test]
    fn accumulator_tracks_runs() {
        let mut acc = ScanAccumulator::default();
        acc.observe(0, PagedChunkRecord::empty());
        assert_eq!(acc.first_invalid, Some(0));

        // A rekeyed chunk after the bad one means the bad one was rekeyed
        acc.observe(1, rekeyed());
        assert_eq!(acc.first_invalid, None);
        assert_eq!(acc.last_rekeyed, Some(1));

        acc.observe(2, PagedChunkRecord::initialized());
        acc.observe(3, PagedChunkRecord::initialized());
        assert_eq!(acc.first_non_rekeyed, Some(2));
        assert_eq!(acc.rekey_checkpoint(0x800), Some(2 * 0x800));

        assert_eq!(ScanAccumulator::default().rekey_checkpoint(0x800), None);
    }

    #[tokio::test]
    async fn scan_finds_rekey_boundary() {
        let h = harness_for(encrypted_def()).await;
        lay_out_rekey(&h.md);

        let state = h.recon.begin(0x800 * 64, 0x800 * 4).await.unwrap();
        assert_eq!(state, ReconstructState::ScanPaged);
        assert_eq!(h.recon.step().await.unwrap(), ReconstructState::Verify);

        let ctx = h.recon.context().await.unwrap();
        assert_eq!(ctx.scan.last_rekeyed, Some(9));
        assert_eq!(ctx.scan.first_invalid, Some(10));
        assert_eq!(ctx.scan.last_invalid, Some(12));
        assert_eq!(ctx.scan.first_non_rekeyed, Some(13));
        assert_eq!(ctx.orig_rekey_checkpoint, 0);
        assert_eq!(h.store.rekey_checkpoint(), 10 * 0x800);
        assert_eq!(h.md.stats().allocations, 1);
    }

    #[tokio::test]
    async fn old_key_stops_verify() {
        let h = harness_for(encrypted_def()).await;
        lay_out_rekey(&h.md);
        for chunk in 10..13 {
            h.verifier.set_result(
                chunk * 0x800,
                VerifyReport {
                    u_crc_multi_count: 0x800,
                    c_crc_count: 0,
                },
            );
        }

        h.recon.begin(0x800 * 64, 0x800 * 4).await.unwrap();
        h.recon.step().await.unwrap();
        assert_eq!(
            h.recon.step().await.unwrap(),
            ReconstructState::ReconstructPaged
        );
        assert_eq!(h.store.rekey_checkpoint(), 10 * 0x800);
        assert_eq!(
            h.verifier.calls(),
            vec![(10 * 0x800, 0x800, KeyGeneration::New)]
        );

        // The bad chunks come back valid but not rekeyed
        assert_eq!(
            h.recon.step().await.unwrap(),
            ReconstructState::Done
        );
        assert_eq!(h.recon.step().await.unwrap(), ReconstructState::Invalid);
        assert!(h.recon.context().await.is_none());
        for chunk in 10..13 {
            assert_eq!(h.md.record(chunk), Some(PagedChunkRecord::initialized()));
        }
        assert_eq!(h.md.record(9), Some(rekeyed()));
    }

    #[tokio::test]
    async fn new_key_advances_checkpoint() {
        let h = harness_for(encrypted_def()).await;
        lay_out_rekey(&h.md);
        // Chunk 10 was rekeyed, chunk 11 was not
        h.verifier.set_result(
            11 * 0x800,
            VerifyReport {
                u_crc_multi_count: 0x401,
                c_crc_count: 0,
            },
        );

        h.recon.reconstruct_all_paged().await.unwrap();
        assert_eq!(h.store.rekey_checkpoint(), 11 * 0x800);
        assert_eq!(h.verifier.calls().len(), 2);

        // Below the checkpoint is rekeyed, above it is not
        assert_eq!(h.md.record(10), Some(rekeyed()));
        assert_eq!(h.md.record(11), Some(PagedChunkRecord::initialized()));
        assert_eq!(h.md.record(12), Some(PagedChunkRecord::initialized()));
    }

    #[tokio::test]
    async fn half_bad_chunk_is_new_key() {
        let h = harness_for(encrypted_def()).await;
        lay_out_rekey(&h.md);
        for chunk in 10..13 {
            h.verifier.set_result(
                chunk * 0x800,
                VerifyReport {
                    u_crc_multi_count: 0x400,
                    c_crc_count: 3,
                },
            );
        }
        h.recon.reconstruct_all_paged().await.unwrap();
        assert_eq!(h.store.rekey_checkpoint(), 13 * 0x800);
        assert_eq!(h.verifier.calls().len(), 3);
    }

    #[tokio::test]
    async fn failures_keep_context() {
        let h = harness_for(encrypted_def()).await;
        lay_out_rekey(&h.md);

        h.md.fail_next_allocate(MetadataStatus::Busy);
        let res = h.recon.reconstruct_all_paged().await;
        assert!(res.unwrap_err().is_retryable());
        assert_eq!(h.recon.state().await, ReconstructState::ScanPaged);

        h.verifier
            .set_failure(Some(RaidMetaError::Retryable("busy".to_string())));
        assert!(h.recon.reconstruct_all_paged().await.is_err());
        assert_eq!(h.recon.state().await, ReconstructState::Verify);

        h.verifier.set_failure(None);
        h.recon.reconstruct_all_paged().await.unwrap();
        assert_eq!(h.recon.state().await, ReconstructState::Invalid);
        assert!(h.md.record(11).unwrap().valid);
    }

    #[tokio::test]
    async fn unencrypted_group_skips_scan() {
        let h = harness_for(GroupDefinition::default()).await;
        h.md.invalidate(3..6);
        let state = h.recon.begin(0x800 * 64, 0x800 * 4).await.unwrap();
        assert_eq!(state, ReconstructState::ReconstructPaged);
        h.recon.reconstruct_all_paged().await.unwrap();
        assert_eq!(h.md.stats().paged_scans, 0);
        assert!(h.verifier.calls().is_empty());
        for chunk in 3..6 {
            assert!(h.md.record(chunk).unwrap().valid);
        }
    }

    #[tokio::test]
    async fn unjustified_rebuild_bits_rewritten() {
        let h = harness_for(GroupDefinition::default()).await;
        h.store.set_rebuild_logging(0b001).await.unwrap();

        let nr = |bits| PagedChunkRecord {
            needs_rebuild: bits,
            ..PagedChunkRecord::initialized()
        };
        h.md.set_record(4, nr(0b001));
        h.md.set_record(5, nr(0b010));
        h.recon.reconstruct_all_paged().await.unwrap();

        // Chunk 4 is degraded on a logging position and is left alone.
        // Chunk 5 claims a position nothing is rebuilding.
        assert_eq!(h.md.record(4).unwrap().needs_rebuild, 0b001);
        assert_eq!(h.md.record(5).unwrap().needs_rebuild, 0b001);
        assert_eq!(h.md.record(6).unwrap().needs_rebuild, 0);
    }

    #[tokio::test]
    async fn checkpoints_in_range_reset() {
        let h = harness_for(GroupDefinition::default()).await;
        let def = h.store.definition().clone();
        h.store
            .set_checkpoint_persist(
                NonPagedField::VerifyCheckpoint(VerifyKind::ReadOnly),
                20 * 0x800,
            )
            .await
            .unwrap();
        h.store
            .set_checkpoint_persist(
                NonPagedField::VerifyCheckpoint(VerifyKind::Error),
                40 * 0x800,
            )
            .await
            .unwrap();
        h.store.set_rebuild_checkpoint(1, 30 * 0x800).await.unwrap();

        let changed = h
            .recon
            .update_nonpaged_if_needed(ChunkRange::new(16, 16))
            .await
            .unwrap();
        assert!(changed);
        let np = h.store.snapshot();
        assert_eq!(np.verify_checkpoint(VerifyKind::ReadOnly), 16 * 0x800);
        assert_eq!(np.verify_checkpoint(VerifyKind::Error), 40 * 0x800);
        assert_eq!(np.rebuild_checkpoint(1), 16 * 0x800);
        assert_eq!(np.verify_checkpoint(VerifyKind::ReadWrite), LBA_INVALID);

        // Nothing left inside the range, nothing written
        let persists = h.md.stats().np_persists;
        assert!(!h
            .recon
            .update_nonpaged_if_needed(ChunkRange::new(16, 16))
            .await
            .unwrap());
        assert_eq!(h.md.stats().np_persists, persists);
        assert!(matches!(
            h.recon.update_nonpaged_if_needed(ChunkRange::new(16, 0)).await,
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));

        // Rebuilt records carry the bits the checkpoints imply
        let rec =
            set_paged_bits_from_nonpaged(&def, &np, ChunkRange::new(16, 1))
                .unwrap();
        assert!(rec.valid);
        assert!(rec.verify.contains(VerifyBits::USER_READ_ONLY));
        assert!(!rec.verify.contains(VerifyBits::ERROR));
        assert_eq!(rec.needs_rebuild, 0b010);

        let rec =
            set_paged_bits_from_nonpaged(&def, &np, ChunkRange::new(2, 1))
                .unwrap();
        assert_eq!(rec.needs_rebuild, 0);
        assert!(rec.verify.is_empty());
    }

    #[test]
    fn rekey_bit_from_checkpoint() {
        let def = GroupDefinition::default();
        let mut np = NonPagedRecord::new_default(&def);
        let one = |c| {
            set_paged_bits_from_nonpaged(&def, &np, ChunkRange::new(c, 1))
                .unwrap()
        };
        assert!(!one(0).rekey);

        np.encryption.rekey_checkpoint = 8 * 0x800;
        let one = |c| {
            set_paged_bits_from_nonpaged(&def, &np, ChunkRange::new(c, 1))
                .unwrap()
        };
        assert!(one(7).rekey);
        assert!(!one(8).rekey);

        // A verify checkpoint already in the paged region marks everything
        np.system_verify_checkpoint = def.exported_disk_capacity();
        let rec =
            set_paged_bits_from_nonpaged(&def, &np, ChunkRange::new(3, 1))
                .unwrap();
        assert!(rec.verify.contains(VerifyBits::SYSTEM));

        // No chunks, no record
        assert!(matches!(
            set_paged_bits_from_nonpaged(&def, &np, ChunkRange::new(3, 0)),
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn user_range_is_rejected() {
        let h = harness_for(GroupDefinition::default()).await;
        h.recon.begin(0, 0x800).await.unwrap();
        assert!(matches!(
            h.recon.step().await,
            Err(RaidMetaError::ReconstructFailed(_))
        ));
    }
}
