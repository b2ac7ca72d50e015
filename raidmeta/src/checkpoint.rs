// Copyright 2023 Oxide Computer Company
use super::*;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::nonpaged::NonPagedField;

/// How a checkpoint move is written.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum PersistMode {
    /// Written and pushed to the peer.  The peer may hold a stale value,
    /// so this is a set rather than an increment.
    ForceSet,
    /// Moved locally only.
    LocalIncrement,
}

/// Peer staleness is bounded by `interval`: once that long has passed
/// since the last peer-visible write (or there has never been one), the
/// next move is pushed to the peer.
pub fn choose_persist_mode(
    elapsed: Option<Duration>,
    interval: Duration,
) -> PersistMode {
    match elapsed {
        Some(e) if e <= interval => PersistMode::LocalIncrement,
        _ => PersistMode::ForceSet,
    }
}

/// What a checkpoint operation actually did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Nothing written: no pass is active, or somebody else already moved
    /// the checkpoint past this unit of work.
    Skipped,
    ForceSet(u64),
    Incremented(u64),
    /// Written with a synchronous persist.
    Persisted(u64),
    /// A continuation flag was set instead of moving the checkpoint.
    Flagged,
}

/// Moves the non-paged checkpoints as work completes.
pub struct CheckpointEngine {
    log: Logger,
    store: Arc<NonPagedStore>,
    last_peer_update: Mutex<Option<Instant>>,
}

impl CheckpointEngine {
    pub fn new(log: &Logger, store: Arc<NonPagedStore>) -> Self {
        CheckpointEngine {
            log: log.new(o!("component" => "checkpoint")),
            store,
            last_peer_update: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<NonPagedStore> {
        &self.store
    }

    fn def(&self) -> &GroupDefinition {
        self.store.definition()
    }

    /// The persist mode for the next move, per the peer update interval.
    pub fn next_persist_mode(&self) -> PersistMode {
        let last = *self
            .last_peer_update
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        choose_persist_mode(
            last.map(|t| t.elapsed()),
            self.def().peer_update_interval(),
        )
    }

    fn note_peer_update(&self) {
        *self
            .last_peer_update
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Move `field` from `current` to `new` by the time based policy.
    async fn advance(
        &self,
        field: NonPagedField,
        current: u64,
        new: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        match self.next_persist_mode() {
            PersistMode::ForceSet => {
                self.store.force_set_checkpoint(field, new).await?;
                self.note_peer_update();
                debug!(self.log, "{:?} force set to {:#x}", field, new);
                Ok(CheckpointOutcome::ForceSet(new))
            }
            PersistMode::LocalIncrement => {
                if self.store.increment_checkpoint(field, current, new).await? {
                    Ok(CheckpointOutcome::Incremented(new))
                } else {
                    Ok(CheckpointOutcome::Skipped)
                }
            }
        }
    }

    /// Record that `blocks` blocks of verify work at per-disk `lba` are
    /// done.  A pass that reaches the end of the exported capacity goes
    /// idle, or starts its next lap at 0 when its continuation flag is set.
    pub async fn update_verify_checkpoint(
        &self,
        kind: VerifyKind,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        if lba + blocks < self.def().exported_disk_capacity() {
            return self.advance_verify(kind, lba, blocks).await;
        }

        self.store.acquire_np_lock().await?;
        let res = self.advance_verify(kind, lba, blocks).await;
        self.store.release_np_lock().await;
        res
    }

    /// For a range upstream does not consume there is nothing to verify,
    /// only the checkpoint to move.
    pub async fn update_checkpoint_for_unconsumed(
        &self,
        kind: VerifyKind,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        self.store.acquire_np_lock().await?;
        let res = self.advance_verify(kind, lba, blocks).await;
        self.store.release_np_lock().await;
        res
    }

    async fn advance_verify(
        &self,
        kind: VerifyKind,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let field = kind.field();
        let current = self.store.verify_checkpoint(kind);
        let new = lba + blocks;

        if current == LBA_INVALID || lba != current || blocks == 0 {
            debug!(
                self.log,
                "{} verify skip, checkpoint {:#x} lba {:#x}",
                kind,
                current,
                lba
            );
            return Ok(CheckpointOutcome::Skipped);
        }

        if new < self.def().exported_disk_capacity() {
            return self.advance(field, current, new).await;
        }

        /*
         * Pass complete.  With a continuation flag set, restart at 0 and
         * clear the flag only once the restart is durable: a mark that
         * lands in between sees the flag still set and the pass still
         * active, so it is covered by the new lap.
         */
        let restart = kind
            .continuation_flag()
            .filter(|flag| self.store.is_flag_set(*flag));
        let next = if restart.is_some() { 0 } else { LBA_INVALID };
        self.store.set_checkpoint_persist(field, next).await?;
        self.note_peer_update();
        if let Some(flag) = restart {
            self.store.clear_flag(flag).await?;
            info!(self.log, "{} verify pass restarts at 0", kind);
        } else {
            info!(self.log, "{} verify pass complete", kind);
        }
        Ok(CheckpointOutcome::Persisted(next))
    }

    /// Start (or re-arm) a verify pass after chunks were marked for `kind`.
    ///
    /// An idle pass starts at 0.  Error and incomplete write passes that
    /// are already running only set their continuation flag; the other
    /// passes restart at 0, pushed to the peer.
    pub async fn mark_for_verify(
        &self,
        kind: VerifyKind,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        self.store.acquire_np_lock().await?;
        let res = self.mark_for_verify_locked(kind).await;
        self.store.release_np_lock().await;
        res
    }

    async fn mark_for_verify_locked(
        &self,
        kind: VerifyKind,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let field = kind.field();
        if self.store.verify_checkpoint(kind) == LBA_INVALID {
            self.store.set_checkpoint_persist(field, 0).await?;
            info!(self.log, "{} verify pass started", kind);
            return Ok(CheckpointOutcome::Persisted(0));
        }

        if let Some(flag) = kind.continuation_flag() {
            if self.store.is_flag_set(flag) {
                debug!(self.log, "{} already set", flag);
                return Ok(CheckpointOutcome::Skipped);
            }
            self.store.set_flag(flag).await?;
            return Ok(CheckpointOutcome::Flagged);
        }

        self.store.force_set_checkpoint(field, 0).await?;
        self.note_peer_update();
        info!(self.log, "{} verify pass restarted", kind);
        Ok(CheckpointOutcome::ForceSet(0))
    }

    /// Record rebuild progress for `position`.  The position is fully
    /// rebuilt when the checkpoint reaches the exported capacity.
    pub async fn update_rebuild_checkpoint(
        &self,
        position: u32,
        lba: u64,
        blocks: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let Some(entry) = self.store.find_rebuild_entry(position) else {
            return Ok(CheckpointOutcome::Skipped);
        };
        let field = NonPagedField::RebuildCheckpoint(entry);
        let current = self.store.checkpoint(field);
        if current == LBA_INVALID || lba != current || blocks == 0 {
            return Ok(CheckpointOutcome::Skipped);
        }

        let new = lba + blocks;
        if new < self.def().exported_disk_capacity() {
            return self.advance(field, current, new).await;
        }

        self.store.acquire_np_lock().await?;
        let res = self.store.set_rebuild_checkpoint(position, LBA_INVALID).await;
        self.store.release_np_lock().await;
        res?;
        self.note_peer_update();
        info!(self.log, "position {} rebuild complete", position);
        Ok(CheckpointOutcome::Persisted(LBA_INVALID))
    }

    /// Move the rekey checkpoint forward to `lba`.  It never moves back.
    pub async fn advance_rekey_checkpoint(
        &self,
        lba: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let current = self.store.rekey_checkpoint();
        if current != LBA_INVALID && lba <= current {
            return Ok(CheckpointOutcome::Skipped);
        }
        self.advance(NonPagedField::RekeyCheckpoint, current, lba)
            .await
    }

    /// Mark the journal chunk holding raid-relative `raid_lba` for verify.
    /// The LBA has to fall inside the journal.
    pub async fn mark_journal_for_verify(
        &self,
        raid_lba: u64,
    ) -> Result<CheckpointOutcome, RaidMetaError> {
        let def = self.def();
        if def.data_disks() == 0 {
            raid_bail!(InvalidConfig, "group has no data disks");
        }
        let disk_lba = raid_lba / u64::from(def.data_disks());
        let Some(journal) = def.journal() else {
            raid_bail!(JournalRangeExceeded, "group has no journal");
        };
        if !journal.contains(disk_lba) {
            raid_bail!(
                JournalRangeExceeded,
                "lba {:#x} outside journal {:#x}..={:#x}",
                disk_lba,
                journal.start,
                journal.end()
            );
        }
        let lba = disk_lba - disk_lba % def.chunk_size();
        let field = NonPagedField::JournalVerifyCheckpoint;

        self.store.acquire_np_lock().await?;
        let res = if self.store.journal_verify_checkpoint() == LBA_INVALID {
            self.store
                .set_checkpoint_persist(field, lba)
                .await
                .map(|_| CheckpointOutcome::Persisted(lba))
        } else {
            self.store
                .force_set_checkpoint(field, lba)
                .await
                .map(|_| CheckpointOutcome::ForceSet(lba))
        };
        self.store.release_np_lock().await;
        if res.is_ok() {
            info!(self.log, "journal verify from {:#x}", lba);
        }
        res
    }
}
