// Copyright 2023 Oxide Computer Company
use super::*;

use std::sync::{Mutex, MutexGuard};

use crate::chunk::ChunkRange;

/*
 * The non-paged record is addressed by byte offset: checkpoint and flag
 * updates send only the bytes of the field they change.  The layout is the
 * bincode (fixed int, little endian) encoding of `NonPagedRecord` and may
 * only ever be appended to.  Version 1:
 *
 *   off  len  field
 *     0    4  version
 *     4    1  np_state
 *     5    8  operation_bitmask
 *    13    2  rebuild_logging_bitmask
 *    15   24  rebuild checkpoints, 2 x (lba u64, position u32)
 *    39    8  ro verify checkpoint
 *    47    8  rw verify checkpoint
 *    55    8  error verify checkpoint
 *    63    8  journal verify checkpoint
 *    71    8  incomplete write verify checkpoint
 *    79    8  system verify checkpoint
 *    87   56  metadata of metadata, 14 x u32
 *   143    1  np flags
 *   144    2  glitching disks bitmask
 *   146    8  rekey checkpoint
 *   154    2  (unused)
 *   156    4  encryption flags
 *   160    2  drive tier
 *   162    8  extended flags
 *   170       end
 */
pub const NP_VERSION: u32 = 1;

const VERSION_OFFSET: usize = 0;
const NP_STATE_OFFSET: usize = 4;
const OPERATION_BITMASK_OFFSET: usize = 5;
const REBUILD_LOGGING_OFFSET: usize = 13;
const REBUILD_ENTRIES_OFFSET: usize = 15;
const REBUILD_ENTRY_SIZE: usize = 12;
const RO_VERIFY_OFFSET: usize =
    REBUILD_ENTRIES_OFFSET + REBUILD_ENTRY_SIZE * MAX_REBUILD_POSITIONS;
const RW_VERIFY_OFFSET: usize = RO_VERIFY_OFFSET + 8;
const ERROR_VERIFY_OFFSET: usize = RW_VERIFY_OFFSET + 8;
const JOURNAL_VERIFY_OFFSET: usize = ERROR_VERIFY_OFFSET + 8;
const IW_VERIFY_OFFSET: usize = JOURNAL_VERIFY_OFFSET + 8;
const SYSTEM_VERIFY_OFFSET: usize = IW_VERIFY_OFFSET + 8;
const MDD_OFFSET: usize = SYSTEM_VERIFY_OFFSET + 8;
const MDD_ENTRY_SIZE: usize = 4;
const NP_FLAGS_OFFSET: usize = MDD_OFFSET + MDD_ENTRY_SIZE * MDD_SLOTS;
const GLITCHING_OFFSET: usize = NP_FLAGS_OFFSET + 1;
const REKEY_CHECKPOINT_OFFSET: usize = GLITCHING_OFFSET + 2;
const ENCRYPTION_UNUSED_OFFSET: usize = REKEY_CHECKPOINT_OFFSET + 8;
const ENCRYPTION_FLAGS_OFFSET: usize = ENCRYPTION_UNUSED_OFFSET + 2;
const DRIVE_TIER_OFFSET: usize = ENCRYPTION_FLAGS_OFFSET + 4;
const EXTENDED_FLAGS_OFFSET: usize = DRIVE_TIER_OFFSET + 2;

pub const NONPAGED_RECORD_SIZE: usize = EXTENDED_FLAGS_OFFSET + 8;

static_assertions::const_assert_eq!(RO_VERIFY_OFFSET, 39);
static_assertions::const_assert_eq!(NP_FLAGS_OFFSET, 143);
static_assertions::const_assert_eq!(NONPAGED_RECORD_SIZE, 170);

pub const NP_STATE_UNINITIALIZED: u8 = 0;
pub const NP_STATE_INITIALIZED: u8 = 1;

pub const NP_FLAG_SWAPPED_IN: u8 = 0x01;
pub const NP_FLAG_NO_SPARE_REPORTED: u8 = 0x02;
pub const NP_FLAG_SOURCE_DRIVE_FAILED: u8 = 0x04;
pub const NP_FLAG_MARK_NR_REQUIRED: u8 = 0x08;
pub const NP_FLAG_RECONSTRUCT_REQUIRED: u8 = 0x10;
pub const NP_FLAG_ERROR_VERIFY_REQUIRED: u8 = 0x20;
pub const NP_FLAG_DEGRADED_NEEDS_REBUILD: u8 = 0x40;
pub const NP_FLAG_IW_VERIFY_REQUIRED: u8 = 0x80;

pub const NP_EXTENDED_FLAG_4K_COMMITTED: u64 = 0x1;

pub const ENCRYPTION_FLAG_PAGED_NEEDS_RECONSTRUCT: u32 = 0x1;
pub const ENCRYPTION_FLAG_PVD_NOTIFIED: u32 = 0x2;
pub const ENCRYPTION_FLAG_PAGED_ENCRYPTED: u32 = 0x4;

/// The independent verify passes.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
)]
pub enum VerifyKind {
    ReadWrite,
    ReadOnly,
    Error,
    IncompleteWrite,
    System,
}

impl VerifyKind {
    /// The paged record bit that marks a chunk for this pass.
    pub fn verify_bits(self) -> VerifyBits {
        match self {
            VerifyKind::ReadWrite => VerifyBits::USER_READ_WRITE,
            VerifyKind::ReadOnly => VerifyBits::USER_READ_ONLY,
            VerifyKind::Error => VerifyBits::ERROR,
            VerifyKind::IncompleteWrite => VerifyBits::INCOMPLETE_WRITE,
            VerifyKind::System => VerifyBits::SYSTEM,
        }
    }

    /// Passes that never restart mid-flight.  New marks set this flag and
    /// the pass takes another lap when it reaches the end.
    pub fn continuation_flag(self) -> Option<GroupFlag> {
        match self {
            VerifyKind::Error => Some(GroupFlag::ErrorVerifyRequired),
            VerifyKind::IncompleteWrite => Some(GroupFlag::IwVerifyRequired),
            _ => None,
        }
    }

    pub fn field(self) -> NonPagedField {
        NonPagedField::VerifyCheckpoint(self)
    }
}

/// Boolean state kept in one of the non-paged flag words.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumIter,
)]
pub enum GroupFlag {
    SwappedIn,
    NoSpareReported,
    SourceDriveFailed,
    MarkNrRequired,
    ReconstructRequired,
    ErrorVerifyRequired,
    DegradedNeedsRebuild,
    IwVerifyRequired,
    FourKCommitted,
    PagedNeedsReconstruct,
    PvdNotified,
    PagedEncrypted,
}

impl GroupFlag {
    /// The field holding the flag and its mask within that field.
    fn location(self) -> (NonPagedField, u64) {
        use GroupFlag::*;
        match self {
            SwappedIn => (NonPagedField::NpFlags, NP_FLAG_SWAPPED_IN.into()),
            NoSpareReported => {
                (NonPagedField::NpFlags, NP_FLAG_NO_SPARE_REPORTED.into())
            }
            SourceDriveFailed => {
                (NonPagedField::NpFlags, NP_FLAG_SOURCE_DRIVE_FAILED.into())
            }
            MarkNrRequired => {
                (NonPagedField::NpFlags, NP_FLAG_MARK_NR_REQUIRED.into())
            }
            ReconstructRequired => {
                (NonPagedField::NpFlags, NP_FLAG_RECONSTRUCT_REQUIRED.into())
            }
            ErrorVerifyRequired => {
                (NonPagedField::NpFlags, NP_FLAG_ERROR_VERIFY_REQUIRED.into())
            }
            DegradedNeedsRebuild => (
                NonPagedField::NpFlags,
                NP_FLAG_DEGRADED_NEEDS_REBUILD.into(),
            ),
            IwVerifyRequired => {
                (NonPagedField::NpFlags, NP_FLAG_IW_VERIFY_REQUIRED.into())
            }
            FourKCommitted => {
                (NonPagedField::ExtendedFlags, NP_EXTENDED_FLAG_4K_COMMITTED)
            }
            PagedNeedsReconstruct => (
                NonPagedField::EncryptionFlags,
                ENCRYPTION_FLAG_PAGED_NEEDS_RECONSTRUCT.into(),
            ),
            PvdNotified => (
                NonPagedField::EncryptionFlags,
                ENCRYPTION_FLAG_PVD_NOTIFIED.into(),
            ),
            PagedEncrypted => (
                NonPagedField::EncryptionFlags,
                ENCRYPTION_FLAG_PAGED_ENCRYPTED.into(),
            ),
        }
    }
}

/// A byte-addressable field of the non-paged record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NonPagedField {
    Version,
    NpState,
    OperationBitmask,
    RebuildLoggingBitmask,
    /// A whole rebuild entry, checkpoint then position.
    RebuildEntry(usize),
    RebuildCheckpoint(usize),
    RebuildPosition(usize),
    VerifyCheckpoint(VerifyKind),
    JournalVerifyCheckpoint,
    MddSlot(usize),
    NpFlags,
    GlitchingDisks,
    RekeyCheckpoint,
    EncryptionFlags,
    DriveTier,
    ExtendedFlags,
}

impl NonPagedField {
    pub fn offset(self) -> usize {
        match self {
            NonPagedField::Version => VERSION_OFFSET,
            NonPagedField::NpState => NP_STATE_OFFSET,
            NonPagedField::OperationBitmask => OPERATION_BITMASK_OFFSET,
            NonPagedField::RebuildLoggingBitmask => REBUILD_LOGGING_OFFSET,
            NonPagedField::RebuildEntry(i)
            | NonPagedField::RebuildCheckpoint(i) => {
                REBUILD_ENTRIES_OFFSET + i * REBUILD_ENTRY_SIZE
            }
            NonPagedField::RebuildPosition(i) => {
                REBUILD_ENTRIES_OFFSET + i * REBUILD_ENTRY_SIZE + 8
            }
            NonPagedField::VerifyCheckpoint(kind) => match kind {
                VerifyKind::ReadOnly => RO_VERIFY_OFFSET,
                VerifyKind::ReadWrite => RW_VERIFY_OFFSET,
                VerifyKind::Error => ERROR_VERIFY_OFFSET,
                VerifyKind::IncompleteWrite => IW_VERIFY_OFFSET,
                VerifyKind::System => SYSTEM_VERIFY_OFFSET,
            },
            NonPagedField::JournalVerifyCheckpoint => JOURNAL_VERIFY_OFFSET,
            NonPagedField::MddSlot(i) => MDD_OFFSET + i * MDD_ENTRY_SIZE,
            NonPagedField::NpFlags => NP_FLAGS_OFFSET,
            NonPagedField::GlitchingDisks => GLITCHING_OFFSET,
            NonPagedField::RekeyCheckpoint => REKEY_CHECKPOINT_OFFSET,
            NonPagedField::EncryptionFlags => ENCRYPTION_FLAGS_OFFSET,
            NonPagedField::DriveTier => DRIVE_TIER_OFFSET,
            NonPagedField::ExtendedFlags => EXTENDED_FLAGS_OFFSET,
        }
    }

    pub fn size(self) -> usize {
        match self {
            NonPagedField::Version => 4,
            NonPagedField::NpState => 1,
            NonPagedField::OperationBitmask => 8,
            NonPagedField::RebuildLoggingBitmask => 2,
            NonPagedField::RebuildEntry(_) => REBUILD_ENTRY_SIZE,
            NonPagedField::RebuildCheckpoint(_) => 8,
            NonPagedField::RebuildPosition(_) => 4,
            NonPagedField::VerifyCheckpoint(_) => 8,
            NonPagedField::JournalVerifyCheckpoint => 8,
            NonPagedField::MddSlot(_) => MDD_ENTRY_SIZE,
            NonPagedField::NpFlags => 1,
            NonPagedField::GlitchingDisks => 2,
            NonPagedField::RekeyCheckpoint => 8,
            NonPagedField::EncryptionFlags => 4,
            NonPagedField::DriveTier => 2,
            NonPagedField::ExtendedFlags => 8,
        }
    }

    /// Fields that hold an LBA checkpoint.
    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            NonPagedField::RebuildCheckpoint(_)
                | NonPagedField::VerifyCheckpoint(_)
                | NonPagedField::JournalVerifyCheckpoint
                | NonPagedField::RekeyCheckpoint
        )
    }
}

#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct BaseNonPaged {
    pub version: u32,
    pub np_state: u8,
    pub operation_bitmask: u64,
}

#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct RebuildCheckpointInfo {
    pub checkpoint: u64,
    pub position: u32,
}

impl RebuildCheckpointInfo {
    fn unused() -> Self {
        RebuildCheckpointInfo {
            checkpoint: LBA_INVALID,
            position: POSITION_INVALID,
        }
    }
}

#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct RebuildInfo {
    pub rebuild_logging_bitmask: u16,
    pub checkpoints: [RebuildCheckpointInfo; MAX_REBUILD_POSITIONS],
}

#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct EncryptionInfo {
    pub rekey_checkpoint: u64,
    pub unused: u16,
    pub flags: u32,
}

/// The singleton per-group record of checkpoints and flags.
#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct NonPagedRecord {
    pub base: BaseNonPaged,
    pub rebuild_info: RebuildInfo,
    pub ro_verify_checkpoint: u64,
    pub rw_verify_checkpoint: u64,
    pub error_verify_checkpoint: u64,
    pub journal_verify_checkpoint: u64,
    pub incomplete_write_verify_checkpoint: u64,
    pub system_verify_checkpoint: u64,
    pub paged_metadata_metadata: [u32; MDD_SLOTS],
    pub np_flags: u8,
    pub glitching_disks_bitmask: u16,
    pub encryption: EncryptionInfo,
    pub drive_tier: u16,
    pub extended_flags: u64,
}

impl NonPagedRecord {
    /// What the record looks like before the group has ever written it.
    pub fn uninitialized() -> Self {
        NonPagedRecord {
            base: BaseNonPaged {
                version: 0,
                np_state: NP_STATE_UNINITIALIZED,
                operation_bitmask: 0,
            },
            rebuild_info: RebuildInfo {
                rebuild_logging_bitmask: 0,
                checkpoints: [RebuildCheckpointInfo {
                    checkpoint: 0,
                    position: 0,
                }; MAX_REBUILD_POSITIONS],
            },
            ro_verify_checkpoint: 0,
            rw_verify_checkpoint: 0,
            error_verify_checkpoint: 0,
            journal_verify_checkpoint: 0,
            incomplete_write_verify_checkpoint: 0,
            system_verify_checkpoint: 0,
            paged_metadata_metadata: [0; MDD_SLOTS],
            np_flags: 0,
            glitching_disks_bitmask: 0,
            encryption: EncryptionInfo {
                rekey_checkpoint: 0,
                unused: 0,
                flags: 0,
            },
            drive_tier: 0,
            extended_flags: 0,
        }
    }

    /// The record written when a group is created: every position fully
    /// rebuilt, no verify pending, every metadata of metadata slot valid.
    pub fn new_default(def: &GroupDefinition) -> Self {
        let mut rec = NonPagedRecord::uninitialized();
        rec.base.version = NP_VERSION;
        rec.base.np_state = NP_STATE_INITIALIZED;
        rec.rebuild_info.checkpoints =
            [RebuildCheckpointInfo::unused(); MAX_REBUILD_POSITIONS];
        rec.ro_verify_checkpoint = LBA_INVALID;
        rec.rw_verify_checkpoint = LBA_INVALID;
        rec.error_verify_checkpoint = LBA_INVALID;
        rec.journal_verify_checkpoint = LBA_INVALID;
        rec.incomplete_write_verify_checkpoint = LBA_INVALID;
        rec.system_verify_checkpoint = LBA_INVALID;
        rec.paged_metadata_metadata =
            [PagedChunkRecord::initialized().to_wire(); MDD_SLOTS];
        if def.four_k_committed() {
            rec.extended_flags = NP_EXTENDED_FLAG_4K_COMMITTED;
        }
        rec
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RaidMetaError> {
        let buf = bincode::serialize(self)?;
        if buf.len() != NONPAGED_RECORD_SIZE {
            raid_bail!(
                LayoutError,
                "encoded record is {} bytes, expected {}",
                buf.len(),
                NONPAGED_RECORD_SIZE
            );
        }
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, RaidMetaError> {
        if buf.len() < NONPAGED_RECORD_SIZE {
            raid_bail!(
                LayoutError,
                "image is {} bytes, need {}",
                buf.len(),
                NONPAGED_RECORD_SIZE
            );
        }
        Ok(bincode::deserialize(&buf[..NONPAGED_RECORD_SIZE])?)
    }

    /// Overwrite `data.len()` bytes at `offset`, exactly as the metadata
    /// service does with the persisted image.
    pub fn patch(
        &mut self,
        offset: usize,
        data: &[u8],
    ) -> Result<(), RaidMetaError> {
        let mut buf = self.to_bytes()?;
        let Some(dst) = buf.get_mut(offset..offset + data.len()) else {
            raid_bail!(
                LayoutError,
                "patch {}+{} beyond record size {}",
                offset,
                data.len(),
                NONPAGED_RECORD_SIZE
            );
        };
        dst.copy_from_slice(data);
        *self = NonPagedRecord::from_bytes(&buf)?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.base.np_state == NP_STATE_INITIALIZED
    }

    pub fn verify_checkpoint(&self, kind: VerifyKind) -> u64 {
        match kind {
            VerifyKind::ReadWrite => self.rw_verify_checkpoint,
            VerifyKind::ReadOnly => self.ro_verify_checkpoint,
            VerifyKind::Error => self.error_verify_checkpoint,
            VerifyKind::IncompleteWrite => {
                self.incomplete_write_verify_checkpoint
            }
            VerifyKind::System => self.system_verify_checkpoint,
        }
    }

    pub fn set_verify_checkpoint(&mut self, kind: VerifyKind, lba: u64) {
        match kind {
            VerifyKind::ReadWrite => self.rw_verify_checkpoint = lba,
            VerifyKind::ReadOnly => self.ro_verify_checkpoint = lba,
            VerifyKind::Error => self.error_verify_checkpoint = lba,
            VerifyKind::IncompleteWrite => {
                self.incomplete_write_verify_checkpoint = lba
            }
            VerifyKind::System => self.system_verify_checkpoint = lba,
        }
    }

    /// Current value of a checkpoint field.
    pub fn checkpoint(&self, field: NonPagedField) -> Option<u64> {
        match field {
            NonPagedField::VerifyCheckpoint(kind) => {
                Some(self.verify_checkpoint(kind))
            }
            NonPagedField::JournalVerifyCheckpoint => {
                Some(self.journal_verify_checkpoint)
            }
            NonPagedField::RekeyCheckpoint => {
                Some(self.encryption.rekey_checkpoint)
            }
            NonPagedField::RebuildCheckpoint(i) => self
                .rebuild_info
                .checkpoints
                .get(i)
                .map(|c| c.checkpoint),
            _ => None,
        }
    }

    fn flag_word(&self, field: NonPagedField) -> u64 {
        match field {
            NonPagedField::NpFlags => self.np_flags.into(),
            NonPagedField::ExtendedFlags => self.extended_flags,
            NonPagedField::EncryptionFlags => self.encryption.flags.into(),
            _ => 0,
        }
    }

    pub fn is_flag_set(&self, flag: GroupFlag) -> bool {
        let (field, mask) = flag.location();
        self.flag_word(field) & mask != 0
    }

    pub fn mdd_slot(&self, slot: usize) -> Option<PagedChunkRecord> {
        self.paged_metadata_metadata
            .get(slot)
            .map(|w| PagedChunkRecord::from_wire(*w))
    }

    /// Index of the rebuild entry tracking `position`, if any.
    pub fn find_rebuild_entry(&self, position: u32) -> Option<usize> {
        self.rebuild_info
            .checkpoints
            .iter()
            .position(|c| c.position == position)
    }

    /// Rebuild checkpoint for `position`; the invalid LBA when it is fully
    /// rebuilt.
    pub fn rebuild_checkpoint(&self, position: u32) -> u64 {
        match self.find_rebuild_entry(position) {
            Some(i) => self.rebuild_info.checkpoints[i].checkpoint,
            None => LBA_INVALID,
        }
    }
}

/// Encode a flag word in the width of its field.
fn encode_flag_word(field: NonPagedField, word: u64) -> Vec<u8> {
    match field.size() {
        1 => vec![word as u8],
        4 => (word as u32).to_le_bytes().to_vec(),
        _ => word.to_le_bytes().to_vec(),
    }
}

/// The group's resident copy of the non-paged record.  Every change goes
/// through the metadata service first and lands in the resident copy only
/// once the service has accepted it, so a failed write leaves both the
/// durable and resident state as they were.
pub struct NonPagedStore {
    log: Logger,
    def: GroupDefinition,
    service: Arc<dyn MetadataService>,
    resident: Mutex<NonPagedRecord>,
}

impl NonPagedStore {
    pub fn new(
        log: &Logger,
        def: GroupDefinition,
        service: Arc<dyn MetadataService>,
        record: NonPagedRecord,
    ) -> Self {
        NonPagedStore {
            log: log.new(o!("component" => "nonpaged")),
            def,
            service,
            resident: Mutex::new(record),
        }
    }

    /// Load the persisted image.  A blank image yields an uninitialized
    /// record; call [`NonPagedStore::set_default_nonpaged`] to create it.
    pub async fn load(
        log: &Logger,
        def: GroupDefinition,
        service: Arc<dyn MetadataService>,
    ) -> Result<Self, RaidMetaError> {
        let image = match service.nonpaged_read().await {
            Ok(image) => image,
            Err(s) => {
                // A correctable error that returned no image is worth a retry
                s.translate()?;
                raid_bail!(Retryable, "nonpaged read returned {}", s);
            }
        };

        let record = if image.iter().all(|b| *b == 0) {
            NonPagedRecord::uninitialized()
        } else {
            let record = NonPagedRecord::from_bytes(&image)?;
            if record.base.version > NP_VERSION {
                raid_bail!(
                    LayoutError,
                    "on-disk version {} is newer than {}",
                    record.base.version,
                    NP_VERSION
                );
            }
            record
        };
        let store = NonPagedStore::new(log, def, service, record);
        info!(
            store.log,
            "loaded nonpaged, initialized: {}",
            record.is_initialized()
        );
        Ok(store)
    }

    fn resident(&self) -> MutexGuard<'_, NonPagedRecord> {
        self.resident.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the resident record.  Readers accept that it may be
    /// slightly stale with respect to a concurrent writer.
    pub fn snapshot(&self) -> NonPagedRecord {
        *self.resident()
    }

    pub fn is_initialized(&self) -> bool {
        self.resident().is_initialized()
    }

    pub fn definition(&self) -> &GroupDefinition {
        &self.def
    }

    fn apply(&self, offset: usize, data: &[u8]) -> Result<(), RaidMetaError> {
        self.resident().patch(offset, data)
    }

    /// Write the group's creation-time record in one persisted write.
    pub async fn set_default_nonpaged(&self) -> Result<(), RaidMetaError> {
        let rec = NonPagedRecord::new_default(&self.def);
        self.write_persist_record(&rec).await?;
        info!(self.log, "wrote default nonpaged metadata");
        Ok(())
    }

    /// Persist an entire record as one atomic write.
    pub async fn write_persist_record(
        &self,
        rec: &NonPagedRecord,
    ) -> Result<(), RaidMetaError> {
        let bytes = rec.to_bytes()?;
        if let Err(s) = self.service.nonpaged_write_persist(0, &bytes).await {
            warn!(self.log, "nonpaged record write failed: {}", s);
            s.translate()?;
        }
        *self.resident() = *rec;
        Ok(())
    }

    async fn write_field_persist(
        &self,
        field: NonPagedField,
        data: &[u8],
    ) -> Result<(), RaidMetaError> {
        if data.len() != field.size() {
            raid_bail!(
                LayoutError,
                "{:?} is {} bytes, not {}",
                field,
                field.size(),
                data.len()
            );
        }
        if let Err(s) = self
            .service
            .nonpaged_write_persist(field.offset(), data)
            .await
        {
            warn!(self.log, "nonpaged write {:?} failed: {}", field, s);
            s.translate()?;
        }
        self.apply(field.offset(), data)
    }

    pub fn checkpoint(&self, field: NonPagedField) -> u64 {
        self.resident().checkpoint(field).unwrap_or(LBA_INVALID)
    }

    pub fn verify_checkpoint(&self, kind: VerifyKind) -> u64 {
        self.resident().verify_checkpoint(kind)
    }

    pub fn rekey_checkpoint(&self) -> u64 {
        self.resident().encryption.rekey_checkpoint
    }

    pub fn journal_verify_checkpoint(&self) -> u64 {
        self.resident().journal_verify_checkpoint
    }

    fn require_checkpoint(
        &self,
        field: NonPagedField,
    ) -> Result<(), RaidMetaError> {
        if !field.is_checkpoint() {
            raid_bail!(LayoutError, "{:?} is not a checkpoint", field);
        }
        Ok(())
    }

    /// Persist a checkpoint synchronously.
    pub async fn set_checkpoint_persist(
        &self,
        field: NonPagedField,
        lba: u64,
    ) -> Result<(), RaidMetaError> {
        self.require_checkpoint(field)?;
        self.write_field_persist(field, &lba.to_le_bytes()).await
    }

    /// Set a checkpoint and make it visible to the peer.
    pub async fn force_set_checkpoint(
        &self,
        field: NonPagedField,
        lba: u64,
    ) -> Result<(), RaidMetaError> {
        self.require_checkpoint(field)?;
        if let Err(s) = self
            .service
            .nonpaged_force_set_checkpoint(field.offset(), lba)
            .await
        {
            warn!(self.log, "force set {:?} failed: {}", field, s);
            s.translate()?;
        }
        self.apply(field.offset(), &lba.to_le_bytes())
    }

    /// Move a checkpoint from `expected` to `lba` without telling the peer.
    /// Returns false, without touching anything, when the checkpoint is no
    /// longer at `expected`: some other request got there first.
    pub async fn increment_checkpoint(
        &self,
        field: NonPagedField,
        expected: u64,
        lba: u64,
    ) -> Result<bool, RaidMetaError> {
        self.require_checkpoint(field)?;
        if self.checkpoint(field) != expected {
            debug!(
                self.log,
                "{:?} moved from {:#x}, skip increment to {:#x}",
                field,
                expected,
                lba
            );
            return Ok(false);
        }
        if let Err(s) = self
            .service
            .nonpaged_increment_checkpoint(field.offset(), lba)
            .await
        {
            warn!(self.log, "increment {:?} failed: {}", field, s);
            s.translate()?;
        }
        self.apply(field.offset(), &lba.to_le_bytes())?;
        Ok(true)
    }

    pub fn is_flag_set(&self, flag: GroupFlag) -> bool {
        self.resident().is_flag_set(flag)
    }

    async fn write_flag(
        &self,
        flag: GroupFlag,
        set: bool,
    ) -> Result<(), RaidMetaError> {
        let (field, mask) = flag.location();
        let current = self.resident().flag_word(field);
        let word = if set { current | mask } else { current & !mask };
        self.write_field_persist(field, &encode_flag_word(field, word))
            .await?;
        info!(self.log, "{} {}", if set { "set" } else { "clear" }, flag);
        Ok(())
    }

    pub async fn set_flag(&self, flag: GroupFlag) -> Result<(), RaidMetaError> {
        self.write_flag(flag, true).await
    }

    pub async fn clear_flag(
        &self,
        flag: GroupFlag,
    ) -> Result<(), RaidMetaError> {
        self.write_flag(flag, false).await
    }

    pub fn is_mark_nr_required(&self) -> bool {
        self.is_flag_set(GroupFlag::MarkNrRequired)
    }

    pub async fn set_mark_nr_required(&self) -> Result<(), RaidMetaError> {
        self.set_flag(GroupFlag::MarkNrRequired).await
    }

    pub async fn clear_mark_nr_required(&self) -> Result<(), RaidMetaError> {
        self.clear_flag(GroupFlag::MarkNrRequired).await
    }

    pub fn is_reconstruct_required(&self) -> bool {
        self.is_flag_set(GroupFlag::ReconstructRequired)
    }

    pub async fn set_reconstruct_required(&self) -> Result<(), RaidMetaError> {
        self.set_flag(GroupFlag::ReconstructRequired).await
    }

    pub async fn clear_reconstruct_required(
        &self,
    ) -> Result<(), RaidMetaError> {
        self.clear_flag(GroupFlag::ReconstructRequired).await
    }

    pub fn is_degraded_needs_rebuild(&self) -> bool {
        self.is_flag_set(GroupFlag::DegradedNeedsRebuild)
    }

    pub async fn set_degraded_needs_rebuild(
        &self,
    ) -> Result<(), RaidMetaError> {
        self.set_flag(GroupFlag::DegradedNeedsRebuild).await
    }

    pub async fn clear_degraded_needs_rebuild(
        &self,
    ) -> Result<(), RaidMetaError> {
        self.clear_flag(GroupFlag::DegradedNeedsRebuild).await
    }

    pub fn is_4k_committed(&self) -> bool {
        self.is_flag_set(GroupFlag::FourKCommitted)
    }

    pub async fn set_4k_committed(&self) -> Result<(), RaidMetaError> {
        self.set_flag(GroupFlag::FourKCommitted).await
    }

    pub async fn set_drive_tier(&self, tier: u16) -> Result<(), RaidMetaError> {
        self.write_field_persist(NonPagedField::DriveTier, &tier.to_le_bytes())
            .await
    }

    pub fn rebuild_logging_bitmask(&self) -> u16 {
        self.resident().rebuild_info.rebuild_logging_bitmask
    }

    fn check_position_mask(&self, mask: u16) -> Result<(), RaidMetaError> {
        if u32::from(mask) >> self.def.width() != 0 {
            raid_bail!(
                InvalidPosition,
                "bitmask {:#x} beyond width {}",
                mask,
                self.def.width()
            );
        }
        Ok(())
    }

    /// Start rebuild logging for the positions in `mask`.
    pub async fn set_rebuild_logging(
        &self,
        mask: u16,
    ) -> Result<(), RaidMetaError> {
        self.check_position_mask(mask)?;
        let bitmask = self.rebuild_logging_bitmask() | mask;
        self.write_field_persist(
            NonPagedField::RebuildLoggingBitmask,
            &bitmask.to_le_bytes(),
        )
        .await
    }

    pub async fn clear_rebuild_logging(
        &self,
        mask: u16,
    ) -> Result<(), RaidMetaError> {
        self.check_position_mask(mask)?;
        let bitmask = self.rebuild_logging_bitmask() & !mask;
        self.write_field_persist(
            NonPagedField::RebuildLoggingBitmask,
            &bitmask.to_le_bytes(),
        )
        .await
    }

    pub fn rebuild_checkpoint(&self, position: u32) -> u64 {
        self.resident().rebuild_checkpoint(position)
    }

    pub fn find_rebuild_entry(&self, position: u32) -> Option<usize> {
        self.resident().find_rebuild_entry(position)
    }

    /// Record the rebuild checkpoint for `position`, claiming a free entry
    /// if the position has none.  Setting the invalid LBA releases the
    /// entry.
    pub async fn set_rebuild_checkpoint(
        &self,
        position: u32,
        lba: u64,
    ) -> Result<(), RaidMetaError> {
        if position >= self.def.width() {
            error!(
                self.log,
                "rebuild position {} >= width {}",
                position,
                self.def.width()
            );
            raid_bail!(
                InvalidPosition,
                "position {} >= width {}",
                position,
                self.def.width()
            );
        }

        let entry = {
            let rec = self.resident();
            match rec.find_rebuild_entry(position) {
                Some(i) => i,
                None => {
                    let Some(i) = rec
                        .rebuild_info
                        .checkpoints
                        .iter()
                        .position(|c| c.position == POSITION_INVALID)
                    else {
                        raid_bail!(
                            InvalidPosition,
                            "no free rebuild entry for position {}",
                            position
                        );
                    };
                    i
                }
            }
        };

        let info = if lba == LBA_INVALID {
            RebuildCheckpointInfo::unused()
        } else {
            RebuildCheckpointInfo {
                checkpoint: lba,
                position,
            }
        };
        let data = bincode::serialize(&info)?;
        self.write_field_persist(NonPagedField::RebuildEntry(entry), &data)
            .await
    }

    /// Every position that is rebuild logging or still has a rebuild
    /// checkpoint.
    pub fn degraded_bitmask(&self) -> u16 {
        let rec = self.resident();
        let mut mask = rec.rebuild_info.rebuild_logging_bitmask;
        for c in rec.rebuild_info.checkpoints.iter() {
            if c.checkpoint != LBA_INVALID && c.position < MAX_WIDTH {
                mask |= 1 << c.position;
            }
        }
        mask
    }

    /// The needs-rebuild bits the non-paged state justifies for `range`:
    /// the rebuild logging positions plus every position with a valid
    /// rebuild checkpoint, wherever that checkpoint is.
    pub fn determine_nr_bits(
        &self,
        range: ChunkRange,
    ) -> Result<u16, RaidMetaError> {
        let rec = self.snapshot();
        if !rec.is_initialized() {
            return Ok(0);
        }

        let mut bits = rec.rebuild_info.rebuild_logging_bitmask;
        for c in rec.rebuild_info.checkpoints.iter() {
            if c.checkpoint == LBA_INVALID {
                continue;
            }
            if c.position >= self.def.width() {
                error!(
                    self.log,
                    "chunks {:#x}+{:#x}: rebuild position {} >= width {}",
                    range.start,
                    range.count,
                    c.position,
                    self.def.width()
                );
                raid_bail!(
                    InvalidPosition,
                    "rebuild position {} >= width {}",
                    c.position,
                    self.def.width()
                );
            }
            bits |= 1 << c.position;
        }
        Ok(bits)
    }

    pub fn mdd_slot(&self, slot: usize) -> Option<PagedChunkRecord> {
        self.resident().mdd_slot(slot)
    }

    /// OR `record` into `count` slots starting at `first`.
    pub async fn set_mdd_bits(
        &self,
        first: usize,
        count: usize,
        record: PagedChunkRecord,
    ) -> Result<(), RaidMetaError> {
        self.update_mdd_bits(first, count, record, true).await
    }

    pub async fn clear_mdd_bits(
        &self,
        first: usize,
        count: usize,
        record: PagedChunkRecord,
    ) -> Result<(), RaidMetaError> {
        self.update_mdd_bits(first, count, record, false).await
    }

    /// Replace `count` slots starting at `first` with `record`.
    pub async fn write_mdd_slots(
        &self,
        first: usize,
        count: usize,
        record: PagedChunkRecord,
    ) -> Result<(), RaidMetaError> {
        if first + count > MDD_SLOTS {
            raid_bail!(
                SlotOverflow,
                "slots {}+{} beyond {}",
                first,
                count,
                MDD_SLOTS
            );
        }
        let data: Vec<u8> = std::iter::repeat(record.to_wire().to_le_bytes())
            .take(count)
            .flatten()
            .collect();
        let offset = NonPagedField::MddSlot(first).offset();
        if let Err(s) = self.service.nonpaged_write_persist(offset, &data).await
        {
            warn!(self.log, "mdd slot write failed: {}", s);
            s.translate()?;
        }
        self.apply(offset, &data)
    }

    async fn update_mdd_bits(
        &self,
        first: usize,
        count: usize,
        record: PagedChunkRecord,
        set: bool,
    ) -> Result<(), RaidMetaError> {
        if first + count > MDD_SLOTS {
            raid_bail!(
                SlotOverflow,
                "slots {}+{} beyond {}",
                first,
                count,
                MDD_SLOTS
            );
        }
        let data = record.to_wire().to_le_bytes();
        let offset = NonPagedField::MddSlot(first).offset();
        let res = if set {
            self.service.nonpaged_set_bits(offset, &data, count).await
        } else {
            self.service.nonpaged_clear_bits(offset, &data, count).await
        };
        if let Err(s) = res {
            warn!(self.log, "mdd bit update failed: {}", s);
            s.translate()?;
        }

        let mut rec = self.resident();
        for slot in rec.paged_metadata_metadata[first..first + count].iter_mut()
        {
            let mut r = PagedChunkRecord::from_wire(*slot);
            if set {
                r.set_bits(&record);
            } else {
                r.clear_bits(&record);
            }
            *slot = r.to_wire();
        }
        Ok(())
    }

    /// Acquire the group-wide distributed lock.  Every read-then-write of
    /// the non-paged record must hold it, and must release it with
    /// [`NonPagedStore::release_np_lock`].
    pub async fn acquire_np_lock(&self) -> Result<(), RaidMetaError> {
        if let Err(s) = self.service.acquire_np_lock().await {
            warn!(self.log, "np lock failed: {}", s);
            s.translate()?;
        }
        Ok(())
    }

    pub async fn release_np_lock(&self) {
        self.service.release_np_lock().await;
    }
}
