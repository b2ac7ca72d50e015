// Copyright 2023 Oxide Computer Company
//! Mapping between per-disk LBAs and chunk indexes, and classification of
//! chunk ranges into the area of the group that holds their metadata.
use super::*;

/// A contiguous run of chunks.
#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct ChunkRange {
    pub start: u64,
    pub count: u64,
}

impl ChunkRange {
    pub fn new(start: u64, count: u64) -> Self {
        ChunkRange { start, count }
    }

    /// Last chunk in the range (inclusive).  The range must not be empty.
    pub fn last(&self) -> u64 {
        debug_assert!(self.count > 0, "last chunk of empty range");
        self.start + self.count - 1
    }

    /// One past the last chunk.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn contains(&self, chunk: u64) -> bool {
        chunk >= self.start && chunk < self.end()
    }
}

/// Where the records for a chunk range live.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum ChunkArea {
    /// User data; one paged record per chunk, served by the metadata
    /// service.
    UserData,

    /// The paged metadata itself (or everything, on a group without paged
    /// metadata); tracked by the non-paged metadata of metadata.
    PagedMetadata,

    /// The journal area, outside of chunk accounting.
    Journal,
}

pub fn lba_to_chunk_index(
    def: &GroupDefinition,
    lba: u64,
) -> Result<u64, RaidMetaError> {
    if lba >= def.disk_capacity() {
        raid_bail!(
            LbaOutOfRange,
            "lba {:#x} >= disk capacity {:#x}",
            lba,
            def.disk_capacity()
        );
    }
    Ok(lba / def.chunk_size())
}

/// Like [`lba_to_chunk_index`], but for an LBA in the journal area.
pub fn journal_lba_to_chunk_index(
    def: &GroupDefinition,
    lba: u64,
) -> Result<u64, RaidMetaError> {
    let Some(journal) = def.journal() else {
        raid_bail!(JournalRangeExceeded, "group has no journal");
    };
    if !journal.contains(lba) {
        raid_bail!(
            JournalRangeExceeded,
            "lba {:#x} outside journal {:#x}..={:#x}",
            lba,
            journal.start,
            journal.end()
        );
    }
    Ok(lba / def.chunk_size())
}

fn chunks_for_blocks(def: &GroupDefinition, block_count: u64) -> u64 {
    block_count.div_ceil(def.chunk_size())
}

/// The chunk range touched by `block_count` blocks at `lba`.
pub fn chunk_range(
    def: &GroupDefinition,
    lba: u64,
    block_count: u64,
) -> Result<ChunkRange, RaidMetaError> {
    let start = lba_to_chunk_index(def, lba)?;
    Ok(ChunkRange::new(start, chunks_for_blocks(def, block_count)))
}

pub fn journal_chunk_range(
    def: &GroupDefinition,
    lba: u64,
    block_count: u64,
) -> Result<ChunkRange, RaidMetaError> {
    let start = journal_lba_to_chunk_index(def, lba)?;
    Ok(ChunkRange::new(start, chunks_for_blocks(def, block_count)))
}

pub fn chunk_index_to_lba(
    def: &GroupDefinition,
    chunk_index: u64,
) -> Result<u64, RaidMetaError> {
    if chunk_index >= def.total_chunks() {
        raid_bail!(
            ChunkOutOfRange,
            "chunk {:#x} >= total chunks {:#x}",
            chunk_index,
            def.total_chunks()
        );
    }
    Ok(chunk_index * def.chunk_size())
}

/// First and last (inclusive) per-disk LBA covered by a chunk range.  The
/// range is not checked against capacity; callers use this for ranges
/// derived from paged metadata geometry.
pub fn chunk_range_to_lba_range(
    def: &GroupDefinition,
    range: ChunkRange,
) -> Result<(u64, u64), RaidMetaError> {
    if range.count == 0 {
        raid_bail!(ChunkOutOfRange, "empty chunk range at {:#x}", range.start);
    }
    let start = range.start * def.chunk_size();
    let end = range.last() * def.chunk_size() + (def.chunk_size() - 1);
    Ok((start, end))
}

/// Does an LBA range cross from user data into paged metadata?
pub fn lba_range_spans_user_and_paged(
    def: &GroupDefinition,
    lba: u64,
    block_count: u64,
) -> Result<bool, RaidMetaError> {
    let range = chunk_range(def, lba, block_count)?;
    if range.count == 0 {
        return Ok(false);
    }
    let exported = def.exported_chunks();
    Ok(range.start < exported && range.last() >= exported)
}

/// Decide which area holds the records for `range`.  A range that crosses
/// from user data into paged metadata is an error; the caller has to split
/// it.
pub fn classify(
    def: &GroupDefinition,
    range: ChunkRange,
) -> Result<ChunkArea, RaidMetaError> {
    if range.count == 0 {
        raid_bail!(ChunkOutOfRange, "empty chunk range at {:#x}", range.start);
    }

    // Raw mirrors keep every record in the metadata of metadata.
    if !def.has_paged_metadata() {
        return Ok(ChunkArea::PagedMetadata);
    }

    if let Some(journal) = def.journal() {
        let journal_range = journal_chunk_range(def, journal.start, journal.blocks)?;
        if range.end() > journal_range.end() {
            raid_bail!(
                JournalRangeExceeded,
                "chunks {:#x}+{:#x} beyond journal end chunk {:#x}",
                range.start,
                range.count,
                journal_range.last()
            );
        }
        if range.start >= journal_range.start {
            return Ok(ChunkArea::Journal);
        }
    }

    let total = def.total_chunks();
    let exported = def.exported_chunks();
    if range.last() >= total {
        raid_bail!(
            ChunkOutOfRange,
            "last chunk {:#x} >= total chunks {:#x}",
            range.last(),
            total
        );
    }

    if range.last() < exported {
        Ok(ChunkArea::UserData)
    } else if range.start >= exported {
        Ok(ChunkArea::PagedMetadata)
    } else {
        raid_bail!(
            RangeSpansBoundary,
            "chunks {:#x}..={:#x} cross exported chunk {:#x}",
            range.start,
            range.last(),
            exported
        );
    }
}

/// Every paged record describes one user chunk, and one chunk of paged
/// metadata holds `RECORDS_PER_METADATA_BLOCK * chunk_size` records.  Map a
/// range of paged metadata chunks to the user chunks their records
/// describe.
pub fn user_range_for_paged_range(
    def: &GroupDefinition,
    paged: ChunkRange,
) -> Result<ChunkRange, RaidMetaError> {
    let exported = def.exported_chunks();
    if paged.start < exported {
        raid_bail!(
            ChunkOutOfRange,
            "chunk {:#x} is not paged metadata (exported {:#x})",
            paged.start,
            exported
        );
    }
    let records_per_chunk = RECORDS_PER_METADATA_BLOCK * def.chunk_size();
    let start = (paged.start - exported) * records_per_chunk;
    let max_count = records_per_chunk * paged.count;

    // The last paged chunk is usually only partly used.
    Ok(ChunkRange::new(start, max_count.min(exported)))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn small_def() -> GroupDefinition {
        /*
         * 8 user chunks, 2 paged chunks, chunk size 16:
         *
         *   |0|1|2|3|4|5|6|7|P|P|
         */
        let opts = GroupOptions {
            chunk_size: 16,
            exported_disk_capacity: 16 * 8,
            paged_disk_capacity: 16 * 2,
            ..Default::default()
        };
        GroupDefinition::from_options(&opts).unwrap()
    }

    fn journal_def() -> GroupDefinition {
        /*
         * Same layout with a 2 chunk journal at chunk 12:
         *
         *   |0|1|2|3|4|5|6|7|P|P| | |J|J|
         */
        let opts = GroupOptions {
            chunk_size: 16,
            exported_disk_capacity: 16 * 8,
            paged_disk_capacity: 16 * 2,
            journal: Some(JournalRange {
                start: 16 * 12,
                blocks: 32,
            }),
            ..Default::default()
        };
        GroupDefinition::from_options(&opts).unwrap()
    }

    #[test]
    fn lba_to_chunk() {
        let def = small_def();
        assert_eq!(lba_to_chunk_index(&def, 0), Ok(0));
        assert_eq!(lba_to_chunk_index(&def, 15), Ok(0));
        assert_eq!(lba_to_chunk_index(&def, 16), Ok(1));
        assert_eq!(lba_to_chunk_index(&def, 159), Ok(9));
        assert!(matches!(
            lba_to_chunk_index(&def, 160),
            Err(RaidMetaError::LbaOutOfRange(_))
        ));
    }

    #[test]
    fn chunk_to_lba() {
        let def = small_def();
        assert_eq!(chunk_index_to_lba(&def, 0), Ok(0));
        assert_eq!(chunk_index_to_lba(&def, 9), Ok(144));
        assert!(chunk_index_to_lba(&def, 10).is_err());
    }

    #[test]
    fn chunk_range_rounds_up() {
        let def = small_def();
        assert_eq!(chunk_range(&def, 0, 16), Ok(ChunkRange::new(0, 1)));
        assert_eq!(chunk_range(&def, 0, 17), Ok(ChunkRange::new(0, 2)));
        assert_eq!(chunk_range(&def, 32, 1), Ok(ChunkRange::new(2, 1)));
        assert_eq!(chunk_range(&def, 32, 0), Ok(ChunkRange::new(2, 0)));
        assert!(chunk_range(&def, 1000, 1).is_err());
    }

    #[test]
    fn journal_lba() {
        let def = journal_def();
        assert_eq!(journal_lba_to_chunk_index(&def, 16 * 12), Ok(12));
        assert_eq!(journal_lba_to_chunk_index(&def, 16 * 14 - 1), Ok(13));
        assert!(journal_lba_to_chunk_index(&def, 16 * 14).is_err());
        assert!(journal_lba_to_chunk_index(&def, 16 * 12 - 1).is_err());

        // Ordinary capacity accounting does not cover the journal
        assert!(lba_to_chunk_index(&def, 16 * 12).is_err());

        // No journal at all
        assert!(journal_lba_to_chunk_index(&small_def(), 0).is_err());
    }

    #[test]
    fn classify_areas() {
        let def = small_def();
        /*
         *   |0|1|2|3|4|5|6|7|P|P|
         *   |---------------|        user
         *                   |---|    paged
         *                 |---|      spans
         */
        assert_eq!(
            classify(&def, ChunkRange::new(0, 8)),
            Ok(ChunkArea::UserData)
        );
        assert_eq!(
            classify(&def, ChunkRange::new(8, 2)),
            Ok(ChunkArea::PagedMetadata)
        );
        assert!(matches!(
            classify(&def, ChunkRange::new(7, 2)),
            Err(RaidMetaError::RangeSpansBoundary(_))
        ));
        assert!(matches!(
            classify(&def, ChunkRange::new(9, 2)),
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));
        assert!(matches!(
            classify(&def, ChunkRange::new(3, 0)),
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));
    }

    #[test]
    fn classify_journal_first() {
        let def = journal_def();
        assert_eq!(
            classify(&def, ChunkRange::new(12, 2)),
            Ok(ChunkArea::Journal)
        );
        assert_eq!(
            classify(&def, ChunkRange::new(13, 1)),
            Ok(ChunkArea::Journal)
        );
        assert!(matches!(
            classify(&def, ChunkRange::new(12, 0)),
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));
        assert!(matches!(
            classify(&def, ChunkRange::new(13, 2)),
            Err(RaidMetaError::JournalRangeExceeded(_))
        ));
        assert_eq!(
            classify(&def, ChunkRange::new(2, 2)),
            Ok(ChunkArea::UserData)
        );
    }

    #[test]
    fn classify_raw_mirror() {
        let opts = GroupOptions {
            chunk_size: 16,
            exported_disk_capacity: 16 * 8,
            paged_disk_capacity: 0,
            has_paged_metadata: false,
            ..Default::default()
        };
        let def = GroupDefinition::from_options(&opts).unwrap();
        assert_eq!(
            classify(&def, ChunkRange::new(0, 1)),
            Ok(ChunkArea::PagedMetadata)
        );
    }

    #[test]
    fn spans_user_and_paged() {
        let def = small_def();
        assert_eq!(lba_range_spans_user_and_paged(&def, 0, 128), Ok(false));
        assert_eq!(lba_range_spans_user_and_paged(&def, 112, 32), Ok(true));
        assert_eq!(lba_range_spans_user_and_paged(&def, 128, 32), Ok(false));
    }

    #[test]
    fn lba_range_of_chunks() {
        let def = small_def();
        assert_eq!(
            chunk_range_to_lba_range(&def, ChunkRange::new(2, 3)),
            Ok((32, 79))
        );
        assert!(matches!(
            chunk_range_to_lba_range(&def, ChunkRange::new(2, 0)),
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));
    }

    #[test]
    fn user_range_for_paged() {
        let def = small_def();
        // One paged chunk holds 128 * 16 records, more than the 8 user
        // chunks, so the user range is clamped.
        assert_eq!(
            user_range_for_paged_range(&def, ChunkRange::new(8, 1)),
            Ok(ChunkRange::new(0, 8))
        );
        assert!(user_range_for_paged_range(&def, ChunkRange::new(7, 1))
            .is_err());
    }

    #[proptest]
    fn chunk_contains_its_lba(
        #[strategy(0..4u32)] shift: u32,
        #[strategy(1..=64u64)] user_chunks: u64,
        #[strategy(1..=8u64)] paged_chunks: u64,
        #[strategy(0..(#user_chunks + #paged_chunks) * (16 << #shift))]
        lba: u64,
    ) {
        let chunk_size = 16u64 << shift;
        let opts = GroupOptions {
            chunk_size,
            exported_disk_capacity: chunk_size * user_chunks,
            paged_disk_capacity: chunk_size * paged_chunks,
            ..Default::default()
        };
        let def = GroupDefinition::from_options(&opts).unwrap();

        let chunk = lba_to_chunk_index(&def, lba).unwrap();
        let base = chunk_index_to_lba(&def, chunk).unwrap();
        prop_assert!(base <= lba);
        prop_assert!(lba < base + chunk_size);
    }

    #[proptest]
    fn classify_never_lies(
        #[strategy(1..=32u64)] user_chunks: u64,
        #[strategy(1..=8u64)] paged_chunks: u64,
        #[strategy(0..#user_chunks + #paged_chunks)] start: u64,
        #[strategy(1..=#user_chunks + #paged_chunks - #start)] count: u64,
    ) {
        let opts = GroupOptions {
            chunk_size: 16,
            exported_disk_capacity: 16 * user_chunks,
            paged_disk_capacity: 16 * paged_chunks,
            ..Default::default()
        };
        let def = GroupDefinition::from_options(&opts).unwrap();
        let range = ChunkRange::new(start, count);

        match classify(&def, range) {
            Ok(ChunkArea::UserData) => {
                prop_assert!(range.last() < user_chunks)
            }
            Ok(ChunkArea::PagedMetadata) => {
                prop_assert!(range.start >= user_chunks)
            }
            Ok(ChunkArea::Journal) => prop_assert!(false),
            Err(RaidMetaError::RangeSpansBoundary(_)) => {
                prop_assert!(range.start < user_chunks);
                prop_assert!(range.last() >= user_chunks);
            }
            Err(e) => prop_assert!(false, "unexpected {:?}", e),
        }
    }
}
