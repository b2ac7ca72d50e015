// Copyright 2023 Oxide Computer Company
//! The paged metadata region cannot describe itself.  Its chunks are
//! summarized by the metadata of metadata: `MDD_SLOTS` records in the
//! non-paged record, each standing in for `chunks_per_slot` consecutive
//! paged metadata chunks.
use super::*;

use crate::chunk::ChunkRange;
use crate::nonpaged::NonPagedRecord;

/// Geometry of the metadata of metadata for one group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MddMap {
    /// Chunk index of the first chunk the slots describe.  Zero on a raw
    /// mirror, where the slots cover every chunk.
    first_chunk: u64,
    metadata_chunks: u64,
    chunks_per_slot: u64,
    total_chunks: u64,
    chunk_size: u64,
    width: u32,
}

impl MddMap {
    pub fn new(def: &GroupDefinition) -> Self {
        let (first_chunk, metadata_chunks) = if def.has_paged_metadata() {
            (def.exported_chunks(), def.paged_chunks_per_data_disk())
        } else {
            (0, def.exported_chunks())
        };
        MddMap {
            first_chunk,
            metadata_chunks,
            chunks_per_slot: metadata_chunks.div_ceil(MDD_SLOTS as u64),
            total_chunks: def.total_chunks(),
            chunk_size: def.chunk_size(),
            width: def.width(),
        }
    }

    pub fn metadata_chunks(&self) -> u64 {
        self.metadata_chunks
    }

    pub fn chunks_per_slot(&self) -> u64 {
        self.chunks_per_slot
    }

    /// Slots actually in use.  The last one may describe fewer than
    /// `chunks_per_slot` chunks.
    pub fn slot_count(&self) -> Result<usize, RaidMetaError> {
        if self.chunks_per_slot == 0 {
            return Ok(0);
        }
        let mut count = self.metadata_chunks / self.chunks_per_slot;
        if self.metadata_chunks % self.chunks_per_slot != 0 {
            count += 1;
        }
        if count > MDD_SLOTS as u64 {
            raid_bail!(
                SlotOverflow,
                "{} metadata chunks need {} slots",
                self.metadata_chunks,
                count
            );
        }
        Ok(count as usize)
    }

    fn relative(&self, chunk: u64) -> Result<u64, RaidMetaError> {
        if chunk < self.first_chunk {
            raid_bail!(
                ChunkOutOfRange,
                "chunk {:#x} is below the paged metadata at {:#x}",
                chunk,
                self.first_chunk
            );
        }
        Ok(chunk - self.first_chunk)
    }

    /// The slot describing `chunk`.
    pub fn physical_to_slot(&self, chunk: u64) -> Result<usize, RaidMetaError> {
        if self.chunks_per_slot == 0 {
            raid_bail!(SlotOverflow, "group has no metadata chunks");
        }
        let slot = self.relative(chunk)? / self.chunks_per_slot;
        if slot >= MDD_SLOTS as u64 {
            raid_bail!(
                SlotOverflow,
                "chunk {:#x} maps to slot {} of {}",
                chunk,
                slot,
                MDD_SLOTS
            );
        }
        Ok(slot as usize)
    }

    /// The chunks a slot describes.
    pub fn slot_to_physical_range(
        &self,
        slot: usize,
    ) -> Result<ChunkRange, RaidMetaError> {
        if slot >= MDD_SLOTS {
            raid_bail!(SlotOverflow, "slot {} >= {}", slot, MDD_SLOTS);
        }
        let start = slot as u64 * self.chunks_per_slot + self.first_chunk;
        Ok(ChunkRange::new(start, self.chunks_per_slot))
    }

    /// The chunk to resume work at for `slot` given a per-disk checkpoint:
    /// the checkpoint's chunk if it falls inside the slot, else the slot's
    /// first chunk.
    pub fn slot_to_chunk_for_checkpoint(
        &self,
        slot: usize,
        checkpoint: u64,
    ) -> Result<u64, RaidMetaError> {
        let range = self.slot_to_physical_range(slot)?;
        if checkpoint != LBA_INVALID && self.chunk_size != 0 {
            let chunk = checkpoint / self.chunk_size;
            if range.count > 0 && range.contains(chunk) {
                return Ok(chunk);
            }
        }
        Ok(range.start)
    }

    /// Expand the slots into one record per chunk of `range`.
    ///
    /// A slot shared by several chunks only says that some of them need
    /// work.  Where a rebuild checkpoint has already passed a chunk, that
    /// position's bit is dropped for the chunk.
    pub fn populate(
        &self,
        np: &NonPagedRecord,
        range: ChunkRange,
    ) -> Result<Vec<PagedChunkRecord>, RaidMetaError> {
        let rel_start = self.relative(range.start)?;
        let slots = &np.paged_metadata_metadata;

        if self.chunks_per_slot == 1 {
            let Some(words) = slots
                .get(rel_start as usize..(rel_start + range.count) as usize)
            else {
                raid_bail!(
                    SlotOverflow,
                    "chunks {:#x}+{:#x} beyond the slots",
                    range.start,
                    range.count
                );
            };
            return Ok(words
                .iter()
                .map(|w| PagedChunkRecord::from_wire(*w))
                .collect());
        }

        let mut out = Vec::with_capacity(range.count as usize);
        for i in 0..range.count {
            let slot = ((rel_start + i) / self.chunks_per_slot) as usize;
            let Some(word) = slots.get(slot) else {
                raid_bail!(
                    SlotOverflow,
                    "chunk {:#x} maps to slot {}",
                    range.start + i,
                    slot
                );
            };
            let mut record = PagedChunkRecord::from_wire(*word);

            let lba = (range.start + i) * self.chunk_size;
            for c in np.rebuild_info.checkpoints.iter() {
                if c.position >= self.width || c.checkpoint == LBA_INVALID {
                    continue;
                }
                if lba < c.checkpoint {
                    record.needs_rebuild &= !(1 << c.position);
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    /// How many slots a clear of `range` may touch, starting at the slot of
    /// `range.start`.  A slot is only cleared when the range reaches the
    /// slot's last chunk (or the end of the group).
    pub fn clearable_slot_count(
        &self,
        range: ChunkRange,
    ) -> Result<u64, RaidMetaError> {
        if self.chunks_per_slot == 1 {
            return Ok(range.count);
        }
        if self.chunks_per_slot == 0 || range.count == 0 {
            raid_bail!(
                PartialSlotClear,
                "nothing to clear at chunk {:#x}",
                range.start
            );
        }

        let rel_start = self.relative(range.start)?;
        let rel_last = rel_start + range.count - 1;
        let start_slot = rel_start / self.chunks_per_slot;
        let end_slot = rel_last / self.chunks_per_slot;
        if start_slot > MDD_SLOTS as u64
            || end_slot > MDD_SLOTS as u64
            || start_slot > end_slot
        {
            raid_bail!(
                SlotOverflow,
                "chunks {:#x}+{:#x} map to slots {}..={}",
                range.start,
                range.count,
                start_slot,
                end_slot
            );
        }

        let mut n = end_slot - start_slot;
        if range.end() == self.total_chunks
            || (rel_last + 1) % self.chunks_per_slot == 0
        {
            n += 1;
        }
        if n == 0 {
            raid_bail!(
                PartialSlotClear,
                "chunks {:#x}+{:#x} do not complete slot {}",
                range.start,
                range.count,
                start_slot
            );
        }
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nonpaged::RebuildCheckpointInfo;
    use proptest::prelude::*;
    use test_strategy::proptest;

    /*
     * 64 exported chunks followed by 30 chunks of paged metadata per data
     * disk.  Three metadata chunks per slot, ten slots in use:
     *
     *   chunk   64 65 66 | 67 68 69 | ... | 91 92 93
     *   slot        0    |    1     | ... |    9
     */
    fn big_def() -> GroupDefinition {
        let opts = GroupOptions {
            paged_disk_capacity: 0x800 * 30,
            ..Default::default()
        };
        GroupDefinition::from_options(&opts).unwrap()
    }

    fn raw_mirror_def() -> GroupDefinition {
        let opts = GroupOptions {
            width: 3,
            data_disks: 1,
            has_paged_metadata: false,
            ..Default::default()
        };
        GroupDefinition::from_options(&opts).unwrap()
    }

    #[test]
    fn geometry() {
        let m = MddMap::new(&GroupDefinition::default());
        assert_eq!(m.metadata_chunks(), 4);
        assert_eq!(m.chunks_per_slot(), 1);
        assert_eq!(m.slot_count(), Ok(4));

        let m = MddMap::new(&big_def());
        assert_eq!(m.chunks_per_slot(), 3);
        assert_eq!(m.slot_count(), Ok(10));

        // 64 chunks over 14 slots: 5 per slot, the last one partial
        let m = MddMap::new(&raw_mirror_def());
        assert_eq!(m.chunks_per_slot(), 5);
        assert_eq!(m.slot_count(), Ok(13));
    }

    #[test]
    fn no_metadata_chunks() {
        let opts = GroupOptions {
            paged_disk_capacity: 0,
            ..Default::default()
        };
        let def = GroupDefinition::from_options(&opts).unwrap();
        let m = MddMap::new(&def);
        assert_eq!(m.slot_count(), Ok(0));
        assert!(m.physical_to_slot(64).is_err());
    }

    #[test]
    fn translate_both_ways() {
        let m = MddMap::new(&big_def());
        assert_eq!(m.physical_to_slot(64), Ok(0));
        assert_eq!(m.physical_to_slot(66), Ok(0));
        assert_eq!(m.physical_to_slot(67), Ok(1));
        assert_eq!(m.physical_to_slot(93), Ok(9));
        assert!(matches!(
            m.physical_to_slot(63),
            Err(RaidMetaError::ChunkOutOfRange(_))
        ));

        assert_eq!(m.slot_to_physical_range(1), Ok(ChunkRange::new(67, 3)));
        assert!(matches!(
            m.slot_to_physical_range(MDD_SLOTS),
            Err(RaidMetaError::SlotOverflow(_))
        ));

        let m = MddMap::new(&raw_mirror_def());
        assert_eq!(m.physical_to_slot(0), Ok(0));
        assert_eq!(m.physical_to_slot(63), Ok(12));
        assert_eq!(m.slot_to_physical_range(2), Ok(ChunkRange::new(10, 5)));
    }

    #[test]
    fn checkpoint_inside_slot() {
        let m = MddMap::new(&big_def());
        // Slot 1 covers chunks 67..=69
        assert_eq!(m.slot_to_chunk_for_checkpoint(1, 68 * 0x800 + 5), Ok(68));
        assert_eq!(m.slot_to_chunk_for_checkpoint(1, 70 * 0x800), Ok(67));
        assert_eq!(m.slot_to_chunk_for_checkpoint(1, LBA_INVALID), Ok(67));
        assert!(m.slot_to_chunk_for_checkpoint(14, 0).is_err());
    }

    #[test]
    fn populate_one_per_slot() {
        let def = GroupDefinition::default();
        let m = MddMap::new(&def);
        let mut np = NonPagedRecord::new_default(&def);
        np.paged_metadata_metadata[2] =
            PagedChunkRecord::with_needs_rebuild(0b1).to_wire() | 1;

        let recs = m.populate(&np, ChunkRange::new(65, 3)).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].needs_rebuild, 0);
        assert_eq!(recs[1].needs_rebuild, 0b1);
        assert!(recs.iter().all(|r| r.valid));

        assert!(m.populate(&np, ChunkRange::new(64 + 13, 2)).is_err());
    }

    #[test]
    fn populate_filters_rebuilt_chunks() {
        let def = big_def();
        let m = MddMap::new(&def);
        let mut np = NonPagedRecord::new_default(&def);
        np.paged_metadata_metadata[1] =
            PagedChunkRecord::with_needs_rebuild(0b110).to_wire() | 1;
        // Position 1 has been rebuilt up to chunk 68
        np.rebuild_info.checkpoints[0] = RebuildCheckpointInfo {
            checkpoint: 68 * 0x800,
            position: 1,
        };

        let recs = m.populate(&np, ChunkRange::new(66, 4)).unwrap();
        let nr: Vec<u16> = recs.iter().map(|r| r.needs_rebuild).collect();
        //           66 (slot 0), 67, 68, 69
        assert_eq!(nr, vec![0, 0b100, 0b110, 0b110]);
    }

    #[test]
    fn clear_only_whole_slots() {
        let def = big_def();
        let m = MddMap::new(&def);

        // Ends on a slot boundary: slots 0 and 1
        assert_eq!(m.clearable_slot_count(ChunkRange::new(64, 6)), Ok(2));
        // Ends mid slot 1: only slot 0
        assert_eq!(m.clearable_slot_count(ChunkRange::new(64, 5)), Ok(1));
        // Inside one slot, not at its end
        assert!(matches!(
            m.clearable_slot_count(ChunkRange::new(67, 1)),
            Err(RaidMetaError::PartialSlotClear(_))
        ));
        // Reaching the end of the group completes the last slot
        assert_eq!(m.clearable_slot_count(ChunkRange::new(92, 2)), Ok(1));

        let m = MddMap::new(&GroupDefinition::default());
        assert_eq!(m.clearable_slot_count(ChunkRange::new(65, 2)), Ok(2));
    }

    #[proptest]
    fn every_metadata_chunk_has_a_slot(
        #[strategy(1u64..200)] metadata_chunks: u64,
        #[strategy(0u64..200)] offset: u64,
    ) {
        let opts = GroupOptions {
            paged_disk_capacity: 0x800 * metadata_chunks,
            ..Default::default()
        };
        let def = GroupDefinition::from_options(&opts).unwrap();
        let m = MddMap::new(&def);
        let count = m.slot_count().unwrap();
        prop_assert!(count <= MDD_SLOTS);

        let chunk = def.exported_chunks() + offset % metadata_chunks;
        let slot = m.physical_to_slot(chunk).unwrap();
        prop_assert!(slot < count);
        prop_assert!(m.slot_to_physical_range(slot).unwrap().contains(chunk));
    }
}
