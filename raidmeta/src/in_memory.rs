// Copyright 2023 Oxide Computer Company

use super::*;

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use rangemap::RangeSet;
use tokio::sync::OwnedMutexGuard;

use crate::nonpaged::NONPAGED_RECORD_SIZE;

/// Counters for what the metadata service was asked to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub paged_reads: u64,
    pub paged_updates: u64,
    pub paged_write_verifies: u64,
    pub paged_scans: u64,
    pub np_persists: u64,
    pub np_force_sets: u64,
    pub np_increments: u64,
    pub np_bit_updates: u64,
    pub allocations: u64,
    /// Every paged request, in the order it arrived.
    pub paged_requests: Vec<PagedRequest>,
}

struct Inner {
    paged: Vec<u32>,

    /// The local non-paged image and the one the peer would see.
    nonpaged: Vec<u8>,
    peer: Vec<u8>,

    /// Stripe ranges held by in-flight paged requests.
    stripes: RangeSet<u64>,

    next_paged_fault: Option<MetadataStatus>,
    next_nonpaged_fault: Option<MetadataStatus>,
    next_allocate_fault: Option<MetadataStatus>,

    stats: ServiceStats,
}

/// Implement MetadataService in memory, for tests and the demo.
///
/// Paged records exist for exported chunks only; the paged region itself is
/// summarized by the metadata of metadata slots in the non-paged record.
pub struct InMemoryMetadata {
    max_chunks: u64,
    inner: Mutex<Inner>,
    np_lock: Arc<tokio::sync::Mutex<()>>,
    np_guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

fn patch(image: &mut [u8], offset: usize, data: &[u8]) -> bool {
    match image.get_mut(offset..offset + data.len()) {
        Some(dst) => {
            dst.copy_from_slice(data);
            true
        }
        None => false,
    }
}

impl InMemoryMetadata {
    /// A freshly created group: every paged record initialized, the
    /// non-paged image blank.
    pub fn new(def: &GroupDefinition) -> Self {
        InMemoryMetadata {
            max_chunks: def.max_chunks_per_request(),
            inner: Mutex::new(Inner {
                paged: vec![
                    PagedChunkRecord::initialized().to_wire();
                    def.exported_chunks() as usize
                ],
                nonpaged: vec![0; NONPAGED_RECORD_SIZE],
                peer: vec![0; NONPAGED_RECORD_SIZE],
                stripes: RangeSet::new(),
                next_paged_fault: None,
                next_nonpaged_fault: None,
                next_allocate_fault: None,
                stats: ServiceStats::default(),
            }),
            np_lock: Arc::new(tokio::sync::Mutex::new(())),
            np_guard: Mutex::new(None),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next paged request fails with `status`.
    pub fn fail_next_paged(&self, status: MetadataStatus) {
        self.inner().next_paged_fault = Some(status);
    }

    /// The next non-paged request fails with `status`.
    pub fn fail_next_nonpaged(&self, status: MetadataStatus) {
        self.inner().next_nonpaged_fault = Some(status);
    }

    /// The next memory allocation fails with `status`.
    pub fn fail_next_allocate(&self, status: MetadataStatus) {
        self.inner().next_allocate_fault = Some(status);
    }

    pub fn stats(&self) -> ServiceStats {
        self.inner().stats.clone()
    }

    pub fn record(&self, chunk: u64) -> Option<PagedChunkRecord> {
        self.inner()
            .paged
            .get(chunk as usize)
            .map(|w| PagedChunkRecord::from_wire(*w))
    }

    pub fn set_record(&self, chunk: u64, record: PagedChunkRecord) {
        if let Some(w) = self.inner().paged.get_mut(chunk as usize) {
            *w = record.to_wire();
        }
    }

    /// Mark `range` as lost; the records read back invalid.
    pub fn invalidate(&self, range: Range<u64>) {
        let mut inner = self.inner();
        for chunk in range {
            if let Some(w) = inner.paged.get_mut(chunk as usize) {
                *w = PagedChunkRecord::empty().to_wire();
            }
        }
    }

    /// The local non-paged image.
    pub fn image(&self) -> Vec<u8> {
        self.inner().nonpaged.clone()
    }

    /// A checkpoint as the peer last saw it.
    pub fn peer_checkpoint(&self, offset: usize) -> u64 {
        let inner = self.inner();
        let mut v = [0u8; 8];
        if let Some(src) = inner.peer.get(offset..offset + 8) {
            v.copy_from_slice(src);
        }
        u64::from_le_bytes(v)
    }

    pub fn np_lock_held(&self) -> bool {
        self.np_guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /*
     * Common entry for paged requests: consume an injected fault, check the
     * request is in range, and take the stripe lock.  The caller must hand
     * the stripe back with `end_paged`.
     */
    fn begin_paged(
        &self,
        inner: &mut Inner,
        req: &PagedRequest,
    ) -> Result<(), MetadataStatus> {
        self.begin_paged_limited(inner, req, self.max_chunks)
    }

    fn begin_paged_limited(
        &self,
        inner: &mut Inner,
        req: &PagedRequest,
        limit: u64,
    ) -> Result<(), MetadataStatus> {
        inner.stats.paged_requests.push(req.clone());
        if let Some(s) = inner.next_paged_fault.take() {
            return Err(s);
        }
        if req.count == 0
            || req.count > limit
            || req.start + req.count > inner.paged.len() as u64
        {
            return Err(MetadataStatus::Failure);
        }
        if !req.stripe.is_empty() {
            if inner.stripes.overlaps(&req.stripe) {
                return Err(MetadataStatus::Busy);
            }
            inner.stripes.insert(req.stripe.clone());
        }
        Ok(())
    }

    fn end_paged(&self, inner: &mut Inner, req: &PagedRequest) {
        if !req.stripe.is_empty() {
            inner.stripes.remove(req.stripe.clone());
        }
    }

    fn begin_nonpaged(&self, inner: &mut Inner) -> Result<(), MetadataStatus> {
        match inner.next_nonpaged_fault.take() {
            Some(s) => Err(s),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MetadataService for InMemoryMetadata {
    fn max_chunks_per_request(&self) -> u64 {
        self.max_chunks
    }

    async fn paged_read(
        &self,
        req: &PagedRequest,
    ) -> Result<Vec<PagedChunkRecord>, MetadataStatus> {
        let mut inner = self.inner();
        self.begin_paged(&mut inner, req)?;
        inner.stats.paged_reads += 1;
        let out = inner.paged[req.start as usize..][..req.count as usize]
            .iter()
            .map(|w| PagedChunkRecord::from_wire(*w))
            .collect();
        self.end_paged(&mut inner, req);
        Ok(out)
    }

    async fn paged_update(
        &self,
        req: &PagedRequest,
        op: PagedOp,
        record: PagedChunkRecord,
    ) -> Result<Option<PagedChunkRecord>, MetadataStatus> {
        let mut inner = self.inner();
        self.begin_paged(&mut inner, req)?;
        inner.stats.paged_updates += 1;
        for w in inner.paged[req.start as usize..][..req.count as usize]
            .iter_mut()
        {
            let mut r = PagedChunkRecord::from_wire(*w);
            match op {
                PagedOp::Set => r.set_bits(&record),
                PagedOp::Clear => r.clear_bits(&record),
                PagedOp::Write => r = record,
            }
            *w = r.to_wire();
        }
        let after = if req.count == 1 {
            Some(PagedChunkRecord::from_wire(inner.paged[req.start as usize]))
        } else {
            None
        };
        self.end_paged(&mut inner, req);
        Ok(after)
    }

    async fn paged_write_repeat(
        &self,
        req: &PagedRequest,
        record: PagedChunkRecord,
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_paged_limited(&mut inner, req, u64::MAX)?;
        inner.stats.paged_updates += 1;
        let word = record.to_wire();
        inner.paged[req.start as usize..][..req.count as usize].fill(word);
        self.end_paged(&mut inner, req);
        Ok(())
    }

    async fn paged_write_verify(
        &self,
        req: &PagedRequest,
        rewrite: &mut (dyn FnMut(u64, PagedChunkRecord) -> PagedChunkRecord
                  + Send),
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_paged(&mut inner, req)?;
        inner.stats.paged_write_verifies += 1;
        for (i, w) in inner.paged[req.start as usize..][..req.count as usize]
            .iter_mut()
            .enumerate()
        {
            *w = rewrite(req.start + i as u64, PagedChunkRecord::from_wire(*w))
                .to_wire();
        }
        self.end_paged(&mut inner, req);
        Ok(())
    }

    async fn paged_scan(
        &self,
        req: &PagedRequest,
        observe: &mut (dyn FnMut(u64, PagedChunkRecord) + Send),
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_paged(&mut inner, req)?;
        inner.stats.paged_scans += 1;
        for (i, w) in inner.paged[req.start as usize..][..req.count as usize]
            .iter()
            .enumerate()
        {
            observe(req.start + i as u64, PagedChunkRecord::from_wire(*w));
        }
        self.end_paged(&mut inner, req);
        Ok(())
    }

    async fn nonpaged_read(&self) -> Result<Vec<u8>, MetadataStatus> {
        let mut inner = self.inner();
        self.begin_nonpaged(&mut inner)?;
        Ok(inner.nonpaged.clone())
    }

    async fn nonpaged_write_persist(
        &self,
        offset: usize,
        data: &[u8],
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_nonpaged(&mut inner)?;
        if !patch(&mut inner.nonpaged, offset, data) {
            return Err(MetadataStatus::Failure);
        }
        patch(&mut inner.peer, offset, data);
        inner.stats.np_persists += 1;
        Ok(())
    }

    async fn nonpaged_force_set_checkpoint(
        &self,
        offset: usize,
        value: u64,
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_nonpaged(&mut inner)?;
        let data = value.to_le_bytes();
        if !patch(&mut inner.nonpaged, offset, &data) {
            return Err(MetadataStatus::Failure);
        }
        patch(&mut inner.peer, offset, &data);
        inner.stats.np_force_sets += 1;
        Ok(())
    }

    async fn nonpaged_increment_checkpoint(
        &self,
        offset: usize,
        value: u64,
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_nonpaged(&mut inner)?;
        if !patch(&mut inner.nonpaged, offset, &value.to_le_bytes()) {
            return Err(MetadataStatus::Failure);
        }
        inner.stats.np_increments += 1;
        Ok(())
    }

    async fn nonpaged_set_bits(
        &self,
        offset: usize,
        data: &[u8],
        repeat: usize,
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_nonpaged(&mut inner)?;
        let end = offset + data.len() * repeat;
        if end > inner.nonpaged.len() {
            return Err(MetadataStatus::Failure);
        }
        for (i, b) in inner.nonpaged[offset..end].iter_mut().enumerate() {
            *b |= data[i % data.len()];
        }
        let local = inner.nonpaged[offset..end].to_vec();
        inner.peer[offset..end].copy_from_slice(&local);
        inner.stats.np_bit_updates += 1;
        Ok(())
    }

    async fn nonpaged_clear_bits(
        &self,
        offset: usize,
        data: &[u8],
        repeat: usize,
    ) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        self.begin_nonpaged(&mut inner)?;
        let end = offset + data.len() * repeat;
        if end > inner.nonpaged.len() {
            return Err(MetadataStatus::Failure);
        }
        for (i, b) in inner.nonpaged[offset..end].iter_mut().enumerate() {
            *b &= !data[i % data.len()];
        }
        let local = inner.nonpaged[offset..end].to_vec();
        inner.peer[offset..end].copy_from_slice(&local);
        inner.stats.np_bit_updates += 1;
        Ok(())
    }

    async fn acquire_np_lock(&self) -> Result<(), MetadataStatus> {
        let guard = self.np_lock.clone().lock_owned().await;
        *self.np_guard.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);
        Ok(())
    }

    async fn release_np_lock(&self) {
        self.np_guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    async fn allocate(&self, _chunks: u64) -> Result<(), MetadataStatus> {
        let mut inner = self.inner();
        inner.stats.allocations += 1;
        match inner.next_allocate_fault.take() {
            Some(s) => Err(s),
            None => Ok(()),
        }
    }
}

/// A block verifier with scripted results.
#[derive(Default)]
pub struct InMemoryVerifier {
    inner: Mutex<VerifierInner>,
}

#[derive(Default)]
struct VerifierInner {
    /// Result for a verify starting at this per-disk LBA.
    results: BTreeMap<u64, VerifyReport>,
    fail: Option<RaidMetaError>,
    calls: Vec<(u64, u64, KeyGeneration)>,
}

impl InMemoryVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, VerifierInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A verify at `lba` reports `report`.
    pub fn set_result(&self, lba: u64, report: VerifyReport) {
        self.inner().results.insert(lba, report);
    }

    /// Every verify fails with `err` until cleared.
    pub fn set_failure(&self, err: Option<RaidMetaError>) {
        self.inner().fail = err;
    }

    pub fn calls(&self) -> Vec<(u64, u64, KeyGeneration)> {
        self.inner().calls.clone()
    }
}

#[async_trait]
impl BlockVerifier for InMemoryVerifier {
    async fn verify_read_only(
        &self,
        lba: u64,
        blocks: u64,
        key: KeyGeneration,
    ) -> Result<VerifyReport, RaidMetaError> {
        let mut inner = self.inner();
        inner.calls.push((lba, blocks, key));
        if let Some(e) = inner.fail.clone() {
            return Err(e);
        }
        Ok(inner.results.get(&lba).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn req(start: u64, count: u64) -> PagedRequest {
        PagedRequest {
            start,
            count,
            stripe: 0..0,
        }
    }

    #[tokio::test]
    async fn paged_ops() {
        let md = InMemoryMetadata::new(&GroupDefinition::default());
        let nr = PagedChunkRecord::with_needs_rebuild(0b10);

        let after = md.paged_update(&req(3, 1), PagedOp::Set, nr).await;
        assert_eq!(after.unwrap().unwrap().needs_rebuild, 0b10);
        assert!(md.record(3).unwrap().valid);

        let after = md.paged_update(&req(0, 8), PagedOp::Clear, nr).await;
        assert_eq!(after, Ok(None));
        assert_eq!(md.record(3), Some(PagedChunkRecord::initialized()));

        md.invalidate(5..7);
        let recs = md.paged_read(&req(4, 4)).await.unwrap();
        let valid: Vec<bool> = recs.iter().map(|r| r.valid).collect();
        assert_eq!(valid, vec![true, false, false, true]);

        // Off the end of the paged records
        assert_eq!(
            md.paged_read(&req(63, 2)).await,
            Err(MetadataStatus::Failure)
        );
    }

    #[tokio::test]
    async fn injected_faults() {
        let md = InMemoryMetadata::new(&GroupDefinition::default());
        md.fail_next_paged(MetadataStatus::IoRetryable);
        assert_eq!(
            md.paged_read(&req(0, 1)).await,
            Err(MetadataStatus::IoRetryable)
        );
        assert!(md.paged_read(&req(0, 1)).await.is_ok());

        md.fail_next_nonpaged(MetadataStatus::Busy);
        assert_eq!(
            md.nonpaged_write_persist(0, &[1]).await,
            Err(MetadataStatus::Busy)
        );
        assert_eq!(md.image()[0], 0);
        assert_eq!(md.stats().paged_reads, 1);
        assert_eq!(md.stats().paged_requests.len(), 2);
    }

    #[tokio::test]
    async fn bit_updates_repeat() {
        let md = InMemoryMetadata::new(&GroupDefinition::default());
        md.nonpaged_set_bits(8, &[0x01, 0x80], 3).await.unwrap();
        assert_eq!(&md.image()[8..14], &[0x01, 0x80, 0x01, 0x80, 0x01, 0x80]);
        md.nonpaged_clear_bits(10, &[0x01, 0x00], 1).await.unwrap();
        assert_eq!(&md.image()[8..14], &[0x01, 0x80, 0x00, 0x80, 0x01, 0x80]);
    }

    #[tokio::test]
    async fn np_lock_is_exclusive() {
        let md = Arc::new(InMemoryMetadata::new(&GroupDefinition::default()));
        md.acquire_np_lock().await.unwrap();
        assert!(md.np_lock_held());

        let md2 = md.clone();
        let waiter = tokio::spawn(async move {
            md2.acquire_np_lock().await.unwrap();
            md2.release_np_lock().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        md.release_np_lock().await;
        waiter.await.unwrap();
        assert!(!md.np_lock_held());
    }
}
