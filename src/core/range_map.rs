//! Byte-range bookkeeping for one ranged download attempt.
//!
//! A [`RangeMap`] covers `[0, total_size)` and tracks the segments workers
//! are filling. Everything that is not covered by a segment is a gap; new
//! segments are opened inside the largest gap, so the unfinished part of the
//! file is re-partitioned as workers come and go.

use crate::core::error::RangeMapError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Handle to a segment owned by a [`RangeMap`].
///
/// The start offset never changes. The id tells apart two segments that
/// happened to start at the same offset at different times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    start: u64,
    id: u64,
}

impl Segment {
    pub fn start(&self) -> u64 {
        self.start
    }
}

#[derive(Debug, Clone, Copy)]
struct SegmentState {
    id: u64,
    length: u64,
    finished: bool,
}

/// Outcome of [`RangeMap::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Absolute file offset where the accepted bytes go.
    pub offset: u64,
    /// How many bytes of the chunk belong to this segment.
    pub accepted: u64,
    /// False once the segment touched the next segment or the end of file.
    pub more: bool,
}

/// Read-only view of one segment, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSnapshot {
    pub start: u64,
    pub length: u64,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy)]
struct Gap {
    start: u64,
    size: u64,
    live_left: bool,
}

impl Gap {
    /// Where a new segment should open inside this gap. A live segment on the
    /// left keeps filling the first half, otherwise nobody would.
    fn claim_point(&self) -> u64 {
        if self.live_left {
            self.start + self.size / 2
        } else {
            self.start
        }
    }
}

#[derive(Debug, Default)]
struct Segments {
    by_start: BTreeMap<u64, SegmentState>,
    next_id: u64,
}

impl Segments {
    fn next_boundary(&self, start: u64, total: u64) -> u64 {
        self.by_start
            .range((Excluded(start), Unbounded))
            .next()
            .map(|(s, _)| *s)
            .unwrap_or(total)
    }

    fn gaps(&self, total: u64) -> Vec<Gap> {
        let mut gaps = Vec::with_capacity(self.by_start.len() + 1);
        let mut prev_end = 0u64;
        let mut live_left = false;
        for (&start, st) in &self.by_start {
            gaps.push(Gap { start: prev_end, size: start.saturating_sub(prev_end), live_left });
            prev_end = start + st.length;
            live_left = !st.finished;
        }
        gaps.push(Gap { start: prev_end, size: total.saturating_sub(prev_end), live_left });
        gaps
    }

    fn largest_gap(&self, total: u64) -> Option<Gap> {
        let mut best: Option<Gap> = None;
        for g in self.gaps(total) {
            if best.map_or(true, |b| g.size > b.size) {
                best = Some(g);
            }
        }
        best.filter(|g| g.size > 0)
    }

    fn is_covered(&self, offset: u64) -> bool {
        self.by_start
            .range(..=offset)
            .next_back()
            .map_or(false, |(s, st)| offset < s + st.length)
    }

    fn state_mut(&mut self, seg: &Segment) -> Result<&mut SegmentState, RangeMapError> {
        match self.by_start.get_mut(&seg.start) {
            Some(st) if st.id == seg.id => Ok(st),
            _ => Err(RangeMapError::UnknownSegment { start: seg.start }),
        }
    }

    fn active(&self) -> usize {
        self.by_start.values().filter(|s| !s.finished).count()
    }
}

pub struct RangeMap {
    total_size: u64,
    max_fragments: usize,
    segments: Mutex<Segments>,
}

impl RangeMap {
    pub fn new(total_size: u64, max_fragments: usize) -> Self {
        Self {
            total_size,
            max_fragments: max_fragments.max(1),
            segments: Mutex::new(Segments::default()),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn max_fragments(&self) -> usize {
        self.max_fragments
    }

    pub fn unfinished_total(&self) -> u64 {
        let segs = self.segments.lock();
        let sum: u64 = segs.gaps(self.total_size).iter().map(|g| g.size).sum();
        sum.min(self.total_size)
    }

    pub fn finished_total(&self) -> u64 {
        self.total_size - self.unfinished_total()
    }

    /// Offset where the next segment should start, or `None` when the whole
    /// file is covered. Ties go to the lowest offset.
    pub fn largest_gap_center(&self) -> Option<u64> {
        let segs = self.segments.lock();
        segs.largest_gap(self.total_size).map(|g| g.claim_point())
    }

    pub fn is_all_finished(&self) -> bool {
        self.largest_gap_center().is_none()
    }

    /// Open a zero-length segment at `at`, or in the largest gap when `at`
    /// is `None`.
    ///
    /// `Ok(None)` means there is nothing to claim there right now: the file
    /// is covered, the offset is already covered, or another worker got the
    /// same offset first.
    pub fn start_segment(&self, at: Option<u64>) -> Result<Option<Segment>, RangeMapError> {
        let mut segs = self.segments.lock();
        let at = match at {
            Some(at) => at,
            None => match segs.largest_gap(self.total_size) {
                Some(g) => g.claim_point(),
                None => return Ok(None),
            },
        };
        if at >= self.total_size || segs.by_start.contains_key(&at) || segs.is_covered(at) {
            return Ok(None);
        }
        if segs.active() >= self.max_fragments {
            return Err(RangeMapError::CapacityExceeded { max: self.max_fragments });
        }

        let id = segs.next_id;
        segs.next_id += 1;
        segs.by_start.insert(at, SegmentState { id, length: 0, finished: false });
        Ok(Some(Segment { start: at, id }))
    }

    /// Set the segment length. Returns `false` when the segment reached the
    /// next segment or the end of file and must stop requesting data.
    ///
    /// The stored length never runs past the next boundary.
    pub fn advance(&self, seg: &Segment, new_length: u64) -> Result<bool, RangeMapError> {
        let mut segs = self.segments.lock();
        let next = segs.next_boundary(seg.start, self.total_size);
        let st = segs.state_mut(seg)?;
        if new_length < st.length {
            return Err(RangeMapError::LengthDecreased {
                start: seg.start,
                current: st.length,
                requested: new_length,
            });
        }
        if st.finished {
            return Ok(false);
        }
        st.length = new_length.min(next - seg.start);
        Ok(seg.start + new_length < next)
    }

    /// Claim up to `chunk_len` more bytes for the segment, stopping at the
    /// next boundary.
    pub fn reserve(&self, seg: &Segment, chunk_len: u64) -> Result<Reservation, RangeMapError> {
        let mut segs = self.segments.lock();
        let next = segs.next_boundary(seg.start, self.total_size);
        let st = segs.state_mut(seg)?;
        let offset = seg.start + st.length;
        if st.finished {
            return Ok(Reservation { offset, accepted: 0, more: false });
        }
        let accepted = chunk_len.min(next - offset);
        st.length += accepted;
        Ok(Reservation { offset, accepted, more: offset + accepted < next })
    }

    /// Retire a segment. Empty segments disappear so their gap can be claimed
    /// again; the others stay as finished boundary markers. Idempotent.
    pub fn finish_or_cancel(&self, seg: &Segment) {
        let mut segs = self.segments.lock();
        let Ok(st) = segs.state_mut(seg) else {
            return;
        };
        if st.length == 0 {
            segs.by_start.remove(&seg.start);
        } else {
            st.finished = true;
        }
    }

    pub fn length(&self, seg: &Segment) -> Option<u64> {
        self.segments.lock().state_mut(seg).ok().map(|st| st.length)
    }

    pub fn active_segments(&self) -> usize {
        self.segments.lock().active()
    }

    pub fn snapshot(&self) -> Vec<SegmentSnapshot> {
        self.segments
            .lock()
            .by_start
            .iter()
            .map(|(&start, st)| SegmentSnapshot { start, length: st.length, finished: st.finished })
            .collect()
    }
}

impl std::fmt::Debug for RangeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeMap")
            .field("total_size", &self.total_size)
            .field("max_fragments", &self.max_fragments)
            .field("segments", &self.snapshot())
            .finish()
    }
}
