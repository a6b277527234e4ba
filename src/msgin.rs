//! Inbound message reassembly.
//!
//! An incoming message learns its total length from the first DATA packet
//! and tracks the bytes it has not yet seen as a sorted list of disjoint
//! gaps below the receive frontier. Packet payloads land directly in the
//! socket pool's bpages, which the message owns until the user takes them.

use quanta::Instant;

use crate::pool::{Pool, HOMA_BPAGE_SIZE};
use crate::type_alias::*;

/// A hole in the received byte range: `[start, end)` has not arrived.
#[derive(Debug, Clone)]
pub(crate) struct Gap {
    pub start: usize,
    pub end: usize,

    /// When the hole was first observed, for diagnostics.
    pub first_seen: Instant,
}

/// Outcome of installing one DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddResult {
    /// At least one new byte was accepted.
    Accepted,

    /// Every byte of the packet had already been received.
    Duplicate,

    /// The pool could not supply the bpages the packet needs; nothing was
    /// mutated and the sender will retransmit.
    NoBufferSpace,
}

/// Reassembly state of one incoming message.
pub(crate) struct Msgin {
    /// Total message length, learned from the first packet.
    length: usize,

    /// Bytes below this offset have all been seen, except those inside
    /// `gaps`.
    recv_end: usize,

    /// Count of distinct bytes received so far.
    bytes_received: usize,

    /// Cumulative bytes the sender is authorized to transmit. Starts at the
    /// sender's own unscheduled claim and is only ever raised, by the grant
    /// scheduler.
    granted: usize,

    /// The sender's most recent `incoming` advertisement, used to decide
    /// whether a GRANT would tell it anything new.
    rec_incoming: usize,

    /// Holes below `recv_end`, disjoint and sorted by start.
    gaps: Vec<Gap>,

    /// Bpages owned by this message, in message order. Covers
    /// `[0, recv_end)` rounded up to a page boundary.
    bpages: Vec<BpageIdx>,

    /// Set when a bpage allocation failed; cleared on the next success.
    /// While set, the grant scheduler leaves this message alone.
    needs_bpages: bool,

    /// Packets accepted into this message, for dead-buffer accounting.
    num_skbs: usize,
}

impl Msgin {
    pub fn new(length: usize, incoming: usize) -> Self {
        Self {
            length,
            recv_end: 0,
            bytes_received: 0,
            granted: incoming.min(length),
            rec_incoming: incoming.min(length),
            gaps: Vec::new(),
            bpages: Vec::new(),
            needs_bpages: false,
            num_skbs: 0,
        }
    }

    #[inline(always)]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline(always)]
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    #[inline(always)]
    pub fn granted(&self) -> usize {
        self.granted
    }

    #[inline(always)]
    pub fn rec_incoming(&self) -> usize {
        self.rec_incoming
    }

    #[inline(always)]
    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    #[inline(always)]
    pub fn needs_bpages(&self) -> bool {
        self.needs_bpages
    }

    #[inline(always)]
    pub fn num_skbs(&self) -> usize {
        self.num_skbs
    }

    /// Optimistically forget a past allocation failure (bpages were freed).
    #[inline(always)]
    pub fn clear_needs_bpages(&mut self) {
        self.needs_bpages = false;
    }

    /// Bytes of the message not yet authorized for transmission.
    #[inline(always)]
    pub fn ungranted(&self) -> usize {
        self.length - self.granted
    }

    /// Raise the authorization level. Monotone; never beyond the length.
    /// Returns the new value.
    pub fn raise_granted(&mut self, offset: usize) -> usize {
        self.granted = self.granted.max(offset.min(self.length));
        self.granted
    }

    /// Record the `incoming` value the sender advertised in a DATA packet.
    pub fn note_incoming(&mut self, incoming: usize) {
        self.rec_incoming = self.rec_incoming.max(incoming.min(self.length));
    }

    /// The message is complete when the frontier has reached the length and
    /// no holes remain below it.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.recv_end == self.length && self.gaps.is_empty()
    }

    /// The first missing byte range, bounded by what the sender is
    /// authorized to transmit. `None` when nothing outstanding is missing.
    pub fn first_missing_range(&self) -> Option<(usize, usize)> {
        if let Some(gap) = self.gaps.first() {
            return Some((gap.start, gap.end));
        }
        let bound = self.granted.min(self.length);
        if self.recv_end < bound {
            Some((self.recv_end, bound))
        } else {
            None
        }
    }

    /// Install one DATA segment at `offset`.
    ///
    /// Accepts exactly the bytes not previously received, so replays and
    /// partial overlaps are idempotent. On success the payload (including
    /// any already-received overlap, which carries identical bytes) is
    /// copied into the owned bpages.
    pub fn add_packet(&mut self, pool: &Pool, offset: usize, data: &[u8]) -> AddResult {
        let start = offset.min(self.length);
        let end = (offset + data.len()).min(self.length);
        if start >= end {
            return AddResult::Duplicate;
        }

        // Reserve bpages up to the new frontier before touching any state,
        // so a failed allocation leaves the message untouched.
        let new_end = self.recv_end.max(end);
        let needed = (new_end + HOMA_BPAGE_SIZE - 1) / HOMA_BPAGE_SIZE;
        if needed > self.bpages.len() {
            let mut fresh = Vec::with_capacity(needed - self.bpages.len());
            while self.bpages.len() + fresh.len() < needed {
                match pool.alloc_bpage() {
                    Some(idx) => fresh.push(idx),
                    None => {
                        pool.free_bpages_list(&fresh);
                        self.needs_bpages = true;
                        log::debug!(
                            "msgin: out of bpages installing [{}, {}) of {}-byte message",
                            start,
                            end,
                            self.length
                        );
                        return AddResult::NoBufferSpace;
                    }
                }
            }
            self.bpages.extend(fresh);
            self.needs_bpages = false;
        }

        let mut covered = 0;

        // Part below the frontier: claw bytes out of the gaps.
        let below = end.min(self.recv_end);
        if start < below {
            covered += self.fill_gaps(start, below);
        }

        // Part at or past the frontier: extend it, leaving a new gap if the
        // packet landed out of order.
        if end > self.recv_end {
            let from = start.max(self.recv_end);
            if from > self.recv_end {
                self.gaps.push(Gap {
                    start: self.recv_end,
                    end: from,
                    first_seen: Instant::now(),
                });
            }
            covered += end - from;
            self.recv_end = end;
        }

        if covered == 0 {
            return AddResult::Duplicate;
        }

        self.copy_in(pool, start, data, end - start);
        self.bytes_received += covered;
        self.num_skbs += 1;
        debug_assert!(self.bytes_received <= self.length);
        AddResult::Accepted
    }

    /// Remove `[start, end)` from the gap list, splitting and trimming as
    /// needed. Returns the number of bytes that were actually inside gaps.
    fn fill_gaps(&mut self, start: usize, end: usize) -> usize {
        let mut covered = 0;
        let mut i = 0;
        while i < self.gaps.len() {
            let gap = &mut self.gaps[i];
            if gap.end <= start {
                i += 1;
                continue;
            }
            if gap.start >= end {
                break;
            }

            let lo = gap.start.max(start);
            let hi = gap.end.min(end);
            covered += hi - lo;

            if lo == gap.start && hi == gap.end {
                // Fully covered.
                self.gaps.remove(i);
            } else if lo == gap.start {
                gap.start = hi;
                i += 1;
            } else if hi == gap.end {
                gap.end = lo;
                i += 1;
            } else {
                // Packet in the middle of the gap: split it.
                let tail = Gap {
                    start: hi,
                    end: gap.end,
                    first_seen: gap.first_seen,
                };
                gap.end = lo;
                self.gaps.insert(i + 1, tail);
                i += 2;
            }
        }
        covered
    }

    /// Copy `len` bytes of `data` into the bpages covering
    /// `[start, start + len)`.
    fn copy_in(&self, pool: &Pool, start: usize, data: &[u8], len: usize) {
        let mut off = start;
        let mut src = &data[..len];
        while !src.is_empty() {
            let page = off / HOMA_BPAGE_SIZE;
            let page_off = off % HOMA_BPAGE_SIZE;
            let chunk = src.len().min(HOMA_BPAGE_SIZE - page_off);
            pool.write(self.bpages[page], page_off, &src[..chunk]);
            off += chunk;
            src = &src[chunk..];
        }
    }

    /// Hand the owned bpages to the caller (delivery to the user, or the
    /// reaper). The message no longer owns them afterwards.
    pub fn take_bpages(&mut self) -> Vec<BpageIdx> {
        std::mem::take(&mut self.bpages)
    }

    #[cfg(test)]
    pub fn copy_out(&self, pool: &Pool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.recv_end);
        let mut off = 0;
        while off < self.recv_end {
            let page = off / HOMA_BPAGE_SIZE;
            let chunk = (self.recv_end - off).min(HOMA_BPAGE_SIZE);
            out.extend_from_slice(pool.read(self.bpages[page], 0, chunk));
            off += chunk;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        Pool::new(4 * HOMA_BPAGE_SIZE).unwrap()
    }

    fn check_gaps(msgin: &Msgin, expected: &[(usize, usize)]) {
        let actual: Vec<_> = msgin.gaps().iter().map(|g| (g.start, g.end)).collect();
        assert_eq!(actual, expected);

        // Gaps must stay disjoint and sorted.
        for pair in msgin.gaps().windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let pool = pool();
        let mut msgin = Msgin::new(2800, 10000);

        assert_eq!(msgin.add_packet(&pool, 0, &[1; 1400]), AddResult::Accepted);
        assert!(!msgin.is_complete());
        assert_eq!(msgin.add_packet(&pool, 1400, &[2; 1400]), AddResult::Accepted);
        assert!(msgin.is_complete());
        assert_eq!(msgin.bytes_received(), 2800);
        check_gaps(&msgin, &[]);
    }

    #[test]
    fn test_out_of_order_gap() {
        // Scenario: 5000-byte message as packets at offsets 0, 2800, 1400.
        let pool = pool();
        let mut msgin = Msgin::new(5000, 10000);

        assert_eq!(msgin.add_packet(&pool, 0, &[1; 1400]), AddResult::Accepted);
        assert_eq!(msgin.add_packet(&pool, 2800, &[3; 1400]), AddResult::Accepted);
        check_gaps(&msgin, &[(1400, 2800)]);
        assert!(!msgin.is_complete());

        assert_eq!(msgin.add_packet(&pool, 1400, &[2; 1400]), AddResult::Accepted);
        check_gaps(&msgin, &[]);
        assert_eq!(msgin.add_packet(&pool, 4200, &[4; 800]), AddResult::Accepted);
        assert!(msgin.is_complete());

        let bytes = msgin.copy_out(&pool);
        assert_eq!(&bytes[..1400], &[1; 1400][..]);
        assert_eq!(&bytes[1400..2800], &[2; 1400][..]);
        assert_eq!(&bytes[2800..4200], &[3; 1400][..]);
        assert_eq!(&bytes[4200..], &[4; 800][..]);
    }

    #[test]
    fn test_duplicates_and_overlaps() {
        let pool = pool();
        let mut msgin = Msgin::new(5000, 10000);

        assert_eq!(msgin.add_packet(&pool, 0, &[1; 1400]), AddResult::Accepted);
        assert_eq!(msgin.add_packet(&pool, 0, &[1; 1400]), AddResult::Duplicate);
        assert_eq!(msgin.bytes_received(), 1400);

        // Partial overlap: only the fresh suffix counts.
        assert_eq!(msgin.add_packet(&pool, 700, &[1; 1400]), AddResult::Accepted);
        assert_eq!(msgin.bytes_received(), 2100);
        check_gaps(&msgin, &[]);
    }

    #[test]
    fn test_packet_splits_gap() {
        let pool = pool();
        let mut msgin = Msgin::new(10000, 10000);

        assert_eq!(msgin.add_packet(&pool, 0, &[0; 1000]), AddResult::Accepted);
        assert_eq!(msgin.add_packet(&pool, 7000, &[7; 1000]), AddResult::Accepted);
        check_gaps(&msgin, &[(1000, 7000)]);

        assert_eq!(msgin.add_packet(&pool, 3000, &[3; 1000]), AddResult::Accepted);
        check_gaps(&msgin, &[(1000, 3000), (4000, 7000)]);

        // Cover the first remaining gap exactly.
        assert_eq!(msgin.add_packet(&pool, 1000, &[1; 2000]), AddResult::Accepted);
        check_gaps(&msgin, &[(4000, 7000)]);

        // A replay spanning both received and missing bytes.
        assert_eq!(msgin.add_packet(&pool, 3500, &[3; 1000]), AddResult::Accepted);
        check_gaps(&msgin, &[(4500, 7000)]);
        assert_eq!(msgin.bytes_received(), 5500);
    }

    #[test]
    fn test_no_buffer_space_leaves_state_alone() {
        let pool = Pool::new(HOMA_BPAGE_SIZE).unwrap();
        let page = pool.alloc_bpage().unwrap();

        let mut msgin = Msgin::new(5000, 10000);
        assert_eq!(
            msgin.add_packet(&pool, 0, &[1; 1400]),
            AddResult::NoBufferSpace
        );
        assert!(msgin.needs_bpages());
        assert_eq!(msgin.bytes_received(), 0);
        check_gaps(&msgin, &[]);

        // After a page frees up, the retransmission lands.
        pool.free_bpages_list(&[page]);
        assert_eq!(msgin.add_packet(&pool, 0, &[1; 1400]), AddResult::Accepted);
        assert!(!msgin.needs_bpages());
    }

    #[test]
    fn test_monotone_grants() {
        let mut msgin = Msgin::new(5000, 1400);
        assert_eq!(msgin.granted(), 1400);
        assert_eq!(msgin.raise_granted(3000), 3000);
        assert_eq!(msgin.raise_granted(2000), 3000);
        assert_eq!(msgin.raise_granted(100_000), 5000);
    }

    #[test]
    fn test_first_missing_range() {
        let pool = pool();
        let mut msgin = Msgin::new(10000, 5000);

        assert_eq!(msgin.add_packet(&pool, 0, &[0; 1400]), AddResult::Accepted);
        assert_eq!(msgin.first_missing_range(), Some((1400, 5000)));

        assert_eq!(msgin.add_packet(&pool, 2800, &[2; 1400]), AddResult::Accepted);
        assert_eq!(msgin.first_missing_range(), Some((1400, 2800)));
    }
}
