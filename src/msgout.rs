//! Outbound message state: fragmentation and the transmit window.
//!
//! The message body is copied out of the user's buffers once, segmented at
//! `max_seg` boundaries, and released segment by segment as the granted
//! window allows. [`xmit`] hands eligible segments to the driver, pacing
//! them through the throttle horizon unless forced.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::homa::HomaShared;
use crate::rpc::{HomaRpc, RpcInner};
use crate::type_alias::*;
use crate::wire::{pkt_hdr_len, CommonHeader, DataHeader, PktType};

/// Transmit state of one outgoing message.
pub(crate) struct Msgout {
    /// Full message body.
    data: Box<[u8]>,

    /// Data bytes per packet (driver MTU minus the DATA header).
    max_seg: usize,

    /// Bytes the receiver has authorized, including the unscheduled prefix.
    /// Monotone, capped at the length.
    granted: usize,

    /// Offset of the first byte not yet handed to the driver. Segments
    /// below it have been transmitted (at least once).
    next_xmit_offset: usize,

    /// Length of the prefix that needed no grants.
    unsched: usize,

    /// Priority for scheduled segments, from the most recent GRANT.
    sched_priority: Priority,
}

impl Msgout {
    pub fn new(data: &[u8], max_seg: usize, unsched_bytes: usize) -> Self {
        debug_assert!(!data.is_empty());
        debug_assert!(max_seg > 0);
        let unsched = unsched_bytes.min(data.len());
        Self {
            data: data.into(),
            max_seg,
            granted: unsched,
            next_xmit_offset: 0,
            unsched,
            sched_priority: 0,
        }
    }

    #[inline(always)]
    pub fn length(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn granted(&self) -> usize {
        self.granted
    }

    #[inline(always)]
    pub fn next_xmit_offset(&self) -> usize {
        self.next_xmit_offset
    }

    #[inline(always)]
    pub fn unsched(&self) -> usize {
        self.unsched
    }

    #[inline(always)]
    pub fn sched_priority(&self) -> Priority {
        self.sched_priority
    }

    /// Total packets the message fragments into.
    #[inline]
    pub fn num_pkts(&self) -> usize {
        (self.data.len() + self.max_seg - 1) / self.max_seg
    }

    /// All bytes have been handed to the driver at least once.
    #[inline(always)]
    pub fn fully_transmitted(&self) -> bool {
        self.next_xmit_offset >= self.data.len()
    }

    /// Raise the authorization level from a GRANT. Monotone; never beyond
    /// the length. Also records the priority for the newly granted bytes.
    pub fn raise_granted(&mut self, offset: usize, priority: Priority) {
        let offset = offset.min(self.data.len());
        if offset > self.granted {
            self.granted = offset;
            self.sched_priority = priority;
        }
    }

    /// The next segment eligible for transmission, or `None` if the window
    /// is exhausted. Does not advance.
    pub fn next_ready(&self) -> Option<(usize, &[u8])> {
        if self.next_xmit_offset >= self.granted {
            return None;
        }
        Some(self.segment(self.next_xmit_offset))
    }

    /// Mark the segment at `next_xmit_offset` as handed to the driver.
    pub fn advance(&mut self) {
        let (_, seg) = self.segment(self.next_xmit_offset);
        self.next_xmit_offset += seg.len();
    }

    /// The segment containing `offset`, aligned down to a segment boundary.
    pub fn segment(&self, offset: usize) -> (usize, &[u8]) {
        let start = offset - offset % self.max_seg;
        let end = (start + self.max_seg).min(self.data.len());
        (start, &self.data[start..end])
    }

    /// Offsets of the already-transmitted segments overlapping
    /// `[lo, hi)`, for retransmission.
    pub fn sent_segments_in(&self, lo: usize, hi: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut off = lo - lo % self.max_seg;
        let hi = hi.min(self.next_xmit_offset);
        while off < hi {
            out.push(off);
            off += self.max_seg;
        }
        out
    }
}

/// Release packets from `next_xmit_offset` up to the granted bound.
/// `force` bypasses pacing (teardown and retransmission contexts).
/// Caller holds the RPC lock and passes its guard.
pub(crate) fn xmit(shared: &Arc<HomaShared>, rpc: &Arc<HomaRpc>, inner: &mut RpcInner, force: bool) {
    loop {
        let Some(msgout) = inner.msgout.as_ref() else {
            return;
        };
        let Some((offset, seg)) = msgout.next_ready() else {
            return;
        };
        let (seg_len, msg_len) = (seg.len(), msgout.length());

        let pkt_bytes = pkt_hdr_len(PktType::Data) + seg_len;
        if !force && shared.pacer.needs_throttle(msg_len) {
            if !shared.pacer.admit(pkt_bytes) {
                shared.pacer.enqueue(rpc, inner);
                shared.metrics.paced_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
        } else {
            shared.pacer.note_xmit(pkt_bytes);
        }

        let msgout = inner.msgout.as_ref().unwrap();
        let priority = if offset < msgout.unsched() {
            rpc.peer.unsched_priority(msg_len)
        } else {
            msgout.sched_priority()
        };
        let hdr = data_header(rpc, msgout, offset, 0);
        let pkt = hdr.encode(seg);

        inner.msgout.as_mut().unwrap().advance();
        shared.xmit_raw(rpc.addr, priority, &pkt);
    }
}

/// Retransmit the already-sent segments overlapping `[start, end)` at the
/// priority the receiver demanded. Caller holds the RPC lock.
pub(crate) fn resend_data(
    shared: &Arc<HomaShared>,
    rpc: &Arc<HomaRpc>,
    inner: &mut RpcInner,
    start: usize,
    end: usize,
    priority: Priority,
) {
    let Some(msgout) = inner.msgout.as_ref() else {
        return;
    };
    for off in msgout.sent_segments_in(start, end) {
        let (offset, seg) = msgout.segment(off);
        let pkt = data_header(rpc, msgout, offset, 1).encode(seg);
        shared.xmit_raw(rpc.addr, priority, &pkt);
    }
}

fn data_header(rpc: &Arc<HomaRpc>, msgout: &Msgout, offset: usize, retransmit: u8) -> DataHeader {
    DataHeader {
        common: CommonHeader::new(
            rpc.sock.port.load(Ordering::Acquire),
            rpc.addr.port(),
            PktType::Data,
            rpc.id,
        ),
        message_length: msgout.length() as u32,
        incoming: msgout.granted() as u32,
        cutoff_version: rpc.peer.cutoff_version(),
        retransmit,
        seg_offset: offset as u32,
    }
}
