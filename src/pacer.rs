//! Outbound pacing.
//!
//! The pacer maintains a nanosecond horizon estimating when the NIC queue
//! drains: each transmitted packet pushes the horizon forward by its
//! serialization time at the configured link rate. While the horizon runs
//! no further than `max_nic_queue_ns` ahead of now, packets go straight
//! out; beyond that, their RPCs park in a throttled queue drained in
//! shortest-remaining-first order from the transmit path and the timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quanta::Instant;

use crate::config::HomaConfig;
use crate::homa::HomaShared;
use crate::msgout;
use crate::rpc::{HomaRpc, RpcInner, RpcState};

struct Throttled {
    rpc: Arc<HomaRpc>,

    /// Bytes left to transmit when enqueued; the sort key.
    remaining: usize,
}

pub(crate) struct Pacer {
    origin: Instant,

    /// Nanoseconds (since `origin`) at which the NIC queue is estimated to
    /// drain.
    link_idle_ns: AtomicU64,

    link_mbps: u64,
    max_queue_ns: u64,
    throttle_min_bytes: usize,
    dont_throttle: bool,

    /// RPCs with transmittable packets held back by the horizon. Sorted by
    /// `(remaining, arrival)`.
    throttled: Mutex<Vec<Throttled>>,
}

impl Pacer {
    pub fn new(config: &HomaConfig) -> Self {
        Self {
            origin: Instant::now(),
            link_idle_ns: AtomicU64::new(0),
            link_mbps: config.link_mbps,
            max_queue_ns: config.max_nic_queue_ns,
            throttle_min_bytes: config.throttle_min_bytes,
            dont_throttle: config.dont_throttle(),
            throttled: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// Serialization time of `bytes` on the link.
    #[inline]
    fn xmit_ns(&self, bytes: usize) -> u64 {
        (bytes as u64 * 8000) / self.link_mbps
    }

    /// Whether messages of this length are subject to pacing at all.
    #[inline]
    pub fn needs_throttle(&self, msg_len: usize) -> bool {
        !self.dont_throttle && msg_len > self.throttle_min_bytes
    }

    /// Try to claim transmit time for one packet. On success the horizon
    /// has been advanced and the packet must be sent; on failure the NIC
    /// queue estimate is too deep and the caller should park the RPC.
    pub fn admit(&self, bytes: usize) -> bool {
        let cost = self.xmit_ns(bytes);
        loop {
            let now = self.now_ns();
            let idle = self.link_idle_ns.load(Ordering::Acquire);
            let start = idle.max(now);
            if start - now > self.max_queue_ns {
                return false;
            }
            if self
                .link_idle_ns
                .compare_exchange_weak(idle, start + cost, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Account for a packet sent without admission (forced or unpaced);
    /// it still occupies the link.
    pub fn note_xmit(&self, bytes: usize) {
        let cost = self.xmit_ns(bytes);
        loop {
            let now = self.now_ns();
            let idle = self.link_idle_ns.load(Ordering::Acquire);
            let new = idle.max(now) + cost;
            if self
                .link_idle_ns
                .compare_exchange_weak(idle, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Park an RPC whose transmit was refused. Caller holds the RPC lock.
    pub fn enqueue(&self, rpc: &Arc<HomaRpc>, inner: &mut RpcInner) {
        if inner.throttled {
            return;
        }
        let remaining = inner
            .msgout
            .as_ref()
            .map_or(0, |m| m.length() - m.next_xmit_offset());
        inner.throttled = true;

        let mut q = self.throttled.lock().unwrap();
        // Equal remainders keep arrival order.
        let at = q.partition_point(|e| e.remaining <= remaining);
        q.insert(
            at,
            Throttled {
                rpc: rpc.clone(),
                remaining,
            },
        );
    }

    /// Remove an RPC from the queue (teardown). Caller holds the RPC lock.
    pub fn detach_rpc(&self, rpc: &Arc<HomaRpc>, inner: &mut RpcInner) {
        if !inner.throttled {
            return;
        }
        inner.throttled = false;
        self.throttled
            .lock()
            .unwrap()
            .retain(|e| !Arc::ptr_eq(&e.rpc, rpc));
    }

    fn pop_first(&self) -> Option<Arc<HomaRpc>> {
        let mut q = self.throttled.lock().unwrap();
        if q.is_empty() {
            None
        } else {
            Some(q.remove(0).rpc)
        }
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.throttled.lock().unwrap().len()
    }
}

/// Drain the throttled queue as far as the horizon allows. Runs from the
/// transmit path opportunistically and from every timer tick.
pub(crate) fn run(shared: &Arc<HomaShared>) {
    loop {
        let Some(rpc) = shared.pacer.pop_first() else {
            return;
        };

        let mut inner = rpc.lock();
        inner.throttled = false;
        if inner.state == RpcState::Dead || inner.msgout.is_none() {
            continue;
        }
        msgout::xmit(shared, &rpc, &mut inner, false);

        // xmit re-parked the RPC: the horizon is full again, stop.
        if inner.throttled {
            return;
        }
    }
}

/// Detach hook used by `rpc::end`.
pub(crate) fn detach(shared: &Arc<HomaShared>, rpc: &Arc<HomaRpc>, inner: &mut RpcInner) {
    shared.pacer.detach_rpc(rpc, inner);
}
