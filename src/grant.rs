//! The grant scheduler: receive-side bandwidth allocation.
//!
//! Incoming messages with ungranted bytes are tracked per peer, sorted
//! shortest-remaining first. At most `num_active_rpcs` of them hold grants
//! at a time; each active message is kept `window` bytes ahead of what has
//! arrived, at a priority derived from its rank in the active set.
//!
//! Fairness rule when peers compete (documented in DESIGN.md): the active
//! set first admits at most one message per peer, in SRPT order; leftover
//! slots then fall back to global SRPT. Ties break toward the smaller id.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::config::HomaConfig;
use crate::homa::HomaShared;
use crate::rpc::{HomaRpc, RpcInner, RpcState};
use crate::sock::Sock;
use crate::type_alias::*;
use crate::wire::{CommonHeader, GrantHeader, PktType, HOMA_MAX_PRIORITIES};

/// Priority used for GRANT packets themselves.
const GRANT_PKT_PRIORITY: Priority = (HOMA_MAX_PRIORITIES - 1) as Priority;

struct Entry {
    rpc: Arc<HomaRpc>,

    /// Cached `length - granted`, maintained on every progress note.
    ungranted: usize,
}

struct PeerList {
    key: (HnetId, IpAddr),

    /// Sorted ascending by `(ungranted, id)`.
    rpcs: Vec<Entry>,
}

struct GrantState {
    /// The granted set; index is the rank.
    active: Vec<Arc<HomaRpc>>,

    /// Peers with at least one grantable message.
    peers: Vec<PeerList>,
}

pub(crate) struct GrantSched {
    window: usize,
    num_active: usize,
    max_sched_prio: Priority,
    state: Mutex<GrantState>,
}

impl GrantSched {
    pub fn new(config: &HomaConfig) -> Self {
        Self {
            window: config.window,
            num_active: config.num_active_rpcs,
            max_sched_prio: config.max_sched_prio,
            state: Mutex::new(GrantState {
                active: Vec::new(),
                peers: Vec::new(),
            }),
        }
    }

    /// Record progress on an incoming message (creation, data arrival, or
    /// completion). Caller holds the RPC lock and passes its guard.
    ///
    /// Returns the RPCs whose grant standing may have changed; the caller
    /// must run [`check_and_send`] on each *after* releasing the RPC lock.
    pub fn note_progress(
        &self,
        rpc: &Arc<HomaRpc>,
        inner: &mut RpcInner,
    ) -> Vec<Arc<HomaRpc>> {
        let Some(msgin) = inner.msgin.as_ref() else {
            return Vec::new();
        };

        let mut st = self.state.lock().unwrap();
        let old_active: Vec<Arc<HomaRpc>> = st.active.clone();

        let done = msgin.is_complete()
            || msgin.ungranted() == 0
            || inner.state == RpcState::Dead;
        if done {
            st.unlist(rpc.id, &peer_key(rpc));
            inner.grant_listed = false;
            inner.grant_rank = None;
        } else {
            st.upsert(rpc, msgin.ungranted());
            inner.grant_listed = true;
        }

        st.recompute_active(self.num_active);

        // Everything whose rank may have moved deserves a fresh look.
        let mut changed: Vec<Arc<HomaRpc>> = st.active.clone();
        for old in old_active {
            if !changed.iter().any(|r| Arc::ptr_eq(r, &old)) {
                changed.push(old);
            }
        }
        changed
    }

    /// Re-evaluate one RPC's grant: sync its rank and, if it is active and
    /// behind the window, raise `granted` and produce the GRANT to send.
    /// Caller holds the RPC lock.
    pub fn check_rpc(&self, rpc: &Arc<HomaRpc>, inner: &mut RpcInner) -> Option<GrantHeader> {
        let mut st = self.state.lock().unwrap();
        let rank = st.active.iter().position(|r| Arc::ptr_eq(r, rpc));
        inner.grant_rank = rank;
        let rank = rank?;

        let msgin = inner.msgin.as_mut()?;
        if msgin.needs_bpages() {
            return None;
        }

        // Nothing to say if the sender already holds authorization at or
        // past the target, whether from our grants or its own claim.
        let target = (msgin.bytes_received() + self.window).min(msgin.length());
        if target <= msgin.granted() || target <= msgin.rec_incoming() {
            return None;
        }
        msgin.raise_granted(target);
        st.update_ungranted(rpc.id, &peer_key(rpc), msgin.ungranted());

        let priority = self.max_sched_prio.saturating_sub(rank as Priority);
        Some(GrantHeader {
            common: CommonHeader::new(
                rpc.sock.port.load(std::sync::atomic::Ordering::Acquire),
                rpc.addr.port(),
                PktType::Grant,
                rpc.id,
            ),
            offset: msgin.granted() as u32,
            priority,
            resend_all: 0,
        })
    }

    /// Forget an RPC entirely (teardown path). Caller holds the RPC lock.
    pub fn detach_rpc(&self, rpc: &Arc<HomaRpc>, inner: &mut RpcInner) {
        if !inner.grant_listed && inner.grant_rank.is_none() {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.unlist(rpc.id, &peer_key(rpc));
        st.recompute_active(self.num_active);
        inner.grant_listed = false;
        inner.grant_rank = None;
    }

    /// Current active set, for periodic re-checks.
    fn active_snapshot(&self) -> Vec<Arc<HomaRpc>> {
        self.state.lock().unwrap().active.clone()
    }

    #[cfg(test)]
    pub fn active_ids(&self) -> Vec<RpcId> {
        self.state.lock().unwrap().active.iter().map(|r| r.id).collect()
    }
}

impl GrantState {
    fn peer_list(&mut self, key: (HnetId, IpAddr)) -> &mut PeerList {
        if let Some(pos) = self.peers.iter().position(|p| p.key == key) {
            return &mut self.peers[pos];
        }
        self.peers.push(PeerList {
            key,
            rpcs: Vec::new(),
        });
        self.peers.last_mut().unwrap()
    }

    fn upsert(&mut self, rpc: &Arc<HomaRpc>, ungranted: usize) {
        let list = self.peer_list(peer_key(rpc));
        if let Some(pos) = list.rpcs.iter().position(|e| e.rpc.id == rpc.id) {
            list.rpcs.remove(pos);
        }
        let at = list
            .rpcs
            .partition_point(|e| (e.ungranted, e.rpc.id) < (ungranted, rpc.id));
        list.rpcs.insert(
            at,
            Entry {
                rpc: rpc.clone(),
                ungranted,
            },
        );
    }

    fn update_ungranted(&mut self, id: RpcId, key: &(HnetId, IpAddr), ungranted: usize) {
        if let Some(list) = self.peers.iter_mut().find(|p| p.key == *key) {
            if let Some(pos) = list.rpcs.iter().position(|e| e.rpc.id == id) {
                let mut entry = list.rpcs.remove(pos);
                entry.ungranted = ungranted;
                if ungranted > 0 {
                    let at = list
                        .rpcs
                        .partition_point(|e| (e.ungranted, e.rpc.id) < (ungranted, id));
                    list.rpcs.insert(at, entry);
                }
            }
        }
    }

    fn unlist(&mut self, id: RpcId, key: &(HnetId, IpAddr)) {
        if let Some(pos) = self.peers.iter().position(|p| p.key == *key) {
            self.peers[pos].rpcs.retain(|e| e.rpc.id != id);
            if self.peers[pos].rpcs.is_empty() {
                self.peers.remove(pos);
            }
        }
        // Ids repeat across peers; qualify by the peer key.
        self.active
            .retain(|r| !(r.id == id && peer_key(r) == *key));
    }

    /// Rebuild the active set: one message per peer first (SRPT over the
    /// per-peer champions), then global SRPT for the remaining slots.
    fn recompute_active(&mut self, num_active: usize) {
        let mut chosen: Vec<(usize, RpcId, Arc<HomaRpc>)> = Vec::new();

        let mut champions: Vec<&Entry> =
            self.peers.iter().filter_map(|p| p.rpcs.first()).collect();
        champions.sort_by_key(|e| (e.ungranted, e.rpc.id));
        for e in champions.into_iter().take(num_active) {
            chosen.push((e.ungranted, e.rpc.id, e.rpc.clone()));
        }

        if chosen.len() < num_active {
            let mut rest: Vec<&Entry> = self
                .peers
                .iter()
                .flat_map(|p| p.rpcs.iter().skip(1))
                .collect();
            rest.sort_by_key(|e| (e.ungranted, e.rpc.id));
            for e in rest {
                if chosen.len() >= num_active {
                    break;
                }
                chosen.push((e.ungranted, e.rpc.id, e.rpc.clone()));
            }
            chosen.sort_by_key(|(ungranted, id, _)| (*ungranted, *id));
        }

        self.active = chosen.into_iter().map(|(_, _, r)| r).collect();
    }
}

#[inline]
fn peer_key(rpc: &Arc<HomaRpc>) -> (HnetId, IpAddr) {
    (rpc.sock.hnet, rpc.addr.ip())
}

/// Run a grant check on one RPC and transmit the GRANT if one is due.
/// Caller must hold no locks.
pub(crate) fn check_and_send(shared: &Arc<HomaShared>, rpc: &Arc<HomaRpc>) {
    let mut inner = rpc.lock();
    if inner.state == RpcState::Dead {
        return;
    }
    let Some(grant) = shared.grant.check_rpc(rpc, &mut inner) else {
        return;
    };
    drop(inner);

    shared
        .metrics
        .grants_sent
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    shared.xmit_raw(rpc.addr, GRANT_PKT_PRIORITY, &grant.encode());
}

/// Detach hook used by `rpc::end` (socket and RPC locks held).
pub(crate) fn detach(shared: &Arc<HomaShared>, rpc: &Arc<HomaRpc>, inner: &mut RpcInner) {
    shared.grant.detach_rpc(rpc, inner);
}

/// Periodic pass from the timer: make sure every active message is granted
/// up to its window, catching promotions that happened on teardown paths.
pub(crate) fn retry_active(shared: &Arc<HomaShared>) {
    for rpc in shared.grant.active_snapshot() {
        check_and_send(shared, &rpc);
    }
}

/// Bpages were freed on `sock`: resume granting for messages that stalled
/// on pool exhaustion.
pub(crate) fn rekick_sock(shared: &Arc<HomaShared>, sock: &Arc<Sock>) {
    let stalled: Vec<Arc<HomaRpc>> = {
        let sk = sock.inner.lock().unwrap();
        sk.active.clone()
    };
    for rpc in stalled {
        let mut inner = rpc.lock();
        let Some(msgin) = inner.msgin.as_mut() else {
            continue;
        };
        if !msgin.needs_bpages() {
            continue;
        }
        // Optimistic: the next allocation failure will set it again.
        msgin.clear_needs_bpages();
        let checks = shared.grant.note_progress(&rpc, &mut inner);
        drop(inner);
        for other in checks {
            check_and_send(shared, &other);
        }
    }
}
