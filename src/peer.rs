//! Per-remote-host state and the table that owns it.
//!
//! Peers are keyed by `(hnet, address)` and shared by every RPC talking to
//! that host. Entries are reference counted by their users (RPCs, pending
//! acknowledgements); a zero count parks the entry on a dead list that the
//! timer scavenges once nothing aliases it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use dashmap::DashMap;

use crate::config::HomaConfig;
use crate::type_alias::*;
use crate::wire::{CutoffsHeader, RpcAck, HOMA_MAX_ACKS_PER_PKT, HOMA_MAX_PRIORITIES};

/// Priority cutoffs learned from a peer's CUTOFFS packets, governing the
/// priority of unscheduled bytes we send to it.
struct PeerCutoffs {
    /// `cutoffs[p]` is the largest message that may use priority `p`.
    cutoffs: [u32; HOMA_MAX_PRIORITIES],

    /// Version from the peer's last CUTOFFS packet; 0 before the first one.
    /// Echoed in the `cutoff_version` of DATA packets we send to the peer.
    version: u16,
}

/// State for one remote host.
pub(crate) struct HomaPeer {
    pub addr: IpAddr,
    pub hnet: HnetId,

    /// Count of users: RPCs plus queued acknowledgements.
    refs: AtomicU32,

    /// RESENDs sent to this peer since it last made progress.
    pub outstanding_resends: AtomicU32,

    cutoffs: Mutex<PeerCutoffs>,

    /// Acknowledgements of completed client RPCs waiting to be batched
    /// onto an ACK packet to this peer.
    acks: Mutex<Vec<RpcAck>>,
}

impl HomaPeer {
    fn new(hnet: HnetId, addr: IpAddr, config: &HomaConfig) -> Self {
        Self {
            addr,
            hnet,
            refs: AtomicU32::new(0),
            outstanding_resends: AtomicU32::new(0),
            cutoffs: Mutex::new(PeerCutoffs {
                cutoffs: config.unsched_cutoffs,
                version: 0,
            }),
            acks: Mutex::new(Vec::new()),
        }
    }

    /// Install the cutoff table from a CUTOFFS packet.
    pub fn set_cutoffs(&self, hdr: &CutoffsHeader) {
        let mut cutoffs = self.cutoffs.lock().unwrap();
        cutoffs.cutoffs = hdr.unsched_cutoffs;
        cutoffs.version = hdr.cutoff_version;
    }

    /// The cutoff version to echo in DATA packets to this peer.
    pub fn cutoff_version(&self) -> u16 {
        self.cutoffs.lock().unwrap().version
    }

    /// Priority for the unscheduled bytes of a `length`-byte message to
    /// this peer.
    pub fn unsched_priority(&self, length: usize) -> Priority {
        let cutoffs = self.cutoffs.lock().unwrap();
        for prio in (0..HOMA_MAX_PRIORITIES).rev() {
            if length <= cutoffs.cutoffs[prio] as usize {
                return prio as Priority;
            }
        }
        0
    }

    /// Queue an acknowledgement for later piggybacking. When the queue
    /// reaches a full ACK packet's worth, it is drained and returned so the
    /// caller can transmit it eagerly.
    pub fn add_ack(&self, ack: RpcAck) -> Option<Vec<RpcAck>> {
        let mut acks = self.acks.lock().unwrap();
        acks.push(ack);
        if acks.len() >= HOMA_MAX_ACKS_PER_PKT {
            Some(std::mem::take(&mut *acks))
        } else {
            None
        }
    }

    /// Drain every pending acknowledgement.
    pub fn take_acks(&self) -> Vec<RpcAck> {
        std::mem::take(&mut *self.acks.lock().unwrap())
    }

    #[cfg(test)]
    pub fn pending_acks(&self) -> usize {
        self.acks.lock().unwrap().len()
    }
}

/// The table of all known peers.
pub(crate) struct PeerTable {
    peers: DashMap<(HnetId, IpAddr), Arc<HomaPeer>, RandomState>,

    /// Entries whose refcount reached zero, awaiting scavenging.
    dead: Mutex<Vec<Arc<HomaPeer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: DashMap::with_capacity_and_hasher(64, RandomState::new()),
            dead: Mutex::new(Vec::new()),
        }
    }

    /// Find or create the peer for `(hnet, addr)`, charging one reference
    /// to the caller.
    pub fn lookup_or_create(
        &self,
        hnet: HnetId,
        addr: IpAddr,
        config: &HomaConfig,
    ) -> Arc<HomaPeer> {
        let peer = self
            .peers
            .entry((hnet, addr))
            .or_insert_with(|| Arc::new(HomaPeer::new(hnet, addr, config)))
            .clone();
        peer.refs.fetch_add(1, Ordering::AcqRel);
        peer
    }

    /// Drop one reference. The last one removes the peer from the table and
    /// parks it for scavenging.
    pub fn release(&self, peer: &Arc<HomaPeer>) {
        if peer.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some((_, entry)) = self.peers.remove(&(peer.hnet, peer.addr)) {
                self.dead.lock().unwrap().push(entry);
            }
        }
    }

    /// Free dead peers that nothing references any more. Called from the
    /// timer tick.
    pub fn scavenge(&self) {
        let mut dead = self.dead.lock().unwrap();
        dead.retain(|peer| {
            // A revived address gets a fresh entry, so the dead one only
            // needs to wait out stray aliases.
            Arc::strong_count(peer) > 1 || peer.refs.load(Ordering::Acquire) > 0
        });
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Number of entries awaiting scavenging.
    pub fn dead_len(&self) -> usize {
        self.dead.lock().unwrap().len()
    }
}
