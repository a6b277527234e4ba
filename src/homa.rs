//! The top-level transport instance.
//!
//! A [`Homa`] owns everything shared across sockets: the configuration, the
//! driver, the peer table, the grant scheduler, the pacer, the tick counter
//! and the metrics. Sockets, the dispatcher and the timer all operate
//! through the shared state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;

use crate::config::HomaConfig;
use crate::driver::Driver;
use crate::error::{HomaError, Result};
use crate::grant::GrantSched;
use crate::pacer::Pacer;
use crate::peer::PeerTable;
use crate::sock::{HomaSocket, Sock};
use crate::type_alias::*;
use crate::wire::{pkt_hdr_len, PktType};

/// Event counters. Modeled as plain atomics; precision matters less than
/// not perturbing the fast paths.
#[derive(Default)]
pub struct Metrics {
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub dropped_no_socket: AtomicU64,
    pub duplicate_packets: AtomicU64,
    pub no_buffer_drops: AtomicU64,
    pub unknown_rpc_replies: AtomicU64,
    pub resends_sent: AtomicU64,
    pub grants_sent: AtomicU64,
    pub busy_sent: AtomicU64,
    pub need_acks_sent: AtomicU64,
    pub acks_sent: AtomicU64,
    pub rpc_timeouts: AtomicU64,
    pub reaped_rpcs: AtomicU64,
    pub reaped_skbs: AtomicU64,
    pub paced_packets: AtomicU64,
    pub send_errors: AtomicU64,
}

/// A network namespace of the transport. Sockets live inside exactly one
/// hnet; peers and ports are scoped by it.
#[derive(Clone)]
pub struct Hnet {
    pub(crate) id: HnetId,
    inner: Arc<HnetState>,
}

struct HnetState {
    /// Last ephemeral port handed out, for round-robin probing.
    prev_default_port: AtomicU32,
}

impl Hnet {
    pub(crate) fn next_default_port(&self, base: Port) -> Port {
        let span = (u16::MAX - base) as u32 + 1;
        let n = self.inner.prev_default_port.fetch_add(1, Ordering::Relaxed);
        base + (n % span) as Port
    }
}

/// State shared by every component of one transport instance.
pub(crate) struct HomaShared {
    pub config: HomaConfig,
    pub driver: Box<dyn Driver>,
    pub peers: PeerTable,
    pub grant: GrantSched,
    pub pacer: Pacer,

    /// All bound sockets, keyed by `(hnet, port)`.
    pub socks: DashMap<(HnetId, Port), Arc<Sock>, RandomState>,

    /// Source of client RPC ids; always even.
    pub next_outgoing_id: AtomicU64,

    next_hnet_id: AtomicU32,

    /// Count of timer ticks since creation.
    pub timer_ticks: AtomicU64,

    pub metrics: Metrics,

    /// Data bytes per DATA packet, derived from the driver MTU.
    pub max_seg: usize,
}

impl HomaShared {
    /// Hand one packet to the driver, with bookkeeping. Transmit failures
    /// are absorbed: the timer's retransmission machinery owns recovery.
    pub fn xmit_raw(&self, dst: SocketAddr, priority: Priority, pkt: &[u8]) {
        self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.driver.send(dst, priority, pkt) {
            self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("driver refused packet to {}: {}", dst, e);
        }
    }
}

/// A Homa transport instance.
pub struct Homa {
    pub(crate) shared: Arc<HomaShared>,
}

impl Homa {
    /// Create an instance over the given driver.
    ///
    /// # Panics
    ///
    /// Panics if the driver MTU cannot fit a DATA header plus one byte.
    pub fn new(config: HomaConfig, driver: Box<dyn Driver>) -> Self {
        let mtu = driver.mtu();
        let max_seg = mtu
            .checked_sub(pkt_hdr_len(PktType::Data))
            .filter(|&s| s > 0)
            .expect("driver MTU too small for a DATA packet");
        assert!(mtu >= pkt_hdr_len(PktType::Ack));

        let pacer = Pacer::new(&config);
        Self {
            shared: Arc::new(HomaShared {
                grant: GrantSched::new(&config),
                pacer,
                config,
                driver,
                peers: PeerTable::new(),
                socks: DashMap::with_capacity_and_hasher(64, RandomState::new()),
                next_outgoing_id: AtomicU64::new(2),
                next_hnet_id: AtomicU32::new(0),
                timer_ticks: AtomicU64::new(0),
                metrics: Metrics::default(),
                max_seg,
            }),
        }
    }

    /// Create a new network namespace.
    pub fn hnet(&self) -> Hnet {
        Hnet {
            id: self.shared.next_hnet_id.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(HnetState {
                prev_default_port: AtomicU32::new(0),
            }),
        }
    }

    /// Create an unbound socket in the given namespace.
    pub fn socket(&self, hnet: &Hnet) -> HomaSocket {
        HomaSocket::new(self.shared.clone(), hnet.clone())
    }

    /// Inject one inbound packet (called by the embedding's receive path).
    pub fn deliver(&self, hnet: &Hnet, src: SocketAddr, pkt: &[u8]) {
        crate::dispatch::deliver(&self.shared, hnet.id, src, pkt);
    }

    /// Run one tick of the periodic timer. The embedding calls this at a
    /// fixed interval (milliseconds, typically).
    pub fn tick(&self) {
        crate::timer::tick(&self.shared);
    }

    /// Event counters.
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Number of live peers (diagnostics).
    pub fn num_peers(&self) -> usize {
        self.shared.peers.len()
    }

    /// Number of dead peers awaiting scavenging (diagnostics).
    pub fn num_dead_peers(&self) -> usize {
        self.shared.peers.dead_len()
    }

    /// Number of bound sockets (diagnostics).
    pub fn num_socks(&self) -> usize {
        self.shared.socks.len()
    }
}

/// Validate a user-supplied message length.
pub(crate) fn check_msg_len(len: usize) -> Result<()> {
    if len == 0 || len > crate::pool::HOMA_MAX_MESSAGE_LENGTH {
        return Err(HomaError::InvalidArgument);
    }
    Ok(())
}
