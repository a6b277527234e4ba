//! The RPC object: one request/response exchange with a remote peer.
//!
//! An RPC is identified by `(peer, id)` and owned jointly by its socket's
//! hash buckets, the grant scheduler, the pacer queue and any code path
//! that is actively using it. The per-RPC mutex guards all mutable state;
//! `refs` keeps a dead RPC's carcass around until every such path lets go.

mod reap;

pub(crate) use self::reap::{reap_dead, REAP_BATCH};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::HomaError;
use crate::homa::HomaShared;
use crate::msgin::Msgin;
use crate::msgout::Msgout;
use crate::peer::HomaPeer;
use crate::sock::Sock;
use crate::type_alias::*;
use crate::wire::id_is_client;
use crate::{grant, pacer};

/// Life stage of an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcState {
    /// Transmitting our message (request for clients, response for servers).
    Outgoing,

    /// Receiving the peer's message.
    Incoming,

    /// Server only: the request is with the user, awaiting its response.
    InService,

    /// Terminal. Unreachable through the socket's indices; resources are
    /// reclaimed by the reaper.
    Dead,
}

/// Mutable state of an RPC, guarded by its lock.
pub(crate) struct RpcInner {
    pub state: RpcState,
    pub msgin: Option<Msgin>,
    pub msgout: Option<Msgout>,

    /// Ticks since the peer last made observable progress.
    pub silent_ticks: u32,

    /// Tick count when a server finished transmitting its response;
    /// 0 while unset. Drives NEED_ACK.
    pub done_timer_ticks: u64,

    /// Sticky fatal error.
    pub error: Option<HomaError>,

    /// Position in the grant scheduler's active set, if any.
    pub grant_rank: Option<usize>,

    /// Whether the scheduler currently tracks this RPC as grantable.
    pub grant_listed: bool,

    /// Whether the RPC sits in the pacer's throttled queue.
    pub throttled: bool,

    /// The completed message (or error) has been handed to the user.
    pub delivered: bool,

    /// Packet buffers still to be reclaimed after death.
    pub reap_skbs_remaining: usize,
}

/// One RPC. Shared via `Arc`; every list membership is explicit state in
/// [`RpcInner`] so teardown can sever each one deliberately.
pub(crate) struct HomaRpc {
    pub id: RpcId,
    pub peer: Arc<HomaPeer>,

    /// Remote address and port.
    pub addr: SocketAddr,

    /// Owning socket.
    pub sock: Arc<Sock>,

    /// Opaque user token echoed on completion (client RPCs only).
    pub completion_cookie: u64,

    /// Code paths currently using the RPC outside the socket's indices.
    refs: AtomicU32,

    inner: Mutex<RpcInner>,
}

impl HomaRpc {
    fn new(
        id: RpcId,
        peer: Arc<HomaPeer>,
        addr: SocketAddr,
        sock: Arc<Sock>,
        completion_cookie: u64,
        state: RpcState,
    ) -> Self {
        Self {
            id,
            peer,
            addr,
            sock,
            completion_cookie,
            refs: AtomicU32::new(0),
            inner: Mutex::new(RpcInner {
                state,
                msgin: None,
                msgout: None,
                silent_ticks: 0,
                done_timer_ticks: 0,
                error: None,
                grant_rank: None,
                grant_listed: false,
                throttled: false,
                delivered: false,
                reap_skbs_remaining: 0,
            }),
        }
    }

    /// `true` if this end initiated the RPC.
    #[inline(always)]
    pub fn is_client(&self) -> bool {
        id_is_client(self.id)
    }

    /// Acquire the RPC lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, RpcInner> {
        self.inner.lock().unwrap()
    }

    /// Mark the RPC as in use, keeping it from being reaped.
    #[inline(always)]
    pub fn hold(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a `hold`.
    #[inline(always)]
    pub fn put(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced put on RPC {}", self.id);
    }

    /// Current hold count.
    #[inline(always)]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Create a client RPC for a request to `dest`, install it in the socket's
/// client bucket and active list, and return it.
pub(crate) fn alloc_client(
    shared: &Arc<HomaShared>,
    sock: &Arc<Sock>,
    dest: SocketAddr,
    completion_cookie: u64,
) -> crate::error::Result<Arc<HomaRpc>> {
    let id = shared.next_outgoing_id.fetch_add(2, Ordering::Relaxed);
    let peer = shared
        .peers
        .lookup_or_create(sock.hnet, dest.ip(), &shared.config);
    let rpc = Arc::new(HomaRpc::new(
        id,
        peer,
        dest,
        sock.clone(),
        completion_cookie,
        RpcState::Outgoing,
    ));

    let mut sk = sock.inner.lock().unwrap();
    if sk.shutdown {
        shared.peers.release(&rpc.peer);
        return Err(HomaError::Shutdown);
    }
    sk.client_rpcs.insert(id, rpc.clone());
    sk.active.push(rpc.clone());
    Ok(rpc)
}

/// Find or create the server RPC for an inbound request packet. The id has
/// already been localized (odd). Returns the RPC and whether it was created.
pub(crate) fn alloc_server(
    shared: &Arc<HomaShared>,
    sock: &Arc<Sock>,
    src: SocketAddr,
    id: RpcId,
) -> crate::error::Result<(Arc<HomaRpc>, bool)> {
    debug_assert!(!id_is_client(id));

    let mut sk = sock.inner.lock().unwrap();
    if let Some(rpc) = sk.server_rpcs.get(&(id, src.ip())) {
        return Ok((rpc.clone(), false));
    }
    if sk.shutdown {
        return Err(HomaError::Shutdown);
    }

    let peer = shared
        .peers
        .lookup_or_create(sock.hnet, src.ip(), &shared.config);
    let rpc = Arc::new(HomaRpc::new(
        id,
        peer,
        src,
        sock.clone(),
        0,
        RpcState::Incoming,
    ));
    sk.server_rpcs.insert((id, src.ip()), rpc.clone());
    sk.active.push(rpc.clone());
    Ok((rpc, true))
}

/// Terminate an RPC: unlink it from every index and list, then queue it for
/// reaping. Idempotent. The caller must hold neither the socket lock nor
/// the RPC lock.
pub(crate) fn end(shared: &Arc<HomaShared>, rpc: &Arc<HomaRpc>) {
    let sock = &rpc.sock;
    let mut sk = sock.inner.lock().unwrap();
    let mut inner = rpc.lock();
    if inner.state == RpcState::Dead {
        return;
    }
    inner.state = RpcState::Dead;

    // Sever scheduler and pacer membership while both locks are held, so
    // neither will hand out the dying RPC afterwards.
    grant::detach(shared, rpc, &mut inner);
    pacer::detach(shared, rpc, &mut inner);

    let skbs = inner.msgout.as_ref().map_or(0, Msgout::num_pkts)
        + inner.msgin.as_ref().map_or(0, Msgin::num_skbs);
    inner.reap_skbs_remaining = skbs;

    if rpc.is_client() {
        sk.client_rpcs.remove(&rpc.id);
    } else {
        sk.server_rpcs.remove(&(rpc.id, rpc.addr.ip()));
    }
    sk.active.retain(|r| !Arc::ptr_eq(r, rpc));

    // An errored client RPC still owes the user a completion.
    let notify = inner.error.is_some() && rpc.is_client() && !inner.delivered;
    drop(inner);

    sock.dead_skbs.fetch_add(skbs, Ordering::AcqRel);
    sock.dead_rpcs.push(rpc.clone());

    if notify {
        sk.ready.push_back(rpc.clone());
    }
    drop(sk);
    if notify {
        sock.avail.notify_all();
    }

    log::trace!("RPC {}: ended with {} dead skbs", rpc.id, skbs);
}

/// Abort an RPC with a sticky error and terminate it.
pub(crate) fn abort(shared: &Arc<HomaShared>, rpc: &Arc<HomaRpc>, error: HomaError) {
    {
        let mut inner = rpc.lock();
        if inner.state == RpcState::Dead {
            return;
        }
        if inner.error.is_none() {
            inner.error = Some(error);
        }
    }
    end(shared, rpc);
}
