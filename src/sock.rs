//! Sockets: the user-facing endpoints of the transport.
//!
//! A socket owns its RPCs (two id-keyed buckets plus an active list), its
//! receive buffer pool, and the queue of completions waiting for a user.
//! [`HomaSocket`] is the public handle; dropping it shuts the socket down.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ahash::RandomState;
use bitflags::bitflags;
use crossbeam::queue::SegQueue;

use crate::error::{HomaError, Result};
use crate::homa::{check_msg_len, HomaShared, Hnet};
use crate::msgout::{self, Msgout};
use crate::pool::{Pool, HOMA_BPAGE_SIZE};
use crate::rpc::{self, HomaRpc, RpcState};
use crate::type_alias::*;

bitflags! {
    /// Mode flags for [`HomaSocket::receive`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: u32 {
        /// Deliver inbound requests (server role).
        const REQUEST = 0x01;
        /// Deliver completed responses (client role).
        const RESPONSE = 0x02;
        /// Fail with `Again` instead of blocking.
        const NONBLOCKING = 0x04;
    }
}

/// A message delivered to the user. The payload lives in the socket's
/// registered region, in the listed bpages; the user must hand them back
/// with [`HomaSocket::release_bpages`] once consumed.
#[derive(Debug)]
pub struct RecvMsg {
    /// Local id of the RPC. Odd ids are requests to answer with
    /// [`HomaSocket::send_response`].
    pub id: RpcId,

    /// The remote endpoint.
    pub src: SocketAddr,

    /// Total message length in bytes.
    pub length: usize,

    /// User token passed to `send_request` (0 for inbound requests).
    pub completion_cookie: u64,

    /// Bpages holding the message, in offset order. Bpage `i` covers byte
    /// range `[i * HOMA_BPAGE_SIZE, ...)` of the message.
    pub bpages: Vec<BpageIdx>,

    /// The RPC's sticky error, if it failed instead of completing.
    pub error: Option<HomaError>,
}

/// State guarded by the socket lock.
///
/// Client ids come from an instance-wide counter, so the id alone keys the
/// client bucket. Server RPCs are named by their *clients'* counters, which
/// collide across client hosts, so that bucket is keyed by `(id, peer ip)`.
pub(crate) struct SockInner {
    pub client_rpcs: HashMap<RpcId, Arc<HomaRpc>, RandomState>,
    pub server_rpcs: HashMap<(RpcId, IpAddr), Arc<HomaRpc>, RandomState>,

    /// Every live RPC, traversed by the timer.
    pub active: Vec<Arc<HomaRpc>>,

    /// Completions (and errored client RPCs) awaiting a `receive` call.
    pub ready: VecDeque<Arc<HomaRpc>>,

    pub shutdown: bool,
}

/// One socket.
pub(crate) struct Sock {
    /// Bound port; 0 while unbound.
    pub port: AtomicU16,

    pub hnet: HnetId,

    pub inner: Mutex<SockInner>,

    /// Signaled when `ready` gains an entry or the socket shuts down.
    pub avail: Condvar,

    /// Receive buffer pool, absent until the user registers a region.
    pub pool: Mutex<Option<Pool>>,

    /// Dead RPCs whose buffers the reaper has not finished reclaiming.
    pub dead_rpcs: SegQueue<Arc<HomaRpc>>,

    /// Aggregate packet buffers held by `dead_rpcs`.
    pub dead_skbs: AtomicUsize,
}

impl Sock {
    fn new(hnet: HnetId) -> Self {
        Self {
            port: AtomicU16::new(0),
            hnet,
            inner: Mutex::new(SockInner {
                client_rpcs: HashMap::with_hasher(RandomState::new()),
                server_rpcs: HashMap::with_hasher(RandomState::new()),
                active: Vec::new(),
                ready: VecDeque::new(),
                shutdown: false,
            }),
            avail: Condvar::new(),
            pool: Mutex::new(None),
            dead_rpcs: SegQueue::new(),
            dead_skbs: AtomicUsize::new(0),
        }
    }

    /// Find a live RPC by localized id and the peer that owns it.
    pub fn find_rpc(&self, id: RpcId, peer_ip: IpAddr) -> Option<Arc<HomaRpc>> {
        let sk = self.inner.lock().unwrap();
        if crate::wire::id_is_client(id) {
            sk.client_rpcs
                .get(&id)
                .filter(|rpc| rpc.addr.ip() == peer_ip)
                .cloned()
        } else {
            sk.server_rpcs.get(&(id, peer_ip)).cloned()
        }
    }

    /// Find a client RPC by id alone (ids from the local counter are
    /// unique, so no peer qualifier is needed).
    pub fn find_client(&self, id: RpcId) -> Option<Arc<HomaRpc>> {
        self.inner.lock().unwrap().client_rpcs.get(&id).cloned()
    }

    /// Queue a completed (or errored) RPC for delivery and wake waiters.
    pub fn deliver_ready(&self, rpc: &Arc<HomaRpc>) {
        let mut sk = self.inner.lock().unwrap();
        if sk.ready.iter().any(|r| Arc::ptr_eq(r, rpc)) {
            return;
        }
        sk.ready.push_back(rpc.clone());
        drop(sk);
        self.avail.notify_all();
    }
}

/// Public handle to a socket. Dropping it destroys the socket.
pub struct HomaSocket {
    pub(crate) sock: Arc<Sock>,
    pub(crate) shared: Arc<HomaShared>,
    hnet: Hnet,
}

impl HomaSocket {
    pub(crate) fn new(shared: Arc<HomaShared>, hnet: Hnet) -> Self {
        Self {
            sock: Arc::new(Sock::new(hnet.id)),
            shared,
            hnet,
        }
    }

    /// The bound port, or 0 if unbound.
    pub fn port(&self) -> Port {
        self.sock.port.load(Ordering::Acquire)
    }

    /// Bind the socket. A nonzero `port` must lie below the configured
    /// server/client boundary and be free; 0 picks an ephemeral port.
    /// Returns the bound port.
    pub fn bind(&self, port: Port) -> Result<Port> {
        if self.port() != 0 {
            return Err(HomaError::InvalidArgument);
        }

        let boundary = self.shared.config.min_default_port;
        if port != 0 {
            if port >= boundary {
                return Err(HomaError::InvalidArgument);
            }
            return self.try_install(port).then_some(port).ok_or(HomaError::PortInUse);
        }

        // Ephemeral: probe from the per-hnet counter with wraparound.
        let span = (u16::MAX - boundary) as u32 + 1;
        for _ in 0..span {
            let candidate = self.hnet.next_default_port(boundary);
            if self.try_install(candidate) {
                return Ok(candidate);
            }
        }
        Err(HomaError::PortInUse)
    }

    fn try_install(&self, port: Port) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.shared.socks.entry((self.sock.hnet, port)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(self.sock.clone());
                self.sock.port.store(port, Ordering::Release);
                true
            }
        }
    }

    fn ensure_bound(&self) -> Result<Port> {
        match self.port() {
            0 => self.bind(0),
            p => Ok(p),
        }
    }

    /// Register the receive buffer region. `region_len` must be a positive
    /// multiple of [`HOMA_BPAGE_SIZE`].
    pub fn set_buf_region(&self, region_len: usize) -> Result<()> {
        let pool = Pool::new(region_len)?;
        *self.sock.pool.lock().unwrap() = Some(pool);
        Ok(())
    }

    /// Hand consumed bpages back to the pool.
    pub fn release_bpages(&self, bpages: &[BpageIdx]) {
        if bpages.is_empty() {
            return;
        }
        {
            let pool = self.sock.pool.lock().unwrap();
            if let Some(pool) = pool.as_ref() {
                pool.free_bpages_list(bpages);
            }
        }
        // Freed pages may unblock granting for paused messages.
        crate::grant::rekick_sock(&self.shared, &self.sock);
    }

    /// Copy a delivered message out of the region (convenience; the
    /// zero-copy path is [`HomaSocket::with_msg_bytes`]).
    pub fn msg_bytes(&self, msg: &RecvMsg) -> Vec<u8> {
        let mut out = Vec::with_capacity(msg.length);
        self.with_msg_bytes(msg, |chunk| out.extend_from_slice(chunk));
        out
    }

    /// Visit the delivered message's bytes in offset order, directly in the
    /// registered region.
    pub fn with_msg_bytes(&self, msg: &RecvMsg, mut f: impl FnMut(&[u8])) {
        let pool = self.sock.pool.lock().unwrap();
        let Some(pool) = pool.as_ref() else { return };
        let mut remaining = msg.length;
        for &bpage in &msg.bpages {
            let chunk = remaining.min(HOMA_BPAGE_SIZE);
            f(pool.read(bpage, 0, chunk));
            remaining -= chunk;
            if remaining == 0 {
                break;
            }
        }
    }

    /// Issue a request to `dest`. Returns the new RPC's id; the response
    /// arrives through [`HomaSocket::receive`] carrying `completion_cookie`.
    pub fn send_request(
        &self,
        dest: SocketAddr,
        data: &[u8],
        completion_cookie: u64,
    ) -> Result<RpcId> {
        check_msg_len(data.len())?;
        self.ensure_bound()?;

        let rpc = rpc::alloc_client(&self.shared, &self.sock, dest, completion_cookie)?;
        let mut inner = rpc.lock();
        inner.msgout = Some(Msgout::new(
            data,
            self.shared.max_seg,
            self.shared.config.unsched_bytes,
        ));
        msgout::xmit(&self.shared, &rpc, &mut inner, false);
        drop(inner);
        Ok(rpc.id)
    }

    /// Answer a request previously delivered by `receive`. `src` is the
    /// requester's address from the delivered [`RecvMsg`].
    pub fn send_response(&self, id: RpcId, src: SocketAddr, data: &[u8]) -> Result<()> {
        check_msg_len(data.len())?;
        if crate::wire::id_is_client(id) {
            return Err(HomaError::InvalidArgument);
        }

        let rpc = self.sock.find_rpc(id, src.ip()).ok_or(HomaError::NotFound)?;
        let mut inner = rpc.lock();
        if inner.state != RpcState::InService {
            return Err(HomaError::InvalidArgument);
        }
        inner.state = RpcState::Outgoing;
        inner.msgout = Some(Msgout::new(
            data,
            self.shared.max_seg,
            self.shared.config.unsched_bytes,
        ));
        msgout::xmit(&self.shared, &rpc, &mut inner, false);
        drop(inner);
        Ok(())
    }

    /// Wait for the next completion matching `flags` (and `id`, if given).
    ///
    /// Client completions end the RPC; its bpages transfer to the caller.
    /// Inbound requests leave the RPC in service until `send_response`.
    pub fn receive(&self, flags: RecvFlags, id: Option<RpcId>) -> Result<RecvMsg> {
        if id.is_none() && !flags.intersects(RecvFlags::REQUEST | RecvFlags::RESPONSE) {
            return Err(HomaError::InvalidArgument);
        }

        let mut sk = self.sock.inner.lock().unwrap();
        loop {
            let matching = sk.ready.iter().position(|rpc| match id {
                Some(want) => rpc.id == want,
                None => {
                    (flags.contains(RecvFlags::REQUEST) && !rpc.is_client())
                        || (flags.contains(RecvFlags::RESPONSE) && rpc.is_client())
                }
            });

            if let Some(pos) = matching {
                let rpc = sk.ready.remove(pos).unwrap();

                let mut inner = rpc.lock();
                inner.delivered = true;
                let error = inner.error;
                let (length, bpages) = match inner.msgin.as_mut() {
                    Some(msgin) if msgin.is_complete() => {
                        (msgin.length(), msgin.take_bpages())
                    }
                    _ => (0, Vec::new()),
                };
                drop(inner);
                drop(sk);

                // A client RPC is finished once the user has its response.
                if rpc.is_client() {
                    rpc::end(&self.shared, &rpc);
                }

                return Ok(RecvMsg {
                    id: rpc.id,
                    src: rpc.addr,
                    length,
                    completion_cookie: rpc.completion_cookie,
                    bpages,
                    error,
                });
            }

            if sk.shutdown {
                return Err(HomaError::Shutdown);
            }
            if flags.contains(RecvFlags::NONBLOCKING) {
                return Err(HomaError::Again);
            }
            sk = self.sock.avail.wait(sk).unwrap();
        }
    }

    /// Abort an outstanding request. Its completion (with error
    /// `Cancelled`) is still delivered to a waiting `receive`.
    pub fn abort(&self, id: RpcId) -> Result<()> {
        if !crate::wire::id_is_client(id) {
            return Err(HomaError::InvalidArgument);
        }
        let rpc = self.sock.find_client(id).ok_or(HomaError::NotFound)?;
        rpc::abort(&self.shared, &rpc, HomaError::Cancelled);
        Ok(())
    }

    /// Tear down every RPC and wake all waiters. Idempotent.
    pub fn shutdown(&self) {
        let doomed: Vec<Arc<HomaRpc>> = {
            let mut sk = self.sock.inner.lock().unwrap();
            if sk.shutdown {
                return;
            }
            sk.shutdown = true;
            sk.active.clone()
        };

        for rpc in doomed {
            rpc::abort(&self.shared, &rpc, HomaError::Shutdown);
        }
        self.sock.avail.notify_all();
    }

    /// Shut down and release everything the socket still holds. Called by
    /// `Drop`; exposed so tests can drive teardown deterministically.
    pub fn destroy(&self) {
        self.shutdown();

        let port = self.port();
        if port != 0 {
            self.shared.socks.remove(&(self.sock.hnet, port));
        }

        // Reap whatever can be reaped now; anything pinned by a concurrent
        // holder stays until its holder lets go and the timer returns.
        while self.sock.dead_skbs.load(Ordering::Acquire) > 0 {
            if rpc::reap_dead(&self.shared, &self.sock, usize::MAX) == 0 {
                break;
            }
        }
    }
}

impl Drop for HomaSocket {
    fn drop(&mut self) {
        self.destroy();
    }
}
