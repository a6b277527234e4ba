//! Inbound packet dispatch.
//!
//! `deliver` parses a raw packet, locates (or creates) the target RPC and
//! runs the per-type handler under the RPC lock. Everything that needs
//! other locks — completions, terminations, grants for other RPCs — is
//! collected as actions and executed after the lock is released.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::HomaError;
use crate::homa::HomaShared;
use crate::msgin::{AddResult, Msgin};
use crate::msgout;
use crate::rpc::{self, HomaRpc, RpcInner, RpcState};
use crate::sock::Sock;
use crate::type_alias::*;
use crate::util::unlikely;
use crate::wire::*;

/// Priority for control packets (grants, resends, acks, ...).
const CTRL_PRIORITY: Priority = (HOMA_MAX_PRIORITIES - 1) as Priority;

/// Work deferred until the RPC lock is dropped.
#[derive(Default)]
struct Actions {
    /// Queue the RPC for user delivery.
    deliver: bool,

    /// Terminate the RPC.
    end: bool,

    /// Reply RPC_UNKNOWN to the sender.
    send_unknown: bool,

    /// Reply BUSY to the sender.
    send_busy: bool,

    /// Reply ACK carrying the peer's pending acknowledgements.
    send_ack: bool,

    /// Send our cutoff table to the sender.
    send_cutoffs: bool,

    /// RPCs whose grant standing must be re-checked.
    grant_checks: Vec<Arc<HomaRpc>>,

    /// Acknowledgements to apply to other RPCs.
    acks: Vec<RpcAck>,
}

/// Entry point for one inbound packet.
pub(crate) fn deliver(shared: &Arc<HomaShared>, hnet: HnetId, src: SocketAddr, bytes: &[u8]) {
    shared.metrics.packets_received.fetch_add(1, Ordering::Relaxed);

    let pkt = match Packet::parse(bytes) {
        Ok(pkt) => pkt,
        Err(e) => {
            shared.metrics.malformed_packets.fetch_add(1, Ordering::Relaxed);
            log::debug!("dropping malformed packet from {}: {}", src, e);
            return;
        }
    };
    let common = *pkt.common();

    let Some(sock) = shared
        .socks
        .get(&(hnet, common.dport()))
        .map(|entry| entry.value().clone())
    else {
        shared.metrics.dropped_no_socket.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "dropping {:?} packet from {}: no socket on port {}",
            common.pkt_type(),
            src,
            common.dport()
        );
        return;
    };

    let id = local_id(common.sender_id());
    let mut rpc = sock.find_rpc(id, src.ip());

    // A DATA packet for an unknown id on a server port starts a new RPC.
    if rpc.is_none() && matches!(pkt, Packet::Data(..)) {
        if !id_is_client(id) && common.dport() < shared.config.min_default_port {
            match rpc::alloc_server(shared, &sock, src, id) {
                Ok((fresh, created)) => {
                    if created {
                        log::trace!("RPC {}: created from request packet", id);
                    }
                    rpc = Some(fresh);
                }
                Err(_) => return,
            }
        }
    }

    let Some(rpc) = rpc else {
        no_rpc(shared, hnet, &sock, src, &common, &pkt);
        return;
    };

    rpc.hold();
    let mut actions = Actions::default();
    {
        let mut inner = rpc.lock();
        if unlikely(inner.state == RpcState::Dead) {
            // The indices have already been purged, but a racing holder can
            // still surface a dying RPC here.
            if matches!(pkt, Packet::Data(..)) {
                actions.send_unknown = true;
            }
        } else {
            inner.silent_ticks = 0;
            match pkt {
                Packet::Data(hdr, payload) => {
                    handle_data(shared, &sock, &rpc, &mut inner, &hdr, payload, &mut actions)
                }
                Packet::Grant(hdr) => handle_grant(shared, &rpc, &mut inner, &hdr),
                Packet::Resend(hdr) => handle_resend(shared, &rpc, &mut inner, &hdr, &mut actions),
                Packet::RpcUnknown(_) => {
                    if rpc.is_client() {
                        // Our outstanding request is gone at the server.
                        inner.error = Some(HomaError::Unknown);
                    }
                    // For a server, the client forgetting the RPC is an
                    // implicit acknowledgement of the response.
                    actions.end = true;
                }
                Packet::Busy(_) => {
                    // Progress signal; the silent-tick reset is the effect.
                }
                Packet::Cutoffs(hdr) => rpc.peer.set_cutoffs(&hdr),
                Packet::Freeze(_) => log::debug!("RPC {}: FREEZE received", rpc.id),
                Packet::NeedAck(_) => handle_need_ack(&mut inner, &mut actions),
                Packet::Ack(hdr) => {
                    // The id in the common header acknowledges this RPC.
                    actions.acks = hdr.acks.clone();
                    actions.end = true;
                }
            }
        }
    }
    rpc.put();

    run_actions(shared, hnet, &sock, src, &common, &rpc, actions);
}

/// Handle a packet whose id matches no live RPC.
fn no_rpc(
    shared: &Arc<HomaShared>,
    hnet: HnetId,
    sock: &Arc<Sock>,
    src: SocketAddr,
    common: &CommonHeader,
    pkt: &Packet<'_>,
) {
    match pkt {
        Packet::RpcUnknown(_) => {
            log::debug!("ignoring RPC_UNKNOWN for unknown RPC {}", common.sender_id());
        }
        Packet::Ack(hdr) => apply_acks(shared, hnet, src, &hdr.acks),
        _ => send_rpc_unknown(shared, sock, src, common),
    }
}

fn handle_data(
    shared: &Arc<HomaShared>,
    sock: &Arc<Sock>,
    rpc: &Arc<HomaRpc>,
    inner: &mut RpcInner,
    hdr: &DataHeader,
    payload: &[u8],
    actions: &mut Actions,
) {
    rpc.peer.outstanding_resends.store(0, Ordering::Release);

    // The first response byte flips a client RPC into receive mode.
    if rpc.is_client() && inner.state == RpcState::Outgoing {
        inner.state = RpcState::Incoming;
    }
    if inner.state != RpcState::Incoming {
        // A server already past receiving (duplicated request data): tell
        // the client we have it and are working on it.
        actions.send_busy = true;
        return;
    }

    {
        let pool = sock.pool.lock().unwrap();
        let Some(pool) = pool.as_ref() else {
            shared.metrics.no_buffer_drops.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "RPC {}: dropping data, socket has no buffer region",
                rpc.id
            );
            return;
        };

        let msgin = inner.msgin.get_or_insert_with(|| {
            Msgin::new(hdr.message_length as usize, hdr.incoming as usize)
        });
        msgin.note_incoming(hdr.incoming as usize);

        match msgin.add_packet(pool, hdr.seg_offset as usize, payload) {
            AddResult::Accepted => {}
            AddResult::Duplicate => {
                shared.metrics.duplicate_packets.fetch_add(1, Ordering::Relaxed);
            }
            AddResult::NoBufferSpace => {
                shared.metrics.no_buffer_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    if hdr.cutoff_version != shared.config.cutoff_version {
        actions.send_cutoffs = true;
    }

    let msgin = inner.msgin.as_ref().unwrap();
    if msgin.is_complete() {
        if !rpc.is_client() {
            inner.state = RpcState::InService;
        }
        actions.deliver = true;
    }

    actions.grant_checks = shared.grant.note_progress(rpc, inner);
}

fn handle_grant(
    shared: &Arc<HomaShared>,
    rpc: &Arc<HomaRpc>,
    inner: &mut RpcInner,
    hdr: &GrantHeader,
) {
    rpc.peer.outstanding_resends.store(0, Ordering::Release);
    if inner.state != RpcState::Outgoing || inner.msgout.is_none() {
        return;
    }

    let msgout = inner.msgout.as_mut().unwrap();
    msgout.raise_granted(hdr.offset as usize, hdr.priority);

    if hdr.resend_all != 0 {
        let end = msgout.next_xmit_offset();
        msgout::resend_data(shared, rpc, inner, 0, end, hdr.priority);
    }
    msgout::xmit(shared, rpc, inner, false);
}

fn handle_resend(
    shared: &Arc<HomaShared>,
    rpc: &Arc<HomaRpc>,
    inner: &mut RpcInner,
    hdr: &ResendHeader,
    actions: &mut Actions,
) {
    let Some(msgout) = inner.msgout.as_ref() else {
        // Nothing transmitted yet (response still being computed, or the
        // request never started): the peer just needs a sign of life.
        actions.send_busy = true;
        return;
    };

    let start = hdr.offset as usize;
    if start >= msgout.next_xmit_offset() {
        actions.send_busy = true;
        return;
    }
    let end = if hdr.length == u32::MAX {
        msgout.next_xmit_offset()
    } else {
        (start + hdr.length as usize).min(msgout.next_xmit_offset())
    };

    msgout::resend_data(shared, rpc, inner, start, end, hdr.priority);
}

fn handle_need_ack(inner: &mut RpcInner, actions: &mut Actions) {
    let complete = inner
        .msgin
        .as_ref()
        .map_or(inner.delivered, Msgin::is_complete);
    if complete {
        actions.send_ack = true;
    } else {
        actions.send_busy = true;
    }
}

fn run_actions(
    shared: &Arc<HomaShared>,
    hnet: HnetId,
    sock: &Arc<Sock>,
    src: SocketAddr,
    common: &CommonHeader,
    rpc: &Arc<HomaRpc>,
    actions: Actions,
) {
    if actions.deliver {
        sock.deliver_ready(rpc);
    }
    if actions.end {
        rpc::end(shared, rpc);
    }
    if actions.send_unknown {
        send_rpc_unknown(shared, sock, src, common);
    }
    if actions.send_busy {
        let busy = CommonHeader::new(common.dport(), common.sport(), PktType::Busy, rpc.id);
        shared.metrics.busy_sent.fetch_add(1, Ordering::Relaxed);
        shared.xmit_raw(src, CTRL_PRIORITY, busy.as_bytes());
    }
    if actions.send_ack {
        let ack = AckHeader {
            common: CommonHeader::new(common.dport(), common.sport(), PktType::Ack, rpc.id),
            acks: rpc.peer.take_acks(),
        };
        shared.metrics.acks_sent.fetch_add(1, Ordering::Relaxed);
        shared.xmit_raw(src, CTRL_PRIORITY, &ack.encode());
    }
    if actions.send_cutoffs {
        let cutoffs = CutoffsHeader {
            common: CommonHeader::new(common.dport(), common.sport(), PktType::Cutoffs, rpc.id),
            unsched_cutoffs: shared.config.unsched_cutoffs,
            cutoff_version: shared.config.cutoff_version,
        };
        shared.xmit_raw(src, CTRL_PRIORITY, &cutoffs.encode());
    }
    for other in actions.grant_checks {
        crate::grant::check_and_send(shared, &other);
    }
    if !actions.acks.is_empty() {
        apply_acks(shared, hnet, src, &actions.acks);
    }
}

/// End the server RPCs named in a batch of acknowledgements. The client's
/// address identifies which peer's ids the batch refers to.
fn apply_acks(shared: &Arc<HomaShared>, hnet: HnetId, src: SocketAddr, acks: &[RpcAck]) {
    for ack in acks {
        let Some(sock) = shared
            .socks
            .get(&(hnet, ack.server_port))
            .map(|entry| entry.value().clone())
        else {
            continue;
        };
        let server_id = local_id(ack.client_id);
        if let Some(rpc) = sock.find_rpc(server_id, src.ip()) {
            log::trace!("RPC {}: acknowledged by peer", server_id);
            rpc::end(shared, &rpc);
        }
    }
}

/// Reply RPC_UNKNOWN: the peer is talking about an RPC we have no record
/// of. Our id for it is theirs with the role bit flipped.
fn send_rpc_unknown(
    shared: &Arc<HomaShared>,
    _sock: &Arc<Sock>,
    src: SocketAddr,
    common: &CommonHeader,
) {
    let reply = CommonHeader::new(
        common.dport(),
        common.sport(),
        PktType::RpcUnknown,
        local_id(common.sender_id()),
    );
    shared.metrics.unknown_rpc_replies.fetch_add(1, Ordering::Relaxed);
    shared.xmit_raw(src, CTRL_PRIORITY, reply.as_bytes());
}
