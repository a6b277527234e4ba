//! The periodic timer pass.
//!
//! Once per tick, every live RPC is inspected: silent peers get RESENDs,
//! silence past the horizon becomes a timeout, servers with delivered
//! responses nag for acknowledgement, and sockets drowning in dead packet
//! buffers get reaped. The tick also drains the pacer and scavenges peers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::HomaError;
use crate::homa::HomaShared;
use crate::rpc::{self, HomaRpc, RpcState};
use crate::sock::Sock;
use crate::type_alias::*;
use crate::wire::{CommonHeader, PktType, ResendHeader, HOMA_MAX_PRIORITIES};
use crate::{grant, pacer};

/// Priority for RESEND and NEED_ACK packets.
const CTRL_PRIORITY: Priority = (HOMA_MAX_PRIORITIES - 1) as Priority;

/// Run one timer tick over the whole instance.
pub(crate) fn tick(shared: &Arc<HomaShared>) {
    let ticks = shared.timer_ticks.fetch_add(1, Ordering::AcqRel) + 1;

    let socks: Vec<Arc<Sock>> = shared
        .socks
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    for sock in &socks {
        let active: Vec<Arc<HomaRpc>> = sock.inner.lock().unwrap().active.clone();
        for rpc in active {
            rpc.hold();
            let timed_out = check_rpc(shared, ticks, &rpc);
            if timed_out {
                shared.metrics.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
                rpc::abort(shared, &rpc, HomaError::TimedOut);
            }
            rpc.put();
        }

        if sock.dead_skbs.load(Ordering::Acquire) > shared.config.dead_buffs_limit {
            rpc::reap_dead(shared, sock, rpc::REAP_BATCH);
        }
    }

    grant::retry_active(shared);
    pacer::run(shared);
    shared.peers.scavenge();
}

/// Inspect one RPC. Returns `true` if it has timed out and must be ended
/// (done by the caller, which holds no locks).
fn check_rpc(shared: &Arc<HomaShared>, ticks: u64, rpc: &Arc<HomaRpc>) -> bool {
    let config = &shared.config;
    let mut inner = rpc.lock();

    match inner.state {
        RpcState::Dead => return false,
        RpcState::InService => {
            // The request is with the user; the peer is not expected to
            // say anything.
            inner.silent_ticks = 0;
            return false;
        }
        _ => {}
    }

    inner.silent_ticks += 1;
    let mut resend_eligible = false;

    match inner.state {
        RpcState::Incoming => {
            let suppressed = match inner.msgin.as_ref() {
                // Nothing accepted yet (e.g. no buffer region): the sender
                // retransmits on its own clock.
                None => true,
                Some(msgin) if msgin.needs_bpages() => true,
                // Everything we asked for has arrived; more grants, not
                // resends, are the next step.
                Some(msgin) if msgin.granted() <= msgin.bytes_received() => true,
                Some(_) => false,
            };
            if suppressed {
                inner.silent_ticks = 0;
                return false;
            }
            resend_eligible = true;
        }
        RpcState::Outgoing => {
            let Some(msgout) = inner.msgout.as_ref() else {
                inner.silent_ticks = 0;
                return false;
            };
            if msgout.next_xmit_offset() < msgout.granted() {
                // We still owe granted bytes; the silence is ours.
                inner.silent_ticks = 0;
                return false;
            }
            if !rpc.is_client() && msgout.fully_transmitted() {
                // Response delivered in full: periodically ask the client
                // to confirm so the RPC can be reclaimed.
                if inner.done_timer_ticks == 0 {
                    inner.done_timer_ticks = ticks;
                } else if ticks - inner.done_timer_ticks >= config.request_ack_ticks as u64 {
                    inner.done_timer_ticks = ticks;
                    let need_ack = CommonHeader::new(
                        rpc.sock.port.load(Ordering::Acquire),
                        rpc.addr.port(),
                        PktType::NeedAck,
                        rpc.id,
                    );
                    shared.metrics.need_acks_sent.fetch_add(1, Ordering::Relaxed);
                    shared.xmit_raw(rpc.addr, CTRL_PRIORITY, need_ack.as_bytes());
                }
            } else if rpc.is_client() && msgout.fully_transmitted() {
                // Request fully sent, response not yet begun.
                resend_eligible = true;
            }
        }
        _ => unreachable!(),
    }

    if inner.silent_ticks >= config.timeout_ticks
        || rpc.peer.outstanding_resends.load(Ordering::Acquire) >= config.timeout_resends
    {
        return true;
    }

    if resend_eligible
        && inner.silent_ticks >= config.resend_ticks
        && (inner.silent_ticks - config.resend_ticks) % config.resend_interval == 0
    {
        let range = match inner.msgin.as_ref() {
            Some(msgin) => msgin.first_missing_range(),
            // The whole response is missing and its length is unknown.
            None => Some((0, usize::MAX)),
        };
        if let Some((start, end)) = range {
            let gap_age = inner
                .msgin
                .as_ref()
                .and_then(|m| m.gaps().first())
                .map(|g| g.first_seen.elapsed());
            let length = if end == usize::MAX {
                u32::MAX
            } else {
                (end - start) as u32
            };
            let resend = ResendHeader {
                common: CommonHeader::new(
                    rpc.sock.port.load(Ordering::Acquire),
                    rpc.addr.port(),
                    PktType::Resend,
                    rpc.id,
                ),
                offset: start as u32,
                length,
                priority: CTRL_PRIORITY,
            };
            rpc.peer.outstanding_resends.fetch_add(1, Ordering::AcqRel);
            shared.metrics.resends_sent.fetch_add(1, Ordering::Relaxed);
            shared.xmit_raw(rpc.addr, CTRL_PRIORITY, &resend.encode());
            log::debug!(
                "RPC {}: silent for {} ticks, requesting resend of [{}, {}) (oldest gap {:?})",
                rpc.id,
                inner.silent_ticks,
                start,
                end,
                gap_age
            );
        }
    }

    false
}
