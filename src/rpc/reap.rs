//! Deferred reclamation of dead RPCs.
//!
//! Ending an RPC only unlinks it; its packet buffers stay charged to the
//! socket's `dead_skbs` until the timer reaps them, a bounded batch per
//! tick so a burst of large dead messages cannot stall the tick.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::homa::HomaShared;
use crate::rpc::HomaRpc;
use crate::sock::Sock;
use crate::wire::{AckHeader, CommonHeader, PktType, RpcAck, HOMA_MAX_PRIORITIES};

/// Packet buffers reclaimed per socket per call.
pub(crate) const REAP_BATCH: usize = 10;

/// Reclaim up to `batch` packet buffers from the socket's dead list.
/// Returns the number reclaimed.
pub(crate) fn reap_dead(shared: &Arc<HomaShared>, sock: &Arc<Sock>, batch: usize) -> usize {
    let mut freed = 0;
    let mut requeue: Vec<Arc<HomaRpc>> = Vec::new();

    while freed < batch {
        let Some(rpc) = sock.dead_rpcs.pop() else {
            break;
        };

        // Still in use somewhere; come back to it on a later tick.
        if rpc.refs() > 0 {
            requeue.push(rpc);
            continue;
        }

        let mut inner = rpc.lock();
        let take = inner.reap_skbs_remaining.min(batch - freed);
        inner.reap_skbs_remaining -= take;
        freed += take;

        if inner.reap_skbs_remaining == 0 {
            // Final release: bpages the user never took go back to the
            // pool (delivery empties the list), messages are dropped, and
            // the peer loses a reference.
            if let Some(mut msgin) = inner.msgin.take() {
                let bpages = msgin.take_bpages();
                if !bpages.is_empty() {
                    if let Some(pool) = sock.pool.lock().unwrap().as_ref() {
                        pool.free_bpages_list(&bpages);
                    }
                }
            }
            inner.msgout = None;
            drop(inner);

            // Let the server drop its record of a finished client RPC. The
            // acknowledgement rides the peer's pending-ACK queue; a full
            // queue flushes eagerly.
            if rpc.is_client() {
                let flushed = rpc.peer.add_ack(RpcAck {
                    client_id: rpc.id,
                    server_port: rpc.addr.port(),
                });
                if let Some(acks) = flushed {
                    let hdr = AckHeader {
                        common: CommonHeader::new(
                            rpc.sock.port.load(Ordering::Acquire),
                            rpc.addr.port(),
                            PktType::Ack,
                            rpc.id,
                        ),
                        acks,
                    };
                    shared.metrics.acks_sent.fetch_add(1, Ordering::Relaxed);
                    shared.xmit_raw(rpc.addr, (HOMA_MAX_PRIORITIES - 1) as u8, &hdr.encode());
                }
            }

            shared.peers.release(&rpc.peer);
            shared.metrics.reaped_rpcs.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(inner);
            requeue.push(rpc);
        }
    }

    for rpc in requeue {
        sock.dead_rpcs.push(rpc);
    }

    if freed > 0 {
        sock.dead_skbs.fetch_sub(freed, Ordering::AcqRel);
        shared.metrics.reaped_skbs.fetch_add(freed as u64, Ordering::Relaxed);
    }
    freed
}
