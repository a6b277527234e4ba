//! The seam between the transport core and the OS packet path.
//!
//! The core never talks to a NIC directly; it hands fully formed packets to
//! a [`Driver`] and receives inbound packets through
//! [`Homa::deliver`](crate::Homa::deliver). Production embeds supply a real
//! driver; tests and benchmarks use [`MockDriver`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::type_alias::*;
use crate::wire::Packet;

/// Outbound packet path.
///
/// Implementations must be cheap to call and must never block: the transmit
/// path runs under short critical sections and from the timer tick.
pub trait Driver: Send + Sync {
    /// Maximum packet size (headers included) toward any destination.
    fn mtu(&self) -> usize;

    /// Queue one packet for transmission at the given priority level.
    fn send(&self, dst: SocketAddr, priority: Priority, pkt: &[u8]) -> Result<()>;
}

impl<D: Driver> Driver for Arc<D> {
    fn mtu(&self) -> usize {
        (**self).mtu()
    }

    fn send(&self, dst: SocketAddr, priority: Priority, pkt: &[u8]) -> Result<()> {
        (**self).send(dst, priority, pkt)
    }
}

/// A driver that records every packet instead of transmitting it.
///
/// Alongside the raw packets it keeps a human-readable log of one line per
/// packet (`"DATA 1400@2800"`, `"RESEND 1400-4999@7"`, ...), which tests
/// assert against.
pub struct MockDriver {
    mtu: usize,
    sent: Mutex<Vec<(SocketAddr, Priority, Vec<u8>)>>,
    log: Mutex<Vec<String>>,
}

/// MTU that yields 1400-byte DATA segments with the 32-byte DATA header.
pub const MOCK_MTU: usize = 1432;

impl MockDriver {
    pub fn new() -> Self {
        Self::with_mtu(MOCK_MTU)
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            mtu,
            sent: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Take every recorded packet, oldest first.
    pub fn drain(&self) -> Vec<(SocketAddr, Priority, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Take the log lines accumulated since the last call.
    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    /// Number of packets recorded and not yet drained.
    pub fn pending(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn describe(priority: Priority, pkt: &[u8]) -> String {
        match Packet::parse(pkt) {
            Ok(Packet::Data(hdr, payload)) => {
                let retrans = if hdr.retransmit != 0 { " retrans" } else { "" };
                format!(
                    "DATA {}@{}{}",
                    payload.len(),
                    hdr.seg_offset,
                    retrans
                )
            }
            Ok(Packet::Grant(hdr)) => format!("GRANT {}@{}", hdr.offset, hdr.priority),
            Ok(Packet::Resend(hdr)) if hdr.length == u32::MAX => {
                format!("RESEND {}-all@{}", hdr.offset, hdr.priority)
            }
            Ok(Packet::Resend(hdr)) => format!(
                "RESEND {}-{}@{}",
                hdr.offset,
                hdr.offset + hdr.length - 1,
                hdr.priority
            ),
            Ok(Packet::RpcUnknown(_)) => "RPC_UNKNOWN".to_owned(),
            Ok(Packet::Busy(_)) => "BUSY".to_owned(),
            Ok(Packet::Cutoffs(hdr)) => format!("CUTOFFS v{}", hdr.cutoff_version),
            Ok(Packet::Freeze(_)) => "FREEZE".to_owned(),
            Ok(Packet::NeedAck(_)) => "NEED_ACK".to_owned(),
            Ok(Packet::Ack(hdr)) => format!("ACK n{}", hdr.acks.len()),
            Err(e) => format!("<unparseable: {}> prio {}", e, priority),
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn send(&self, dst: SocketAddr, priority: Priority, pkt: &[u8]) -> Result<()> {
        self.log.lock().unwrap().push(Self::describe(priority, pkt));
        self.sent.lock().unwrap().push((dst, priority, pkt.to_vec()));
        Ok(())
    }
}

