#![allow(unused_imports)]

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::*;
use std::sync::{mpsc, Arc};
use std::thread;

use rand::Rng;
use simple_logger::SimpleLogger;

use crate::config::FLAG_DONT_THROTTLE;
use crate::homa::{Hnet, Homa};
use crate::sock::{HomaSocket, RecvFlags, RecvMsg};
use crate::type_alias::*;
use crate::wire;
use crate::{HomaConfig, HomaError, MockDriver};

mod small;
mod timers;

static LOGGER: std::sync::Once = std::sync::Once::new();

pub(self) fn init_logging() {
    LOGGER.call_once(|| {
        SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init()
            .ok();
    });
}

/// One in-process transport instance with a recording driver.
pub(self) struct Node {
    pub homa: Homa,
    pub hnet: Hnet,
    pub driver: Arc<MockDriver>,
    pub ip: IpAddr,
}

impl Node {
    pub fn new(last_octet: u8, config: HomaConfig) -> Self {
        init_logging();
        let driver = Arc::new(MockDriver::new());
        let homa = Homa::new(config, Box::new(driver.clone()));
        let hnet = homa.hnet();
        Self {
            homa,
            hnet,
            driver,
            ip: IpAddr::from([10, 0, 0, last_octet]),
        }
    }

    pub fn addr(&self, port: Port) -> SocketAddr {
        SocketAddr::new(self.ip, port)
    }
}

/// Config used by most tests: pacing off so packet timing is deterministic.
pub(self) fn test_config() -> HomaConfig {
    HomaConfig {
        flags: FLAG_DONT_THROTTLE,
        ..HomaConfig::default()
    }
}

/// Source port of a raw packet (first header field, network order).
pub(self) fn sport_of(pkt: &[u8]) -> Port {
    u16::from_be_bytes([pkt[0], pkt[1]])
}

/// Shuttle packets between two nodes until both are quiescent.
pub(self) fn pump(a: &Node, b: &Node) {
    loop {
        let from_a = a.driver.drain();
        let from_b = b.driver.drain();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for (dst, _prio, pkt) in from_a {
            if dst.ip() == b.ip {
                b.homa.deliver(&b.hnet, SocketAddr::new(a.ip, sport_of(&pkt)), &pkt);
            }
        }
        for (dst, _prio, pkt) in from_b {
            if dst.ip() == a.ip {
                a.homa.deliver(&a.hnet, SocketAddr::new(b.ip, sport_of(&pkt)), &pkt);
            }
        }
    }
}

/// A recognizable payload: `msg_data(n)[i] == (i * 7 + 3) % 251`.
pub(self) fn msg_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + 3) % 251) as u8).collect()
}

/// Build a raw DATA packet as a remote client/server would send it.
/// `sender_id` is the *remote* end's id for the RPC.
pub(self) fn raw_data_pkt(
    sport: Port,
    dport: Port,
    sender_id: RpcId,
    message_length: usize,
    incoming: usize,
    seg_offset: usize,
    payload: &[u8],
) -> Vec<u8> {
    let hdr = wire::DataHeader {
        common: wire::CommonHeader::new(sport, dport, wire::PktType::Data, sender_id),
        message_length: message_length as u32,
        incoming: incoming as u32,
        cutoff_version: 1,
        retransmit: 0,
        seg_offset: seg_offset as u32,
    };
    hdr.encode(payload)
}
