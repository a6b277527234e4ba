//! Timer-driven behavior: resend cadence, timeouts, NEED_ACK, reaping.

use super::*;
use crate::HOMA_BPAGE_SIZE;

const SERVER_PORT: Port = 99;

fn timer_config() -> HomaConfig {
    HomaConfig {
        resend_ticks: 2,
        resend_interval: 2,
        timeout_ticks: 6,
        timeout_resends: 100,
        request_ack_ticks: 2,
        ..test_config()
    }
}

/// A client with a half-received response asks for the missing range on
/// the resend schedule, then times out.
#[test]
fn resend_then_timeout() {
    let node = Node::new(1, timer_config());
    let sock = node.homa.socket(&node.hnet);
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    let server = SocketAddr::new(IpAddr::from([10, 0, 0, 9]), SERVER_PORT);
    let id = sock.send_request(server, &msg_data(200), 1).unwrap();
    let client_port = sock.port();
    node.driver.drain(); // the request vanishes into the void

    // First 1400 bytes of a 10000-byte response arrive, fully granted.
    let pkt = raw_data_pkt(SERVER_PORT, client_port, id ^ 1, 10000, 10000, 0, &msg_data(1400));
    node.homa.deliver(&node.hnet, server, &pkt);
    node.driver.take_log();

    // Ticks 1: silent. Tick 2 = resend_ticks: first RESEND.
    node.homa.tick();
    assert!(node.driver.take_log().is_empty());
    node.homa.tick();
    assert_eq!(node.driver.take_log(), vec!["RESEND 1400-9999@7".to_owned()]);

    // Tick 3: between resends. Tick 4: second RESEND.
    node.homa.tick();
    assert!(node.driver.take_log().is_empty());
    node.homa.tick();
    assert_eq!(node.driver.take_log(), vec!["RESEND 1400-9999@7".to_owned()]);

    // Ticks 5 and 6: the timeout horizon.
    node.homa.tick();
    node.homa.tick();
    let msg = sock.receive(RecvFlags::RESPONSE | RecvFlags::NONBLOCKING, None).unwrap();
    assert_eq!(msg.id, id);
    assert_eq!(msg.error, Some(HomaError::TimedOut));
    assert_eq!(node.homa.metrics().rpc_timeouts.load(Ordering::Relaxed), 1);
}

/// A client that never heard a response byte asks for everything.
#[test]
fn resend_whole_response() {
    let node = Node::new(1, timer_config());
    let sock = node.homa.socket(&node.hnet);
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    let server = SocketAddr::new(IpAddr::from([10, 0, 0, 9]), SERVER_PORT);
    sock.send_request(server, &msg_data(200), 1).unwrap();
    node.driver.take_log();

    node.homa.tick();
    node.homa.tick();
    assert_eq!(node.driver.take_log(), vec!["RESEND 0-all@7".to_owned()]);
}

/// Too many unanswered RESENDs to one peer fail the RPC even before the
/// silence horizon.
#[test]
fn timeout_by_outstanding_resends() {
    let config = HomaConfig {
        timeout_ticks: 1000,
        timeout_resends: 2,
        ..timer_config()
    };
    let node = Node::new(1, config);
    let sock = node.homa.socket(&node.hnet);
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    let server = SocketAddr::new(IpAddr::from([10, 0, 0, 9]), SERVER_PORT);
    sock.send_request(server, &msg_data(200), 1).unwrap();

    // Resends at ticks 2 and 4; at tick 5 the peer has 2 outstanding.
    for _ in 0..5 {
        node.homa.tick();
    }
    let msg = sock.receive(RecvFlags::RESPONSE | RecvFlags::NONBLOCKING, None).unwrap();
    assert_eq!(msg.error, Some(HomaError::TimedOut));
}

/// Scenario: a server that finished its response stamps `done_timer_ticks`
/// on the next tick and emits NEED_ACK `request_ack_ticks` later.
#[test]
fn need_ack_cadence() {
    let config = HomaConfig {
        timeout_ticks: 1000,
        ..timer_config()
    };
    let node = Node::new(2, config);
    let sock = node.homa.socket(&node.hnet);
    sock.bind(SERVER_PORT).unwrap();
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    let client = SocketAddr::new(IpAddr::from([10, 0, 0, 77]), 40000);
    let pkt = raw_data_pkt(40000, SERVER_PORT, 2, 100, 100, 0, &msg_data(100));
    node.homa.deliver(&node.hnet, client, &pkt);

    let req = sock.receive(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None).unwrap();
    sock.send_response(req.id, req.src, &msg_data(100)).unwrap();
    sock.release_bpages(&req.bpages);
    node.driver.take_log();

    // Tick 1 stamps done_timer_ticks, tick 2 is short of the horizon,
    // tick 3 asks.
    node.homa.tick();
    assert!(node.driver.take_log().is_empty());
    node.homa.tick();
    assert!(node.driver.take_log().is_empty());
    node.homa.tick();
    assert_eq!(node.driver.take_log(), vec!["NEED_ACK".to_owned()]);

    // And again after another interval, until the client answers.
    node.homa.tick();
    node.homa.tick();
    assert_eq!(node.driver.take_log(), vec!["NEED_ACK".to_owned()]);
}

/// Suppressions: a server in service and a receiver with all granted
/// bytes in hand stay silent.
#[test]
fn silence_suppressions() {
    let config = HomaConfig {
        timeout_ticks: 4,
        // No window: nothing beyond the unscheduled bytes gets granted, so
        // the receiver is owed nothing.
        window: 0,
        ..timer_config()
    };
    let node = Node::new(2, config);
    let sock = node.homa.socket(&node.hnet);
    sock.bind(SERVER_PORT).unwrap();
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    let client = SocketAddr::new(IpAddr::from([10, 0, 0, 77]), 40000);

    // In service: request delivered, response pending with the user.
    let pkt = raw_data_pkt(40000, SERVER_PORT, 2, 100, 100, 0, &msg_data(100));
    node.homa.deliver(&node.hnet, client, &pkt);
    let req = sock.receive(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None).unwrap();

    // All granted received: a partially granted inbound message with no
    // outstanding authorized bytes.
    let pkt = raw_data_pkt(40000, SERVER_PORT, 4, 50_000, 1400, 0, &msg_data(1400));
    node.homa.deliver(&node.hnet, client, &pkt);
    node.driver.drain();

    for _ in 0..10 {
        node.homa.tick();
    }
    // No resends, no timeouts, from either RPC.
    let logs = node.driver.take_log();
    assert!(
        logs.iter().all(|l| !l.starts_with("RESEND")),
        "unexpected: {:?}",
        logs
    );
    assert_eq!(node.homa.metrics().rpc_timeouts.load(Ordering::Relaxed), 0);

    sock.release_bpages(&req.bpages);
}

/// Scenario: `dead_buffs_limit` 15 against an RPC with 31 buffers; each
/// tick reaps one batch, 31 to 21 to 11.
#[test]
fn reap_in_batches() {
    let config = HomaConfig {
        dead_buffs_limit: 15,
        unsched_bytes: 100_000,
        ..test_config()
    };
    let node = Node::new(1, config);
    let sock = node.homa.socket(&node.hnet);
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    // 30 request packets out, 1 response packet in = 31 dead buffers.
    let server = SocketAddr::new(IpAddr::from([10, 0, 0, 9]), SERVER_PORT);
    let id = sock
        .send_request(server, &msg_data(30 * 1400), 1)
        .unwrap();
    let client_port = sock.port();
    node.driver.drain();

    let pkt = raw_data_pkt(SERVER_PORT, client_port, id ^ 1, 1000, 1000, 0, &msg_data(1000));
    node.homa.deliver(&node.hnet, server, &pkt);
    let resp = sock.receive(RecvFlags::RESPONSE | RecvFlags::NONBLOCKING, None).unwrap();
    assert_eq!(resp.length, 1000);

    assert_eq!(sock.sock.dead_skbs.load(Ordering::Acquire), 31);
    node.homa.tick();
    assert_eq!(sock.sock.dead_skbs.load(Ordering::Acquire), 21);
    node.homa.tick();
    assert_eq!(sock.sock.dead_skbs.load(Ordering::Acquire), 11);

    // Below the limit: reaping stops until teardown.
    node.homa.tick();
    assert_eq!(sock.sock.dead_skbs.load(Ordering::Acquire), 11);

    sock.release_bpages(&resp.bpages);
}

/// Client completions queue acknowledgements; a full batch flushes as one
/// ACK packet.
#[test]
fn ack_batch_flush() {
    let config = HomaConfig {
        dead_buffs_limit: 0,
        ..timer_config()
    };
    let node = Node::new(1, config);
    let sock = node.homa.socket(&node.hnet);
    sock.set_buf_region(HOMA_BPAGE_SIZE).unwrap();

    let server = SocketAddr::new(IpAddr::from([10, 0, 0, 9]), SERVER_PORT);
    for i in 0..wire::HOMA_MAX_ACKS_PER_PKT {
        let id = sock.send_request(server, &msg_data(100), i as u64).unwrap();
        let client_port = sock.port();
        let pkt = raw_data_pkt(SERVER_PORT, client_port, id ^ 1, 80, 80, 0, &msg_data(80));
        node.homa.deliver(&node.hnet, server, &pkt);
        let resp = sock.receive(RecvFlags::RESPONSE | RecvFlags::NONBLOCKING, None).unwrap();
        sock.release_bpages(&resp.bpages);
        node.homa.tick(); // reap the finished RPC, queueing its ack
    }

    let logs = node.driver.take_log();
    assert!(
        logs.iter().any(|l| l == &format!("ACK n{}", wire::HOMA_MAX_ACKS_PER_PKT)),
        "{:?}",
        logs
    );
}
