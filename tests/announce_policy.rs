//! Integration tests for announce forwarding policy: interface-mode
//! filtering, hop-count prioritisation, and the per-interface bandwidth
//! budget.

mod common;

use std::sync::Arc;

use common::{init_tracing, pump, LoopbackTransport, Recorder, T0};
use mycorrhizal::{
    Identity, InterfaceMode, ManualClock, Node, NodeConfig, NodeTier, Packet, PacketType,
    Transport,
};

fn gateway_node(clock: Arc<ManualClock>) -> Node {
    Node::builder()
        .config(NodeConfig::for_tier(NodeTier::Gateway).with_name("gateway"))
        .clock(clock)
        .events(Recorder::new())
        .build()
        .expect("node must build")
}

/// A signed announce frame from a fresh identity, with the hop count an
/// intermediate forwarder would have stamped on it.
fn announce_frame(hop_count: u8) -> Vec<u8> {
    let identity = Identity::generate();
    let mut packet = Packet::new(
        PacketType::Announce,
        identity.address(),
        identity.public().to_announce_payload().to_vec(),
        128,
    );
    packet.sign(&identity);
    packet.hop_count = hop_count;
    packet.ttl = 128 - hop_count;
    packet.encode().expect("encode")
}

#[test]
fn boundary_iface_forwards_only_local_announces() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(T0));
    let gateway = gateway_node(clock.clone());

    // T_net (GATEWAY) is where announces arrive; T_lora (BOUNDARY) is the
    // constrained side.
    let (t_net, t_net_peer) = {
        let a = LoopbackTransport::new("t_net", InterfaceMode::Gateway, 100_000_000);
        let b = LoopbackTransport::new("t_net_peer", InterfaceMode::Full, 100_000_000);
        LoopbackTransport::link(&a, &b);
        (a, b)
    };
    let (t_lora, t_lora_peer) = {
        let a = LoopbackTransport::new("t_lora", InterfaceMode::Boundary, 20_000);
        let b = LoopbackTransport::new("t_lora_peer", InterfaceMode::Full, 20_000);
        LoopbackTransport::link(&a, &b);
        (a, b)
    };

    let net_id = gateway.attach_transport(t_net.clone());
    let lora_id = gateway.attach_transport(t_lora.clone());
    for t in [&t_net, &t_net_peer, &t_lora, &t_lora_peer] {
        t.start();
    }

    // Distant announce (10 hops): absorbed, but not forwarded anywhere —
    // T_net is where it came from, T_lora is beyond its boundary depth.
    t_net.inject(announce_frame(10));
    gateway.poll(); // clock not advanced: queues fill but never flush

    let stats = gateway.iface_stats();
    let net = stats.iter().find(|s| s.id == net_id).unwrap();
    let lora = stats.iter().find(|s| s.id == lora_id).unwrap();
    assert_eq!(gateway.known_identities(), 1, "announce itself is absorbed");
    assert_eq!(net.announce_queue_len, 0);
    assert_eq!(lora.announce_queue_len, 0);

    // Local announce (2 hops): forwarded across the boundary.
    t_net.inject(announce_frame(2));
    gateway.poll();

    let stats = gateway.iface_stats();
    let net = stats.iter().find(|s| s.id == net_id).unwrap();
    let lora = stats.iter().find(|s| s.id == lora_id).unwrap();
    assert_eq!(net.announce_queue_len, 0, "never forwarded back out the receiving iface");
    assert_eq!(lora.announce_queue_len, 1);
    assert_eq!(gateway.stats().announces_enqueued, 1);
}

#[test]
fn access_point_iface_never_forwards_announces() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(T0));
    let gateway = gateway_node(clock.clone());

    let (t_in, t_in_peer) = LoopbackTransport::pair("in", "in_peer");
    let t_ap = LoopbackTransport::new("ap", InterfaceMode::AccessPoint, 100_000_000);
    let t_ap_peer = LoopbackTransport::new("ap_peer", InterfaceMode::Full, 100_000_000);
    LoopbackTransport::link(&t_ap, &t_ap_peer);

    gateway.attach_transport(t_in.clone());
    let ap_id = gateway.attach_transport(t_ap.clone());
    for t in [&t_in, &t_in_peer, &t_ap, &t_ap_peer] {
        t.start();
    }

    t_in.inject(announce_frame(0));
    gateway.poll();

    let stats = gateway.iface_stats();
    let ap = stats.iter().find(|s| s.id == ap_id).unwrap();
    assert_eq!(ap.announce_queue_len, 0);
    assert_eq!(gateway.stats().announces_enqueued, 0);
}

#[test]
fn queued_announces_flush_in_hop_count_order() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(T0));
    let gateway = gateway_node(clock.clone());

    let (t_in, t_in_peer) = LoopbackTransport::pair("in", "in_peer");
    let (t_out, t_out_peer) = LoopbackTransport::pair("out", "out_peer");
    gateway.attach_transport(t_in.clone());
    gateway.attach_transport(t_out.clone());

    // A listener on the far side of the outbound link records arrivals.
    let listener_rec = Recorder::new();
    let listener = Node::builder()
        .config(NodeConfig::default().with_name("listener"))
        .clock(clock.clone())
        .events(listener_rec.clone())
        .build()
        .expect("build");
    listener.attach_transport(t_out_peer.clone());

    for t in [&t_in, &t_in_peer, &t_out, &t_out_peer] {
        t.start();
    }

    // Arrive out of priority order; all are queued before any flush.
    for hop in [5u8, 0, 2] {
        t_in.inject(announce_frame(hop));
    }
    gateway.poll(); // enqueue only; no credit yet

    // One big tick releases everything; the listener must see them in
    // ascending hop order (each one hop further than it arrived).
    pump(&clock, &[&gateway, &listener], 2, 1_000);

    let hops: Vec<u8> = listener_rec
        .announce_events()
        .iter()
        .map(|(_, h)| *h)
        .collect();
    assert_eq!(hops, vec![1, 3, 6]);
}

#[test]
fn announce_budget_bounds_forwarded_bytes() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(T0));
    let gateway = gateway_node(clock.clone());

    let (t_in, t_in_peer) = LoopbackTransport::pair("in", "in_peer");
    // LoRa-style link: 800 kbps at a 1% budget = 8,000 bps = 1,000 bytes/s.
    let t_out = LoopbackTransport::with_budget("out", InterfaceMode::Full, 800_000, 1.0);
    let t_out_peer = LoopbackTransport::new("out_peer", InterfaceMode::Full, 800_000);
    LoopbackTransport::link(&t_out, &t_out_peer);

    gateway.attach_transport(t_in.clone());
    let out_id = gateway.attach_transport(t_out.clone());
    for t in [&t_in, &t_in_peer, &t_out, &t_out_peer] {
        t.start();
    }

    // Fill the queue with 30 distinct announces before any credit accrues.
    for _ in 0..30 {
        t_in.inject(announce_frame(0));
    }
    gateway.poll();
    let queued = gateway
        .iface_stats()
        .iter()
        .find(|s| s.id == out_id)
        .unwrap()
        .announce_queue_len;
    assert_eq!(queued, 30);

    // Service for a 2-second window in 250 ms ticks.
    const WINDOW_SECS: f64 = 2.0;
    for _ in 0..8 {
        clock.advance(250);
        gateway.poll();
    }

    let out = gateway
        .iface_stats()
        .into_iter()
        .find(|s| s.id == out_id)
        .unwrap();
    let budget_bytes_per_sec = out.announce_budget_bps / 8.0;
    let ceiling = budget_bytes_per_sec * WINDOW_SECS * 1.1;

    assert!(
        (out.tx_bytes as f64) <= ceiling,
        "sent {} bytes, budget ceiling {}",
        out.tx_bytes,
        ceiling
    );
    // The budget is a rate limit, not a blackout: a healthy share got out.
    assert!(out.tx_frames >= 10, "only {} frames sent", out.tx_frames);
    assert!(out.announce_queue_len > 0, "queue should still be backlogged");
}
