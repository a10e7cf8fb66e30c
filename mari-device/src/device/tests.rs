//! Whole-stack tests driving the facade slot by slot with a scripted radio
//! and a virtual-time timer.

use super::*;
use crate::association::AssociationState;
use crate::bloom::bloom_contains;
use crate::constants::{CPU_PERIPH_OFFSET_US, SCAN_CHANNEL, TX_OFFSET_US};
use crate::scheduler::schedules::SCHEDULE_MINUSCULE;
use crate::test_util::*;
use crate::timer::Alarm;

use mari_encoding::parser::{parse, PacketHeader, PhyPayload};

const GW: u64 = 0xaa;
const NODE: u64 = 0xbb;
const NET: u16 = 1;
const SCHEDULE: u8 = SCHEDULE_MINUSCULE.id;
const N_CELLS: u64 = SCHEDULE_MINUSCULE.n_cells as u64;

/// ASN of the slot currently being run (`Mari::asn` is the next one).
fn current_asn<F: FnMut(Event)>(mari: &TestMari<F>) -> u64 {
    mari.asn() - 1
}

fn expected_sof(slot_start: u32) -> u32 {
    slot_start + TX_OFFSET_US + CPU_PERIPH_OFFSET_US
}

/// Brings a gateway through its startup delay into its first (beacon) slot.
fn start_gateway<F: FnMut(Event)>(gw: &mut TestMari<F>) {
    gw.start();
    // the zero-seeded RNG makes the startup delay zero
    assert_eq!(step(gw), Some(Alarm::Scan));
    assert_eq!(current_asn(gw) % N_CELLS, 0);
}

/// Walks a scanning node through hearing one gateway beacon and syncing.
fn sync_node<F: FnMut(Event)>(mari: &mut TestMari<F>, beacon_asn: u64) {
    mari.start();
    assert_eq!(mari.association_state(), AssociationState::Scanning);
    assert_eq!(mari.get_radio().channel, SCAN_CHANNEL);
    inject_frame(
        mari,
        &beacon_bytes(GW, beacon_asn, NET, 3, SCHEDULE, &[0u8; 128]),
        -60,
        2_000,
    );
    // scan window closes, the gateway gets selected
    let fired = step(mari).unwrap();
    assert_eq!(fired, Alarm::Scan);
    assert_eq!(mari.association_state(), AssociationState::Synced);
    assert!(mari.get_timer().is_armed(Alarm::InterSlot));
    assert!(mari.asn() > beacon_asn);
}

/// Drives a synced node through the join handshake until Joined.
///
/// The zero-seeded RNG draws a zero backoff, so the very first SharedUplink
/// slot carries the join request (the association is already Joining once
/// the slot tick has run `ti1`).
fn join_node<F: FnMut(Event)>(mari: &mut TestMari<F>) {
    loop {
        step_to_slot_start(mari);
        let slot = current_asn(mari) % N_CELLS;
        let joining = mari.association_state() == AssociationState::Joining;
        let tx_armed = mari.get_timer().is_armed(Alarm::Action);
        match slot {
            // SharedUplink with a staged transmission: the request goes out
            1 if joining && tx_armed => {
                step(mari); // ti2, dispatch
                let now = mari.get_timer().now();
                mari.on_radio(crate::radio::Event::FrameEnded(now));
                let (_, frame) = mari.get_radio().last_sent().unwrap().clone();
                assert!(matches!(parse(&frame[..]).unwrap(), PhyPayload::JoinRequest(_)));
            }
            // Downlink: the join response comes back
            2 if joining => {
                step(mari); // ri2, receiver opens
                let sof = expected_sof(mari.mac.slot_start_ts());
                inject_frame(mari, &join_response_bytes(GW, NODE, NET, 3), -60, sof);
                assert_eq!(mari.association_state(), AssociationState::Joined);
                finish_slot(mari);
                return;
            }
            _ => finish_slot(mari),
        }
    }
}

#[test]
fn gateway_beacons_with_schedule_and_capacity() {
    let (_log, mut gw) = test_gateway(GW, NET, SCHEDULE);
    start_gateway(&mut gw);
    step(&mut gw); // ti2
    let (channel, frame) = gw.get_radio().last_sent().unwrap().clone();
    assert_eq!(channel, SCAN_CHANNEL);
    let PhyPayload::Beacon(beacon) = parse(&frame[..]).unwrap() else {
        panic!("expected beacon on the beacon slot");
    };
    assert_eq!(beacon.asn(), 0);
    assert_eq!(beacon.src(), GW);
    assert_eq!(beacon.remaining_capacity(), SCHEDULE_MINUSCULE.max_nodes());
    assert_eq!(beacon.active_schedule_id(), SCHEDULE);
}

#[test]
fn gateway_assigns_cell_and_responds_to_join_request() {
    let (log, mut gw) = test_gateway(GW, NET, SCHEDULE);
    start_gateway(&mut gw);
    finish_slot(&mut gw);
    step_to_slot_start(&mut gw); // shared uplink slot
    assert_eq!(current_asn(&gw) % N_CELLS, 1);
    step(&mut gw); // ri2, receiver opens
    let slot_start = gw.mac.slot_start_ts();
    inject_frame(&mut gw, &join_request_bytes(NODE, GW, NET), -55, slot_start + 459);

    assert!(log.borrow().contains(&Event::NodeJoined { node_id: NODE }));
    assert_eq!(gw.gateway_count_nodes(), 1);
    // the filter rebuild is deferred to the event loop
    assert!(gw.bloom.is_dirty());
    gw.event_loop();
    assert!(bloom_contains(NODE, gw.bloom.bytes()));

    finish_slot(&mut gw);
    step_to_slot_start(&mut gw); // downlink slot carries the response
    step(&mut gw);
    let (_, frame) = gw.get_radio().last_sent().unwrap().clone();
    let PhyPayload::JoinResponse(response) = parse(&frame[..]).unwrap() else {
        panic!("expected join response on the downlink slot");
    };
    assert_eq!(response.dst(), NODE);
    assert_eq!(response.assigned_cell_index(), 3);
}

#[test]
fn gateway_reports_full_schedule() {
    let (log, mut gw) = test_gateway(GW, NET, SCHEDULE);
    start_gateway(&mut gw);
    finish_slot(&mut gw);
    let mut joined = 0u64;
    while joined < SCHEDULE_MINUSCULE.max_nodes() as u64 + 1 {
        step_to_slot_start(&mut gw);
        if current_asn(&gw) % N_CELLS == 1 {
            step(&mut gw);
            let slot_start = gw.mac.slot_start_ts();
            inject_frame(
                &mut gw,
                &join_request_bytes(0x100 + joined, GW, NET),
                -55,
                slot_start + 459,
            );
            joined += 1;
        }
        finish_slot(&mut gw);
    }
    assert_eq!(gw.gateway_count_nodes(), SCHEDULE_MINUSCULE.max_nodes());
    assert!(log.borrow().contains(&Event::Error { reason: DisconnectReason::GatewayFull }));
}

#[test]
fn gateway_evicts_silent_node_and_clears_bloom_bit() {
    let (log, mut gw) = test_gateway(GW, NET, SCHEDULE);
    start_gateway(&mut gw);
    finish_slot(&mut gw);
    step_to_slot_start(&mut gw);
    step(&mut gw);
    let slot_start = gw.mac.slot_start_ts();
    inject_frame(&mut gw, &join_request_bytes(NODE, GW, NET), -55, slot_start + 459);
    gw.event_loop();
    assert!(bloom_contains(NODE, gw.bloom.bytes()));

    // stay silent past the liveness horizon
    while gw.asn() <= N_CELLS * 5 + 2 {
        finish_slot(&mut gw);
        step_to_slot_start(&mut gw);
    }
    assert!(log
        .borrow()
        .contains(&Event::NodeLeft { node_id: NODE, reason: DisconnectReason::PeerLostTimeout }));
    assert_eq!(gw.gateway_count_nodes(), 0);
    gw.event_loop();
    assert!(!bloom_contains(NODE, gw.bloom.bytes()));
}

#[test]
fn node_scans_syncs_and_joins() {
    let (log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);
    assert!(log.borrow().contains(&Event::Connected { gateway_id: GW }));
    assert!(node.node_is_connected());
    assert_eq!(node.node_gateway_id(), Some(GW));
}

#[test]
fn node_with_network_filter_ignores_foreign_beacons() {
    let (_log, mut node) = test_node(NODE, 5, SCHEDULE);
    node.start();
    inject_frame(&mut node, &beacon_bytes(GW, 100, 6, 3, SCHEDULE, &[0u8; 128]), -60, 2_000);
    assert_eq!(step(&mut node), Some(Alarm::Scan));
    // nothing acceptable heard: still scanning, another window armed
    assert_eq!(node.association_state(), AssociationState::Scanning);
    assert!(node.get_timer().is_armed(Alarm::Scan));
    assert!(!node.get_timer().is_armed(Alarm::InterSlot));
}

#[test]
fn joined_node_fills_empty_uplink_slots_with_keepalives() {
    let (_log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);
    // next slot is the node's own uplink cell (index 3)
    step_to_slot_start(&mut node);
    assert_eq!(current_asn(&node) % N_CELLS, 3);
    step(&mut node); // ti2
    let (_, frame) = node.get_radio().last_sent().unwrap().clone();
    let PhyPayload::Keepalive(keepalive) = parse(&frame[..]).unwrap() else {
        panic!("expected a keepalive in the idle uplink slot");
    };
    assert_eq!(keepalive.dst(), GW);
    assert_eq!(keepalive.src(), NODE);
}

#[test]
fn joined_node_prefers_queued_data_over_keepalives() {
    let (_log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);
    node.node_tx_payload(&[0xde, 0xad]).unwrap();
    step_to_slot_start(&mut node);
    assert_eq!(current_asn(&node) % N_CELLS, 3);
    step(&mut node);
    let (_, frame) = node.get_radio().last_sent().unwrap().clone();
    let PhyPayload::Data(data) = parse(&frame[..]).unwrap() else {
        panic!("expected queued data in the uplink slot");
    };
    assert_eq!(data.payload(), &[0xde, 0xad]);
}

#[test]
fn bloom_miss_disconnects_node() {
    let (log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);

    // run to the next beacon slot and deliver a beacon whose filter no
    // longer contains this node
    loop {
        step_to_slot_start(&mut node);
        if current_asn(&node) % N_CELLS == 0 {
            break;
        }
        finish_slot(&mut node);
    }
    step(&mut node); // ri2
    let sof = expected_sof(node.mac.slot_start_ts());
    inject_frame(&mut node, &beacon_bytes(GW, 0, NET, 2, SCHEDULE, &[0u8; 128]), -60, sof);
    finish_slot(&mut node);

    // the miss is handled at the next slot boundary
    step_to_slot_start(&mut node);
    assert!(log
        .borrow()
        .contains(&Event::Disconnected { gateway_id: GW, reason: DisconnectReason::PeerLostBloom }));
    assert_eq!(node.association_state(), AssociationState::Scanning);
    assert!(!node.get_timer().is_armed(Alarm::InterSlot));
}

#[test]
fn small_drift_nudges_the_slot_clock_once() {
    let (_log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);

    loop {
        step_to_slot_start(&mut node);
        if current_asn(&node) % N_CELLS == 0 {
            break;
        }
        finish_slot(&mut node);
    }
    step(&mut node); // ri2
    let before = node.get_timer().deadline(Alarm::InterSlot).unwrap();
    let sof = expected_sof(node.mac.slot_start_ts()) + 80;
    let bloom = member_bloom(NODE);
    inject_frame(&mut node, &beacon_bytes(GW, 0, NET, 2, SCHEDULE, &bloom), -60, sof);

    assert_eq!(node.get_timer().adjustments.last(), Some(&(Alarm::InterSlot, 80)));
    assert_eq!(node.get_timer().deadline(Alarm::InterSlot).unwrap(), before + 80);
    assert_eq!(node.association_state(), AssociationState::Joined);
}

#[test]
fn drift_is_ignored_until_joined() {
    let (log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);

    // the first beacon slot comes up before the first SharedUplink, so the
    // node is still Synced when it hears its scanned gateway again
    loop {
        step_to_slot_start(&mut node);
        if current_asn(&node) % N_CELLS == 0 {
            break;
        }
        finish_slot(&mut node);
    }
    assert_eq!(node.association_state(), AssociationState::Synced);
    step(&mut node); // ri2
    let sof = expected_sof(node.mac.slot_start_ts()) + 150;
    inject_frame(&mut node, &beacon_bytes(GW, 0, NET, 2, SCHEDULE, &[0u8; 128]), -60, sof);

    // an unjoined node never trims its clock, however late the frame is
    assert!(node.get_timer().adjustments.is_empty());
    finish_slot(&mut node);
    step_to_slot_start(&mut node);
    assert!(!log.borrow().iter().any(|e| matches!(e, Event::Disconnected { .. })));
    assert_ne!(node.association_state(), AssociationState::Scanning);
}

#[test]
fn large_drift_declares_out_of_sync() {
    let (log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);

    loop {
        step_to_slot_start(&mut node);
        if current_asn(&node) % N_CELLS == 0 {
            break;
        }
        finish_slot(&mut node);
    }
    step(&mut node); // ri2
    node.get_timer().adjustments.clear();
    let sof = expected_sof(node.mac.slot_start_ts()) + 150;
    let bloom = member_bloom(NODE);
    inject_frame(&mut node, &beacon_bytes(GW, 0, NET, 2, SCHEDULE, &bloom), -60, sof);
    // past the tolerance nothing is nudged; the node schedules a disconnect
    assert!(node.get_timer().adjustments.is_empty());
    finish_slot(&mut node);

    step_to_slot_start(&mut node);
    assert!(log
        .borrow()
        .contains(&Event::Disconnected { gateway_id: GW, reason: DisconnectReason::OutOfSync }));
    assert_eq!(node.association_state(), AssociationState::Scanning);
}

#[test]
fn background_scan_hands_over_to_a_much_stronger_gateway() {
    let (log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);
    run_to_beacon_with_gateway_rssi(&mut node, -70);

    let now = node.get_timer().now();
    node.assoc.test_warp_synced_ts(now.wrapping_sub(6_000_000));

    // sleep slot: the background scan opens and hears a stronger gateway
    loop {
        step_to_slot_start(&mut node);
        if node.mac.in_bg_scan() {
            break;
        }
        finish_slot(&mut node);
    }
    let other = beacon_bytes(0xcc, 500, NET, 5, SCHEDULE, &[0u8; 128]);
    let heard_at = node.get_timer().now() + 100;
    inject_frame(&mut node, &other, -44, heard_at);

    // the next active slot closes the window and decides
    loop {
        step_to_slot_start(&mut node);
        if !node.mac.in_bg_scan() {
            break;
        }
    }
    assert!(log
        .borrow()
        .contains(&Event::Disconnected { gateway_id: GW, reason: DisconnectReason::Handover }));
    assert_eq!(node.association_state(), AssociationState::Synced);
    assert_eq!(node.assoc.gateway_id(), 0xcc);
}

#[test]
fn background_scan_respects_the_rssi_hysteresis() {
    let (log, mut node) = test_node(NODE, NET, SCHEDULE);
    sync_node(&mut node, 100);
    join_node(&mut node);
    run_to_beacon_with_gateway_rssi(&mut node, -70);

    let now = node.get_timer().now();
    node.assoc.test_warp_synced_ts(now.wrapping_sub(6_000_000));

    loop {
        step_to_slot_start(&mut node);
        if node.mac.in_bg_scan() {
            break;
        }
        finish_slot(&mut node);
    }
    // only 20 dB louder: below the 24 dB hysteresis
    let other = beacon_bytes(0xcc, 500, NET, 5, SCHEDULE, &[0u8; 128]);
    let heard_at = node.get_timer().now() + 100;
    inject_frame(&mut node, &other, -50, heard_at);

    loop {
        step_to_slot_start(&mut node);
        if !node.mac.in_bg_scan() {
            break;
        }
    }
    assert!(!log
        .borrow()
        .iter()
        .any(|e| matches!(e, Event::Disconnected { reason: DisconnectReason::Handover, .. })));
    assert_eq!(node.association_state(), AssociationState::Joined);
    assert_eq!(node.assoc.gateway_id(), GW);
}

#[test]
fn gateway_surfaces_received_data_and_keepalives() {
    let (log, mut gw) = test_gateway(GW, NET, SCHEDULE);
    start_gateway(&mut gw);
    finish_slot(&mut gw);
    step_to_slot_start(&mut gw);
    step(&mut gw);
    let slot_start = gw.mac.slot_start_ts();
    inject_frame(&mut gw, &join_request_bytes(NODE, GW, NET), -55, slot_start + 459);
    finish_slot(&mut gw);

    // node's uplink slot: data first, keepalive in a later pass
    loop {
        step_to_slot_start(&mut gw);
        if current_asn(&gw) % N_CELLS == 3 {
            break;
        }
        finish_slot(&mut gw);
    }
    step(&mut gw);
    let slot_start = gw.mac.slot_start_ts();
    inject_frame(&mut gw, &data_bytes(NODE, GW, NET, &[7, 7, 7]), -58, slot_start + 459);
    finish_slot(&mut gw);

    loop {
        step_to_slot_start(&mut gw);
        if current_asn(&gw) % N_CELLS == 3 {
            break;
        }
        finish_slot(&mut gw);
    }
    step(&mut gw);
    let slot_start = gw.mac.slot_start_ts();
    inject_frame(&mut gw, &keepalive_bytes(NODE, GW, NET), -58, slot_start + 459);

    let log = log.borrow();
    assert!(log.iter().any(|e| matches!(
        e,
        Event::NewPacket(p) if p.src == NODE && p.payload[..] == [7, 7, 7]
    )));
    assert!(log.contains(&Event::Keepalive { node_id: NODE }));
}

/// Builds a bloom filter containing exactly `node_id`.
fn member_bloom(node_id: u64) -> [u8; 128] {
    let mut filter = crate::bloom::BloomFilter::new();
    filter.rebuild(core::iter::once(crate::bloom::bloom_hashes(node_id)));
    *filter.bytes()
}

/// Runs to the next beacon slot and delivers an on-time beacon from the
/// synced gateway at the given RSSI (keeping the node a member).
fn run_to_beacon_with_gateway_rssi<F: FnMut(Event)>(node: &mut TestMari<F>, rssi: i8) {
    loop {
        step_to_slot_start(node);
        if current_asn(node) % N_CELLS == 0 {
            break;
        }
        finish_slot(node);
    }
    step(node); // ri2
    let slot_start = node.mac.slot_start_ts();
    let sof = slot_start + TX_OFFSET_US + CPU_PERIPH_OFFSET_US;
    let bloom = member_bloom(NODE);
    inject_frame(node, &beacon_bytes(GW, 0, NET, 2, SCHEDULE, &bloom), rssi, sof);
    finish_slot(node);
}
