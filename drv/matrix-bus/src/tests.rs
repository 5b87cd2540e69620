// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::sim::SimBus;
use crate::{LinkError, LinkLayer};
use matrix_proto::{Frame, FrameType, BROADCAST_ID, MAX_PAYLOAD_WORDS};
use proptest::prelude::*;

fn pair(bus: &SimBus) -> (LinkLayer<crate::sim::SimHw>, LinkLayer<crate::sim::SimHw>) {
    let controller = LinkLayer::new_controller(bus.endpoint());
    let mut node = LinkLayer::new_node(bus.endpoint());
    node.set_node_id(5);
    (controller, node)
}

#[test]
fn unicast_roundtrip() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    let payload = [0x0003u16, 0xAB, 0xCD];
    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &payload)
        .unwrap();

    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.frame_type, FrameType::Ctrl);
    assert_eq!(frame.src, 16);
    assert_eq!(frame.dest, 5);
    assert_eq!(frame.stream, 0);
    assert!(frame.no_ack);
    assert_eq!(frame.length, 6);
    assert_eq!(frame.payload(), &payload);
    assert!(frame.crc_valid);

    // One frame only.
    assert!(!node.try_receive(&mut frame));
    assert_eq!(node.stats().rx_count, 1);
}

#[test]
fn broadcast_reaches_everyone_including_sender() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);
    let mut node2 = LinkLayer::new_node(bus.endpoint());
    node2.set_node_id(9);

    node.send_frame(FrameType::Broadcast, BROADCAST_ID, 4, true, &[42, 7, 1000])
        .unwrap();

    let mut frame = Frame::empty();
    for link in [&mut controller, &mut node2] {
        assert!(link.try_receive(&mut frame));
        assert_eq!(frame.frame_type, FrameType::Broadcast);
        assert_eq!(frame.src, 5);
    }
    // Broadcast loopback is delivered to the sender as well; the spike
    // self-filter lives a layer up.
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.src, 5);
}

#[test]
fn unicast_loopback_is_rejected() {
    let bus = SimBus::new();
    let (_controller, mut node) = pair(&bus);

    node.send_frame(FrameType::Unicast, 5, 0, true, &[1]).unwrap();
    let mut frame = Frame::empty();
    assert!(!node.try_receive(&mut frame));
    assert_eq!(node.stats().rx_count, 0);
}

#[test]
fn discard_path_keeps_framer_synchronized() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    // A burst of frames for some other node, then one for us.
    for i in 0..5u16 {
        controller
            .send_frame(FrameType::Ctrl, 3, 1, true, &[0x10, i, i, i])
            .unwrap();
    }
    controller
        .send_frame(FrameType::Ctrl, 5, 1, true, &[0x99])
        .unwrap();

    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.payload(), &[0x99]);
    assert!(!node.try_receive(&mut frame));
}

#[test]
fn max_payload_accepted_oversize_rejected() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    let payload = [0x5A5Au16; MAX_PAYLOAD_WORDS];
    controller
        .send_frame(FrameType::Ctrl, 5, 2, true, &payload)
        .unwrap();
    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.length, 1200);
    assert_eq!(frame.payload().len(), 600);
    assert!(frame.crc_valid);

    // 601 words: refused before the bus is touched.
    let oversize = [0u16; MAX_PAYLOAD_WORDS + 1];
    let tx_before = controller.stats().tx_count;
    assert_eq!(
        controller.send_frame(FrameType::Ctrl, 5, 2, true, &oversize),
        Err(LinkError::TooLong)
    );
    assert_eq!(controller.stats().tx_count, tx_before);
}

#[test]
fn zero_payload_frame_is_delivered() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &[])
        .unwrap();
    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.length, 0);
    assert!(frame.crc_valid);
}

#[test]
fn corrupted_beat_flags_bad_crc() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    // Flip one bit in the first payload beat (frame word 2).
    bus.corrupt_next_tx(2, 0x0100);
    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &[0x11, 0x22])
        .unwrap();

    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert!(!frame.crc_valid);
    assert_eq!(node.stats().crc_errors, 1);
}

#[test]
fn corrupted_crc_beat_flags_bad_crc() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    // Frame words: header, length, payload, crc; word 3 is the CRC.
    bus.corrupt_next_tx(3, 0x8000);
    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &[0x77])
        .unwrap();

    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert!(!frame.crc_valid);
}

#[test]
fn valid_unicast_is_acked() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    controller
        .send_frame(FrameType::Unicast, 5, 3, false, &[10, 20])
        .unwrap();

    let mut frame = Frame::empty();
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.frame_type, FrameType::Unicast);

    // The node's ACK comes back as link control: consumed internally,
    // recorded for check_ack.
    assert!(!controller.try_receive(&mut frame));
    assert!(controller.check_ack(5, 3));
    assert!(!controller.check_ack(5, 2));
    controller.clear_ack();
    assert!(!controller.check_ack(5, 3));
}

#[test]
fn no_ack_for_broadcast_ctrl_or_flagged_frames() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);
    let mut frame = Frame::empty();

    // no-ack unicast
    controller
        .send_frame(FrameType::Unicast, 5, 0, true, &[1])
        .unwrap();
    assert!(node.try_receive(&mut frame));
    // ctrl
    controller
        .send_frame(FrameType::Ctrl, 5, 0, false, &[0x03])
        .unwrap();
    assert!(node.try_receive(&mut frame));
    // broadcast
    controller
        .send_frame(FrameType::Broadcast, BROADCAST_ID, 4, false, &[9])
        .unwrap();
    assert!(node.try_receive(&mut frame));

    assert!(!controller.try_receive(&mut frame));
    assert!(!controller.check_ack(5, 0));
    assert!(!controller.check_ack(5, 4));
}

#[test]
fn ping_elicits_reply_with_nonce() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    let nonce = [0xA, 0xB, 0xC, 0xD];
    controller.send_ping(5, 0x1234, nonce).unwrap();

    // The node consumes the ping internally and answers.
    let mut frame = Frame::empty();
    assert!(!node.try_receive(&mut frame));

    // The controller consumes the reply internally and records it.
    assert!(!controller.try_receive(&mut frame));
    let reply = controller.take_ping_reply().unwrap();
    assert_eq!(reply.src, 5);
    assert_eq!(reply.seq, 0x1234);
    assert_eq!(reply.nonce, nonce);
    // take semantics
    assert!(controller.take_ping_reply().is_none());
}

#[test]
fn topology_broadcast_updates_worker_copy() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    let bitmap = 1 << 5 | 1 << 9 | 1 << 16;
    controller.broadcast_topology(bitmap).unwrap();

    let mut frame = Frame::empty();
    assert!(!node.try_receive(&mut frame));
    assert!(node.topology().is_online(5));
    assert!(node.topology().is_online(9));
    assert!(node.topology().is_online(16));
    assert!(!node.topology().is_online(3));
}

#[test]
fn hung_tx_dma_times_out() {
    let bus = SimBus::new();
    let (mut controller, _node) = pair(&bus);

    bus.hang_next_tx();
    assert_eq!(
        controller.send_frame(FrameType::Ctrl, 5, 0, true, &[1]),
        Err(LinkError::TxTimeout)
    );
    assert_eq!(controller.stats().tx_timeouts, 1);
    assert!(!bus.is_busy(), "lines must be released after a timeout");

    // The path recovers: the next send goes through.
    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &[2])
        .unwrap();
}

#[test]
fn rx_dma_escape_triggers_rate_limited_reset() {
    let bus = SimBus::new();
    let (_controller, mut node) = pair(&bus);
    let endpoint = 1; // node was the second endpoint

    bus.break_rx_dma(endpoint);
    let mut frame = Frame::empty();
    assert!(!node.try_receive(&mut frame));
    assert_eq!(node.stats().rx_resets, 1);

    // Broken again immediately: the reset is rate-limited.
    bus.break_rx_dma(endpoint);
    assert!(!node.try_receive(&mut frame));
    assert_eq!(node.stats().rx_resets, 1);

    // After the hold-off the reset fires again.
    bus.advance_us(crate::RX_RESET_INTERVAL_US + 1);
    assert!(!node.try_receive(&mut frame));
    assert_eq!(node.stats().rx_resets, 2);
}

#[test]
fn oversized_length_field_flushes_and_resyncs() {
    let bus = SimBus::new();
    let (mut controller, mut node) = pair(&bus);

    // Corrupt the length beat (frame word 1) so it decodes far beyond
    // the payload limit.
    bus.corrupt_next_tx(1, 0x8000);
    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &[1, 2, 3])
        .unwrap();
    let mut frame = Frame::empty();
    assert!(!node.try_receive(&mut frame));
    assert_eq!(node.stats().protocol_errors, 1);

    // Framer is back in sync for the next frame.
    controller
        .send_frame(FrameType::Ctrl, 5, 0, true, &[0x55])
        .unwrap();
    assert!(node.try_receive(&mut frame));
    assert_eq!(frame.payload(), &[0x55]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_frame_roundtrips(
        ty in prop_oneof![
            Just(FrameType::Unicast),
            Just(FrameType::Broadcast),
            Just(FrameType::Ctrl),
        ],
        stream in 0u8..8,
        payload in proptest::collection::vec(any::<u16>(), 0..64),
    ) {
        let bus = SimBus::new();
        let (mut controller, mut node) = pair(&bus);

        let dest = if ty == FrameType::Broadcast { BROADCAST_ID } else { 5 };
        controller.send_frame(ty, dest, stream, true, &payload).unwrap();

        let mut frame = Frame::empty();
        prop_assert!(node.try_receive(&mut frame));
        prop_assert_eq!(frame.frame_type, ty);
        prop_assert_eq!(frame.src, 16);
        prop_assert_eq!(frame.dest, dest);
        prop_assert_eq!(frame.stream, stream);
        prop_assert_eq!(frame.length as usize, payload.len() * 2);
        prop_assert_eq!(frame.payload(), &payload[..]);
        prop_assert!(frame.crc_valid);
    }
}
