// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use cluster_hw::mock::{
    RamExtMem, RamFlash, TestRgb, TestScratch, TestWatchdog,
};
use drv_matrix_bus::sim::{SimBus, SimHw};
use drv_matrix_bus::LinkLayer;
use neuron_table::{encode_weight, pack_synapse, write_entry, RawNeuron};
use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::FromZeros;

type TestNode =
    NodeApp<SimHw, RamFlash, RamExtMem, TestRgb, TestScratch, TestWatchdog>;

const FLASH_SIZE: usize = (map::APP_PARTITION_OFFSET + 0x10_0000) as usize;

fn make_node(bus: &SimBus, psram: RamExtMem, id: u8) -> TestNode {
    NodeApp::new(
        LinkLayer::new_node(bus.endpoint()),
        RamFlash::new(FLASH_SIZE),
        psram,
        TestRgb::default(),
        TestScratch::default(),
        TestWatchdog::default(),
        id,
    )
}

fn controller(bus: &SimBus) -> LinkLayer<SimHw> {
    LinkLayer::new_controller(bus.endpoint())
}

fn psram_with_table(entries: &[RawNeuron]) -> RamExtMem {
    let mut mem = RamExtMem::new(map::PSRAM_SIZE as usize);
    for (i, e) in entries.iter().enumerate() {
        write_entry(&mut mem, map::NEURON_TABLE_OFFSET, i, e);
    }
    let mut term = RawNeuron::new_zeroed();
    term.local_id = U16::new(neuron_table::TERMINATOR_ID);
    write_entry(&mut mem, map::NEURON_TABLE_OFFSET, entries.len(), &term);
    mem
}

fn input_neuron(local: u16, threshold: f32, refractory_us: u32) -> RawNeuron {
    let mut e = RawNeuron::new_zeroed();
    e.local_id = U16::new(local);
    e.threshold = F32::new(threshold);
    e.refractory_us = U32::new(refractory_us);
    e
}

fn listening_neuron(local: u16, source: u32, weight: f32) -> RawNeuron {
    let mut e = RawNeuron::new_zeroed();
    e.local_id = U16::new(local);
    e.threshold = F32::new(1.0);
    e.leak_rate = F32::new(0.95);
    e.refractory_us = U32::new(1000);
    e.synapse_count = U16::new(1);
    e.synapse_capacity = U16::new(neuron_table::MAX_SYNAPSES as u16);
    e.synapses[0] = U32::new(pack_synapse(source, encode_weight(weight)));
    e
}

/// Sends one command and polls the node until a CTRL reply arrives.
fn transact(
    ctrl: &mut LinkLayer<SimHw>,
    node: &mut TestNode,
    payload: &[u16],
) -> Option<Vec<u16>> {
    ctrl.send_frame(FrameType::Ctrl, node.node_id(), 0, true, payload)
        .unwrap();
    let mut frame = Frame::empty();
    for _ in 0..10 {
        node.poll();
        if ctrl.try_receive(&mut frame) {
            assert!(frame.crc_valid);
            return Some(frame.payload().to_vec());
        }
    }
    None
}

fn drain(ctrl: &mut LinkLayer<SimHw>) {
    let mut frame = Frame::empty();
    while ctrl.try_receive(&mut frame) {}
}

#[test]
fn fresh_node_status_literal() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 3);
    let mut ctrl = controller(&bus);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::ReadStatus as u16]).unwrap();
    // Freshly booted, idle, green LED at 32/255, 8 MiB free.
    assert_eq!(reply, vec![0x83, 3, 0, 0, 0, 0x80, 0, 32, 0, 0, 0]);
}

#[test]
fn ping_pong_and_discover() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 6);
    let mut ctrl = controller(&bus);

    let reply = transact(&mut ctrl, &mut node, &[Opcode::Ping as u16]).unwrap();
    assert_eq!(reply, vec![Opcode::Pong as u16]);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::Discover as u16]).unwrap();
    assert_eq!(reply, vec![Opcode::DiscoverAck as u16, 6]);
}

#[test]
fn set_led_is_reflected_in_status() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 2);
    let mut ctrl = controller(&bus);

    let set = cluster_commands::SetLed { r: 10, g: 20, b: 30 };
    let reply = transact(&mut ctrl, &mut node, &set.to_words()).unwrap();
    assert_eq!(reply[0], Opcode::LedAck as u16);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::ReadStatus as u16]).unwrap();
    let status = Status::from_words(&reply).unwrap();
    assert_eq!(status.led, (10, 20, 30));
}

#[test]
fn memory_write_then_read_roundtrip() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 4);
    let mut ctrl = controller(&bus);

    let data: Vec<u8> = (0..384u32).map(|i| (i * 3) as u8).collect();
    let header = MemoryHeader {
        opcode: Opcode::WriteMemory,
        length_bytes: data.len() as u16,
        addr: map::NEURON_TABLE_OFFSET,
    };
    let mut words = header.to_words().to_vec();
    let mut data_words = vec![0u16; data.len().div_ceil(2)];
    bytes_to_words(&data, &mut data_words);
    words.extend_from_slice(&data_words);

    let reply = transact(&mut ctrl, &mut node, &words).unwrap();
    assert_eq!(reply, vec![Opcode::WriteAck as u16]);

    let read = MemoryHeader {
        opcode: Opcode::ReadMemory,
        length_bytes: data.len() as u16,
        addr: map::NEURON_TABLE_OFFSET,
    };
    let reply = transact(&mut ctrl, &mut node, &read.to_words()).unwrap();
    let resp_header = MemoryHeader::from_words(&reply).unwrap();
    assert_eq!(resp_header.opcode, Opcode::ReadData);
    assert_eq!(resp_header.length_bytes, data.len() as u16);
    let mut back = vec![0u8; data.len()];
    words_to_bytes(&reply[MemoryHeader::WORDS..], &mut back);
    assert_eq!(back, data);
}

#[test]
fn misaligned_memory_write_is_dropped() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 4);
    let mut ctrl = controller(&bus);

    let header = MemoryHeader {
        opcode: Opcode::WriteMemory,
        length_bytes: 4,
        addr: 0x100_0002,
    };
    let mut words = header.to_words().to_vec();
    words.extend_from_slice(&[0xAAAA, 0xBBBB]);
    assert!(transact(&mut ctrl, &mut node, &words).is_none());
}

#[test]
fn deploy_start_inject_fire_broadcast() {
    let bus = SimBus::new();
    // One externally driven neuron, local id 7.
    let psram = psram_with_table(&[input_neuron(7, 1.0, 0)]);
    let mut node = make_node(&bus, psram, 3);
    let mut ctrl = controller(&bus);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 1])
            .unwrap();
    assert_eq!(reply, vec![Opcode::DeployAck as u16, 1]);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]).unwrap();
    assert_eq!(
        reply,
        vec![Opcode::SnnAck as u16, Opcode::StartSnn as u16]
    );
    drain(&mut ctrl);

    // Inject a 1.5 stimulus into (3 << 16) | 7 via unicast.
    ctrl.send_frame(FrameType::Unicast, 3, stream::SPIKE, true, &[7, 3, 1500])
        .unwrap();
    node.poll();

    // Let a timestep elapse; the fire event comes back as a broadcast.
    bus.advance_us(1001);
    node.poll();

    let mut frame = Frame::empty();
    assert!(ctrl.try_receive(&mut frame));
    assert_eq!(frame.frame_type, FrameType::Broadcast);
    let spike = SpikePayload::from_words(frame.payload()).unwrap();
    assert_eq!(spike.global_id, (3 << 16) | 7);
    assert!((spike.value - 1.0).abs() < 1e-3);
}

#[test]
fn self_broadcasts_are_filtered_on_receive() {
    let bus = SimBus::new();
    let psram = psram_with_table(&[input_neuron(1, 1.0, 0)]);
    let mut node = make_node(&bus, psram, 5);
    let mut ctrl = controller(&bus);

    transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 1]);
    transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]);
    drain(&mut ctrl);

    // A broadcast claiming to be from node 5 itself: dropped on receive.
    let mut impostor = LinkLayer::new_node(bus.endpoint());
    impostor.set_node_id(5);
    impostor
        .send_frame(FrameType::Broadcast, BROADCAST_ID, stream::SPIKE, true, &[1, 5, 1000])
        .unwrap();
    node.poll();
    assert_eq!(node.engine().stats().spikes_received, 0);

    // The same spike from a different node is accepted.
    impostor.set_node_id(9);
    impostor
        .send_frame(FrameType::Broadcast, BROADCAST_ID, stream::SPIKE, true, &[1, 5, 1000])
        .unwrap();
    node.poll();
    assert_eq!(node.engine().stats().spikes_received, 1);
}

#[test]
fn remote_spike_feeds_synapse() {
    let bus = SimBus::new();
    // Local neuron 2 listens to remote neuron (1, 4) with weight 1.2.
    let src = (1u32 << 16) | 4;
    let psram = psram_with_table(&[listening_neuron(2, src, 1.2)]);
    let mut node = make_node(&bus, psram, 3);
    let mut ctrl = controller(&bus);

    transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 1]);
    transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]);
    drain(&mut ctrl);

    let mut peer = LinkLayer::new_node(bus.endpoint());
    peer.set_node_id(1);
    peer.send_frame(
        FrameType::Broadcast,
        BROADCAST_ID,
        stream::SPIKE,
        true,
        &[4, 1, 1000],
    )
    .unwrap();
    node.poll();
    // The peer's own broadcast also landed in the controller's ring;
    // clear it so the next frame we see is the node's fire event.
    drain(&mut ctrl);

    bus.advance_us(1001);
    node.poll();

    // weight 1.2 * value 1.0 > threshold: the neuron fired.
    let mut frame = Frame::empty();
    assert!(ctrl.try_receive(&mut frame));
    assert_eq!(frame.frame_type, FrameType::Broadcast);
    let spike = SpikePayload::from_words(frame.payload()).unwrap();
    assert_eq!(spike.global_id, (3 << 16) | 2);
}

#[test]
fn same_node_chain_fires_through_engine_loopback() {
    let bus = SimBus::new();
    // Neuron 1 listens to neuron 0 on the same node; only neuron 0 is
    // externally driven.
    let a_gid = 3u32 << 16;
    let psram = psram_with_table(&[
        input_neuron(0, 1.0, 5000),
        listening_neuron(1, a_gid, 1.2),
    ]);
    let mut node = make_node(&bus, psram, 3);
    let mut ctrl = controller(&bus);

    transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 2]);
    transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]);
    drain(&mut ctrl);

    // One stimulus into neuron 0 over the bus.
    ctrl.send_frame(FrameType::Unicast, 3, stream::SPIKE, true, &[0, 3, 1500])
        .unwrap();
    node.poll();

    // Run a few timesteps, collecting the node's fire-event broadcasts.
    // The extra polls per step let the node shed its own bus echoes.
    let mut fires = Vec::new();
    let mut frame = Frame::empty();
    for _ in 0..4 {
        bus.advance_us(1001);
        for _ in 0..4 {
            node.poll();
        }
        while ctrl.try_receive(&mut frame) {
            if frame.frame_type == FrameType::Broadcast {
                let spike =
                    SpikePayload::from_words(frame.payload()).unwrap();
                fires.push(spike.global_id);
            }
        }
    }

    // Step 1: the stimulus fires neuron 0 directly and reaches neuron
    // 1's synapse. Step 2: neuron 0's fire-event, looped back inside the
    // engine, fires neuron 1 again. Quiet after that.
    assert_eq!(fires, vec![a_gid, a_gid | 1, a_gid | 1]);

    // The origin never re-integrated its own spike: one received
    // stimulus, and neuron 0 is back at rest.
    assert_eq!(node.engine().stats().spikes_received, 1);
    assert_eq!(node.engine().neuron_info(0).unwrap().potential, 0.0);
}

#[test]
fn snn_status_and_control_roundtrip() {
    let bus = SimBus::new();
    let psram = psram_with_table(&[input_neuron(0, 1.0, 0)]);
    let mut node = make_node(&bus, psram, 1);
    let mut ctrl = controller(&bus);

    transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 1]);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::GetSnnStatus as u16]).unwrap();
    let status = SnnStatus::from_words(&reply).unwrap();
    assert!(!status.running);
    assert_eq!(status.neuron_count, 1);

    transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]);
    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::GetSnnStatus as u16]).unwrap();
    assert!(SnnStatus::from_words(&reply).unwrap().running);

    // Pause: time stands still for the engine.
    transact(&mut ctrl, &mut node, &[Opcode::PauseSnn as u16]);
    let t = node.engine().current_time_us();
    bus.advance_us(5_000);
    node.poll();
    assert_eq!(node.engine().current_time_us(), t);

    transact(&mut ctrl, &mut node, &[Opcode::ResumeSnn as u16]);
    bus.advance_us(2_000);
    node.poll();
    assert!(node.engine().current_time_us() > t);

    transact(&mut ctrl, &mut node, &[Opcode::StopSnn as u16]);
    assert!(!node.engine().is_running());
}

#[test]
fn inject_spike_batch() {
    let bus = SimBus::new();
    let psram = psram_with_table(&[input_neuron(0, 10.0, 0)]);
    let mut node = make_node(&bus, psram, 2);
    let mut ctrl = controller(&bus);

    transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 1]);
    transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]);

    // Three spikes aimed at (2 << 16) | 0.
    let batch = [
        Opcode::InjectSpikeBatch as u16,
        3,
        0, 2,
        0, 2,
        0, 2,
    ];
    ctrl.send_frame(FrameType::Ctrl, 2, stream::SNN_CONFIG, true, &batch)
        .unwrap();
    node.poll();
    assert_eq!(node.engine().stats().spikes_received, 3);
}

#[test]
fn reset_to_bootloader_acks_then_resets() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 9);
    let mut ctrl = controller(&bus);

    let reply = transact(
        &mut ctrl,
        &mut node,
        &[Opcode::ResetToBootloader as u16],
    )
    .unwrap();
    assert_eq!(
        reply,
        vec![Opcode::ResetAck as u16, Opcode::ResetToBootloader as u16]
    );
    assert!(node.reset_pending());
}

#[test]
fn ota_stages_into_psram_and_commits() {
    let bus = SimBus::new();
    let psram = RamExtMem::new(map::PSRAM_SIZE as usize);
    let mut node = make_node(&bus, psram, 4);
    let mut ctrl = controller(&bus);

    let image: Vec<u8> = (0..10_000u32).map(|i| (i ^ (i >> 3)) as u8).collect();
    let chunk_size = 1024u16;
    let total_chunks = image.len().div_ceil(1024) as u16;
    let crc = app_image::crc32(&image);

    let start = UpdateStart {
        target: 4,
        size: image.len() as u32,
        crc32: crc,
        chunk_size,
        total_chunks,
    };
    let reply = transact(&mut ctrl, &mut node, &start.to_words()).unwrap();
    let ready = UpdateReady::from_words(&reply).unwrap();
    assert_eq!(ready.status, 0);
    // PSRAM staging window: 8 MiB minus the 64 KiB driver prefix.
    assert_eq!(ready.avail_kib, 8128);

    for (num, chunk) in image.chunks(usize::from(chunk_size)).enumerate() {
        let header = ChunkHeader {
            target: 4,
            chunk_num: num as u16,
            data_size: chunk.len() as u16,
        };
        let mut words = header.to_words().to_vec();
        let mut data_words = vec![0u16; chunk.len().div_ceil(2)];
        bytes_to_words(chunk, &mut data_words);
        words.extend_from_slice(&data_words);
        let reply = transact(&mut ctrl, &mut node, &words).unwrap();
        assert_eq!(reply, vec![Opcode::UpdateAckChunk as u16, num as u16]);
    }

    let poll = UpdatePoll {
        target: 4,
        poll_type: PollType::Verify,
    };
    let reply = transact(&mut ctrl, &mut node, &poll.to_words()).unwrap();
    let verify = VerifyResp::from_words(&reply).unwrap();
    assert_eq!(verify.status, 0);
    assert_eq!(verify.crc32, crc);

    let reply =
        transact(&mut ctrl, &mut node, &[Opcode::UpdateCommit as u16, 4])
            .unwrap();
    assert_eq!(reply, vec![Opcode::UpdateCommitResp as u16, 0]);
}

#[test]
fn update_start_stops_a_running_network() {
    let bus = SimBus::new();
    let psram = psram_with_table(&[input_neuron(0, 1.0, 0)]);
    let mut node = make_node(&bus, psram, 4);
    let mut ctrl = controller(&bus);

    transact(&mut ctrl, &mut node, &[Opcode::DeployTopology as u16, 1]);
    transact(&mut ctrl, &mut node, &[Opcode::StartSnn as u16]);
    assert!(node.engine().is_running());

    let start = UpdateStart {
        target: 4,
        size: 2048,
        crc32: 0,
        chunk_size: 512,
        total_chunks: 4,
    };
    transact(&mut ctrl, &mut node, &start.to_words()).unwrap();
    assert!(!node.engine().is_running());
    assert!(node.update_mode());
    assert!(node.ota_active());
}

#[test]
fn commands_for_other_nodes_are_ignored() {
    let bus = SimBus::new();
    let mut node = make_node(&bus, RamExtMem::new(map::PSRAM_SIZE as usize), 4);
    let mut ctrl = controller(&bus);

    // UPDATE_START addressed to node 9: node 4 stays silent.
    let start = UpdateStart {
        target: 9,
        size: 2048,
        crc32: 0,
        chunk_size: 512,
        total_chunks: 4,
    };
    assert!(transact(&mut ctrl, &mut node, &start.to_words()).is_none());
    assert!(!node.ota_active());
}
