// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use app_image::AppFlags;
use cluster_hw::mock::{
    RamFlash, TestHandoff, TestRgb, TestScratch, TestStraps, TestWatchdog,
};
use cluster_hw::Flash as _;
use drv_matrix_bus::sim::{SimBus, SimHw};
use matrix_proto::FrameType;

const FLASH_SIZE: usize = (map::APP_PARTITION_OFFSET + 0x10_0000) as usize;

type TestBootloader =
    Bootloader<SimHw, RamFlash, TestRgb, TestScratch, TestWatchdog>;

/// A plausible little application: vector table first (stack pointer,
/// reset handler), then filler.
fn sample_binary(len: usize) -> Vec<u8> {
    let mut binary = vec![0u8; len];
    binary[..4].copy_from_slice(&0x2004_2000u32.to_le_bytes());
    binary[4..8].copy_from_slice(&0x1008_01C1u32.to_le_bytes());
    for (i, b) in binary[8..].iter_mut().enumerate() {
        *b = (i * 13) as u8;
    }
    binary
}

/// Full partition image: 192-byte header + binary.
fn sample_image(binary: &[u8]) -> Vec<u8> {
    let header = AppHeader::describe(
        "snn-node",
        "worker firmware",
        (2, 1, 0),
        AppFlags::empty(),
        binary,
    );
    let mut image = Vec::new();
    image.extend_from_slice(zerocopy_bytes(&header));
    image.extend_from_slice(binary);
    image
}

fn zerocopy_bytes(header: &AppHeader) -> &[u8] {
    use zerocopy::IntoBytes;
    header.as_bytes()
}

fn flash_with_image(image: &[u8]) -> RamFlash {
    let mut flash = RamFlash::new(FLASH_SIZE);
    let mut padded = image.to_vec();
    let page = map::FLASH_PAGE_SIZE as usize;
    padded.resize(padded.len().div_ceil(page) * page, 0xFF);
    flash.program(map::APP_PARTITION_OFFSET, &padded).unwrap();
    flash
}

fn make_bootloader(
    bus: &SimBus,
    flash: RamFlash,
    strap_id: u8,
    debug: bool,
) -> TestBootloader {
    Bootloader::new(
        drv_matrix_bus::LinkLayer::new_node(bus.endpoint()),
        flash,
        TestRgb::default(),
        TestScratch::default(),
        &TestStraps(strap_id),
        TestWatchdog::default(),
        debug,
    )
}

fn controller(bus: &SimBus) -> drv_matrix_bus::LinkLayer<SimHw> {
    drv_matrix_bus::LinkLayer::new_controller(bus.endpoint())
}

/// Sends one command frame from the controller and runs the bootloader
/// until it answers or stops making progress. Returns the reply payload
/// words.
fn transact(
    ctrl: &mut drv_matrix_bus::LinkLayer<SimHw>,
    boot: &mut TestBootloader,
    payload: &[u16],
) -> Option<Vec<u16>> {
    ctrl.send_frame(FrameType::Ctrl, boot.node_id(), 0, true, payload)
        .unwrap();
    let mut frame = Frame::empty();
    for _ in 0..10 {
        boot.step();
        if ctrl.try_receive(&mut frame) {
            assert!(frame.crc_valid);
            return Some(frame.payload().to_vec());
        }
    }
    None
}

#[test]
fn valid_app_jumps_immediately_in_release() {
    let bus = SimBus::new();
    let binary = sample_binary(2048);
    let mut boot =
        make_bootloader(&bus, flash_with_image(&sample_image(&binary)), 3, false);

    boot.start();
    assert_eq!(boot.phase(), Phase::JumpReady);
    let vectors = boot.jump_vectors().unwrap();
    assert_eq!(
        vectors.vector_base,
        map::XIP_CACHED_BASE + map::APP_PARTITION_OFFSET + 0xC0
    );
    assert_eq!(vectors.stack_pointer, 0x2004_2000);
    assert_eq!(vectors.reset_handler, 0x1008_01C1);
}

#[test]
fn jump_hands_vectors_to_the_handoff() {
    let bus = SimBus::new();
    let binary = sample_binary(2048);
    let mut boot =
        make_bootloader(&bus, flash_with_image(&sample_image(&binary)), 3, false);

    boot.start();
    assert_eq!(boot.phase(), Phase::JumpReady);

    let mut handoff = TestHandoff::default();
    boot.jump(&mut handoff);
    let vectors = handoff.jumped_to.unwrap();
    assert_eq!(vectors.stack_pointer, 0x2004_2000);
    assert_eq!(vectors.reset_handler, 0x1008_01C1);
    // The mock "returned" from the branch; the only place left to go is
    // safe mode.
    assert_eq!(boot.phase(), Phase::SafeMode);
}

#[test]
fn debug_countdown_expires_into_jump() {
    let bus = SimBus::new();
    let binary = sample_binary(1024);
    let mut boot =
        make_bootloader(&bus, flash_with_image(&sample_image(&binary)), 3, true);

    boot.start();
    assert_eq!(boot.phase(), Phase::Countdown);
    boot.step();
    assert_eq!(boot.phase(), Phase::Countdown);

    bus.advance_us(COUNTDOWN_US + 1);
    boot.step();
    assert_eq!(boot.phase(), Phase::JumpReady);
}

#[test]
fn boot_now_short_circuits_countdown() {
    let bus = SimBus::new();
    let binary = sample_binary(1024);
    let mut boot =
        make_bootloader(&bus, flash_with_image(&sample_image(&binary)), 3, true);
    let mut ctrl = controller(&bus);

    boot.start();
    ctrl.send_frame(
        FrameType::Ctrl,
        3,
        Opcode::BootNow.stream(),
        true,
        &[Opcode::BootNow as u16],
    )
    .unwrap();
    boot.step();
    assert_eq!(boot.phase(), Phase::JumpReady);
}

#[test]
fn update_opcode_during_countdown_diverts_to_safe_mode() {
    let bus = SimBus::new();
    let binary = sample_binary(1024);
    let mut boot =
        make_bootloader(&bus, flash_with_image(&sample_image(&binary)), 3, true);
    let mut ctrl = controller(&bus);

    boot.start();
    ctrl.send_frame(
        FrameType::Ctrl,
        3,
        Opcode::UpdateModeEnter.stream(),
        true,
        &[Opcode::UpdateModeEnter as u16],
    )
    .unwrap();
    boot.step();
    assert_eq!(boot.phase(), Phase::SafeMode);
}

#[test]
fn blank_partition_lands_in_safe_mode() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 3, false);
    boot.start();
    assert_eq!(boot.phase(), Phase::SafeMode);
    assert!(boot.jump_vectors().is_none());
}

#[test]
fn corrupt_binary_lands_in_safe_mode() {
    let bus = SimBus::new();
    let binary = sample_binary(4096);
    let mut image = sample_image(&binary);
    // One flipped bit in the binary region.
    image[app_image::HEADER_SIZE + 1000] ^= 0x04;
    let mut boot = make_bootloader(&bus, flash_with_image(&image), 3, false);
    boot.start();
    assert_eq!(boot.phase(), Phase::SafeMode);
}

#[test]
fn bad_entry_point_lands_in_safe_mode() {
    let bus = SimBus::new();
    let binary = sample_binary(1024);
    let mut header = AppHeader::describe(
        "x",
        "",
        (1, 0, 0),
        AppFlags::empty(),
        &binary,
    );
    header.entry_point = zerocopy::byteorder::little_endian::U32::new(0x100);
    let mut image = Vec::new();
    image.extend_from_slice(zerocopy_bytes(&header));
    image.extend_from_slice(&binary);
    let mut boot = make_bootloader(&bus, flash_with_image(&image), 3, false);
    boot.start();
    assert_eq!(boot.phase(), Phase::SafeMode);
}

#[test]
fn node_id_from_straps_cold_and_latch_warm() {
    let bus = SimBus::new();
    let boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 0b0111, false);
    assert_eq!(boot.node_id(), 7);

    // Warm boot: a latched id wins over the straps.
    let mut scratch = TestScratch::default();
    cluster_hw::node_id::latch(&mut scratch, 12);
    let boot2 = Bootloader::new(
        drv_matrix_bus::LinkLayer::new_node(bus.endpoint()),
        RamFlash::new(FLASH_SIZE),
        TestRgb::default(),
        scratch,
        &TestStraps(0b0001),
        TestWatchdog::default(),
        false,
    );
    assert_eq!(boot2.node_id(), 12);
}

#[test]
fn safe_mode_answers_ping_and_status() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 5, false);
    let mut ctrl = controller(&bus);
    boot.start();

    let pong = transact(&mut ctrl, &mut boot, &[Opcode::Ping as u16]).unwrap();
    assert_eq!(pong, vec![Opcode::Pong as u16]);

    let status =
        transact(&mut ctrl, &mut boot, &[Opcode::ReadStatus as u16]).unwrap();
    assert_eq!(status.len(), Status::WORDS);
    let status = Status::from_words(&status).unwrap();
    assert_eq!(status.node_id, 5);
    assert_eq!(status.free_mem, 8 * 1024 * 1024);
    // Red LED, SNN absent: the safe-mode signature.
    assert_eq!(status.led.0, 255);
    assert!(!status.snn_running);
    assert_eq!(status.neuron_count, 0);
}

#[test]
fn unknown_opcode_is_dropped_not_fatal() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 5, false);
    let mut ctrl = controller(&bus);
    boot.start();

    assert!(transact(&mut ctrl, &mut boot, &[0x7EAD]).is_none());
    // Still serving afterwards.
    let pong = transact(&mut ctrl, &mut boot, &[Opcode::Ping as u16]).unwrap();
    assert_eq!(pong, vec![Opcode::Pong as u16]);
}

#[test]
fn oversized_update_start_is_refused() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 5, false);
    let mut ctrl = controller(&bus);
    boot.start();

    let start = UpdateStart {
        target: 5,
        size: 100_000, // larger than the 48 KiB SRAM staging buffer
        crc32: 0,
        chunk_size: 1024,
        total_chunks: 98,
    };
    let reply = transact(&mut ctrl, &mut boot, &start.to_words()).unwrap();
    assert_eq!(
        reply,
        vec![
            Opcode::UpdateError as u16,
            cluster_commands::UpdateErrorCode::BadSize as u16
        ]
    );
}

#[test]
fn full_ota_flow_then_boot() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 5, false);
    let mut ctrl = controller(&bus);
    boot.start();
    assert_eq!(boot.phase(), Phase::SafeMode);

    // Package a fresh application image.
    let binary = sample_binary(6000);
    let image = sample_image(&binary);
    let chunk_size = 512u16;
    let total_chunks =
        image.len().div_ceil(usize::from(chunk_size)) as u16;
    let image_crc = app_image::crc32(&image);

    let start = UpdateStart {
        target: 5,
        size: image.len() as u32,
        crc32: image_crc,
        chunk_size,
        total_chunks,
    };
    let reply = transact(&mut ctrl, &mut boot, &start.to_words()).unwrap();
    let ready = UpdateReady::from_words(&reply).unwrap();
    assert_eq!(ready.status, 0);
    assert_eq!(ready.avail_kib, 48);

    // Stream the chunks.
    for (num, chunk) in image.chunks(usize::from(chunk_size)).enumerate() {
        let header = ChunkHeader {
            target: 5,
            chunk_num: num as u16,
            data_size: chunk.len() as u16,
        };
        let mut words = header.to_words().to_vec();
        let mut data_words = vec![0u16; chunk.len().div_ceil(2)];
        cluster_commands::bytes_to_words(chunk, &mut data_words);
        words.extend_from_slice(&data_words);

        let reply = transact(&mut ctrl, &mut boot, &words).unwrap();
        assert_eq!(
            reply,
            vec![Opcode::UpdateAckChunk as u16, num as u16]
        );
    }

    // Verify: the staged CRC must equal what we computed before chunking.
    let poll = UpdatePoll {
        target: 5,
        poll_type: PollType::Verify,
    };
    let reply = transact(&mut ctrl, &mut boot, &poll.to_words()).unwrap();
    let verify = VerifyResp::from_words(&reply).unwrap();
    assert_eq!(verify.status, 0);
    assert_eq!(verify.crc32, image_crc);

    // Commit programs the partition and proves it by readback.
    let reply =
        transact(&mut ctrl, &mut boot, &[Opcode::UpdateCommit as u16, 5])
            .unwrap();
    assert_eq!(reply, vec![Opcode::UpdateCommitResp as u16, 0]);

    // The freshly flashed image boots.
    let reply = transact(&mut ctrl, &mut boot, &[Opcode::BootNow as u16]);
    assert!(reply.is_none());
    assert_eq!(boot.phase(), Phase::JumpReady);
    let vectors = boot.jump_vectors().unwrap();
    assert_eq!(vectors.stack_pointer, 0x2004_2000);
}

#[test]
fn chunk_out_of_range_reports_sequence_error() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 5, false);
    let mut ctrl = controller(&bus);
    boot.start();

    let start = UpdateStart {
        target: 5,
        size: 1024,
        crc32: 0,
        chunk_size: 512,
        total_chunks: 2,
    };
    transact(&mut ctrl, &mut boot, &start.to_words()).unwrap();

    let header = ChunkHeader {
        target: 5,
        chunk_num: 9,
        data_size: 512,
    };
    let mut words = header.to_words().to_vec();
    words.extend_from_slice(&[0u16; 256]);
    let reply = transact(&mut ctrl, &mut boot, &words).unwrap();
    assert_eq!(
        reply,
        vec![
            Opcode::UpdateError as u16,
            cluster_commands::UpdateErrorCode::ChunkSequence as u16
        ]
    );
}

#[test]
fn commit_of_garbage_image_is_refused_before_flash() {
    let bus = SimBus::new();
    let mut boot = make_bootloader(&bus, RamFlash::new(FLASH_SIZE), 5, false);
    let mut ctrl = controller(&bus);
    boot.start();

    // Stage 1 KiB of noise that is not an application package.
    let noise: Vec<u8> = (0..1024u32).map(|i| (i * 7 + 1) as u8).collect();
    let start = UpdateStart {
        target: 5,
        size: 1024,
        crc32: app_image::crc32(&noise),
        chunk_size: 512,
        total_chunks: 2,
    };
    transact(&mut ctrl, &mut boot, &start.to_words()).unwrap();
    for (num, chunk) in noise.chunks(512).enumerate() {
        let header = ChunkHeader {
            target: 5,
            chunk_num: num as u16,
            data_size: 512,
        };
        let mut words = header.to_words().to_vec();
        let mut data_words = vec![0u16; 256];
        cluster_commands::bytes_to_words(chunk, &mut data_words);
        words.extend_from_slice(&data_words);
        transact(&mut ctrl, &mut boot, &words).unwrap();
    }

    let reply =
        transact(&mut ctrl, &mut boot, &[Opcode::UpdateCommit as u16, 5])
            .unwrap();
    assert_eq!(
        reply,
        vec![
            Opcode::UpdateError as u16,
            cluster_commands::UpdateErrorCode::BadMagic as u16
        ]
    );
}
