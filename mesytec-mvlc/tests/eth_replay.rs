// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! ETH-format listfile replay: reconstructed packets interleaved with
//! raw system event frames.

use std::sync::Arc;
use std::time::Duration;

use mesytec_mvlc::{BufferPool, ModuleData, ParserCallbacks, ReadoutParser, ReplayWorker, TransportKind};
use mvlc_proto::bytes_from_words;
use mvlc_proto::constants::frame_headers::STACK_FRAME;
use mvlc_proto::constants::system_event;
use mvlc_proto::eth::make_packet_headers;
use mvlc_proto::frame::make_frame_header;
use mvlc_proto::readout_structure::ModuleReadoutStructure;
use mvlc_readout::listfile::{read_full_preamble, ZipReadHandle, ZipWriteHandle};

#[derive(Default)]
struct Recorder {
    events: Vec<Vec<u32>>,
    system_subtypes: Vec<u8>,
}

impl ParserCallbacks for Recorder {
    fn event_data(&mut self, _crate_index: u8, _event_index: usize, modules: &[ModuleData]) {
        self.events.push(modules[0].data().to_vec());
    }

    fn system_event(&mut self, _crate_index: u8, words: &[u32]) {
        if let Some(mvlc_proto::Frame::SystemEvent { subtype, .. }) =
            words.first().copied().and_then(mvlc_proto::Frame::decode)
        {
            self.system_subtypes.push(subtype);
        }
    }
}

/// One packet carrying a one-module stack frame with a single prefix
/// word.
fn data_packet(packet_number: u16, value: u32) -> Vec<u32> {
    let frame = [make_frame_header(STACK_FRAME, 1, 0, 1, 0), value];
    let headers = make_packet_headers(1, packet_number, 0, frame.len() as u16, 0, 100);

    let mut words = vec![headers.header0, headers.header1];
    words.extend_from_slice(&frame);
    words
}

#[test]
fn eth_listfile_replays_with_interleaved_system_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run100.zip");

    {
        let mut writer =
            ZipWriteHandle::create(&path, "run100.mvlclst.lz4", TransportKind::Eth).unwrap();
        writer.write_run_start(100).unwrap();

        for (number, value) in [(1u16, 0xa1u32), (2, 0xa2), (3, 0xa3)] {
            writer.write(&bytes_from_words(&data_packet(number, value))).unwrap();
        }

        // a timetick between packets, the way live recording interleaves
        writer
            .write_system_event(system_event::subtype::UNIX_TIMETICK, &[0x1234])
            .unwrap();

        writer.write(&bytes_from_words(&data_packet(4, 0xa4))).unwrap();
        writer.write_run_end(100).unwrap();
        writer.finish().unwrap();
    }

    // the preamble is readable on its own
    {
        let mut handle = ZipReadHandle::open(&path).unwrap();
        let preamble = read_full_preamble(&mut handle).unwrap();
        assert_eq!(preamble.kind, TransportKind::Eth);
        assert_eq!(preamble.sections.len(), 2);
        assert_eq!(
            preamble.sections[1].subtype,
            system_event::subtype::BEGIN_RUN
        );
    }

    let pool = Arc::new(BufferPool::new(4, 64 * 1024));
    let mut replay = ReplayWorker::new(Arc::clone(&pool));
    replay
        .start(Box::new(ZipReadHandle::open(&path).unwrap()))
        .unwrap();
    replay.join();
    assert_eq!(replay.counters().last_error, None);

    let structure = vec![vec![ModuleReadoutStructure {
        prefix_len: 1,
        has_dynamic: false,
        suffix_len: 0,
        name: "m0".into(),
    }]];
    let mut parser = ReadoutParser::new(0, structure);
    let mut rec = Recorder::default();

    while let Some(buffer) = pool.dequeue_filled(Duration::from_millis(100)) {
        assert_eq!(buffer.kind(), TransportKind::Eth);
        parser.process_buffer(buffer.kind(), buffer.number(), buffer.data(), &mut rec);
        pool.enqueue_empty(buffer);
    }

    assert_eq!(parser.counters().parser_exceptions, 0);
    assert_eq!(
        rec.events,
        vec![vec![0xa1], vec![0xa2], vec![0xa3], vec![0xa4]]
    );
    assert_eq!(
        rec.system_subtypes,
        vec![
            system_event::subtype::ENDIAN_MARKER,
            system_event::subtype::BEGIN_RUN,
            system_event::subtype::UNIX_TIMETICK,
            system_event::subtype::END_RUN,
            system_event::subtype::END_OF_FILE,
        ]
    );
}
