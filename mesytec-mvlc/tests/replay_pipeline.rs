// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! End-to-end replay: a synthesized listfile runs through the replay
//! worker, the readout parser and the event builder.

use std::sync::Arc;
use std::time::Duration;

use mesytec_mvlc::{
    build_readout_structure, vme_amods, BufferPool, ModuleData, ParserCallbacks, ReadoutParser,
    ReplayWorker, StackCommandBuilder, TransportKind,
};
use mvlc_eventbuilder::{
    make_mesytec_default_timestamp_extractor, CrateSetup, EventBuilder, EventBuilderConfig,
    EventSetup,
};
use mvlc_proto::constants::{frame_headers, system_event};
use mvlc_proto::frame::{make_frame_header, make_system_event_header};
use mvlc_proto::bytes_from_words;
use mvlc_readout::listfile::{ZipReadHandle, ZipWriteHandle};

/// One event readout: a single module doing one block transfer.
fn make_readout_stack() -> StackCommandBuilder {
    let mut stack = StackCommandBuilder::new();
    stack.begin_group("mdpp16");
    stack.add_vme_block_read(0x0, vme_amods::A32_USER_BLOCK, 0xffff);
    stack
}

/// A stack frame for event 0 carrying one block read whose last word is a
/// standard mesytec timestamp.
fn make_event_frame(channel_data: &[u32], timestamp: u32) -> Vec<u32> {
    let mut block = channel_data.to_vec();
    block.push(0xc000_0000 | timestamp);

    let mut words = Vec::new();
    words.push(make_frame_header(
        frame_headers::STACK_FRAME,
        (block.len() + 1) as u16,
        0,
        1,
        0,
    ));
    words.push(make_frame_header(
        frame_headers::BLOCK_READ,
        block.len() as u16,
        0,
        0,
        0,
    ));
    words.extend_from_slice(&block);
    words
}

struct PipelineSink {
    builder: Arc<EventBuilder>,
}

impl ParserCallbacks for PipelineSink {
    fn event_data(&mut self, crate_index: u8, event_index: usize, modules: &[ModuleData]) {
        self.builder
            .record_event_data(crate_index, event_index, modules);
    }

    fn system_event(&mut self, crate_index: u8, words: &[u32]) {
        self.builder.record_system_event(crate_index, words);
    }
}

#[derive(Default)]
struct FinalSink {
    events: Vec<Vec<Vec<u32>>>,
    system_subtypes: Vec<u8>,
}

impl ParserCallbacks for FinalSink {
    fn event_data(&mut self, _crate_index: u8, _event_index: usize, modules: &[ModuleData]) {
        self.events
            .push(modules.iter().map(|m| m.data().to_vec()).collect());
    }

    fn system_event(&mut self, _crate_index: u8, words: &[u32]) {
        if let Some(mvlc_proto::Frame::SystemEvent { subtype, .. }) =
            words.first().copied().and_then(mvlc_proto::Frame::decode)
        {
            self.system_subtypes.push(subtype);
        }
    }
}

#[test]
fn listfile_replays_through_parser_and_event_builder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run042.zip");

    // Synthesize the listfile: BeginRun, three events, EndRun.
    {
        let mut writer =
            ZipWriteHandle::create(&path, "run042.mvlclst", TransportKind::Usb).unwrap();

        let begin_run = vec![
            make_system_event_header(system_event::subtype::BEGIN_RUN, 1, false, 0),
            0x0042,
        ];
        writer.write(&bytes_from_words(&begin_run)).unwrap();

        for (ts, amplitude) in [(100u32, 0xaau32), (200, 0xbb), (300, 0xcc)] {
            let frame = make_event_frame(&[amplitude], ts);
            writer.write(&bytes_from_words(&frame)).unwrap();
        }

        let end_run = vec![
            make_system_event_header(system_event::subtype::END_RUN, 1, false, 0),
            0x0042,
        ];
        writer.write(&bytes_from_words(&end_run)).unwrap();

        writer.finish().unwrap();
    }

    // Replay it through the buffer pool.
    let pool = Arc::new(BufferPool::new(4, 64 * 1024));
    let mut replay = ReplayWorker::new(Arc::clone(&pool));
    replay
        .start(Box::new(ZipReadHandle::open(&path).unwrap()))
        .unwrap();
    replay.join();
    assert_eq!(replay.counters().last_error, None);

    // Parser feeding the event builder.
    let structure = build_readout_structure(&[make_readout_stack()]);
    let mut parser = ReadoutParser::new(0, structure);

    let builder = Arc::new(EventBuilder::new(EventBuilderConfig {
        setups: vec![EventSetup {
            enabled: true,
            main_module: (0, 0),
            crate_setups: vec![CrateSetup {
                module_timestamp_extractors: vec![Box::new(
                    make_mesytec_default_timestamp_extractor(),
                )],
                module_match_windows: vec![(-8, 8)],
            }],
        }],
        memory_limit: 1 << 20,
    }));

    let mut pipeline = PipelineSink {
        builder: Arc::clone(&builder),
    };

    while let Some(buffer) = pool.dequeue_filled(Duration::from_millis(100)) {
        parser.process_buffer(buffer.kind(), buffer.number(), buffer.data(), &mut pipeline);
        pool.enqueue_empty(buffer);
    }

    assert_eq!(parser.counters().parser_exceptions, 0);
    assert_eq!(parser.counters().event_hits[0], 3);

    // Drain the builder.
    let mut sink = FinalSink::default();
    let built = builder.build_events(&mut sink, true);

    assert_eq!(built, 3);
    assert_eq!(
        sink.system_subtypes,
        vec![
            system_event::subtype::BEGIN_RUN,
            system_event::subtype::END_RUN
        ]
    );

    assert_eq!(sink.events.len(), 3);
    assert_eq!(sink.events[0][0], vec![0xaa, 0xc000_0000 | 100]);
    assert_eq!(sink.events[1][0], vec![0xbb, 0xc000_0000 | 200]);
    assert_eq!(sink.events[2][0], vec![0xcc, 0xc000_0000 | 300]);
}
