// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Event assembly scenarios: window matching with and without timestamp
//! overflow, memory accounting, and long perfect-match streams.

use mvlc_eventbuilder::{
    CrateSetup, EventBuilder, EventBuilderConfig, EventSetup, TIMESTAMP_MAX,
};
use mvlc_readout::parser::{ModuleData, ParserCallbacks};

/// The timestamp of a test module is simply its first data word.
fn test_extractor() -> Box<dyn mvlc_eventbuilder::TimestampExtractor> {
    Box::new(|data: &[u32]| if data.is_empty() { 0 } else { data[0] })
}

/// One crate, one event, three modules; module 1 is the main module.
fn make_test_setup() -> EventBuilderConfig {
    EventBuilderConfig {
        setups: vec![EventSetup {
            enabled: true,
            main_module: (0, 1),
            crate_setups: vec![CrateSetup {
                module_timestamp_extractors: vec![
                    test_extractor(),
                    test_extractor(),
                    test_extractor(),
                ],
                module_match_windows: vec![(-50, 75), (0, 0), (-20, 150)],
            }],
        }],
        memory_limit: mvlc_eventbuilder::DEFAULT_MEMORY_LIMIT,
    }
}

fn modules_from_timestamps(timestamps: &[&[u32]]) -> Vec<ModuleData> {
    timestamps
        .iter()
        .map(|words| ModuleData::from_dynamic_words(words.to_vec()))
        .collect()
}

#[derive(Default)]
struct Recorder {
    events: Vec<Vec<Vec<u32>>>,
    system_events: Vec<Vec<u32>>,
}

impl ParserCallbacks for Recorder {
    fn event_data(&mut self, _crate_index: u8, _event_index: usize, modules: &[ModuleData]) {
        self.events
            .push(modules.iter().map(|m| m.data().to_vec()).collect());
    }

    fn system_event(&mut self, _crate_index: u8, words: &[u32]) {
        self.system_events.push(words.to_vec());
    }
}

#[test]
fn construct_and_destruct() {
    let builder = EventBuilder::new(EventBuilderConfig::default());
    assert_eq!(builder.memory_usage(), 0);
    assert_eq!(builder.max_memory_usage(), 0);
    assert!(!builder.is_enabled_for_any_event());
}

#[test]
fn memory_usage_and_discarding() {
    let builder = EventBuilder::new(make_test_setup());

    assert_eq!(builder.memory_usage(), 0);

    let modules = modules_from_timestamps(&[&[0], &[0, 1], &[0, 1, 2]]);
    builder.record_event_data(0, 0, &modules);

    assert_eq!(builder.memory_usage(), 6 * 4);
    assert_eq!(builder.max_memory_usage(), 6 * 4);

    // discard but keep the counters
    builder.discard_all_event_data();
    assert_eq!(builder.memory_usage(), 0);
    assert_eq!(builder.max_memory_usage(), 6 * 4);

    // discard and reset the counters
    builder.reset();
    assert_eq!(builder.memory_usage(), 0);
    assert_eq!(builder.max_memory_usage(), 0);
}

#[test]
fn memory_limit_triggers_the_release_valve() {
    let mut config = make_test_setup();
    config.memory_limit = 64;
    let builder = EventBuilder::new(config);

    for ts in 0..100u32 {
        let modules = modules_from_timestamps(&[&[ts], &[ts], &[ts]]);
        builder.record_event_data(0, 0, &modules);
        assert!(builder.memory_usage() <= 64);
    }

    let counters = builder.get_counters(0).unwrap();
    assert!(counters.discarded_events.iter().sum::<u64>() > 0);
}

#[test]
fn single_crate_window_matching_no_overflow() {
    // event 0: module 0 too old, module 2 in window
    // event 1: module 0 in window, module 2 too new
    // event 2: module 0 in window, module 2 still too new
    let test_data: Vec<[&[u32]; 3]> = vec![
        [&[25], &[150], &[200]],
        [&[101], &[151], &[350]],
        [&[225], &[252], &[666]],
    ];

    // push one event, then flush
    {
        let builder = EventBuilder::new(make_test_setup());
        builder.record_event_data(0, 0, &modules_from_timestamps(&test_data[0]));

        let mut rec = Recorder::default();
        assert_eq!(builder.build_events(&mut rec, true), 1);
        assert_eq!(rec.events.len(), 1);

        let event = &rec.events[0];
        assert!(event[0].is_empty());
        assert_eq!(event[1], vec![150]);
        assert_eq!(event[2], vec![200]);
    }

    // push two events, then flush
    {
        let builder = EventBuilder::new(make_test_setup());
        builder.record_event_data(0, 0, &modules_from_timestamps(&test_data[0]));
        builder.record_event_data(0, 0, &modules_from_timestamps(&test_data[1]));

        let mut rec = Recorder::default();
        assert_eq!(builder.build_events(&mut rec, true), 2);

        let event = &rec.events[0];
        assert_eq!(event[0], vec![101]);
        assert_eq!(event[1], vec![150]);
        assert_eq!(event[2], vec![200]);

        let event = &rec.events[1];
        assert!(event[0].is_empty());
        assert_eq!(event[1], vec![151]);
        assert!(event[2].is_empty());
    }

    // push three events, then flush
    {
        let builder = EventBuilder::new(make_test_setup());
        for data in &test_data {
            builder.record_event_data(0, 0, &modules_from_timestamps(data));
        }

        let mut rec = Recorder::default();
        assert_eq!(builder.build_events(&mut rec, true), 3);

        let event = &rec.events[0];
        assert_eq!(event[0], vec![101]);
        assert_eq!(event[1], vec![150]);
        assert_eq!(event[2], vec![200]);

        let event = &rec.events[1];
        assert_eq!(event[0], vec![225]);
        assert_eq!(event[1], vec![151]);
        assert!(event[2].is_empty());

        let event = &rec.events[2];
        assert!(event[0].is_empty());
        assert_eq!(event[1], vec![252]);
        assert_eq!(event[2], vec![350]);
    }
}

#[test]
fn single_crate_window_matching_with_overflow() {
    let near_max = TIMESTAMP_MAX;

    let near_max_minus_5 = [near_max - 5];
    let near_max_minus_10 = [near_max - 10];
    let near_max_minus_15 = [near_max - 15];
    let near_max_minus_17 = [near_max - 17];

    let test_data: Vec<[&[u32]; 3]> = vec![
        [&[100], &[150], &[200]],
        [&near_max_minus_5, &[10], &near_max_minus_10],
        [&[50], &near_max_minus_15, &[100]],
        [&[2000], &near_max_minus_17, &[3000]],
    ];

    let builder = EventBuilder::new(make_test_setup());
    for data in &test_data {
        builder.record_event_data(0, 0, &modules_from_timestamps(data));
    }

    let mut rec = Recorder::default();
    assert_eq!(builder.build_events(&mut rec, true), 4);

    assert_eq!(rec.events[0][0], vec![100]);
    assert_eq!(rec.events[0][1], vec![150]);
    assert_eq!(rec.events[0][2], vec![200]);

    assert_eq!(rec.events[1][0], vec![near_max - 5]);
    assert_eq!(rec.events[1][1], vec![10]);
    assert_eq!(rec.events[1][2], vec![near_max - 10]);

    assert_eq!(rec.events[2][0], vec![50]);
    assert_eq!(rec.events[2][1], vec![near_max - 15]);
    assert_eq!(rec.events[2][2], vec![100]);

    assert!(rec.events[3][0].is_empty());
    assert_eq!(rec.events[3][1], vec![near_max - 17]);
    assert!(rec.events[3][2].is_empty());
}

#[test]
fn single_crate_perfect_matches() {
    let builder = EventBuilder::new(make_test_setup());
    let mut rec = Recorder::default();

    // 999 events whose modules all share the event number as timestamp
    for ts in 0..999u32 {
        let modules = modules_from_timestamps(&[&[ts], &[ts], &[ts]]);
        builder.record_event_data(0, 0, &modules);
    }

    assert_eq!(builder.build_events(&mut rec, false), 999);
    assert_eq!(rec.events.len(), 999);

    // one more event
    let modules = modules_from_timestamps(&[&[999], &[999], &[999]]);
    builder.record_event_data(0, 0, &modules);

    assert_eq!(builder.build_events(&mut rec, false), 1);
    assert_eq!(rec.events.len(), 1000);

    // no new data, nothing to build
    assert_eq!(builder.build_events(&mut rec, false), 0);
    assert_eq!(builder.build_events(&mut rec, true), 0);
    assert_eq!(rec.events.len(), 1000);

    // a single further event can still be built without flushing
    let modules = modules_from_timestamps(&[&[1000], &[1000], &[1000]]);
    builder.record_event_data(0, 0, &modules);

    assert_eq!(builder.build_events(&mut rec, false), 1);
    assert_eq!(builder.build_events(&mut rec, true), 0);
    assert_eq!(rec.events.len(), 1001);

    assert_eq!(builder.memory_usage(), 0);
}

#[test]
fn passthrough_events_bypass_the_matcher() {
    // event 1 is not configured -> passthrough
    let builder = EventBuilder::new(make_test_setup());

    let modules = modules_from_timestamps(&[&[1, 2, 3]]);
    builder.record_event_data(3, 1, &modules);

    let mut rec = Recorder::default();
    assert_eq!(builder.build_events(&mut rec, false), 0);

    assert_eq!(rec.events.len(), 1);
    assert_eq!(rec.events[0][0], vec![1, 2, 3]);
}

#[test]
fn system_events_drain_in_fifo_order() {
    let builder = EventBuilder::new(make_test_setup());

    builder.record_system_event(0, &[0xfa00_0001, 1]);
    builder.record_system_event(0, &[0xfa00_0002, 2]);

    let mut rec = Recorder::default();
    builder.build_events(&mut rec, false);

    assert_eq!(rec.system_events.len(), 2);
    assert_eq!(rec.system_events[0][1], 1);
    assert_eq!(rec.system_events[1][1], 2);
}

#[test]
fn wait_for_data_wakes_on_recording() {
    use std::sync::Arc;
    use std::time::Duration;

    let builder = Arc::new(EventBuilder::new(make_test_setup()));

    assert!(!builder.wait_for_data(Duration::from_millis(10)));

    let producer = {
        let builder = Arc::clone(&builder);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let modules = modules_from_timestamps(&[&[1], &[1], &[1]]);
            builder.record_event_data(0, 0, &modules);
        })
    };

    assert!(builder.wait_for_data(Duration::from_secs(5)));
    producer.join().unwrap();
}

#[test]
fn empty_module_data_is_counted_not_buffered() {
    let builder = EventBuilder::new(make_test_setup());

    let modules = vec![
        ModuleData::from_dynamic_words(vec![]),
        ModuleData::from_dynamic_words(vec![100]),
        ModuleData::from_dynamic_words(vec![100]),
    ];
    builder.record_event_data(0, 0, &modules);

    let counters = builder.get_counters(0).unwrap();
    assert_eq!(counters.empty_events[0], 1);
    assert_eq!(counters.total_hits, vec![1, 1, 1]);
    assert_eq!(builder.memory_usage(), 2 * 4);
}
