// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Cross-crate assembly: module fragments of one physics event arriving
//! from two crates with nearly-synchronized clocks.

use mvlc_eventbuilder::{
    CrateSetup, EventBuilder, EventBuilderConfig, EventSetup, InvalidTimestampExtractor,
};
use mvlc_readout::parser::{ModuleData, ParserCallbacks};

fn first_word_extractor() -> Box<dyn mvlc_eventbuilder::TimestampExtractor> {
    Box::new(|data: &[u32]| if data.is_empty() { 0 } else { data[0] })
}

/// Two crates contribute to event 0: crate 0 has two modules (the second
/// is the main module), crate 1 has one module.
fn two_crate_config() -> EventBuilderConfig {
    EventBuilderConfig {
        setups: vec![EventSetup {
            enabled: true,
            main_module: (0, 1),
            crate_setups: vec![
                CrateSetup {
                    module_timestamp_extractors: vec![
                        first_word_extractor(),
                        first_word_extractor(),
                    ],
                    module_match_windows: vec![(-100, 100), (0, 0)],
                },
                CrateSetup {
                    module_timestamp_extractors: vec![first_word_extractor()],
                    module_match_windows: vec![(-100, 100)],
                },
            ],
        }],
        memory_limit: 1 << 20,
    }
}

#[derive(Default)]
struct Recorder {
    events: Vec<Vec<Vec<u32>>>,
}

impl ParserCallbacks for Recorder {
    fn event_data(&mut self, crate_index: u8, _event_index: usize, modules: &[ModuleData]) {
        // assembled events always arrive as crate 0
        assert_eq!(crate_index, 0);
        self.events
            .push(modules.iter().map(|m| m.data().to_vec()).collect());
    }

    fn system_event(&mut self, _crate_index: u8, _words: &[u32]) {}
}

fn record(builder: &EventBuilder, crate_index: u8, timestamps: &[u32]) {
    let modules: Vec<ModuleData> = timestamps
        .iter()
        .map(|&ts| ModuleData::from_dynamic_words(vec![ts]))
        .collect();
    builder.record_event_data(crate_index, 0, &modules);
}

#[test]
fn linear_module_indexes_span_crates() {
    let builder = EventBuilder::new(two_crate_config());

    assert_eq!(builder.get_linear_module_index(0, 0, 0), Some(0));
    assert_eq!(builder.get_linear_module_index(0, 0, 1), Some(1));
    assert_eq!(builder.get_linear_module_index(1, 0, 0), Some(2));
    assert_eq!(builder.get_linear_module_index(2, 0, 0), None);
}

#[test]
fn fragments_from_both_crates_assemble_into_one_event() {
    let builder = EventBuilder::new(two_crate_config());
    let mut rec = Recorder::default();

    // crate 0 delivers first, crate 1 trails slightly
    record(&builder, 0, &[990, 1000]);
    assert_eq!(builder.build_events(&mut rec, false), 0);

    record(&builder, 1, &[1050]);
    assert_eq!(builder.build_events(&mut rec, false), 1);

    let event = &rec.events[0];
    assert_eq!(event.len(), 3);
    assert_eq!(event[0], vec![990]);
    assert_eq!(event[1], vec![1000]);
    assert_eq!(event[2], vec![1050]);
}

#[test]
fn incomplete_events_wait_for_the_lagging_crate() {
    let builder = EventBuilder::new(two_crate_config());
    let mut rec = Recorder::default();

    // two main-module events arrive before crate 1 sends anything
    record(&builder, 0, &[990, 1000]);
    record(&builder, 0, &[1990, 2000]);
    assert_eq!(builder.build_events(&mut rec, false), 0);

    // crate 1 catches up with one fragment per event; both events can
    // now be proven complete
    record(&builder, 1, &[1010]);
    record(&builder, 1, &[2010]);

    assert_eq!(builder.build_events(&mut rec, false), 2);

    assert_eq!(rec.events[0][2], vec![1010]);
    assert_eq!(rec.events[1][2], vec![2010]);
}

#[test]
fn stale_fragments_of_a_lagging_crate_are_discarded() {
    let builder = EventBuilder::new(two_crate_config());
    let mut rec = Recorder::default();

    // crate 1 data far older than the main module's first event
    record(&builder, 1, &[5]);
    record(&builder, 1, &[10]);
    record(&builder, 0, &[1000, 1000]);
    record(&builder, 1, &[1000]);

    assert_eq!(builder.build_events(&mut rec, true), 1);

    let event = &rec.events[0];
    assert_eq!(event[2], vec![1000]);

    let counters = builder.get_counters(0).unwrap();
    // linear module 2 dropped its two stale fragments
    assert_eq!(counters.discarded_events[2], 2);
}

#[test]
fn ignored_modules_always_match() {
    let config = EventBuilderConfig {
        setups: vec![EventSetup {
            enabled: true,
            main_module: (0, 0),
            crate_setups: vec![CrateSetup {
                module_timestamp_extractors: vec![
                    first_word_extractor(),
                    Box::new(InvalidTimestampExtractor),
                ],
                module_match_windows: vec![(0, 0), (-8, 8)],
            }],
        }],
        memory_limit: 1 << 20,
    };

    let builder = EventBuilder::new(config);
    let mut rec = Recorder::default();

    // module 1 carries no extractable timestamp at all
    let modules = vec![
        ModuleData::from_dynamic_words(vec![500]),
        ModuleData::from_dynamic_words(vec![0xdead_beef]),
    ];
    builder.record_event_data(0, 0, &modules);

    assert_eq!(builder.build_events(&mut rec, false), 1);
    assert_eq!(rec.events[0][1], vec![0xdead_beef]);
}
