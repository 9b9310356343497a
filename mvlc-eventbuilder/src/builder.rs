// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

use mvlc_readout::parser::{ModuleData, ParserCallbacks};

use crate::extractors::BoxedTimestampExtractor;

/// Timestamps are 30-bit counters that wrap.
pub const TIMESTAMP_MAX: u32 = 0x3fff_ffff;
pub const TIMESTAMP_HALF: u32 = TIMESTAMP_MAX >> 1;
/// Sentinel produced by extractors when no timestamp could be pulled out
/// of the module data.
pub const TIMESTAMP_EXTRACTION_FAILED: u32 = 0xffff_ffff;

pub const DEFAULT_MATCH_WINDOW: (i32, i32) = (-8, 8);
/// 1 GiB of buffered module data.
pub const DEFAULT_MEMORY_LIMIT: usize = 1024 * 1024 * 1024;

/// Classification of a module timestamp against the main module's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMatch {
    TooOld,
    InWindow,
    TooNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowMatchResult {
    pub kind: WindowMatch,
    /// Absolute distance to the reference timestamp. 0 is a perfect
    /// match; the higher the worse.
    pub invscore: u32,
}

/// Compare a module timestamp against the main module's timestamp within
/// `window = (lo, hi)` where `lo <= 0 <= hi`, handling 30-bit wrap.
pub fn timestamp_match(ts_main: u32, ts_module: u32, window: (i32, i32)) -> WindowMatchResult {
    let mut diff = i64::from(ts_main) - i64::from(ts_module);

    if diff.abs() > i64::from(TIMESTAMP_HALF) {
        // overflow handling
        if diff < 0 {
            diff += i64::from(TIMESTAMP_MAX);
        } else {
            diff -= i64::from(TIMESTAMP_MAX);
        }
    }

    let invscore = diff.unsigned_abs() as u32;

    if diff >= 0 {
        // the module timestamp is before the main timestamp
        if diff > i64::from(-window.0) {
            return WindowMatchResult {
                kind: WindowMatch::TooOld,
                invscore,
            };
        }
    } else {
        // the module timestamp is after the main timestamp
        if -diff > i64::from(window.1) {
            return WindowMatchResult {
                kind: WindowMatch::TooNew,
                invscore,
            };
        }
    }

    WindowMatchResult {
        kind: WindowMatch::InWindow,
        invscore,
    }
}

/// Per-crate module configuration of one event, in crate-relative module
/// order.
pub struct CrateSetup {
    pub module_timestamp_extractors: Vec<BoxedTimestampExtractor>,
    pub module_match_windows: Vec<(i32, i32)>,
}

/// Configuration of one event index.
pub struct EventSetup {
    /// Disabled events take the passthrough path.
    pub enabled: bool,
    /// Crate setups in crate index order.
    pub crate_setups: Vec<CrateSetup>,
    /// (crate index, crate-relative module index) of the module providing
    /// the reference timestamp.
    pub main_module: (usize, usize),
}

pub struct EventBuilderConfig {
    pub setups: Vec<EventSetup>,
    pub memory_limit: usize,
}

impl Default for EventBuilderConfig {
    fn default() -> Self {
        Self {
            setups: Vec::new(),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Counters of one event index, per linear module.
#[derive(Debug, Clone, Default)]
pub struct EventCounters {
    pub discarded_events: Vec<u64>,
    pub empty_events: Vec<u64>,
    pub inv_score_sums: Vec<u64>,
    pub total_hits: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct EventBuilderCounters {
    pub event_counters: Vec<EventCounters>,
    pub max_memory_usage: usize,
}

impl std::fmt::Display for EventBuilderCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "maxMemoryUsage={}", self.max_memory_usage)?;

        for (event_index, counters) in self.event_counters.iter().enumerate() {
            writeln!(f, "event {event_index}:")?;

            for module_index in 0..counters.total_hits.len() {
                writeln!(
                    f,
                    "  module {module_index}: hits={}, discarded={}, empty={}, invScoreSum={}",
                    counters.total_hits[module_index],
                    counters.discarded_events[module_index],
                    counters.empty_events[module_index],
                    counters.inv_score_sums[module_index],
                )?;
            }
        }

        Ok(())
    }
}

struct ModuleEventStorage {
    timestamp: u32,
    data: Vec<u32>,
}

impl ModuleEventStorage {
    fn used_memory(&self) -> usize {
        self.data.len() * std::mem::size_of::<u32>()
    }
}

struct State {
    // indexes: [event][linear module]
    extractors: Vec<Vec<BoxedTimestampExtractor>>,
    match_windows: Vec<Vec<(i32, i32)>>,
    event_buffers: Vec<Vec<VecDeque<ModuleEventStorage>>>,
    mem_counters: Vec<Vec<usize>>,
    discarded_events: Vec<Vec<u64>>,
    empty_events: Vec<Vec<u64>>,
    inv_score_sums: Vec<Vec<u64>>,
    total_hits: Vec<Vec<u64>>,
    max_used_memory: usize,
    system_events: VecDeque<(u8, Vec<u32>)>,
    passthrough_events: VecDeque<(u8, usize, Vec<ModuleData>)>,
}

impl State {
    fn memory_usage(&self) -> usize {
        self.mem_counters.iter().flatten().sum()
    }

    fn discard_all_event_data(&mut self) {
        for (event_buffers, discards) in self
            .event_buffers
            .iter_mut()
            .zip(self.discarded_events.iter_mut())
        {
            for (buffer, discarded) in event_buffers.iter_mut().zip(discards.iter_mut()) {
                *discarded += buffer.len() as u64;
                buffer.clear();
            }
        }

        for counters in &mut self.mem_counters {
            counters.fill(0);
        }
    }

    fn reset_counters(&mut self) {
        self.max_used_memory = 0;

        for c in &mut self.mem_counters {
            c.fill(0);
        }
        for c in &mut self.discarded_events {
            c.fill(0);
        }
        for c in &mut self.empty_events {
            c.fill(0);
        }
        for c in &mut self.inv_score_sums {
            c.fill(0);
        }
        for c in &mut self.total_hits {
            c.fill(0);
        }
    }
}

/// The multi-crate event assembler.
///
/// `record_event_data` and `record_system_event` are producers;
/// `build_events` is the single consumer. One mutex and condition
/// variable guard the combined state.
pub struct EventBuilder {
    state: Mutex<State>,
    cv: Condvar,
    // immutable configuration
    enabled: Vec<bool>,
    // indexes: [event][crate] -> linear module index base
    crate_offsets: Vec<Vec<usize>>,
    main_linear_indexes: Vec<usize>,
    memory_limit: usize,
}

impl EventBuilder {
    pub fn new(config: EventBuilderConfig) -> Self {
        let mut enabled = Vec::with_capacity(config.setups.len());
        let mut crate_offsets = Vec::with_capacity(config.setups.len());
        let mut main_linear_indexes = Vec::with_capacity(config.setups.len());

        let mut extractors = Vec::new();
        let mut match_windows = Vec::new();
        let mut event_buffers = Vec::new();
        let mut mem_counters = Vec::new();
        let mut discarded = Vec::new();
        let mut empty = Vec::new();
        let mut invscores = Vec::new();
        let mut hits = Vec::new();

        for setup in config.setups {
            enabled.push(setup.enabled);

            let mut offsets = Vec::with_capacity(setup.crate_setups.len());
            let mut event_extractors = Vec::new();
            let mut event_windows = Vec::new();

            for crate_setup in setup.crate_setups {
                debug_assert_eq!(
                    crate_setup.module_timestamp_extractors.len(),
                    crate_setup.module_match_windows.len()
                );

                offsets.push(event_extractors.len());
                event_extractors.extend(crate_setup.module_timestamp_extractors);
                event_windows.extend(crate_setup.module_match_windows);
            }

            let module_count = event_extractors.len();

            let main_linear = if setup.enabled {
                offsets
                    .get(setup.main_module.0)
                    .map(|base| base + setup.main_module.1)
                    .unwrap_or(0)
            } else {
                0
            };

            crate_offsets.push(offsets);
            main_linear_indexes.push(main_linear);

            extractors.push(event_extractors);
            match_windows.push(event_windows);
            event_buffers.push((0..module_count).map(|_| VecDeque::new()).collect());
            mem_counters.push(vec![0; module_count]);
            discarded.push(vec![0; module_count]);
            empty.push(vec![0; module_count]);
            invscores.push(vec![0; module_count]);
            hits.push(vec![0; module_count]);
        }

        Self {
            state: Mutex::new(State {
                extractors,
                match_windows,
                event_buffers,
                mem_counters,
                discarded_events: discarded,
                empty_events: empty,
                inv_score_sums: invscores,
                total_hits: hits,
                max_used_memory: 0,
                system_events: VecDeque::new(),
                passthrough_events: VecDeque::new(),
            }),
            cv: Condvar::new(),
            enabled,
            crate_offsets,
            main_linear_indexes,
            memory_limit: config.memory_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_enabled_for(&self, event_index: usize) -> bool {
        self.enabled.get(event_index).copied().unwrap_or(false)
    }

    pub fn is_enabled_for_any_event(&self) -> bool {
        self.enabled.iter().any(|&e| e)
    }

    /// Flat index of `(crate, module)` within one event's module list.
    pub fn get_linear_module_index(
        &self,
        crate_index: usize,
        event_index: usize,
        module_index: usize,
    ) -> Option<usize> {
        self.crate_offsets
            .get(event_index)?
            .get(crate_index)
            .map(|base| base + module_index)
    }

    /// Push parsed event data into the builder. Called after parsing (and
    /// multi-event splitting, if any).
    pub fn record_event_data(
        &self,
        crate_index: u8,
        event_index: usize,
        module_data: &[ModuleData],
    ) {
        let mut state = self.lock();

        if !self.is_enabled_for(event_index) {
            state
                .passthrough_events
                .push_back((crate_index, event_index, module_data.to_vec()));
            drop(state);
            self.cv.notify_one();
            return;
        }

        // Memory usage check and possible discarding of all buffered data.
        if state.memory_usage() >= self.memory_limit {
            warn!("memory limit exceeded, discarding all buffered data");
            state.discard_all_event_data();
        }

        let Some(offsets) = self.crate_offsets.get(event_index) else {
            return;
        };
        let Some(&base) = offsets.get(usize::from(crate_index)) else {
            warn!(crate_index, event_index, "crate not part of the event setup");
            return;
        };

        // Linear indexes of this crate end where the next crate begins.
        let crate_end = offsets
            .get(usize::from(crate_index) + 1)
            .copied()
            .unwrap_or(state.extractors[event_index].len());

        for (module_index, module) in module_data.iter().enumerate() {
            let linear = base + module_index;

            if linear >= crate_end {
                warn!(
                    crate_index,
                    event_index, module_index, "module outside the configured crate setup"
                );
                break;
            }

            state.total_hits[event_index][linear] += 1;

            // A block readout of a module that converted nothing yields
            // zero-length data carrying no timestamp; skip those records.
            if module.data().is_empty() {
                state.empty_events[event_index][linear] += 1;
                continue;
            }

            let timestamp = state.extractors[event_index][linear].extract(module.data());

            let storage = ModuleEventStorage {
                timestamp,
                data: module.data().to_vec(),
            };

            let used = storage.used_memory();
            state.event_buffers[event_index][linear].push_back(storage);
            state.mem_counters[event_index][linear] += used;
        }

        // Keep the buffered data within the configured bound.
        if state.memory_usage() > self.memory_limit {
            warn!("memory limit exceeded, discarding all buffered data");
            state.discard_all_event_data();
        }

        let used = state.memory_usage();
        state.max_used_memory = state.max_used_memory.max(used);

        trace!(used, "event data recorded");

        drop(state);
        self.cv.notify_one();
    }

    /// Buffer a system event for later yielding from `build_events`.
    pub fn record_system_event(&self, crate_index: u8, words: &[u32]) {
        let mut state = self.lock();
        state.system_events.push_back((crate_index, words.to_vec()));
        drop(state);
        self.cv.notify_one();
    }

    /// Wait until any buffered data is available.
    pub fn wait_for_data(&self, max_wait: Duration) -> bool {
        let has_data = |state: &State| {
            !state.system_events.is_empty()
                || !state.passthrough_events.is_empty()
                || state
                    .event_buffers
                    .iter()
                    .flatten()
                    .any(|b| !b.is_empty())
        };

        let state = self.lock();
        match self.cv.wait_timeout_while(state, max_wait, |s| !has_data(s)) {
            Ok((state, _)) => has_data(&state),
            Err(poisoned) => {
                let (state, _) = poisoned.into_inner();
                has_data(&state)
            }
        }
    }

    /// Attempt to assemble events, invoking the callbacks for every
    /// emitted event. With `flush` set all buffered data is drained.
    /// Returns the number of assembled events.
    pub fn build_events(&self, callbacks: &mut dyn ParserCallbacks, flush: bool) -> usize {
        let mut state = self.lock();

        while let Some((crate_index, words)) = state.system_events.pop_front() {
            callbacks.system_event(crate_index, &words);
        }

        while let Some((crate_index, event_index, modules)) = state.passthrough_events.pop_front()
        {
            callbacks.event_data(crate_index, event_index, &modules);
        }

        let mut result = 0;

        for event_index in 0..self.enabled.len() {
            if self.enabled[event_index] {
                result += self.build_event(&mut state, event_index, callbacks, flush);
            }
        }

        result
    }

    /// Try to yield only complete events: an event is emitted when every
    /// participating module contributed an in-window record or has more
    /// data queued behind the match window. When a module's queue is
    /// empty and it did not contribute, matching data may still arrive,
    /// so building stops before the current main event.
    fn build_event(
        &self,
        state: &mut State,
        event_index: usize,
        callbacks: &mut dyn ParserCallbacks,
        flush: bool,
    ) -> usize {
        if flush {
            debug!(event_index, "flush requested");
        }

        let main_index = self.main_linear_indexes[event_index];
        let module_count = state.event_buffers[event_index].len();
        let mut result = 0;

        loop {
            {
                let buffers = &state.event_buffers[event_index];

                if buffers[main_index].is_empty() {
                    break;
                }

                // Outside flush mode every module queue must hold data,
                // otherwise no decision can be made yet.
                if !flush && buffers.iter().any(|b| b.is_empty()) {
                    break;
                }
            }

            let main_timestamp = state.event_buffers[event_index][main_index][0].timestamp;

            // Which modules contribute their front record to this event.
            let mut contributes = vec![false; module_count];

            for module_index in 0..module_count {
                let window = state.match_windows[event_index][module_index];

                loop {
                    let Some(front) = state.event_buffers[event_index][module_index].front()
                    else {
                        break;
                    };

                    let match_result = if front.timestamp == TIMESTAMP_EXTRACTION_FAILED {
                        // No timestamp in the module data or the module is
                        // deliberately ignored; it always matches.
                        WindowMatchResult {
                            kind: WindowMatch::InWindow,
                            invscore: u32::MAX,
                        }
                    } else {
                        timestamp_match(main_timestamp, front.timestamp, window)
                    };

                    match match_result.kind {
                        WindowMatch::TooOld => {
                            // Cannot be matched at any future point; drop it.
                            let used = front.used_memory();
                            state.event_buffers[event_index][module_index].pop_front();
                            state.mem_counters[event_index][module_index] -= used;
                            state.discarded_events[event_index][module_index] += 1;
                        }
                        WindowMatch::InWindow => {
                            state.inv_score_sums[event_index][module_index] +=
                                u64::from(match_result.invscore);
                            contributes[module_index] = true;
                            break;
                        }
                        WindowMatch::TooNew => break,
                    }
                }
            }

            if !flush {
                let premature = (0..module_count).any(|m| {
                    !contributes[m] && state.event_buffers[event_index][m].is_empty()
                });

                if premature {
                    break;
                }
            }

            // Assemble from the contributing front records.
            let assembly: Vec<ModuleData> = (0..module_count)
                .map(|module_index| {
                    if contributes[module_index] {
                        // Checked above: contributing queues hold a front record.
                        match state.event_buffers[event_index][module_index].pop_front() {
                            Some(storage) => {
                                state.mem_counters[event_index][module_index] -=
                                    storage.used_memory();
                                ModuleData::from_dynamic_words(storage.data)
                            }
                            None => ModuleData::default(),
                        }
                    } else {
                        ModuleData::default()
                    }
                })
                .collect();

            // Assembled events are always mapped to crate 0.
            callbacks.event_data(0, event_index, &assembly);
            result += 1;
        }

        if flush {
            // Only data too new to match the last main event can be left.
            for buffer in &mut state.event_buffers[event_index] {
                buffer.clear();
            }
            state.mem_counters[event_index].fill(0);
        }

        trace!(event_index, result, "events built");

        result
    }

    pub fn get_counters(&self, event_index: usize) -> Option<EventCounters> {
        let state = self.lock();

        Some(EventCounters {
            discarded_events: state.discarded_events.get(event_index)?.clone(),
            empty_events: state.empty_events.get(event_index)?.clone(),
            inv_score_sums: state.inv_score_sums.get(event_index)?.clone(),
            total_hits: state.total_hits.get(event_index)?.clone(),
        })
    }

    pub fn counters(&self) -> EventBuilderCounters {
        let state = self.lock();

        EventBuilderCounters {
            event_counters: (0..self.enabled.len())
                .map(|event_index| EventCounters {
                    discarded_events: state.discarded_events[event_index].clone(),
                    empty_events: state.empty_events[event_index].clone(),
                    inv_score_sums: state.inv_score_sums[event_index].clone(),
                    total_hits: state.total_hits[event_index].clone(),
                })
                .collect(),
            max_memory_usage: state.max_used_memory,
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.lock().memory_usage()
    }

    pub fn max_memory_usage(&self) -> usize {
        self.lock().max_used_memory
    }

    pub fn discard_all_event_data(&self) {
        self.lock().discard_all_event_data();
    }

    /// Discard all buffered data and zero the counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.discard_all_event_data();
        state.reset_counters();
        state.system_events.clear();
        state.passthrough_events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_classification_without_overflow() {
        let window = (-50, 50);

        let r = timestamp_match(150, 99, window);
        assert_eq!(r.kind, WindowMatch::TooOld);
        assert_eq!(r.invscore, 51);

        let r = timestamp_match(150, 100, window);
        assert_eq!(r.kind, WindowMatch::InWindow);
        assert_eq!(r.invscore, 50);

        let r = timestamp_match(150, 200, window);
        assert_eq!(r.kind, WindowMatch::InWindow);
        assert_eq!(r.invscore, 50);

        let r = timestamp_match(150, 201, window);
        assert_eq!(r.kind, WindowMatch::TooNew);
        assert_eq!(r.invscore, 51);
    }

    #[test]
    fn match_classification_across_the_wrap() {
        let window = (-50, 50);

        // the module timestamp sits just before the wrap, the main
        // timestamp just after it
        let r = timestamp_match(10, TIMESTAMP_MAX - 5, window);
        assert_eq!(r.kind, WindowMatch::InWindow);

        let r = timestamp_match(TIMESTAMP_MAX - 5, 10, window);
        assert_eq!(r.kind, WindowMatch::InWindow);
    }

    #[test]
    fn asymmetric_windows() {
        // only accept modules after the main module
        let window = (0, 100);

        assert_eq!(timestamp_match(500, 499, window).kind, WindowMatch::TooOld);
        assert_eq!(timestamp_match(500, 500, window).kind, WindowMatch::InWindow);
        assert_eq!(timestamp_match(500, 600, window).kind, WindowMatch::InWindow);
        assert_eq!(timestamp_match(500, 601, window).kind, WindowMatch::TooNew);
    }
}
