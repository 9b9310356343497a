// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The readout parser: reconstructs per-event, per-module data from the
//! framed data stream.
//!
//! Input buffers contain whole MVLC frames (USB) or whole packets (ETH);
//! top-level framing is always the MVLC frame. An event can still span
//! multiple frames (StackFrame + StackContinuations) and those frames can
//! land in different buffers, so the parse state survives across
//! `process_buffer` calls. Header inconsistencies increment an exception
//! counter and resynchronize the stream to the next plausible frame
//! header.

use tracing::{trace, warn};

use mvlc_proto::constants::eth::HEADER_WORDS;
use mvlc_proto::eth::{PacketHeaders, NO_HEADER_POINTER};
use mvlc_proto::frame::{Frame, FrameFlags};
use mvlc_proto::readout_structure::{ModuleReadoutStructure, ReadoutStructure};
use mvlc_proto::{words_from_bytes, TransportKind};

/// One module's reassembled data: fixed-length prefix and suffix words
/// around one optional dynamic block-read payload, stored contiguously.
#[derive(Debug, Clone, Default)]
pub struct ModuleData {
    words: Vec<u32>,
    prefix_len: u32,
    dynamic_len: u32,
    suffix_len: u32,
    has_dynamic: bool,
}

impl ModuleData {
    pub fn data(&self) -> &[u32] {
        &self.words
    }

    pub fn prefix(&self) -> &[u32] {
        &self.words[..self.prefix_len as usize]
    }

    pub fn dynamic(&self) -> &[u32] {
        let start = self.prefix_len as usize;
        &self.words[start..start + self.dynamic_len as usize]
    }

    pub fn suffix(&self) -> &[u32] {
        let start = (self.prefix_len + self.dynamic_len) as usize;
        &self.words[start..]
    }

    pub fn has_dynamic(&self) -> bool {
        self.has_dynamic
    }

    pub fn prefix_len(&self) -> u32 {
        self.prefix_len
    }

    pub fn dynamic_len(&self) -> u32 {
        self.dynamic_len
    }

    pub fn suffix_len(&self) -> u32 {
        self.suffix_len
    }

    /// A module record consisting only of a dynamic part. Used by
    /// downstream assemblers re-emitting buffered module data.
    pub fn from_dynamic_words(words: Vec<u32>) -> Self {
        let dynamic_len = words.len() as u32;
        Self {
            words,
            prefix_len: 0,
            dynamic_len,
            suffix_len: 0,
            has_dynamic: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn reset_for(&mut self, structure: &ModuleReadoutStructure) {
        self.words.clear();
        self.prefix_len = 0;
        self.dynamic_len = 0;
        self.suffix_len = 0;
        self.has_dynamic = structure.has_dynamic;
    }
}

/// Consumer of parsed readout data.
pub trait ParserCallbacks {
    fn event_data(&mut self, crate_index: u8, event_index: usize, modules: &[ModuleData]);

    /// `words` is the full system event frame including its header word.
    fn system_event(&mut self, crate_index: u8, words: &[u32]);
}

/// Per-module size statistics.
#[derive(Debug, Clone, Copy)]
pub struct SizeStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
}

impl Default for SizeStats {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
        }
    }
}

impl SizeStats {
    fn update(&mut self, size: u64) {
        self.min = self.min.min(size);
        self.max = self.max.max(size);
        self.sum += size;
        self.count += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParserCounters {
    pub buffers_processed: u64,
    pub unused_bytes: u64,
    pub parser_exceptions: u64,
    pub internal_buffer_loss: u64,
    pub system_events: u64,
    pub event_hits: Vec<u64>,
    pub module_hits: Vec<Vec<u64>>,
    pub module_sizes: Vec<Vec<SizeStats>>,
}

impl std::fmt::Display for ParserCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "buffers={}, systemEvents={}, exceptions={}, bufferLoss={}, unusedBytes={}",
            self.buffers_processed,
            self.system_events,
            self.parser_exceptions,
            self.internal_buffer_loss,
            self.unused_bytes
        )?;

        for (event_index, hits) in self.event_hits.iter().enumerate() {
            writeln!(f, "event {event_index}: hits={hits}")?;

            for (module_index, module_hits) in self.module_hits[event_index].iter().enumerate() {
                let sizes = &self.module_sizes[event_index][module_index];
                let avg = if sizes.count > 0 {
                    sizes.sum as f64 / sizes.count as f64
                } else {
                    0.0
                };
                let min = if sizes.count > 0 { sizes.min } else { 0 };

                writeln!(
                    f,
                    "  module {module_index}: hits={module_hits}, sizes min={min} max={} avg={avg:.1}",
                    sizes.max
                )?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefix,
    Dynamic,
    Suffix,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameState {
    remaining: usize,
    flags: FrameFlags,
}

/// Parse state of one in-progress event.
#[derive(Debug)]
struct EventState {
    event_index: usize,
    module_index: usize,
    phase: Phase,
    prefix_filled: u16,
    suffix_filled: u16,
    frame: FrameState,
    block: Option<FrameState>,
    modules: Vec<ModuleData>,
}

#[derive(Debug)]
enum State {
    /// Scanning for the next StackFrame or SystemEvent header.
    Idle,
    InEvent(EventState),
    InSystemEvent {
        words: Vec<u32>,
        remaining: usize,
    },
    /// Consuming the rest of a frame sequence (including continuations)
    /// whose contents are not usable.
    SkippingFrame(FrameState),
}

enum Step {
    Continue,
    NeedMoreData,
}

/// The readout parser for one crate.
pub struct ReadoutParser {
    structure: ReadoutStructure,
    crate_index: u8,
    counters: ParserCounters,
    state: State,
    last_buffer_number: Option<u32>,
}

impl ReadoutParser {
    pub fn new(crate_index: u8, structure: ReadoutStructure) -> Self {
        let counters = ParserCounters {
            event_hits: vec![0; structure.len()],
            module_hits: structure.iter().map(|m| vec![0; m.len()]).collect(),
            module_sizes: structure
                .iter()
                .map(|m| vec![SizeStats::default(); m.len()])
                .collect(),
            ..Default::default()
        };

        Self {
            structure,
            crate_index,
            counters,
            state: State::Idle,
            last_buffer_number: None,
        }
    }

    pub fn counters(&self) -> &ParserCounters {
        &self.counters
    }

    /// Process one whole-frame buffer. `buffer_number` gaps are recorded
    /// as internal buffer loss and abort any in-progress event.
    pub fn process_buffer(
        &mut self,
        kind: TransportKind,
        buffer_number: u32,
        bytes: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) {
        self.counters.buffers_processed += 1;

        if let Some(last) = self.last_buffer_number {
            let expected = last.wrapping_add(1);
            if buffer_number != expected {
                let lost = buffer_number.wrapping_sub(expected);
                self.counters.internal_buffer_loss += u64::from(lost);

                if !matches!(self.state, State::Idle) {
                    self.counters.parser_exceptions += 1;
                    self.state = State::Idle;
                }
            }
        }
        self.last_buffer_number = Some(buffer_number);

        let words = words_from_bytes(bytes);
        let mut cursor = WordCursor::new(&words, kind);

        loop {
            let step = match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle => self.step_idle(&mut cursor, callbacks),
                State::InEvent(ev) => self.step_event(ev, &mut cursor, callbacks),
                State::InSystemEvent { words, remaining } => {
                    self.step_system_event(words, remaining, &mut cursor, callbacks)
                }
                State::SkippingFrame(frame) => self.step_skip(frame, &mut cursor),
            };

            match step {
                Step::Continue => {}
                Step::NeedMoreData => break,
            }
        }

        self.counters.unused_bytes += cursor.unused_words * 4 + (bytes.len() % 4) as u64;
    }

    fn step_idle(
        &mut self,
        cursor: &mut WordCursor<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Step {
        let Some(header) = cursor.next_word() else {
            return Step::NeedMoreData;
        };

        match Frame::decode(header) {
            Some(Frame::SystemEvent { len, .. }) => {
                let words = vec![header];
                self.counters.system_events += 1;
                self.step_system_event(words, usize::from(len), cursor, callbacks)
            }
            Some(Frame::Stack { len, flags, stack, .. }) => {
                // Readout stacks are numbered from 1; event index is the
                // stack id minus one.
                let event_index = usize::from(stack).wrapping_sub(1);

                let Some(module_structures) = self.structure.get(event_index) else {
                    warn!(stack, "stack id outside the configured readout structure");
                    self.counters.parser_exceptions += 1;
                    cursor.unused_words += 1;
                    return self.step_skip(
                        FrameState { remaining: usize::from(len), flags },
                        cursor,
                    );
                };

                let mut modules: Vec<ModuleData> =
                    vec![ModuleData::default(); module_structures.len()];
                for (m, s) in modules.iter_mut().zip(module_structures) {
                    m.reset_for(s);
                }

                let ev = EventState {
                    event_index,
                    module_index: 0,
                    phase: Phase::Prefix,
                    prefix_filled: 0,
                    suffix_filled: 0,
                    frame: FrameState {
                        remaining: usize::from(len),
                        flags,
                    },
                    block: None,
                    modules,
                };

                self.step_event(ev, cursor, callbacks)
            }
            _ => {
                // A word that is not a usable top-level header. Skip it;
                // the stream resynchronizes at the next plausible header.
                cursor.unused_words += 1;
                Step::Continue
            }
        }
    }

    fn step_system_event(
        &mut self,
        mut words: Vec<u32>,
        mut remaining: usize,
        cursor: &mut WordCursor<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Step {
        while remaining > 0 {
            match cursor.next_word() {
                Some(w) => {
                    words.push(w);
                    remaining -= 1;
                }
                None => {
                    self.state = State::InSystemEvent { words, remaining };
                    return Step::NeedMoreData;
                }
            }
        }

        callbacks.system_event(self.crate_index, &words);
        Step::Continue
    }

    fn step_skip(&mut self, mut frame: FrameState, cursor: &mut WordCursor<'_>) -> Step {
        loop {
            while frame.remaining > 0 {
                match cursor.next_word() {
                    Some(_) => {
                        frame.remaining -= 1;
                        cursor.unused_words += 1;
                    }
                    None => {
                        self.state = State::SkippingFrame(frame);
                        return Step::NeedMoreData;
                    }
                }
            }

            if !frame.flags.continue_flag() {
                return Step::Continue;
            }

            let Some(header) = cursor.next_word() else {
                self.state = State::SkippingFrame(frame);
                return Step::NeedMoreData;
            };

            match Frame::decode(header) {
                Some(Frame::StackContinuation { len, flags, .. }) => {
                    frame = FrameState {
                        remaining: usize::from(len),
                        flags,
                    };
                }
                _ => {
                    // continuation chain broken; rescan from here
                    cursor.unused_words += 1;
                    cursor.begin_resync();
                    return Step::Continue;
                }
            }
        }
    }

    fn step_event(
        &mut self,
        mut ev: EventState,
        cursor: &mut WordCursor<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Step {
        loop {
            if ev.module_index >= self.structure[ev.event_index].len() {
                return self.finish_event(ev, cursor, callbacks);
            }

            let structure = &self.structure[ev.event_index][ev.module_index];

            match ev.phase {
                Phase::Prefix => {
                    while ev.prefix_filled < structure.prefix_len {
                        match take_event_word(&mut ev, cursor) {
                            Ok(Some(w)) => {
                                ev.modules[ev.module_index].words.push(w);
                                ev.modules[ev.module_index].prefix_len += 1;
                                ev.prefix_filled += 1;
                            }
                            Ok(None) => {
                                self.state = State::InEvent(ev);
                                return Step::NeedMoreData;
                            }
                            Err(()) => return self.fail_event(cursor),
                        }
                    }

                    ev.phase = if structure.has_dynamic {
                        ev.block = None;
                        Phase::Dynamic
                    } else {
                        Phase::Suffix
                    };
                }

                Phase::Dynamic => {
                    if let Some(mut block) = ev.block.take() {
                        while block.remaining > 0 {
                            match take_event_word(&mut ev, cursor) {
                                Ok(Some(w)) => {
                                    block.remaining -= 1;
                                    ev.modules[ev.module_index].words.push(w);
                                    ev.modules[ev.module_index].dynamic_len += 1;
                                }
                                Ok(None) => {
                                    ev.block = Some(block);
                                    self.state = State::InEvent(ev);
                                    return Step::NeedMoreData;
                                }
                                Err(()) => return self.fail_event(cursor),
                            }
                        }

                        if !block.flags.continue_flag() {
                            ev.phase = Phase::Suffix;
                            continue;
                        }
                    }

                    // expecting a BlockRead sub-frame header
                    match take_event_word(&mut ev, cursor) {
                        Ok(Some(w)) => match Frame::decode(w) {
                            Some(Frame::BlockRead { len, flags, .. }) => {
                                ev.block = Some(FrameState {
                                    remaining: usize::from(len),
                                    flags,
                                });
                            }
                            _ => {
                                warn!(
                                    word = format_args!("0x{w:08x}"),
                                    "expected a block read frame header"
                                );
                                return self.fail_event(cursor);
                            }
                        },
                        Ok(None) => {
                            self.state = State::InEvent(ev);
                            return Step::NeedMoreData;
                        }
                        Err(()) => return self.fail_event(cursor),
                    }
                }

                Phase::Suffix => {
                    while ev.suffix_filled < structure.suffix_len {
                        match take_event_word(&mut ev, cursor) {
                            Ok(Some(w)) => {
                                ev.modules[ev.module_index].words.push(w);
                                ev.modules[ev.module_index].suffix_len += 1;
                                ev.suffix_filled += 1;
                            }
                            Ok(None) => {
                                self.state = State::InEvent(ev);
                                return Step::NeedMoreData;
                            }
                            Err(()) => return self.fail_event(cursor),
                        }
                    }

                    // module complete
                    let module = &ev.modules[ev.module_index];
                    self.counters.module_hits[ev.event_index][ev.module_index] += 1;
                    self.counters.module_sizes[ev.event_index][ev.module_index]
                        .update(module.words.len() as u64);

                    ev.module_index += 1;
                    ev.phase = Phase::Prefix;
                    ev.prefix_filled = 0;
                    ev.suffix_filled = 0;
                }
            }
        }
    }

    fn finish_event(
        &mut self,
        ev: EventState,
        cursor: &mut WordCursor<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Step {
        self.counters.event_hits[ev.event_index] += 1;
        callbacks.event_data(self.crate_index, ev.event_index, &ev.modules);

        trace!(
            event_index = ev.event_index,
            modules = ev.modules.len(),
            "event emitted"
        );

        // Trailing words in the frame sequence do not match the readout
        // structure; skip them.
        if ev.frame.remaining > 0 || ev.frame.flags.continue_flag() {
            self.counters.parser_exceptions += 1;
            return self.step_skip(ev.frame, cursor);
        }

        Step::Continue
    }

    fn fail_event(&mut self, cursor: &mut WordCursor<'_>) -> Step {
        self.counters.parser_exceptions += 1;
        cursor.begin_resync();
        self.state = State::Idle;
        Step::Continue
    }
}

/// Pull the next word belonging to the current event's frame sequence,
/// crossing StackContinuation boundaries.
///
/// `Ok(None)` means the buffer is exhausted; `Err(())` means the frame
/// sequence is inconsistent.
fn take_event_word(ev: &mut EventState, cursor: &mut WordCursor<'_>) -> Result<Option<u32>, ()> {
    while ev.frame.remaining == 0 {
        if !ev.frame.flags.continue_flag() {
            return Err(());
        }

        let Some(header) = cursor.next_word() else {
            return Ok(None);
        };

        match Frame::decode(header) {
            Some(Frame::StackContinuation { len, flags, .. }) => {
                ev.frame = FrameState {
                    remaining: usize::from(len),
                    flags,
                };
            }
            _ => return Err(()),
        }
    }

    match cursor.next_word() {
        Some(w) => {
            ev.frame.remaining -= 1;
            Ok(Some(w))
        }
        None => Ok(None),
    }
}

/// Word iterator over a buffer that transparently skips the per-packet
/// framing words of ETH buffers. After `begin_resync` an ETH cursor
/// discards data up to the next packet's header pointer; a USB cursor
/// simply continues scanning word-wise.
struct WordCursor<'a> {
    words: &'a [u32],
    pos: usize,
    kind: TransportKind,
    packet_remaining: usize,
    resync: bool,
    unused_words: u64,
}

impl<'a> WordCursor<'a> {
    fn new(words: &'a [u32], kind: TransportKind) -> Self {
        Self {
            words,
            pos: 0,
            kind,
            packet_remaining: 0,
            resync: false,
            unused_words: 0,
        }
    }

    fn begin_resync(&mut self) {
        if self.kind == TransportKind::Eth {
            // discard the rest of the current packet
            let skip = self.packet_remaining.min(self.words.len() - self.pos);
            self.pos += skip;
            self.unused_words += skip as u64;
            self.packet_remaining = 0;
            self.resync = true;
        }
    }

    fn next_word(&mut self) -> Option<u32> {
        match self.kind {
            TransportKind::Usb => {
                let w = self.words.get(self.pos).copied()?;
                self.pos += 1;
                Some(w)
            }
            TransportKind::Eth => {
                while self.packet_remaining == 0 {
                    self.start_packet()?;
                }

                let w = self.words.get(self.pos).copied()?;
                self.pos += 1;
                self.packet_remaining -= 1;
                Some(w)
            }
        }
    }

    /// Consume the two framing words of the next packet. Returns None at
    /// buffer end.
    ///
    /// Software-generated SystemEvent frames sit between packets without
    /// framing words of their own; they are delivered as plain frame
    /// words.
    fn start_packet(&mut self) -> Option<()> {
        if let Some(&word) = self.words.get(self.pos) {
            if let Some(Frame::SystemEvent { len, .. }) = Frame::decode(word) {
                self.packet_remaining = 1 + usize::from(len);
                self.resync = false;
                return Some(());
            }
        }

        if self.pos + HEADER_WORDS > self.words.len() {
            self.unused_words += (self.words.len() - self.pos) as u64;
            self.pos = self.words.len();
            return None;
        }

        let headers = PacketHeaders {
            header0: self.words[self.pos],
            header1: self.words[self.pos + 1],
        };
        self.pos += HEADER_WORDS;

        let declared = usize::from(headers.data_word_count());
        let available = self.words.len() - self.pos;
        self.packet_remaining = declared.min(available);

        if self.resync {
            let pointer = headers.next_header_pointer();

            if pointer == NO_HEADER_POINTER {
                // pure continuation packet; not usable while resyncing
                self.unused_words += self.packet_remaining as u64;
                self.pos += self.packet_remaining;
                self.packet_remaining = 0;
            } else {
                let skip = usize::from(pointer).min(self.packet_remaining);
                self.unused_words += skip as u64;
                self.pos += skip;
                self.packet_remaining -= skip;
                self.resync = false;
            }
        }

        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvlc_proto::bytes_from_words;
    use mvlc_proto::constants::{frame_flags, frame_headers};
    use mvlc_proto::eth::make_packet_headers;
    use mvlc_proto::frame::{make_frame_header, make_system_event_header};
    use mvlc_proto::readout_structure::ModuleReadoutStructure;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(usize, Vec<ModuleData>)>,
        system_events: Vec<Vec<u32>>,
    }

    impl ParserCallbacks for Recorder {
        fn event_data(&mut self, _crate_index: u8, event_index: usize, modules: &[ModuleData]) {
            self.events.push((event_index, modules.to_vec()));
        }

        fn system_event(&mut self, _crate_index: u8, words: &[u32]) {
            self.system_events.push(words.to_vec());
        }
    }

    fn structure_one_event(modules: Vec<ModuleReadoutStructure>) -> ReadoutStructure {
        vec![modules]
    }

    fn module(prefix: u16, dynamic: bool, suffix: u16) -> ModuleReadoutStructure {
        ModuleReadoutStructure {
            prefix_len: prefix,
            has_dynamic: dynamic,
            suffix_len: suffix,
            name: String::new(),
        }
    }

    fn stack_header(len: u16, flags: u8, stack: u8) -> u32 {
        make_frame_header(frame_headers::STACK_FRAME, len, flags, stack, 0)
    }

    fn continuation_header(len: u16, flags: u8, stack: u8) -> u32 {
        make_frame_header(frame_headers::STACK_CONTINUATION, len, flags, stack, 0)
    }

    fn block_header(len: u16, flags: u8) -> u32 {
        make_frame_header(frame_headers::BLOCK_READ, len, flags, 0, 0)
    }

    #[test]
    fn prefix_dynamic_suffix_module() {
        let structure = structure_one_event(vec![module(2, true, 1)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let words = vec![
            stack_header(7, 0, 1),
            0x1110, // prefix 0
            0x1111, // prefix 1
            block_header(2, 0),
            0xd0,
            0xd1,
            0x5550, // suffix
        ];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(rec.events.len(), 1);
        let (event_index, modules) = &rec.events[0];
        assert_eq!(*event_index, 0);
        assert_eq!(modules[0].prefix(), &[0x1110, 0x1111]);
        assert_eq!(modules[0].dynamic(), &[0xd0, 0xd1]);
        assert_eq!(modules[0].suffix(), &[0x5550]);
        assert_eq!(parser.counters().event_hits[0], 1);
        assert_eq!(parser.counters().module_hits[0][0], 1);
        assert_eq!(parser.counters().unused_bytes, 0);
        assert_eq!(parser.counters().parser_exceptions, 0);
    }

    #[test]
    fn block_read_continuations_are_appended() {
        let structure = structure_one_event(vec![module(0, true, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let words = vec![
            stack_header(6, 0, 1),
            block_header(2, frame_flags::CONTINUE),
            1,
            2,
            block_header(2, 0),
            3,
            4,
        ];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(rec.events.len(), 1);
        assert_eq!(rec.events[0].1[0].dynamic(), &[1, 2, 3, 4]);
    }

    #[test]
    fn events_span_stack_continuation_frames_across_buffers() {
        let structure = structure_one_event(vec![module(0, true, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let buffer1 = vec![
            stack_header(3, frame_flags::CONTINUE, 1),
            block_header(4, 0),
            10,
            11,
        ];
        let buffer2 = vec![continuation_header(2, 0, 1), 12, 13];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&buffer1), &mut rec);
        assert!(rec.events.is_empty());

        parser.process_buffer(TransportKind::Usb, 2, &bytes_from_words(&buffer2), &mut rec);

        assert_eq!(rec.events.len(), 1);
        assert_eq!(rec.events[0].1[0].dynamic(), &[10, 11, 12, 13]);
        assert_eq!(parser.counters().parser_exceptions, 0);
    }

    #[test]
    fn multi_module_events_fill_in_configured_order() {
        let structure = structure_one_event(vec![module(1, false, 0), module(0, true, 1)]);
        let mut parser = ReadoutParser::new(2, structure);
        let mut rec = Recorder::default();

        let words = vec![
            stack_header(5, 0, 1),
            0xaaaa,          // module 0 prefix
            block_header(2, 0),
            7,
            8,
            0xbbbb,          // module 1 suffix
        ];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(rec.events.len(), 1);
        let modules = &rec.events[0].1;
        assert_eq!(modules[0].prefix(), &[0xaaaa]);
        assert_eq!(modules[1].dynamic(), &[7, 8]);
        assert_eq!(modules[1].suffix(), &[0xbbbb]);
    }

    #[test]
    fn system_events_are_emitted_with_their_header() {
        let structure = structure_one_event(vec![module(1, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let sys_header = make_system_event_header(0x11, 2, false, 0);
        let words = vec![sys_header, 0x1234, 0x5678];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(rec.system_events.len(), 1);
        assert_eq!(rec.system_events[0], vec![sys_header, 0x1234, 0x5678]);
        assert_eq!(parser.counters().system_events, 1);
    }

    #[test]
    fn unknown_stack_ids_resync() {
        let structure = structure_one_event(vec![module(1, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let words = vec![
            stack_header(1, 0, 9), // stack 9 has no configured event
            0xdead,
            stack_header(1, 0, 1),
            0xbeef,
        ];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(parser.counters().parser_exceptions, 1);
        assert_eq!(rec.events.len(), 1);
        assert_eq!(rec.events[0].1[0].prefix(), &[0xbeef]);
    }

    #[test]
    fn eth_packet_framing_words_are_skipped() {
        let structure = structure_one_event(vec![module(1, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let frame = [stack_header(1, 0, 1), 0xfeed];
        let headers = make_packet_headers(0, 1, 0, frame.len() as u16, 0, 100);
        let words = vec![headers.header0, headers.header1, frame[0], frame[1]];

        parser.process_buffer(TransportKind::Eth, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(rec.events.len(), 1);
        assert_eq!(rec.events[0].1[0].prefix(), &[0xfeed]);
    }

    #[test]
    fn eth_frames_span_packets() {
        let structure = structure_one_event(vec![module(3, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        // frame of 3 payload words split across two packets
        let h1 = make_packet_headers(0, 1, 0, 3, 0, 100);
        let h2 = make_packet_headers(0, 2, 0, 1, NO_HEADER_POINTER, 101);

        let words = vec![
            h1.header0,
            h1.header1,
            stack_header(3, 0, 1),
            0x1,
            0x2,
            h2.header0,
            h2.header1,
            0x3,
        ];

        parser.process_buffer(TransportKind::Eth, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(rec.events.len(), 1);
        assert_eq!(rec.events[0].1[0].prefix(), &[0x1, 0x2, 0x3]);
    }

    #[test]
    fn eth_resync_uses_the_next_header_pointer() {
        let structure = structure_one_event(vec![module(1, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        // The first frame promises a continuation that never arrives:
        // packet 2 carries stray words instead of a continuation header.
        // Packet 3's header pointer leads past one more stray word to the
        // next valid frame.
        let h1 = make_packet_headers(0, 1, 0, 2, 0, 1);
        let h2 = make_packet_headers(0, 2, 0, 2, NO_HEADER_POINTER, 2);
        let h3 = make_packet_headers(0, 3, 0, 3, 1, 3);

        let words = vec![
            h1.header0,
            h1.header1,
            stack_header(1, frame_flags::CONTINUE, 1),
            0x1,
            h2.header0,
            h2.header1,
            0xdead, // not a continuation header
            0xbeef, // discarded while resyncing
            h3.header0,
            h3.header1,
            0x999, // skipped via the header pointer
            stack_header(1, 0, 1),
            0xfeed,
        ];

        parser.process_buffer(TransportKind::Eth, 1, &bytes_from_words(&words), &mut rec);

        assert_eq!(parser.counters().parser_exceptions, 1);
        assert_eq!(rec.events.len(), 2);
        assert_eq!(rec.events[0].1[0].prefix(), &[0x1]);
        assert_eq!(rec.events[1].1[0].prefix(), &[0xfeed]);
        // 0xdead + 0xbeef + 0x999 never reached a consumer
        assert_eq!(parser.counters().unused_bytes, 3 * 4);
    }

    #[test]
    fn buffer_loss_is_counted_and_aborts_open_events() {
        let structure = structure_one_event(vec![module(2, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        // event starts in buffer 1 but needs more data
        let buffer1 = vec![stack_header(2, frame_flags::CONTINUE, 1), 0x1];
        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&buffer1), &mut rec);

        // buffer 2 is lost; buffer 3 arrives
        let buffer3 = vec![stack_header(2, 0, 1), 0x7, 0x8];
        parser.process_buffer(TransportKind::Usb, 3, &bytes_from_words(&buffer3), &mut rec);

        assert_eq!(parser.counters().internal_buffer_loss, 1);
        assert_eq!(parser.counters().parser_exceptions, 1);
        assert_eq!(rec.events.len(), 1);
        assert_eq!(rec.events[0].1[0].prefix(), &[0x7, 0x8]);
    }

    #[test]
    fn any_buffer_split_yields_identical_events() {
        let structure = || structure_one_event(vec![module(1, true, 1)]);

        let words = vec![
            stack_header(7, frame_flags::CONTINUE, 1),
            0x1110, // prefix
            block_header(2, frame_flags::CONTINUE),
            0xd0,
            0xd1,
            block_header(2, 0),
            0xd2,
            0xd3,
            continuation_header(1, 0, 1),
            0x5550, // suffix
            stack_header(3, 0, 1),
            0x1111, // prefix
            block_header(0, 0),
            0x5551, // suffix
        ];

        // reference: everything in one buffer
        let mut reference = Recorder::default();
        {
            let mut parser = ReadoutParser::new(0, structure());
            parser.process_buffer(
                TransportKind::Usb,
                1,
                &bytes_from_words(&words),
                &mut reference,
            );
            assert_eq!(parser.counters().parser_exceptions, 0);
        }
        assert_eq!(reference.events.len(), 2);

        // frames are whole per buffer, so splits happen at frame
        // boundaries: after words 10 (first event) and 13
        for split in [10usize] {
            let mut parser = ReadoutParser::new(0, structure());
            let mut rec = Recorder::default();

            parser.process_buffer(
                TransportKind::Usb,
                1,
                &bytes_from_words(&words[..split]),
                &mut rec,
            );
            parser.process_buffer(
                TransportKind::Usb,
                2,
                &bytes_from_words(&words[split..]),
                &mut rec,
            );

            assert_eq!(parser.counters().parser_exceptions, 0, "split at {split}");
            assert_eq!(rec.events.len(), reference.events.len());

            for (a, b) in rec.events.iter().zip(&reference.events) {
                assert_eq!(a.0, b.0);
                for (ma, mb) in a.1.iter().zip(&b.1) {
                    assert_eq!(ma.data(), mb.data(), "split at {split}");
                }
            }
        }

        // splitting between the outer frame and its continuation works too
        let mut parser = ReadoutParser::new(0, structure());
        let mut rec = Recorder::default();
        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words[..8]), &mut rec);
        assert!(rec.events.is_empty());
        parser.process_buffer(TransportKind::Usb, 2, &bytes_from_words(&words[8..]), &mut rec);
        assert_eq!(rec.events.len(), 2);
        assert_eq!(rec.events[0].1[0].suffix(), &[0x5550]);
    }

    #[test]
    fn word_accounting_balances() {
        let structure = structure_one_event(vec![module(1, false, 0)]);
        let mut parser = ReadoutParser::new(0, structure);
        let mut rec = Recorder::default();

        let sys_header = make_system_event_header(0x02, 1, false, 0);
        let words = vec![
            0xdeadbeef, // stray word -> unused
            stack_header(1, 0, 1),
            0x1,
            sys_header,
            0x2,
        ];

        parser.process_buffer(TransportKind::Usb, 1, &bytes_from_words(&words), &mut rec);

        let c = parser.counters();
        let emitted_module_bytes: u64 = rec
            .events
            .iter()
            .flat_map(|(_, m)| m.iter())
            .map(|m| m.data().len() as u64 * 4)
            .sum();
        let system_event_bytes: u64 = rec
            .system_events
            .iter()
            .map(|w| w.len() as u64 * 4)
            .sum();
        // one stack frame header word
        let frame_header_bytes = 4;

        assert_eq!(
            c.unused_bytes + emitted_module_bytes + system_event_bytes + frame_header_bytes,
            (words.len() * 4) as u64
        );
    }
}
