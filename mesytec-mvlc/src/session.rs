// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Consumer threads of a readout or replay session.
//!
//! A live session runs up to five threads: the user/control thread, the
//! readout worker, the ETH throttler, the parser thread consuming filled
//! buffers, and optionally an event-builder thread running a tight
//! assembly loop. The two consumer threads here are cooperative: a stop
//! flag makes them exit at their next bounded wait, and joining returns
//! the owned state for inspection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use mvlc_common::MvlcError;
use mvlc_eventbuilder::EventBuilder;
use mvlc_readout::listfile::ZipWriteHandle;
use mvlc_readout::{BufferPool, ParserCallbacks, ReadoutParser};

const DEQUEUE_WAIT: Duration = Duration::from_millis(100);
const BUILD_WAIT: Duration = Duration::from_millis(100);

/// Consumes filled buffers: optionally records their raw contents into a
/// listfile, runs them through the parser, and returns them to the empty
/// queue.
pub struct ParserThread<C: ParserCallbacks + Send + 'static> {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<(ReadoutParser, C, Option<ZipWriteHandle>)>>,
}

impl<C: ParserCallbacks + Send + 'static> ParserThread<C> {
    pub fn spawn(
        pool: Arc<BufferPool>,
        mut parser: ReadoutParser,
        mut callbacks: C,
        mut listfile: Option<ZipWriteHandle>,
    ) -> Result<Self, MvlcError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);

        let join = std::thread::Builder::new()
            .name("readout_parser".into())
            .spawn(move || {
                debug!("parser thread starting");

                loop {
                    let Some(buffer) = pool.dequeue_filled(DEQUEUE_WAIT) else {
                        if stop2.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    };

                    if let Some(writer) = listfile.as_mut() {
                        if let Err(e) = writer.write(buffer.data()) {
                            warn!(%e, "listfile write failed, recording disabled");
                            listfile = None;
                        }
                    }

                    parser.process_buffer(
                        buffer.kind(),
                        buffer.number(),
                        buffer.data(),
                        &mut callbacks,
                    );

                    pool.enqueue_empty(buffer);
                }

                debug!("parser thread exiting");
                (parser, callbacks, listfile)
            })
            .map_err(MvlcError::Io)?;

        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Request a stop. The thread drains buffers already in the filled
    /// queue before exiting.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop and join, returning the parser (for its counters), the
    /// callbacks and the listfile writer.
    pub fn join(mut self) -> Option<(ReadoutParser, C, Option<ZipWriteHandle>)> {
        self.stop();
        self.join.take().and_then(|j| j.join().ok())
    }
}

impl<C: ParserCallbacks + Send + 'static> Drop for ParserThread<C> {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Runs the event builder's assembly loop: wait for data, build, repeat.
/// On stop a final flushing build drains all remaining data.
pub struct EventBuilderThread<C: ParserCallbacks + Send + 'static> {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<C>>,
}

impl<C: ParserCallbacks + Send + 'static> EventBuilderThread<C> {
    pub fn spawn(builder: Arc<EventBuilder>, mut callbacks: C) -> Result<Self, MvlcError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);

        let join = std::thread::Builder::new()
            .name("event_builder".into())
            .spawn(move || {
                debug!("event builder thread starting");

                while !stop2.load(Ordering::Acquire) {
                    if builder.wait_for_data(BUILD_WAIT) {
                        builder.build_events(&mut callbacks, false);
                    }
                }

                // drain everything that is left
                builder.build_events(&mut callbacks, true);

                debug!("event builder thread exiting");
                callbacks
            })
            .map_err(MvlcError::Io)?;

        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop, flush and join, returning the callbacks.
    pub fn join(mut self) -> Option<C> {
        self.stop();
        self.join.take().and_then(|j| j.join().ok())
    }
}

impl<C: ParserCallbacks + Send + 'static> Drop for EventBuilderThread<C> {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvlc_proto::constants::frame_headers::STACK_FRAME;
    use mvlc_proto::frame::make_frame_header;
    use mvlc_proto::readout_structure::ModuleReadoutStructure;
    use mvlc_proto::{bytes_from_words, TransportKind};
    use mvlc_readout::ModuleData;

    #[derive(Default)]
    struct Counting {
        events: usize,
    }

    impl ParserCallbacks for Counting {
        fn event_data(&mut self, _c: u8, _e: usize, _m: &[ModuleData]) {
            self.events += 1;
        }

        fn system_event(&mut self, _c: u8, _w: &[u32]) {}
    }

    #[test]
    fn parser_thread_drains_filled_buffers() {
        let pool = Arc::new(BufferPool::new(4, 1024));

        let structure = vec![vec![ModuleReadoutStructure {
            prefix_len: 1,
            has_dynamic: false,
            suffix_len: 0,
            name: "m".into(),
        }]];
        let parser = ReadoutParser::new(0, structure);

        let thread =
            ParserThread::spawn(Arc::clone(&pool), parser, Counting::default(), None).unwrap();

        for n in 1..=3u32 {
            let mut buffer = pool.dequeue_empty(Duration::from_millis(100)).unwrap();
            buffer.set_number(n);
            buffer.set_kind(TransportKind::Usb);
            buffer.extend_from_slice(&bytes_from_words(&[
                make_frame_header(STACK_FRAME, 1, 0, 1, 0),
                0xaa + n,
            ]));
            pool.enqueue_filled(buffer);
        }

        // give the thread time to consume everything, then stop
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.filled_len() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let (parser, callbacks, _) = thread.join().unwrap();

        assert_eq!(callbacks.events, 3);
        assert_eq!(parser.counters().event_hits[0], 3);
        assert_eq!(pool.empty_len(), 4);
    }

    #[test]
    fn event_builder_thread_flushes_on_stop() {
        use mvlc_eventbuilder::{CrateSetup, EventBuilderConfig, EventSetup};

        let builder = Arc::new(EventBuilder::new(EventBuilderConfig {
            setups: vec![EventSetup {
                enabled: true,
                main_module: (0, 0),
                crate_setups: vec![CrateSetup {
                    module_timestamp_extractors: vec![Box::new(|data: &[u32]| data[0])],
                    module_match_windows: vec![(-8, 8)],
                }],
            }],
            memory_limit: 1 << 20,
        }));

        let thread = EventBuilderThread::spawn(Arc::clone(&builder), Counting::default()).unwrap();

        for ts in [100u32, 200, 300] {
            builder.record_event_data(0, 0, &[ModuleData::from_dynamic_words(vec![ts])]);
        }

        let callbacks = thread.join().unwrap();
        assert_eq!(callbacks.events, 3);
        assert_eq!(builder.memory_usage(), 0);
    }
}
