// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The replay worker: drives the readout pipeline from a listfile instead
//! of a live transport.
//!
//! The listfile format (USB frames or ETH packets) is detected once from
//! the preamble magic. Reads are fixed up with the same routines as the
//! live path so consumers again only see whole frames or packets.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use mvlc_common::{MvlcError, Protected, WaitableProtected};
use mvlc_proto::fixup::{fixup_eth_buffer, fixup_usb_buffer};
use mvlc_proto::TransportKind;

use crate::buffer::BufferPool;
use crate::listfile::{read_preamble, ReadHandle};
use crate::worker::WorkerState;

/// Counters of one replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayCounters {
    pub buffers_read: u64,
    pub buffers_flushed: u64,
    pub bytes_read: u64,
    pub last_error: Option<String>,
}

struct ReplayShared {
    state: WaitableProtected<WorkerState>,
    desired: AtomicU8,
    counters: Protected<ReplayCounters>,
}

impl ReplayShared {
    fn set_state(&self, state: WorkerState) {
        self.state.update(|s| *s = state);
    }

    fn desired(&self) -> WorkerState {
        match self.desired.load(Ordering::Acquire) {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Paused,
            4 => WorkerState::Stopping,
            _ => WorkerState::Idle,
        }
    }

    fn set_desired(&self, state: WorkerState) {
        self.desired.store(state as u8, Ordering::Release);
    }
}

/// Replays a listfile stream into the buffer pool, with the same state
/// machine and pause/resume semantics as the readout worker.
pub struct ReplayWorker {
    pool: Arc<BufferPool>,
    shared: Arc<ReplayShared>,
    join: Option<JoinHandle<()>>,
}

const FREE_BUFFER_WAIT: Duration = Duration::from_millis(100);
const PAUSE_SLEEP: Duration = Duration::from_millis(100);

impl ReplayWorker {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            shared: Arc::new(ReplayShared {
                state: WaitableProtected::new(WorkerState::Idle),
                desired: AtomicU8::new(WorkerState::Idle as u8),
                counters: Protected::new(ReplayCounters::default()),
            }),
            join: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state.copy()
    }

    pub fn wait_for_state(&self, state: WorkerState, timeout: Duration) -> bool {
        self.shared.state.wait_for(timeout, |s| *s == state)
    }

    pub fn counters(&self) -> ReplayCounters {
        self.shared.counters.copy()
    }

    /// Start replaying from `handle`. The stream must begin with a
    /// listfile magic.
    pub fn start(&mut self, handle: Box<dyn ReadHandle>) -> Result<(), MvlcError> {
        if self.state() != WorkerState::Idle {
            return Err(MvlcError::WorkerNotIdle);
        }

        self.shared.set_state(WorkerState::Starting);
        self.shared.set_desired(WorkerState::Running);

        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);

        let join = std::thread::Builder::new()
            .name("replay_worker".into())
            .spawn(move || replay_loop(handle, pool, shared))
            .map_err(MvlcError::Io)?;

        self.join = Some(join);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), MvlcError> {
        let state = self.state();

        if matches!(state, WorkerState::Idle | WorkerState::Stopping) {
            return Err(MvlcError::WorkerNotRunning);
        }

        self.shared.set_desired(WorkerState::Stopping);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), MvlcError> {
        if self.state() != WorkerState::Running {
            return Err(MvlcError::WorkerNotRunning);
        }

        self.shared.set_desired(WorkerState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), MvlcError> {
        if self.state() != WorkerState::Paused {
            return Err(MvlcError::WorkerNotPaused);
        }

        self.shared.set_desired(WorkerState::Running);
        Ok(())
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReplayWorker {
    fn drop(&mut self) {
        self.shared.set_desired(WorkerState::Stopping);
        self.join();
    }
}

fn replay_loop(mut handle: Box<dyn ReadHandle>, pool: Arc<BufferPool>, shared: Arc<ReplayShared>) {
    debug!("replay worker thread starting");

    *shared.counters.access() = ReplayCounters::default();

    let format = match read_preamble(handle.as_mut()) {
        Ok(preamble) => preamble.kind,
        Err(e) => {
            shared.counters.access().last_error = Some(e.to_string());
            shared.set_state(WorkerState::Idle);
            return;
        }
    };

    debug!(?format, "replay listfile format detected");

    shared.set_state(WorkerState::Running);

    let mut leftover: Vec<u8> = Vec::new();
    let mut next_buffer_number = 1u32;

    loop {
        let state = shared.state.copy();
        let desired = shared.desired();

        if state == WorkerState::Running && desired == WorkerState::Running {
            let Some(mut buffer) = pool.dequeue_empty(FREE_BUFFER_WAIT) else {
                continue;
            };

            buffer.clear();
            buffer.set_number(next_buffer_number);
            buffer.set_kind(format);

            if !leftover.is_empty() {
                buffer.ensure_free_space(leftover.len());
                buffer.extend_from_slice(&leftover);
                leftover.clear();
            }

            let free = buffer.free().max(64 * 1024);
            let mut read_error = None;

            let bytes_read = buffer.fill_tail(free, |tail| match handle.read(tail) {
                Ok(n) => n,
                Err(e) => {
                    read_error = Some(e);
                    0
                }
            });

            if let Some(e) = read_error {
                shared.counters.access().last_error = Some(e.to_string());
                pool.enqueue_empty(buffer);
                break;
            }

            if bytes_read == 0 && buffer.is_empty() {
                // end of stream
                pool.enqueue_empty(buffer);
                break;
            }

            {
                let mut counters = shared.counters.access();
                counters.buffers_read += 1;
                counters.bytes_read += bytes_read as u64;
            }

            let used = match format {
                TransportKind::Usb => fixup_usb_buffer(buffer.data(), &mut leftover),
                TransportKind::Eth => fixup_eth_buffer(buffer.data(), &mut leftover),
            };
            buffer.truncate(used);

            if buffer.used() > 0 {
                next_buffer_number = next_buffer_number.wrapping_add(1);
                shared.counters.access().buffers_flushed += 1;
                pool.enqueue_filled(buffer);
            } else if bytes_read == 0 {
                // only an incomplete tail is left in the stream
                pool.enqueue_empty(buffer);
                break;
            } else {
                pool.enqueue_empty(buffer);
            }
        } else if state == WorkerState::Running && desired == WorkerState::Paused {
            shared.set_state(WorkerState::Paused);
            debug!("replay paused");
        } else if state == WorkerState::Paused && desired == WorkerState::Running {
            shared.set_state(WorkerState::Running);
            debug!("replay resumed");
        } else if desired == WorkerState::Stopping {
            debug!("replay requested to stop");
            break;
        } else if state == WorkerState::Paused {
            std::thread::sleep(PAUSE_SLEEP);
        } else {
            break;
        }
    }

    shared.set_state(WorkerState::Stopping);
    shared.set_state(WorkerState::Idle);

    debug!("replay worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listfile::MAGIC_USB;

    struct VecHandle {
        data: Vec<u8>,
        pos: usize,
    }

    impl ReadHandle for VecHandle {
        fn read(&mut self, dest: &mut [u8]) -> Result<usize, MvlcError> {
            let n = (self.data.len() - self.pos).min(dest.len());
            dest[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn bad_magic_leaves_the_worker_idle_with_an_error() {
        let pool = Arc::new(BufferPool::new(2, 1024));
        let mut worker = ReplayWorker::new(Arc::clone(&pool));

        let handle = VecHandle {
            data: b"GARBAGE!rest".to_vec(),
            pos: 0,
        };

        worker.start(Box::new(handle)).unwrap();
        worker.join();

        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.counters().last_error.is_some());
        assert_eq!(worker.counters().buffers_flushed, 0);
    }

    #[test]
    fn usb_stream_is_replayed_as_whole_frames() {
        use mvlc_proto::bytes_from_words;
        use mvlc_proto::constants::frame_headers::STACK_FRAME;
        use mvlc_proto::frame::make_frame_header;

        let frames = vec![
            make_frame_header(STACK_FRAME, 2, 0, 1, 0),
            0x0101,
            0x0202,
            make_frame_header(STACK_FRAME, 1, 0, 1, 0),
            0x0303,
        ];

        let mut data = MAGIC_USB.to_vec();
        data.extend_from_slice(&bytes_from_words(&frames));

        let pool = Arc::new(BufferPool::new(4, 1024));
        let mut worker = ReplayWorker::new(Arc::clone(&pool));

        worker
            .start(Box::new(VecHandle { data, pos: 0 }))
            .unwrap();
        worker.join();

        let buffer = pool.dequeue_filled(Duration::from_millis(100)).unwrap();
        assert_eq!(buffer.number(), 1);
        assert_eq!(buffer.kind(), TransportKind::Usb);
        assert_eq!(buffer.view_u32(), frames);

        assert_eq!(worker.counters().buffers_flushed, 1);
        assert_eq!(worker.counters().last_error, None);
    }

    #[test]
    fn state_control_errors() {
        let pool = Arc::new(BufferPool::new(1, 64));
        let mut worker = ReplayWorker::new(pool);

        assert!(matches!(worker.stop(), Err(MvlcError::WorkerNotRunning)));
        assert!(matches!(worker.pause(), Err(MvlcError::WorkerNotRunning)));
        assert!(matches!(worker.resume(), Err(MvlcError::WorkerNotPaused)));
    }
}
