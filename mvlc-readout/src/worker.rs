// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The readout worker: a dedicated thread driving continuous data-pipe
//! reads into the buffer pool.
//!
//! State transitions are requested through an atomic desired-state and
//! observed through a waitable state value. While reading, the worker
//! holds the transport's data lock so command traffic on the other pipe
//! proceeds concurrently.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use mvlc_common::{MvlcError, Protected, WaitableProtected};
use mvlc_proto::constants::eth::JUMBO_FRAME_MAX_SIZE;
use mvlc_proto::constants::usb::USB_STREAM_PIPE_READ_SIZE;
use mvlc_proto::fixup::fixup_usb_buffer;
use mvlc_proto::{Pipe, PipeIo, TransportKind};
use mvlc_transport::ReadoutTransport;

use crate::buffer::BufferPool;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Paused = 3,
    Stopping = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> WorkerState {
        match value {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Paused,
            4 => WorkerState::Stopping,
            _ => WorkerState::Idle,
        }
    }
}

/// Counters of one readout run.
#[derive(Debug, Clone, Default)]
pub struct ReadoutCounters {
    pub buffers_read: u64,
    pub buffers_flushed: u64,
    pub bytes_read: u64,
    pub read_timeouts: u64,
    pub empty_buffer_waits: u64,
    pub last_error: Option<String>,
}

/// Tuning knobs of the readout loop.
#[derive(Debug, Clone, Copy)]
pub struct ReadoutWorkerOptions {
    /// A partially filled buffer is flushed after this long.
    pub flush_timeout: Duration,
    /// Stop appending reads once a buffer holds this many bytes.
    pub buffer_fill_target: usize,
    /// Bounded wait for an empty buffer per iteration.
    pub empty_buffer_wait: Duration,
}

impl Default for ReadoutWorkerOptions {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_millis(500),
            buffer_fill_target: BufferPool::DEFAULT_BUFFER_CAPACITY,
            empty_buffer_wait: Duration::from_millis(100),
        }
    }
}

struct WorkerShared {
    state: WaitableProtected<WorkerState>,
    desired: AtomicU8,
    counters: Protected<ReadoutCounters>,
}

impl WorkerShared {
    fn set_state(&self, state: WorkerState) {
        self.state.update(|s| *s = state);
    }

    fn desired(&self) -> WorkerState {
        WorkerState::from_u8(self.desired.load(Ordering::Acquire))
    }

    fn set_desired(&self, state: WorkerState) {
        self.desired.store(state as u8, Ordering::Release);
    }
}

/// Drives readout from a connected transport into a buffer pool.
pub struct ReadoutWorker<R: ReadoutTransport + Clone + Send + 'static> {
    transport: R,
    data_lock: Arc<Mutex<()>>,
    pool: Arc<BufferPool>,
    options: ReadoutWorkerOptions,
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl<R: ReadoutTransport + Clone + Send + 'static> ReadoutWorker<R> {
    pub fn new(transport: R, data_lock: Arc<Mutex<()>>, pool: Arc<BufferPool>) -> Self {
        Self::with_options(transport, data_lock, pool, ReadoutWorkerOptions::default())
    }

    pub fn with_options(
        transport: R,
        data_lock: Arc<Mutex<()>>,
        pool: Arc<BufferPool>,
        options: ReadoutWorkerOptions,
    ) -> Self {
        Self {
            transport,
            data_lock,
            pool,
            options,
            shared: Arc::new(WorkerShared {
                state: WaitableProtected::new(WorkerState::Idle),
                desired: AtomicU8::new(WorkerState::Idle as u8),
                counters: Protected::new(ReadoutCounters::default()),
            }),
            join: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state.copy()
    }

    /// Wait until the worker reaches `state`, bounded by `timeout`.
    pub fn wait_for_state(&self, state: WorkerState, timeout: Duration) -> bool {
        self.shared.state.wait_for(timeout, |s| *s == state)
    }

    pub fn counters(&self) -> ReadoutCounters {
        self.shared.counters.copy()
    }

    pub fn start(&mut self) -> Result<(), MvlcError> {
        if self.state() != WorkerState::Idle {
            return Err(MvlcError::WorkerNotIdle);
        }

        self.shared.set_state(WorkerState::Starting);
        self.shared.set_desired(WorkerState::Running);

        let transport = self.transport.clone();
        let data_lock = Arc::clone(&self.data_lock);
        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);
        let options = self.options;

        let join = std::thread::Builder::new()
            .name("readout_worker".into())
            .spawn(move || readout_loop(transport, data_lock, pool, shared, options))
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

    /// Request a stop and join the worker thread.
    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl<R: ReadoutTransport + Clone + Send + 'static> Drop for ReadoutWorker<R> {
    fn drop(&mut self) {
        self.shared.set_desired(WorkerState::Stopping);
        self.join();
    }
}

const PAUSE_SLEEP: Duration = Duration::from_millis(100);

fn readout_loop<R: ReadoutTransport>(
    transport: R,
    data_lock: Arc<Mutex<()>>,
    pool: Arc<BufferPool>,
    shared: Arc<WorkerShared>,
    options: ReadoutWorkerOptions,
) {
    debug!("readout worker thread starting");

    *shared.counters.access() = ReadoutCounters::default();
    shared.set_state(WorkerState::Running);

    let kind = transport.kind();
    let mut leftover: Vec<u8> = Vec::new();
    let mut next_buffer_number = 1u32;

    loop {
        let state = shared.state.copy();
        let desired = shared.desired();

        if state == WorkerState::Running && desired == WorkerState::Running {
            let Some(mut buffer) = pool.dequeue_empty(options.empty_buffer_wait) else {
                shared.counters.access().empty_buffer_waits += 1;
                continue;
            };

            buffer.clear();
            buffer.set_number(next_buffer_number);
            buffer.set_kind(kind);

            if !leftover.is_empty() {
                buffer.ensure_free_space(leftover.len());
                buffer.extend_from_slice(&leftover);
                leftover.clear();
            }

            let fatal = {
                let _guard = match data_lock.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };

                match kind {
                    TransportKind::Usb => {
                        fill_from_usb(&transport, &mut buffer, &shared, &options)
                    }
                    TransportKind::Eth => {
                        fill_from_eth(&transport, &mut buffer, &shared, &options)
                    }
                }
            };

            if kind == TransportKind::Usb {
                let mut fixed = Vec::new();
                let used = fixup_usb_buffer(buffer.data(), &mut fixed);
                buffer.truncate(used);
                leftover = fixed;
            }

            if buffer.used() > 0 {
                next_buffer_number = next_buffer_number.wrapping_add(1);
                shared.counters.access().buffers_flushed += 1;
                pool.enqueue_filled(buffer);
            } else {
                pool.enqueue_empty(buffer);
            }

            if let Some(e) = fatal {
                error!(%e, "fatal readout error, stopping");
                shared.counters.access().last_error = Some(e.to_string());
                break;
            }
        } else if state == WorkerState::Running && desired == WorkerState::Paused {
            shared.set_state(WorkerState::Paused);
            debug!("readout paused");
        } else if state == WorkerState::Paused && desired == WorkerState::Running {
            shared.set_state(WorkerState::Running);
            debug!("readout resumed");
        } else if desired == WorkerState::Stopping {
            debug!("readout requested to stop");
            break;
        } else if state == WorkerState::Paused {
            std::thread::sleep(PAUSE_SLEEP);
        } else {
            warn!(?state, ?desired, "unexpected readout worker state");
            break;
        }
    }

    shared.set_state(WorkerState::Stopping);
    shared.set_state(WorkerState::Idle);

    debug!("readout worker thread exiting");
}

/// Issue back-to-back stream reads until the buffer is filled to the
/// target or the flush timeout elapses. Returns a fatal error, if any.
fn fill_from_usb<R: ReadoutTransport>(
    transport: &R,
    buffer: &mut crate::buffer::ReadoutBuffer,
    shared: &WorkerShared,
    options: &ReadoutWorkerOptions,
) -> Option<MvlcError> {
    let start = Instant::now();

    while buffer.used() < options.buffer_fill_target && start.elapsed() < options.flush_timeout {
        buffer.ensure_free_space(USB_STREAM_PIPE_READ_SIZE);

        let mut fatal = None;
        let produced = buffer.fill_tail(USB_STREAM_PIPE_READ_SIZE, |tail| {
            match transport.read(Pipe::Data, tail) {
                Ok(n) => n,
                Err(e) if e.is_timeout() => {
                    shared.counters.access().read_timeouts += 1;
                    0
                }
                Err(e) => {
                    fatal = Some(e);
                    0
                }
            }
        });

        if let Some(e) = fatal {
            return Some(e);
        }

        if produced > 0 {
            let mut counters = shared.counters.access();
            counters.buffers_read += 1;
            counters.bytes_read += produced as u64;
        }
    }

    None
}

/// Gather whole UDP packets (framing words included) into the buffer tail
/// until the fill target or the flush timeout is reached.
fn fill_from_eth<R: ReadoutTransport>(
    transport: &R,
    buffer: &mut crate::buffer::ReadoutBuffer,
    shared: &WorkerShared,
    options: &ReadoutWorkerOptions,
) -> Option<MvlcError> {
    let start = Instant::now();

    while buffer.used() < options.buffer_fill_target && start.elapsed() < options.flush_timeout {
        buffer.ensure_free_space(JUMBO_FRAME_MAX_SIZE);

        let mut fatal = None;
        let produced = buffer.fill_tail(JUMBO_FRAME_MAX_SIZE, |tail| {
            match transport.read_data_packet(tail) {
                Ok(n) => n,
                Err(e) if e.is_timeout() => {
                    shared.counters.access().read_timeouts += 1;
                    0
                }
                Err(e) if matches!(e.kind(), mvlc_common::ErrorKind::Protocol) => {
                    // malformed packet: account and keep reading
                    warn!(%e, "dropping malformed data packet");
                    0
                }
                Err(e) => {
                    fatal = Some(e);
                    0
                }
            }
        });

        if let Some(e) = fatal {
            return Some(e);
        }

        if produced > 0 {
            let mut counters = shared.counters.access();
            counters.buffers_read += 1;
            counters.bytes_read += produced as u64;
        }
    }

    None
}
