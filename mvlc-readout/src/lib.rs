// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The readout pipeline.
//!
//! A readout worker drives continuous data-pipe reads into a pool of
//! buffers that circulate between an empty and a filled queue; the
//! readout parser turns whole-frame buffers back into per-event,
//! per-module records; the replay worker feeds the same pipeline from a
//! listfile instead of a live transport.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod buffer;
pub mod listfile;
pub mod parser;
pub mod replay;
pub mod worker;

pub use buffer::{BufferPool, ReadoutBuffer};
pub use parser::{ModuleData, ParserCallbacks, ParserCounters, ReadoutParser};
pub use replay::ReplayWorker;
pub use worker::{ReadoutCounters, ReadoutWorker, WorkerState};
