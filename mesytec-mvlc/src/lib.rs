// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Driver and readout framework for the Mesytec MVLC VME controller.
//!
//! The MVLC bridges a host computer (USB3 or Gigabit Ethernet/UDP) to a
//! crate of VME data-acquisition modules. The host issues individual VME
//! cycles, uploads command stacks the controller executes autonomously at
//! trigger time, streams out the resulting readout data, parses it back
//! into per-event/per-module records and optionally performs cross-crate
//! event building based on module timestamps.
//!
//! [`Mvlc`] is the central handle combining the transport and the dialog
//! layer behind command and data locks. The readout path lives in
//! [`mvlc_readout`]; cross-crate assembly in [`mvlc_eventbuilder`].
//!
//! A minimal live readout session:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mesytec_mvlc::dialog_util::StackTrigger;
//! use mesytec_mvlc::session::ParserThread;
//! use mesytec_mvlc::stacks::TriggerType;
//! use mesytec_mvlc::{
//!     readout_setup, vme_amods, BufferPool, ModuleData, Mvlc, ParserCallbacks,
//!     ReadoutParser, StackCommandBuilder, WorkerState,
//! };
//!
//! struct Printer;
//!
//! impl ParserCallbacks for Printer {
//!     fn event_data(&mut self, _crate_index: u8, event_index: usize, modules: &[ModuleData]) {
//!         println!("event {event_index}: {} modules", modules.len());
//!     }
//!
//!     fn system_event(&mut self, _crate_index: u8, words: &[u32]) {
//!         println!("system event, {} words", words.len());
//!     }
//! }
//!
//! fn main() -> Result<(), mesytec_mvlc::MvlcError> {
//!     let mvlc = Mvlc::eth("mvlc-0042");
//!     mvlc.connect()?;
//!
//!     // one event: a single module read out with one block transfer
//!     let mut stack = StackCommandBuilder::new();
//!     stack.begin_group("mdpp16");
//!     stack.add_vme_block_read(0x0, vme_amods::A32_USER_BLOCK, 0xffff);
//!
//!     let structure = readout_setup::init_readout(
//!         &mvlc,
//!         &[readout_setup::EventReadout {
//!             stack,
//!             trigger: StackTrigger {
//!                 trigger_type: TriggerType::IrqNoIack,
//!                 irq_level: 1,
//!             },
//!         }],
//!     )?;
//!
//!     let pool = Arc::new(BufferPool::default());
//!     let mut worker = mvlc.readout_worker(Arc::clone(&pool));
//!     let parser = ReadoutParser::new(0, structure);
//!     let parser_thread = ParserThread::spawn(Arc::clone(&pool), parser, Printer, None)?;
//!
//!     worker.start()?;
//!     std::thread::sleep(Duration::from_secs(10));
//!
//!     worker.stop()?;
//!     worker.wait_for_state(WorkerState::Idle, Duration::from_secs(5));
//!     parser_thread.join();
//!
//!     readout_setup::stop_readout(&mvlc)?;
//!     mvlc.disconnect()?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod mvlc;
pub mod readout_setup;
pub mod session;

pub use mvlc::{Mvlc, SharedTransport};
pub use session::{EventBuilderThread, ParserThread};

pub use mvlc_common::{ErrorKind, MvlcError};
pub use mvlc_dialog::{util as dialog_util, Dialog, StackErrorCounters};
pub use mvlc_eventbuilder as eventbuilder;
pub use mvlc_proto::constants::{
    registers, stacks, vme_amods, Pipe, VmeDataWidth,
};
pub use mvlc_proto::readout_structure::{build_readout_structure, ReadoutStructure};
pub use mvlc_proto::stack_commands::{StackCommand, StackCommandBuilder};
pub use mvlc_proto::super_commands::{SuperCommand, SuperCommandBuilder};
pub use mvlc_proto::{Frame, TransportKind};
pub use mvlc_readout::{
    BufferPool, ModuleData, ParserCallbacks, ReadoutBuffer, ReadoutParser, ReadoutWorker,
    ReplayWorker, WorkerState,
};
pub use mvlc_transport::{EthTransport, Transport, UsbTransport};
