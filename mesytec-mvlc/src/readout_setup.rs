// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Readout session setup and teardown.
//!
//! Bringing a crate into DAQ mode means uploading the readout stacks into
//! stack memory (with their offset registers), binding each stack to its
//! trigger, and finally setting the DAQ mode register. Teardown clears
//! all triggers and DAQ mode in one super transaction.

use tracing::info;

use mvlc_common::MvlcError;
use mvlc_dialog::util::{self, StackTrigger};
use mvlc_proto::readout_structure::{build_readout_structure, ReadoutStructure};
use mvlc_proto::stack_commands::StackCommandBuilder;

use crate::mvlc::Mvlc;

/// One readout stack plus the trigger that starts it. Stack N+1 of the
/// controller reads out event index N.
pub struct EventReadout {
    pub stack: StackCommandBuilder,
    pub trigger: StackTrigger,
}

/// Upload all readout stacks, bind their triggers and enable DAQ mode.
/// Returns the parser skeleton derived from the stack definitions.
pub fn init_readout(mvlc: &Mvlc, events: &[EventReadout]) -> Result<ReadoutStructure, MvlcError> {
    let stacks: Vec<StackCommandBuilder> = events.iter().map(|e| e.stack.clone()).collect();
    let triggers: Vec<StackTrigger> = events.iter().map(|e| e.trigger).collect();

    mvlc.with_dialog(|dialog| {
        util::disable_all_triggers_and_daq_mode(dialog)?;
        util::reset_stack_offsets(dialog)?;
        util::setup_readout_stacks(dialog, &stacks)?;
        util::setup_readout_triggers(dialog, &triggers)?;
        util::enable_daq_mode(dialog)?;
        Ok(())
    })?;

    info!(events = events.len(), "readout initialized, DAQ mode enabled");

    Ok(build_readout_structure(&stacks))
}

/// End-of-run teardown: clear all stack triggers and DAQ mode atomically.
pub fn stop_readout(mvlc: &Mvlc) -> Result<(), MvlcError> {
    mvlc.with_dialog(util::disable_all_triggers_and_daq_mode)?;
    info!("readout stopped, triggers and DAQ mode cleared");
    Ok(())
}

/// Enumerate all on-device stack slots.
pub fn read_stack_slots(mvlc: &Mvlc) -> Result<Vec<util::StackInfo>, MvlcError> {
    mvlc.with_dialog(util::read_all_stack_infos)
}
