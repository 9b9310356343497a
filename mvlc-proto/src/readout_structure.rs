// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Derivation of the readout parser's state skeleton from stack
//! definitions.
//!
//! Each readout stack corresponds to one event; each group within the
//! stack reads out one module. A module's readout consists of a fixed
//! number of prefix words (single-cycle reads and markers before the
//! block transfer), one optional dynamic block-read payload, and a fixed
//! number of suffix words after it.

use crate::stack_commands::{StackCommand, StackCommandBuilder};

/// Parser skeleton for one module within an event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleReadoutStructure {
    pub prefix_len: u16,
    pub has_dynamic: bool,
    pub suffix_len: u16,
    pub name: String,
}

impl ModuleReadoutStructure {
    pub fn is_empty(&self) -> bool {
        self.prefix_len == 0 && !self.has_dynamic && self.suffix_len == 0
    }
}

/// Skeleton for all configured events: `structure[event_index][module_index]`.
pub type ReadoutStructure = Vec<Vec<ModuleReadoutStructure>>;

/// Number of fixed output words a command contributes to the readout data
/// stream, or None for the dynamic block-read part.
fn fixed_words(cmd: &StackCommand) -> Option<u16> {
    match cmd {
        StackCommand::VmeRead { .. } | StackCommand::ReadToAccu { .. } => Some(1),
        StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => Some(1),
        StackCommand::VmeBlockRead { .. } => None,
        StackCommand::VmeWrite { .. }
        | StackCommand::AddressIncMode { .. }
        | StackCommand::Wait { .. }
        | StackCommand::MaskShiftAccu { .. }
        | StackCommand::SignalAccu
        | StackCommand::SetAccu { .. }
        | StackCommand::CompareLoopAccu { .. } => Some(0),
    }
}

/// Compute the per-module readout structure of one readout stack.
pub fn module_structures(stack: &StackCommandBuilder) -> Vec<ModuleReadoutStructure> {
    stack
        .groups()
        .iter()
        .map(|group| {
            let mut m = ModuleReadoutStructure {
                name: group.name.clone(),
                ..Default::default()
            };

            for cmd in &group.commands {
                match fixed_words(cmd) {
                    Some(n) if !m.has_dynamic => m.prefix_len += n,
                    Some(n) => m.suffix_len += n,
                    None => m.has_dynamic = true,
                }
            }

            m
        })
        .collect()
}

/// Compute the full readout structure from the readout stacks in event
/// order (stack N reads out event index N-1).
pub fn build_readout_structure(readout_stacks: &[StackCommandBuilder]) -> ReadoutStructure {
    readout_stacks.iter().map(module_structures).collect()
}
