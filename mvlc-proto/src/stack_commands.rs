// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Stack command primitives, the grouped stack builder and the stack
//! buffer encoding.
//!
//! A stack is a VME-level program executed by the MVLC on a trigger. The
//! encoded form is `[StackStart, <encoded commands>, StackEnd]`, laid out
//! in the device's stack memory at word-granular offsets. Groups exist for
//! bookkeeping only (one group per VME module by convention); they do not
//! affect the encoding.

use mvlc_common::MvlcError;

use crate::constants::stack_commands::*;
use crate::constants::{Pipe, VmeDataWidth};

/// Address increment behavior of block transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressIncMode {
    /// Re-read the same address (FIFO reads).
    Fifo = 0,
    /// Increment the address after each transfer.
    Memory = 1,
}

/// Comparison applied by `CompareLoopAccu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccuComparator {
    Eq = 0,
    Lt = 1,
    Gt = 2,
}

/// A single stack command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCommand {
    VmeRead { address: u32, amod: u8, dw: VmeDataWidth },
    VmeBlockRead { address: u32, amod: u8, max_transfers: u16 },
    VmeWrite { address: u32, value: u32, amod: u8, dw: VmeDataWidth },
    /// Write a literal word into the output stream.
    WriteMarker { value: u32 },
    /// Write an MVLC-internal special value (24 bits) into the output.
    WriteSpecial { value: u32 },
    AddressIncMode { mode: AddressIncMode },
    /// Stall stack execution for the given number of cycles (24 bits).
    Wait { cycles: u32 },
    MaskShiftAccu { mask: u32, shift: u8 },
    SignalAccu,
    SetAccu { value: u32 },
    ReadToAccu { address: u32, amod: u8, dw: VmeDataWidth },
    CompareLoopAccu { cmp: AccuComparator, value: u32 },
}

impl StackCommand {
    /// Encoded size in 32-bit words. A pure function of the variant.
    pub fn encoded_size(&self) -> usize {
        match self {
            StackCommand::VmeRead { .. } => 2,
            StackCommand::VmeBlockRead { .. } => 2,
            StackCommand::VmeWrite { .. } => 3,
            StackCommand::WriteMarker { .. } => 2,
            StackCommand::WriteSpecial { .. } => 1,
            StackCommand::AddressIncMode { .. } => 1,
            StackCommand::Wait { .. } => 1,
            StackCommand::MaskShiftAccu { .. } => 2,
            StackCommand::SignalAccu => 1,
            StackCommand::SetAccu { .. } => 2,
            StackCommand::ReadToAccu { .. } => 2,
            StackCommand::CompareLoopAccu { .. } => 2,
        }
    }

    fn encode_into(&self, out: &mut Vec<u32>) {
        match *self {
            StackCommand::VmeRead { address, amod, dw } => {
                out.push(read_word(VME_READ, amod, dw));
                out.push(address);
            }
            StackCommand::VmeBlockRead { address, amod, max_transfers } => {
                out.push(
                    (u32::from(VME_BLOCK_READ) << STACK_CMD_SHIFT)
                        | (u32::from(amod) << 16)
                        | u32::from(max_transfers),
                );
                out.push(address);
            }
            StackCommand::VmeWrite { address, value, amod, dw } => {
                out.push(read_word(VME_WRITE, amod, dw));
                out.push(address);
                out.push(value);
            }
            StackCommand::WriteMarker { value } => {
                out.push(u32::from(WRITE_MARKER) << STACK_CMD_SHIFT);
                out.push(value);
            }
            StackCommand::WriteSpecial { value } => {
                out.push((u32::from(WRITE_SPECIAL) << STACK_CMD_SHIFT) | (value & 0x00ff_ffff));
            }
            StackCommand::AddressIncMode { mode } => {
                out.push((u32::from(ADDRESS_INC_MODE) << STACK_CMD_SHIFT) | mode as u32);
            }
            StackCommand::Wait { cycles } => {
                out.push((u32::from(WAIT) << STACK_CMD_SHIFT) | (cycles & 0x00ff_ffff));
            }
            StackCommand::MaskShiftAccu { mask, shift } => {
                out.push((u32::from(MASK_SHIFT_ACCU) << STACK_CMD_SHIFT) | u32::from(shift));
                out.push(mask);
            }
            StackCommand::SignalAccu => {
                out.push(u32::from(SIGNAL_ACCU) << STACK_CMD_SHIFT);
            }
            StackCommand::SetAccu { value } => {
                out.push(u32::from(SET_ACCU) << STACK_CMD_SHIFT);
                out.push(value);
            }
            StackCommand::ReadToAccu { address, amod, dw } => {
                out.push(read_word(READ_TO_ACCU, amod, dw));
                out.push(address);
            }
            StackCommand::CompareLoopAccu { cmp, value } => {
                out.push((u32::from(COMPARE_LOOP_ACCU) << STACK_CMD_SHIFT) | cmp as u32);
                out.push(value);
            }
        }
    }
}

fn read_word(cmd: u8, amod: u8, dw: VmeDataWidth) -> u32 {
    (u32::from(cmd) << STACK_CMD_SHIFT) | (u32::from(amod) << 16) | (u32::from(dw as u8) << 8)
}

impl std::fmt::Display for StackCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            StackCommand::VmeRead { address, amod, dw } => {
                write!(f, "vme_read 0x{address:08x} amod=0x{amod:02x} {dw:?}")
            }
            StackCommand::VmeBlockRead { address, amod, max_transfers } => write!(
                f,
                "vme_block_read 0x{address:08x} amod=0x{amod:02x} max_transfers={max_transfers}"
            ),
            StackCommand::VmeWrite { address, value, amod, dw } => write!(
                f,
                "vme_write 0x{address:08x} 0x{value:08x} amod=0x{amod:02x} {dw:?}"
            ),
            StackCommand::WriteMarker { value } => write!(f, "write_marker 0x{value:08x}"),
            StackCommand::WriteSpecial { value } => write!(f, "write_special 0x{value:06x}"),
            StackCommand::AddressIncMode { mode } => write!(f, "address_inc_mode {mode:?}"),
            StackCommand::Wait { cycles } => write!(f, "wait {cycles}"),
            StackCommand::MaskShiftAccu { mask, shift } => {
                write!(f, "mask_shift_accu mask=0x{mask:08x} shift={shift}")
            }
            StackCommand::SignalAccu => write!(f, "signal_accu"),
            StackCommand::SetAccu { value } => write!(f, "set_accu 0x{value:08x}"),
            StackCommand::ReadToAccu { address, amod, dw } => {
                write!(f, "read_to_accu 0x{address:08x} amod=0x{amod:02x} {dw:?}")
            }
            StackCommand::CompareLoopAccu { cmp, value } => {
                write!(f, "compare_loop_accu {cmp:?} 0x{value:08x}")
            }
        }
    }
}

/// A named list of stack commands. By convention one group reads out one
/// VME module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackGroup {
    pub name: String,
    pub commands: Vec<StackCommand>,
}

/// Builds a stack as an ordered list of groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackCommandBuilder {
    groups: Vec<StackGroup>,
}

impl StackCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new named group. Subsequent add calls append to it.
    pub fn begin_group(&mut self, name: impl Into<String>) -> &mut Self {
        self.groups.push(StackGroup {
            name: name.into(),
            commands: Vec::new(),
        });
        self
    }

    fn current_group(&mut self) -> &mut StackGroup {
        if self.groups.is_empty() {
            self.groups.push(StackGroup::default());
        }
        // Safe: just ensured non-empty.
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }

    pub fn add_command(&mut self, cmd: StackCommand) -> &mut Self {
        self.current_group().commands.push(cmd);
        self
    }

    pub fn add_vme_read(&mut self, address: u32, amod: u8, dw: VmeDataWidth) -> &mut Self {
        self.add_command(StackCommand::VmeRead { address, amod, dw })
    }

    pub fn add_vme_block_read(&mut self, address: u32, amod: u8, max_transfers: u16) -> &mut Self {
        self.add_command(StackCommand::VmeBlockRead { address, amod, max_transfers })
    }

    pub fn add_vme_write(&mut self, address: u32, value: u32, amod: u8, dw: VmeDataWidth) -> &mut Self {
        self.add_command(StackCommand::VmeWrite { address, value, amod, dw })
    }

    pub fn add_write_marker(&mut self, value: u32) -> &mut Self {
        self.add_command(StackCommand::WriteMarker { value })
    }

    pub fn groups(&self) -> &[StackGroup] {
        &self.groups
    }

    /// All commands across groups in execution order.
    pub fn commands(&self) -> Vec<StackCommand> {
        self.groups.iter().flat_map(|g| g.commands.iter().copied()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.commands.is_empty())
    }
}

/// Encode the builder into the on-device stack layout, directing the
/// stack's output to `out_pipe`.
pub fn make_stack_buffer(builder: &StackCommandBuilder, out_pipe: Pipe) -> Vec<u32> {
    let commands = builder.commands();
    let contents: usize = commands.iter().map(StackCommand::encoded_size).sum();

    let mut out = Vec::with_capacity(contents + 2);
    out.push((u32::from(STACK_START) << STACK_CMD_SHIFT) | (u32::from(out_pipe as u8) << 16));
    for cmd in &commands {
        cmd.encode_into(&mut out);
    }
    out.push(u32::from(STACK_END) << STACK_CMD_SHIFT);

    out
}

/// Encoded size of the full stack buffer including the start/end markers.
pub fn get_encoded_stack_size(builder: &StackCommandBuilder) -> usize {
    2 + builder
        .commands()
        .iter()
        .map(StackCommand::encoded_size)
        .sum::<usize>()
}

/// Decode a raw stack buffer back into a single-group builder. Used by
/// introspection tools reading stack memory back from the device.
pub fn stack_builder_from_buffer(words: &[u32]) -> Result<StackCommandBuilder, MvlcError> {
    let mut it = words.iter().copied().peekable();

    let first = it.next().ok_or(MvlcError::InvalidStackHeader(0))?;
    if (first >> STACK_CMD_SHIFT) & STACK_CMD_MASK != u32::from(STACK_START) {
        return Err(MvlcError::InvalidStackHeader(first));
    }

    let mut builder = StackCommandBuilder::new();

    loop {
        let word = it.next().ok_or(MvlcError::InvalidStackHeader(first))?;
        let cmd = ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8;

        if cmd == STACK_END {
            break;
        }

        let mut arg_word =
            |what: u32| it.next().ok_or(MvlcError::InvalidStackHeader(what));

        let decoded = match cmd {
            VME_READ => StackCommand::VmeRead {
                amod: (word >> 16) as u8,
                dw: decode_dw(word)?,
                address: arg_word(word)?,
            },
            READ_TO_ACCU => StackCommand::ReadToAccu {
                amod: (word >> 16) as u8,
                dw: decode_dw(word)?,
                address: arg_word(word)?,
            },
            VME_BLOCK_READ => StackCommand::VmeBlockRead {
                amod: (word >> 16) as u8,
                max_transfers: word as u16,
                address: arg_word(word)?,
            },
            VME_WRITE => StackCommand::VmeWrite {
                amod: (word >> 16) as u8,
                dw: decode_dw(word)?,
                address: arg_word(word)?,
                value: arg_word(word)?,
            },
            WRITE_MARKER => StackCommand::WriteMarker { value: arg_word(word)? },
            WRITE_SPECIAL => StackCommand::WriteSpecial { value: word & 0x00ff_ffff },
            ADDRESS_INC_MODE => StackCommand::AddressIncMode {
                mode: if word & 1 == 0 { AddressIncMode::Fifo } else { AddressIncMode::Memory },
            },
            WAIT => StackCommand::Wait { cycles: word & 0x00ff_ffff },
            MASK_SHIFT_ACCU => StackCommand::MaskShiftAccu {
                shift: word as u8,
                mask: arg_word(word)?,
            },
            SIGNAL_ACCU => StackCommand::SignalAccu,
            SET_ACCU => StackCommand::SetAccu { value: arg_word(word)? },
            COMPARE_LOOP_ACCU => StackCommand::CompareLoopAccu {
                cmp: match word & 0x3 {
                    0 => AccuComparator::Eq,
                    1 => AccuComparator::Lt,
                    _ => AccuComparator::Gt,
                },
                value: arg_word(word)?,
            },
            _ => return Err(MvlcError::InvalidStackHeader(word)),
        };

        builder.add_command(decoded);
    }

    Ok(builder)
}

fn decode_dw(word: u32) -> Result<VmeDataWidth, MvlcError> {
    match (word >> 8) & 0xff {
        0x1 => Ok(VmeDataWidth::D16),
        0x2 => Ok(VmeDataWidth::D32),
        _ => Err(MvlcError::InvalidStackHeader(word)),
    }
}
