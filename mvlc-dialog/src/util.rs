// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Higher-level operations built on the dialog layer: stack slot
//! enumeration, readout stack setup, trigger composition and DAQ mode
//! control.

use tracing::{debug, trace};

use mvlc_common::MvlcError;
use mvlc_proto::constants::{registers, stacks, Pipe};
use mvlc_proto::constants::stack_commands::{STACK_CMD_MASK, STACK_CMD_SHIFT};
use mvlc_proto::stack_commands::{get_encoded_stack_size, make_stack_buffer, StackCommandBuilder};
use mvlc_proto::super_commands::SuperCommandBuilder;
use mvlc_proto::PipeIo;

use crate::dialog::Dialog;

/// Everything known about one on-device stack slot.
#[derive(Debug, Clone, Default)]
pub struct StackInfo {
    pub id: u8,
    pub triggers: u32,
    pub offset: u32,
    /// Absolute start address of the stack contents in device memory.
    pub start_address: u16,
    pub contents: Vec<u32>,
}

/// A stack trigger in decomposed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTrigger {
    pub trigger_type: stacks::TriggerType,
    pub irq_level: u8,
}

impl StackTrigger {
    pub fn value(&self) -> u32 {
        stacks::trigger_value(self.trigger_type, self.irq_level)
    }
}

fn word_command(word: u32) -> u8 {
    ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8
}

/// Read raw stack contents from device memory starting at `start_address`,
/// walking word by word until the StackEnd marker.
pub fn read_stack_contents<T: PipeIo>(
    dialog: &mut Dialog<T>,
    start_address: u16,
) -> Result<Vec<u32>, MvlcError> {
    use mvlc_proto::constants::stack_commands::{STACK_END, STACK_START};

    let stack_header = dialog.read_register(start_address)?;

    let mut contents = Vec::with_capacity(64);
    contents.push(stack_header);

    if word_command(stack_header) != STACK_START {
        return Err(MvlcError::InvalidStackHeader(stack_header));
    }

    let mut address = start_address + stacks::ADDRESS_INCREMENT;

    loop {
        if address >= stacks::STACK_MEMORY_END {
            return Err(MvlcError::StackMemoryExceeded);
        }

        let value = dialog.read_register(address)?;
        contents.push(value);
        address += stacks::ADDRESS_INCREMENT;

        if word_command(value) == STACK_END {
            break;
        }
    }

    Ok(contents)
}

/// Read trigger and offset registers plus the raw contents of one stack
/// slot.
pub fn read_stack_info<T: PipeIo>(
    dialog: &mut Dialog<T>,
    stack_id: u8,
) -> Result<StackInfo, MvlcError> {
    if stack_id >= stacks::STACK_COUNT {
        return Err(MvlcError::StackCountExceeded);
    }

    let triggers = dialog.read_register(stacks::get_trigger_register(stack_id))?;
    let offset = dialog.read_register(stacks::get_offset_register(stack_id))?;
    let start_address = stacks::STACK_MEMORY_BEGIN + (offset as u16 & stacks::STACK_OFFSET_BIT_MASK);

    // A slot that was never set up has no StackStart marker; report it
    // with empty contents instead of failing the enumeration.
    let contents = match read_stack_contents(dialog, start_address) {
        Ok(contents) => contents,
        Err(MvlcError::InvalidStackHeader(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    Ok(StackInfo {
        id: stack_id,
        triggers,
        offset,
        start_address,
        contents,
    })
}

/// Read all eight stack slots.
pub fn read_all_stack_infos<T: PipeIo>(
    dialog: &mut Dialog<T>,
) -> Result<Vec<StackInfo>, MvlcError> {
    (0..stacks::STACK_COUNT)
        .map(|id| read_stack_info(dialog, id))
        .collect()
}

pub fn enable_daq_mode<T: PipeIo>(dialog: &mut Dialog<T>) -> Result<(), MvlcError> {
    dialog.write_register(registers::DAQ_MODE_ENABLE, 1)
}

pub fn disable_daq_mode<T: PipeIo>(dialog: &mut Dialog<T>) -> Result<(), MvlcError> {
    dialog.write_register(registers::DAQ_MODE_ENABLE, 0)
}

pub fn read_daq_mode<T: PipeIo>(dialog: &mut Dialog<T>) -> Result<u32, MvlcError> {
    dialog.read_register(registers::DAQ_MODE_ENABLE)
}

/// Clear DAQ mode and all stack triggers in a single super transaction.
/// Used to end a DAQ run atomically.
pub fn disable_all_triggers_and_daq_mode<T: PipeIo>(
    dialog: &mut Dialog<T>,
) -> Result<(), MvlcError> {
    let mut sb = SuperCommandBuilder::new();
    sb.add_reference_word(dialog.next_reference_word());
    sb.add_write_local(registers::DAQ_MODE_ENABLE, 0);

    for stack_id in 0..stacks::STACK_COUNT {
        sb.add_write_local(
            stacks::get_trigger_register(stack_id),
            stacks::TriggerType::NoTrigger as u32,
        );
    }

    let mut response = Vec::new();
    dialog.run_super_builder(sb.commands(), &mut response)?;
    trace!(words = response.len(), "disable_all_triggers_and_daq_mode response");
    Ok(())
}

/// Zero all stack offset registers in a single super transaction.
pub fn reset_stack_offsets<T: PipeIo>(dialog: &mut Dialog<T>) -> Result<(), MvlcError> {
    let mut sb = SuperCommandBuilder::new();
    sb.add_reference_word(dialog.next_reference_word());

    for stack_id in 0..stacks::STACK_COUNT {
        sb.add_write_local(stacks::get_offset_register(stack_id), 0);
    }

    let mut response = Vec::new();
    dialog.run_super_builder(sb.commands(), &mut response)
}

/// Upload the readout stacks for all events into stack memory, writing the
/// per-stack offset registers. Stacks are placed in order behind the
/// immediate stack area with a one-word gap between them. Refuses to start
/// an upload that would overflow stack memory.
pub fn setup_readout_stacks<T: PipeIo>(
    dialog: &mut Dialog<T>,
    readout_stacks: &[StackCommandBuilder],
) -> Result<(), MvlcError> {
    // Stack 0 is reserved for immediate execution.
    let mut stack_id = stacks::IMMEDIATE_STACK_ID + 1;

    // One word gap between the immediate stack area and the first readout
    // stack.
    let mut upload_word_offset =
        stacks::IMMEDIATE_STACK_START_OFFSET_WORDS + stacks::IMMEDIATE_STACK_RESERVED_WORDS + 1;

    for stack in readout_stacks {
        if stack_id >= stacks::STACK_COUNT {
            return Err(MvlcError::StackCountExceeded);
        }

        let stack_words = make_stack_buffer(stack, Pipe::Data);
        let upload_address = upload_word_offset * stacks::ADDRESS_INCREMENT;
        let end_address = usize::from(upload_address) + stack_words.len() * 4;

        if usize::from(stacks::STACK_MEMORY_BEGIN) + end_address
            >= usize::from(stacks::STACK_MEMORY_END)
        {
            return Err(MvlcError::StackMemoryExceeded);
        }

        let mut response = Vec::new();
        dialog.upload_stack_words(upload_address, &stack_words, &mut response)?;

        let offset_register = stacks::get_offset_register(stack_id);
        dialog.write_register(
            offset_register,
            u32::from(upload_address & stacks::STACK_OFFSET_BIT_MASK),
        )?;

        debug!(
            stack_id,
            upload_address,
            words = stack_words.len(),
            "readout stack uploaded"
        );

        stack_id += 1;

        // Leave a one word gap behind this stack.
        upload_word_offset += stack_words.len() as u16 + 1;
    }

    Ok(())
}

/// Write one stack's trigger register.
pub fn write_stack_trigger<T: PipeIo>(
    dialog: &mut Dialog<T>,
    stack_id: u8,
    trigger: StackTrigger,
) -> Result<(), MvlcError> {
    if stack_id == stacks::IMMEDIATE_STACK_ID {
        return Err(MvlcError::Stack0IsReserved);
    }

    if stack_id >= stacks::STACK_COUNT {
        return Err(MvlcError::StackCountExceeded);
    }

    dialog.write_register(stacks::get_trigger_register(stack_id), trigger.value())
}

/// Write all readout stack trigger registers in a single super
/// transaction. `triggers[0]` belongs to stack 1.
pub fn setup_readout_triggers<T: PipeIo>(
    dialog: &mut Dialog<T>,
    triggers: &[StackTrigger],
) -> Result<(), MvlcError> {
    if triggers.len() > usize::from(stacks::READOUT_STACK_COUNT) {
        return Err(MvlcError::StackCountExceeded);
    }

    let mut sb = SuperCommandBuilder::new();
    sb.add_reference_word(dialog.next_reference_word());

    for (i, trigger) in triggers.iter().enumerate() {
        let stack_id = stacks::IMMEDIATE_STACK_ID + 1 + i as u8;
        sb.add_write_local(stacks::get_trigger_register(stack_id), trigger.value());
    }

    let mut response = Vec::new();
    dialog.run_super_builder(sb.commands(), &mut response)
}

/// A module found during a VME bus scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedModule {
    pub address: u32,
    pub hardware_id: u32,
}

/// Scan the VME bus for mesytec-style modules by probing the hardware-id
/// register of every 64k bank in `[begin, end)`. Banks that raise a bus
/// timeout are simply absent; other errors abort the scan.
pub fn scan_vme_bus<T: PipeIo>(
    dialog: &mut Dialog<T>,
    begin: u32,
    end: u32,
) -> Result<Vec<ScannedModule>, MvlcError> {
    use mvlc_proto::constants::{vme_amods, VmeDataWidth};

    const BANK_SIZE: u32 = 0x1_0000;
    const HARDWARE_ID_OFFSET: u32 = 0x6008;

    let mut found = Vec::new();
    let mut address = begin & !(BANK_SIZE - 1);

    while address < end {
        match dialog.vme_read(
            address + HARDWARE_ID_OFFSET,
            vme_amods::A32_USER_DATA,
            VmeDataWidth::D16,
        ) {
            Ok(hardware_id) if hardware_id != 0 => {
                debug!(
                    address = format_args!("0x{address:08x}"),
                    hardware_id = format_args!("0x{hardware_id:04x}"),
                    "module found"
                );
                found.push(ScannedModule {
                    address,
                    hardware_id,
                });
            }
            Ok(_) => {}
            Err(e) if e.is_vme_error() => {}
            Err(e) => return Err(e),
        }

        address = match address.checked_add(BANK_SIZE) {
            Some(next) => next,
            None => break,
        };
    }

    Ok(found)
}

/// Guard that a single readout stack fits into the memory left behind the
/// immediate stack area.
pub fn stack_fits_memory(stack: &StackCommandBuilder) -> bool {
    get_encoded_stack_size(stack)
        <= usize::from(stacks::STACK_MEMORY_WORDS - stacks::IMMEDIATE_STACK_RESERVED_WORDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_trigger_values_compose() {
        let t = StackTrigger {
            trigger_type: stacks::TriggerType::IrqNoIack,
            irq_level: 2,
        };
        assert_eq!(
            t.value(),
            (stacks::TriggerType::IrqNoIack as u32) << stacks::TRIGGER_TYPE_SHIFT | 1
        );
    }

    #[test]
    fn small_stacks_fit_memory() {
        let mut stack = StackCommandBuilder::new();
        stack.add_write_marker(1);
        assert!(stack_fits_memory(&stack));
    }
}
