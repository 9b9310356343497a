// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Protocol constants: pipes, ports, frame header layout, command codes,
//! register addresses and the on-device stack memory map.

/// One of the two logical MVLC channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pipe {
    /// Super commands, dialog replies and stack error notifications.
    Command = 0,
    /// Readout data produced by triggered stacks.
    Data = 1,
}

pub const PIPE_COUNT: usize = 2;

/// Frame header field layout shared by all non-system frames:
///
/// ```text
/// 31      24 23  20 19  16 15 14 13 12           0
/// [  type   ][flags][stack] x [ctrl][   length    ]
/// ```
///
/// System event frames reuse the length field but carry ctrl, a continue
/// bit and an 8-bit subtype instead of flags and stack id:
///
/// ```text
/// 31      24 23 22 21 20       13 12            0
/// [  type   ][ctrl][C][ subtype  ][   length     ]
/// ```
pub mod frame_headers {
    pub const TYPE_SHIFT: u32 = 24;
    pub const TYPE_MASK: u32 = 0xff;

    pub const FRAME_FLAGS_SHIFT: u32 = 20;
    pub const FRAME_FLAGS_MASK: u32 = 0xf;

    pub const STACK_NUM_SHIFT: u32 = 16;
    pub const STACK_NUM_MASK: u32 = 0xf;

    pub const CTRL_ID_SHIFT: u32 = 13;
    pub const CTRL_ID_MASK: u32 = 0x3;

    pub const LENGTH_SHIFT: u32 = 0;
    pub const LENGTH_MASK: u32 = 0x1fff;

    pub const SUPER_FRAME: u8 = 0xF1;
    pub const SUPER_CONTINUATION: u8 = 0xF2;
    pub const STACK_FRAME: u8 = 0xF3;
    pub const BLOCK_READ: u8 = 0xF5;
    pub const STACK_ERROR: u8 = 0xF7;
    pub const STACK_CONTINUATION: u8 = 0xF9;
    pub const SYSTEM_EVENT: u8 = 0xFA;
}

pub mod frame_flags {
    pub const TIMEOUT: u8 = 1 << 0;
    pub const BUS_ERROR: u8 = 1 << 1;
    pub const SYNTAX_ERROR: u8 = 1 << 2;
    pub const CONTINUE: u8 = 1 << 3;

    pub const ALL_ERROR_FLAGS: u8 = TIMEOUT | BUS_ERROR | SYNTAX_ERROR;
}

pub mod system_event {
    pub const CTRL_ID_SHIFT: u32 = 22;
    pub const CTRL_ID_MASK: u32 = 0x3;

    pub const CONTINUE_SHIFT: u32 = 21;
    pub const CONTINUE_MASK: u32 = 0x1;

    pub const SUBTYPE_SHIFT: u32 = 13;
    pub const SUBTYPE_MASK: u32 = 0xff;

    pub const LENGTH_MASK: u32 = 0x1fff;

    pub mod subtype {
        pub const ENDIAN_MARKER: u8 = 0x01;
        pub const BEGIN_RUN: u8 = 0x02;
        pub const END_RUN: u8 = 0x03;
        pub const MVME_CONFIG: u8 = 0x10;
        pub const UNIX_TIMETICK: u8 = 0x11;
        pub const PAUSE: u8 = 0x12;
        pub const RESUME: u8 = 0x13;
        pub const MVLC_CRATE_CONFIG: u8 = 0x14;
        pub const STACK_ERRORS: u8 = 0x77;
        pub const END_OF_FILE: u8 = 0x7e;
    }

    pub const ENDIAN_MARKER_VALUE: u32 = 0x1234_5678;
}

/// Super command codes. A super command word carries the 16-bit code in the
/// upper half and a 16-bit argument in the lower half.
pub mod super_commands {
    pub const SUPER_CMD_SHIFT: u32 = 16;
    pub const SUPER_CMD_MASK: u32 = 0xffff;
    pub const SUPER_CMD_ARG_MASK: u32 = 0xffff;

    pub const CMD_BUFFER_START: u16 = 0xF100;
    pub const CMD_BUFFER_END: u16 = 0xF200;
    pub const REFERENCE_WORD: u16 = 0x0101;
    pub const READ_LOCAL: u16 = 0x0102;
    pub const WRITE_LOCAL: u16 = 0x0204;
    pub const ETH_DELAY: u16 = 0x0207;
}

/// Stack command codes. A stack command word carries the 8-bit code in the
/// top byte; argument packing is command specific.
pub mod stack_commands {
    pub const STACK_CMD_SHIFT: u32 = 24;
    pub const STACK_CMD_MASK: u32 = 0xff;

    pub const STACK_START: u8 = 0xF3;
    pub const STACK_END: u8 = 0xF4;

    pub const VME_READ: u8 = 0x12;
    pub const VME_BLOCK_READ: u8 = 0x32;
    pub const READ_TO_ACCU: u8 = 0x14;
    pub const COMPARE_LOOP_ACCU: u8 = 0x15;
    pub const VME_WRITE: u8 = 0x23;

    pub const WRITE_SPECIAL: u8 = 0xC1;
    pub const WRITE_MARKER: u8 = 0xC2;
    pub const ADDRESS_INC_MODE: u8 = 0xC3;
    pub const WAIT: u8 = 0xC4;
    pub const MASK_SHIFT_ACCU: u8 = 0xC5;
    pub const SIGNAL_ACCU: u8 = 0xC6;
    pub const SET_ACCU: u8 = 0xC8;
}

/// VME data widths for single-cycle transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmeDataWidth {
    D16 = 0x1,
    D32 = 0x2,
}

/// The VME address modifiers used by the MVLC.
pub mod vme_amods {
    pub const A16_USER: u8 = 0x29;
    pub const A24_USER_DATA: u8 = 0x39;
    pub const A24_USER_BLOCK: u8 = 0x3B;
    pub const A32_USER_DATA: u8 = 0x09;
    pub const A32_USER_BLOCK: u8 = 0x0B;
    pub const A32_USER_BLOCK64: u8 = 0x08;

    pub fn is_block_mode(amod: u8) -> bool {
        matches!(amod, A24_USER_BLOCK | A32_USER_BLOCK | A32_USER_BLOCK64)
    }
}

/// On-device stack memory map and per-stack registers.
pub mod stacks {
    pub const STACK_COUNT: u8 = 8;
    /// Stack 0 is reserved for immediate execution of host-issued requests.
    pub const IMMEDIATE_STACK_ID: u8 = 0;
    pub const READOUT_STACK_COUNT: u8 = STACK_COUNT - 1;

    /// Byte address of the first stack memory word.
    pub const STACK_MEMORY_BEGIN: u16 = 0x2000;
    pub const STACK_MEMORY_WORDS: u16 = 1024;
    pub const STACK_MEMORY_END: u16 = STACK_MEMORY_BEGIN + STACK_MEMORY_WORDS * 4;

    pub const IMMEDIATE_STACK_START_OFFSET_WORDS: u16 = 0;
    pub const IMMEDIATE_STACK_RESERVED_WORDS: u16 = 64;

    /// Registers advance in steps of 4 bytes per stack memory word.
    pub const ADDRESS_INCREMENT: u16 = 4;

    /// Word-aligned byte offsets into stack memory.
    pub const STACK_OFFSET_BIT_MASK: u16 = 0x0ffc;

    pub const STACK0_OFFSET_REGISTER: u16 = 0x1100;
    pub const STACK0_TRIGGER_REGISTER: u16 = 0x1104;

    pub fn get_offset_register(stack_id: u8) -> u16 {
        STACK0_OFFSET_REGISTER + 8 * u16::from(stack_id)
    }

    pub fn get_trigger_register(stack_id: u8) -> u16 {
        STACK0_TRIGGER_REGISTER + 8 * u16::from(stack_id)
    }

    /// Writing this bit to a stack trigger register executes the stack once.
    pub const IMMEDIATE_SHIFT: u32 = 16;

    pub const TRIGGER_TYPE_SHIFT: u32 = 5;
    pub const TRIGGER_TYPE_MASK: u32 = 0x7;
    /// IRQ level minus one lives in the low trigger bits.
    pub const TRIGGER_BITS_MASK: u32 = 0x1f;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum TriggerType {
        NoTrigger = 0,
        IrqWithIack = 1,
        IrqNoIack = 2,
        External = 3,
    }

    /// Compose a stack trigger register value. For IRQ triggers the level
    /// (1..=7) is stored biased by one in the low trigger bits.
    pub fn trigger_value(trigger_type: TriggerType, irq_level: u8) -> u32 {
        let mut value = (trigger_type as u32) << TRIGGER_TYPE_SHIFT;

        if matches!(trigger_type, TriggerType::IrqWithIack | TriggerType::IrqNoIack)
            && irq_level > 0
        {
            value |= u32::from(irq_level - 1) & TRIGGER_BITS_MASK;
        }

        value
    }

    /// Decompose a stack trigger register value into (type, irq level).
    pub fn decode_trigger_value(value: u32) -> (TriggerType, u8) {
        let trigger_type = match (value >> TRIGGER_TYPE_SHIFT) & TRIGGER_TYPE_MASK {
            0 => TriggerType::NoTrigger,
            1 => TriggerType::IrqWithIack,
            2 => TriggerType::IrqNoIack,
            _ => TriggerType::External,
        };

        let irq_level = match trigger_type {
            TriggerType::IrqWithIack | TriggerType::IrqNoIack => {
                1 + (value & TRIGGER_BITS_MASK) as u8
            }
            _ => 0,
        };

        (trigger_type, irq_level)
    }
}

/// MVLC register addresses outside the stack block.
pub mod registers {
    pub const HARDWARE_ID: u16 = 0x6008;
    pub const FIRMWARE_REVISION: u16 = 0x600e;
    /// Expected contents of the hardware id register.
    pub const HARDWARE_ID_MVLC: u32 = 0x5008;

    pub const DAQ_MODE_ENABLE: u16 = 0x1300;
}

/// UDP transport constants.
pub mod eth {
    pub const COMMAND_PORT: u16 = 0x8000;
    pub const DATA_PORT: u16 = 0x8001;
    pub const DELAY_PORT: u16 = 0x8002;

    pub const NUM_PACKET_CHANNELS: usize = 4;

    /// Two framing words precede the MVLC payload of every data packet.
    pub const HEADER_WORDS: usize = 2;
    pub const HEADER_BYTES: usize = HEADER_WORDS * 4;

    pub const JUMBO_FRAME_MAX_SIZE: usize = 9000;

    /// Standard MTU minus IPv4 and UDP headers.
    pub const MAX_OUTGOING_PAYLOAD_SIZE: usize = 1500 - 20 - 8;

    pub const PACKET_NUMBER_BITS: u32 = 12;
    pub const PACKET_NUMBER_MOD: u32 = 1 << PACKET_NUMBER_BITS;
}

/// Limits of the mirror (super) transaction.
pub mod limits {
    /// Maximum total size of one encoded super command buffer in words.
    pub const MIRROR_TRANSACTION_MAX_WORDS: usize = 384;
    /// Maximum contents between the buffer start/end markers.
    pub const MIRROR_TRANSACTION_MAX_CONTENTS_WORDS: usize = MIRROR_TRANSACTION_MAX_WORDS - 2;

    pub const MIRROR_MAX_RETRIES: usize = 3;
}

/// USB transport constants (FT60x).
pub mod usb {
    /// Bulk endpoint addresses per pipe: (out, in).
    pub const ENDPOINTS: [(u8, u8); 2] = [(0x02, 0x82), (0x03, 0x83)];

    /// Size of one FT60x stream-pipe read.
    pub const USB_STREAM_PIPE_READ_SIZE: usize = 1024 * 1024;

    pub const FTDI_VENDOR_ID: u16 = 0x0403;
    pub const FT600_PRODUCT_ID: u16 = 0x601e;
    pub const FT601_PRODUCT_ID: u16 = 0x601f;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_registers_advance_in_pairs() {
        assert_eq!(stacks::get_offset_register(0), 0x1100);
        assert_eq!(stacks::get_trigger_register(0), 0x1104);
        assert_eq!(stacks::get_offset_register(1), 0x1108);
        assert_eq!(stacks::get_trigger_register(7), 0x113c);
    }

    #[test]
    fn stack_memory_spans_a_kiloword() {
        assert_eq!(stacks::STACK_MEMORY_END - stacks::STACK_MEMORY_BEGIN, 4096);
    }

    #[test]
    fn block_modes() {
        assert!(vme_amods::is_block_mode(vme_amods::A32_USER_BLOCK));
        assert!(vme_amods::is_block_mode(vme_amods::A32_USER_BLOCK64));
        assert!(!vme_amods::is_block_mode(vme_amods::A32_USER_DATA));
    }

    #[test]
    fn trigger_value_roundtrip() {
        use stacks::{decode_trigger_value, trigger_value, TriggerType};

        let v = trigger_value(TriggerType::IrqNoIack, 3);
        assert_eq!(decode_trigger_value(v), (TriggerType::IrqNoIack, 3));

        let v = trigger_value(TriggerType::External, 0);
        assert_eq!(decode_trigger_value(v), (TriggerType::External, 0));

        assert_eq!(trigger_value(TriggerType::NoTrigger, 0), 0);
        // the IRQ level is stored biased by one
        assert_eq!(trigger_value(TriggerType::IrqWithIack, 1) & stacks::TRIGGER_BITS_MASK, 0);
    }
}
