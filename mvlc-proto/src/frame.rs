// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Frame header decoding.
//!
//! Every frame on the wire starts with a 32-bit header word. [`FrameInfo`]
//! is the raw field view; [`Frame`] is the tagged variant downstream code
//! matches on exhaustively.

use std::fmt;

use crate::constants::{frame_flags, frame_headers, system_event};

/// Decoded flag bits of a non-system frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub fn timeout(self) -> bool {
        self.0 & frame_flags::TIMEOUT != 0
    }

    pub fn bus_error(self) -> bool {
        self.0 & frame_flags::BUS_ERROR != 0
    }

    pub fn syntax_error(self) -> bool {
        self.0 & frame_flags::SYNTAX_ERROR != 0
    }

    pub fn continue_flag(self) -> bool {
        self.0 & frame_flags::CONTINUE != 0
    }

    pub fn has_error(self) -> bool {
        self.0 & frame_flags::ALL_ERROR_FLAGS != 0
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.continue_flag() {
            names.push("continue");
        }
        if self.timeout() {
            names.push("timeout");
        }
        if self.bus_error() {
            names.push("buserror");
        }
        if self.syntax_error() {
            names.push("syntax");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Raw field view of a frame header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub len: u16,
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stack: u8,
    pub ctrl: u8,
    pub sys_event_subtype: u8,
}

impl FrameInfo {
    pub fn from_header(header: u32) -> Self {
        use frame_headers::*;

        let frame_type = ((header >> TYPE_SHIFT) & TYPE_MASK) as u8;
        let len = ((header >> LENGTH_SHIFT) & LENGTH_MASK) as u16;

        if frame_type == SYSTEM_EVENT {
            let continue_bit =
                ((header >> system_event::CONTINUE_SHIFT) & system_event::CONTINUE_MASK) as u8;
            FrameInfo {
                len,
                frame_type,
                flags: FrameFlags(continue_bit << 3),
                stack: 0,
                ctrl: ((header >> system_event::CTRL_ID_SHIFT) & system_event::CTRL_ID_MASK) as u8,
                sys_event_subtype: ((header >> system_event::SUBTYPE_SHIFT)
                    & system_event::SUBTYPE_MASK) as u8,
            }
        } else {
            FrameInfo {
                len,
                frame_type,
                flags: FrameFlags(((header >> FRAME_FLAGS_SHIFT) & FRAME_FLAGS_MASK) as u8),
                stack: ((header >> STACK_NUM_SHIFT) & STACK_NUM_MASK) as u8,
                ctrl: ((header >> CTRL_ID_SHIFT) & CTRL_ID_MASK) as u8,
                sys_event_subtype: 0,
            }
        }
    }
}

/// Tagged view of a decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Super { len: u16, flags: FrameFlags, ctrl: u8 },
    SuperContinuation { len: u16, flags: FrameFlags, ctrl: u8 },
    Stack { len: u16, flags: FrameFlags, stack: u8, ctrl: u8 },
    BlockRead { len: u16, flags: FrameFlags, stack: u8, ctrl: u8 },
    StackError { len: u16, flags: FrameFlags, stack: u8, ctrl: u8 },
    StackContinuation { len: u16, flags: FrameFlags, stack: u8, ctrl: u8 },
    SystemEvent { len: u16, subtype: u8, continue_flag: bool, ctrl: u8 },
}

impl Frame {
    /// Decode a header word. Returns None for words that are not a
    /// recognized frame header.
    pub fn decode(header: u32) -> Option<Frame> {
        use frame_headers::*;

        let info = FrameInfo::from_header(header);

        let frame = match info.frame_type {
            SUPER_FRAME => Frame::Super {
                len: info.len,
                flags: info.flags,
                ctrl: info.ctrl,
            },
            SUPER_CONTINUATION => Frame::SuperContinuation {
                len: info.len,
                flags: info.flags,
                ctrl: info.ctrl,
            },
            STACK_FRAME => Frame::Stack {
                len: info.len,
                flags: info.flags,
                stack: info.stack,
                ctrl: info.ctrl,
            },
            BLOCK_READ => Frame::BlockRead {
                len: info.len,
                flags: info.flags,
                stack: info.stack,
                ctrl: info.ctrl,
            },
            STACK_ERROR => Frame::StackError {
                len: info.len,
                flags: info.flags,
                stack: info.stack,
                ctrl: info.ctrl,
            },
            STACK_CONTINUATION => Frame::StackContinuation {
                len: info.len,
                flags: info.flags,
                stack: info.stack,
                ctrl: info.ctrl,
            },
            SYSTEM_EVENT => Frame::SystemEvent {
                len: info.len,
                subtype: info.sys_event_subtype,
                continue_flag: info.flags.continue_flag(),
                ctrl: info.ctrl,
            },
            _ => return None,
        };

        Some(frame)
    }

    /// Number of payload words following the header.
    pub fn len(&self) -> u16 {
        match *self {
            Frame::Super { len, .. }
            | Frame::SuperContinuation { len, .. }
            | Frame::Stack { len, .. }
            | Frame::BlockRead { len, .. }
            | Frame::StackError { len, .. }
            | Frame::StackContinuation { len, .. }
            | Frame::SystemEvent { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flags(&self) -> FrameFlags {
        match *self {
            Frame::Super { flags, .. }
            | Frame::SuperContinuation { flags, .. }
            | Frame::Stack { flags, .. }
            | Frame::BlockRead { flags, .. }
            | Frame::StackError { flags, .. }
            | Frame::StackContinuation { flags, .. } => flags,
            Frame::SystemEvent { continue_flag, .. } => {
                FrameFlags(if continue_flag { frame_flags::CONTINUE } else { 0 })
            }
        }
    }
}

/// Encode a non-system frame header word. The inverse of [`Frame::decode`]
/// for the hardware-produced frame types; used by tests and the listfile
/// tooling to synthesize streams.
pub fn make_frame_header(frame_type: u8, len: u16, flags: u8, stack: u8, ctrl: u8) -> u32 {
    use frame_headers::*;

    (u32::from(frame_type) << TYPE_SHIFT)
        | ((u32::from(flags) & FRAME_FLAGS_MASK) << FRAME_FLAGS_SHIFT)
        | ((u32::from(stack) & STACK_NUM_MASK) << STACK_NUM_SHIFT)
        | ((u32::from(ctrl) & CTRL_ID_MASK) << CTRL_ID_SHIFT)
        | (u32::from(len) & LENGTH_MASK)
}

/// Encode a system event header word.
pub fn make_system_event_header(subtype: u8, len: u16, continue_flag: bool, ctrl: u8) -> u32 {
    use frame_headers::{SYSTEM_EVENT, TYPE_SHIFT};
    use system_event::*;

    (u32::from(SYSTEM_EVENT) << TYPE_SHIFT)
        | ((u32::from(ctrl) & CTRL_ID_MASK) << CTRL_ID_SHIFT)
        | (u32::from(continue_flag) << CONTINUE_SHIFT)
        | ((u32::from(subtype) & SUBTYPE_MASK) << SUBTYPE_SHIFT)
        | (u32::from(len) & LENGTH_MASK)
}

pub fn is_known_frame_header(header: u32) -> bool {
    Frame::decode(header).is_some()
}

pub fn is_super_frame_header(header: u32) -> bool {
    matches!(Frame::decode(header), Some(Frame::Super { .. }))
}

pub fn is_stack_frame_header(header: u32) -> bool {
    matches!(Frame::decode(header), Some(Frame::Stack { .. }))
}

pub fn is_stack_continuation_header(header: u32) -> bool {
    matches!(Frame::decode(header), Some(Frame::StackContinuation { .. }))
}

pub fn is_stack_error_header(header: u32) -> bool {
    matches!(Frame::decode(header), Some(Frame::StackError { .. }))
}

pub fn is_block_read_header(header: u32) -> bool {
    matches!(Frame::decode(header), Some(Frame::BlockRead { .. }))
}

pub fn is_system_event_header(header: u32) -> bool {
    matches!(Frame::decode(header), Some(Frame::SystemEvent { .. }))
}

/// Name of a known system event subtype, or "unknown/custom".
pub fn system_event_subtype_name(subtype: u8) -> &'static str {
    use crate::constants::system_event::subtype::*;

    match subtype {
        ENDIAN_MARKER => "EndianMarker",
        BEGIN_RUN => "BeginRun",
        END_RUN => "EndRun",
        MVME_CONFIG => "MvmeConfig",
        UNIX_TIMETICK => "UnixTimetick",
        PAUSE => "Pause",
        RESUME => "Resume",
        MVLC_CRATE_CONFIG => "MvlcCrateConfig",
        STACK_ERRORS => "StackErrors",
        END_OF_FILE => "EndOfFile",
        _ => "unknown/custom",
    }
}

/// Human-readable rendering of a frame header, for logs and tools.
pub fn decode_frame_header(header: u32) -> String {
    match Frame::decode(header) {
        Some(Frame::Super { len, flags, ctrl }) => {
            format!("SuperFrame(len={len}, flags=[{flags}], ctrl={ctrl})")
        }
        Some(Frame::SuperContinuation { len, flags, ctrl }) => {
            format!("SuperContinuation(len={len}, flags=[{flags}], ctrl={ctrl})")
        }
        Some(Frame::Stack { len, flags, stack, ctrl }) => {
            format!("StackFrame(len={len}, flags=[{flags}], stack={stack}, ctrl={ctrl})")
        }
        Some(Frame::BlockRead { len, flags, stack, ctrl }) => {
            format!("BlockRead(len={len}, flags=[{flags}], stack={stack}, ctrl={ctrl})")
        }
        Some(Frame::StackError { len, flags, stack, ctrl }) => {
            format!("StackError(len={len}, flags=[{flags}], stack={stack}, ctrl={ctrl})")
        }
        Some(Frame::StackContinuation { len, flags, stack, ctrl }) => {
            format!("StackContinuation(len={len}, flags=[{flags}], stack={stack}, ctrl={ctrl})")
        }
        Some(Frame::SystemEvent { len, subtype, continue_flag, ctrl }) => format!(
            "SystemEvent(len={len}, subtype={} (0x{subtype:02x}), continue={continue_flag}, ctrl={ctrl})",
            system_event_subtype_name(subtype)
        ),
        None => format!("UnknownHeader(0x{header:08x})"),
    }
}
