// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Wire-level protocol for the Mesytec MVLC VME controller.
//!
//! All MVLC traffic is a sequence of 32-bit little-endian words. This crate
//! contains the pure, transport-independent parts of the protocol: constants
//! and register addresses, frame-header decoding, the super- and
//! stack-command builders and their encodings, parsing of stack responses,
//! the UDP packet framing, and the buffer fixup routines that guarantee
//! whole-frame delivery to downstream consumers.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod constants;
pub mod eth;
pub mod fixup;
pub mod frame;
pub mod io;
pub mod readout_structure;
pub mod response;
pub mod stack_commands;
pub mod super_commands;

pub use constants::Pipe;
pub use frame::{Frame, FrameFlags, FrameInfo};
pub use io::{PipeIo, TransportKind};

/// Reinterpret a little-endian byte slice as 32-bit words. Trailing bytes
/// that do not form a whole word are ignored.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize words to little-endian bytes.
pub fn bytes_from_words(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}
