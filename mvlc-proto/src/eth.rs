// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! UDP data packet framing.
//!
//! Every UDP payload from the MVLC data pipe starts with two framing
//! words:
//!
//! ```text
//! header0: x x [channel:2][packetNumber:12][controllerId:3][dataWordCount:13]
//! header1: [udpTimestamp:20][nextHeaderPointer:12]
//! ```
//!
//! `nextHeaderPointer` is the word offset into the packet payload where
//! the next MVLC frame header begins, or [`NO_HEADER_POINTER`] when the
//! packet is pure continuation data from the previous packet.

use mvlc_common::MvlcError;

use crate::constants::eth::{HEADER_BYTES, NUM_PACKET_CHANNELS, PACKET_NUMBER_MOD};

pub const NO_HEADER_POINTER: u16 = 0xfff;

const CHANNEL_SHIFT: u32 = 28;
const CHANNEL_MASK: u32 = 0x3;
const PACKET_NUMBER_SHIFT: u32 = 16;
const PACKET_NUMBER_MASK: u32 = 0xfff;
const CONTROLLER_ID_SHIFT: u32 = 13;
const CONTROLLER_ID_MASK: u32 = 0x7;
const WORD_COUNT_MASK: u32 = 0x1fff;

const TIMESTAMP_SHIFT: u32 = 12;
const TIMESTAMP_MASK: u32 = 0xf_ffff;
const HEADER_POINTER_MASK: u32 = 0xfff;

/// The two decoded framing words of one data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeaders {
    pub header0: u32,
    pub header1: u32,
}

impl PacketHeaders {
    pub fn packet_channel(&self) -> u8 {
        ((self.header0 >> CHANNEL_SHIFT) & CHANNEL_MASK) as u8
    }

    pub fn packet_number(&self) -> u16 {
        ((self.header0 >> PACKET_NUMBER_SHIFT) & PACKET_NUMBER_MASK) as u16
    }

    pub fn controller_id(&self) -> u8 {
        ((self.header0 >> CONTROLLER_ID_SHIFT) & CONTROLLER_ID_MASK) as u8
    }

    pub fn data_word_count(&self) -> u16 {
        (self.header0 & WORD_COUNT_MASK) as u16
    }

    pub fn udp_timestamp(&self) -> u32 {
        (self.header1 >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK
    }

    pub fn next_header_pointer(&self) -> u16 {
        (self.header1 & HEADER_POINTER_MASK) as u16
    }

    pub fn has_header_pointer(&self) -> bool {
        self.next_header_pointer() != NO_HEADER_POINTER
    }
}

/// Encode the framing words. Used by tests and the listfile tooling.
pub fn make_packet_headers(
    channel: u8,
    packet_number: u16,
    controller_id: u8,
    data_word_count: u16,
    next_header_pointer: u16,
    udp_timestamp: u32,
) -> PacketHeaders {
    let header0 = ((u32::from(channel) & CHANNEL_MASK) << CHANNEL_SHIFT)
        | ((u32::from(packet_number) & PACKET_NUMBER_MASK) << PACKET_NUMBER_SHIFT)
        | ((u32::from(controller_id) & CONTROLLER_ID_MASK) << CONTROLLER_ID_SHIFT)
        | (u32::from(data_word_count) & WORD_COUNT_MASK);
    let header1 = ((udp_timestamp & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
        | (u32::from(next_header_pointer) & HEADER_POINTER_MASK);

    PacketHeaders { header0, header1 }
}

/// Packets lost between the previously seen packet number and the current
/// one, on a 12-bit wrapping counter.
pub fn calc_packet_loss(last: u16, current: u16) -> u16 {
    (u32::from(current)
        .wrapping_sub(u32::from(last))
        .wrapping_sub(1)
        % PACKET_NUMBER_MOD) as u16
}

/// A validated view of one received data packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub headers: PacketHeaders,
    /// MVLC payload words following the two framing words, truncated to
    /// `dataWordCount`.
    pub payload: &'a [u32],
    /// Bytes beyond the last whole word (ethernet padding residue).
    pub leftover_bytes: usize,
}

/// Validate a received datagram and produce a payload view.
///
/// Checks the minimum length, the packet channel range, and that the
/// declared `dataWordCount` fits the received bytes. Trailing padding
/// beyond the declared word count is cut off (some OSes include ethernet
/// padding in the receive length).
pub fn parse_packet<'a>(bytes: &[u8], words: &'a [u32]) -> Result<PacketView<'a>, MvlcError> {
    if bytes.len() < HEADER_BYTES {
        return Err(MvlcError::ShortRead);
    }

    let headers = PacketHeaders {
        header0: words[0],
        header1: words[1],
    };

    if usize::from(headers.packet_channel()) >= NUM_PACKET_CHANNELS {
        return Err(MvlcError::UdpPacketChannelOutOfRange(headers.packet_channel()));
    }

    let available_payload_words = words.len() - 2;
    let declared = usize::from(headers.data_word_count());

    if declared > available_payload_words {
        return Err(MvlcError::UdpDataWordCountExceedsPacketSize {
            words: headers.data_word_count(),
            packet_words: available_payload_words,
        });
    }

    Ok(PacketView {
        headers,
        payload: &words[2..2 + declared],
        leftover_bytes: bytes.len() % 4,
    })
}
