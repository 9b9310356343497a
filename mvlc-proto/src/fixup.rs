// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Buffer fixup: trim a just-read byte buffer down to whole frames
//! (USB) or whole packets (ETH), carrying the cut-off tail over to the
//! next read.
//!
//! USB bulk reads and listfile reads can cut the byte stream anywhere.
//! The fixup walks the buffer as a frame/packet sequence and moves every
//! byte from the first incomplete unit onward into `leftover`. Callers
//! prepend `leftover` to the next read's destination, so consumers only
//! ever see complete units.

use byteorder::{ByteOrder, LittleEndian};

use crate::constants::eth::HEADER_BYTES;
use crate::frame::Frame;

/// Walk `buf` as a stream of MVLC frames. Returns the number of valid
/// bytes; everything beyond is moved into `leftover`.
pub fn fixup_usb_buffer(buf: &[u8], leftover: &mut Vec<u8>) -> usize {
    let mut pos = 0;

    while pos < buf.len() {
        let avail = buf.len() - pos;

        if avail < 4 {
            break;
        }

        let header = LittleEndian::read_u32(&buf[pos..pos + 4]);

        match Frame::decode(header) {
            Some(frame) => {
                let frame_bytes = (1 + usize::from(frame.len())) * 4;
                if frame_bytes > avail {
                    break;
                }
                pos += frame_bytes;
            }
            // Not a header. Skip one word; the parser accounts for it.
            None => pos += 4,
        }
    }

    leftover.extend_from_slice(&buf[pos..]);
    pos
}

/// Walk `buf` as a stream of ETH packets (two framing words plus the
/// declared payload), interleaved with raw software-generated SystemEvent
/// frames. Returns the number of valid bytes; everything beyond is moved
/// into `leftover`.
pub fn fixup_eth_buffer(buf: &[u8], leftover: &mut Vec<u8>) -> usize {
    let mut pos = 0;

    while pos < buf.len() {
        let avail = buf.len() - pos;

        if avail < 4 {
            break;
        }

        let word = LittleEndian::read_u32(&buf[pos..pos + 4]);

        if let Some(frame @ Frame::SystemEvent { .. }) = Frame::decode(word) {
            let frame_bytes = (1 + usize::from(frame.len())) * 4;
            if frame_bytes > avail {
                break;
            }
            pos += frame_bytes;
            continue;
        }

        if avail < HEADER_BYTES {
            break;
        }

        let data_words = (word & 0x1fff) as usize;
        let packet_bytes = HEADER_BYTES + data_words * 4;

        if packet_bytes > avail {
            break;
        }

        pos += packet_bytes;
    }

    leftover.extend_from_slice(&buf[pos..]);
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes_from_words;
    use crate::constants::frame_headers::STACK_FRAME;
    use crate::eth::make_packet_headers;
    use crate::frame::make_frame_header;

    #[test]
    fn whole_frames_pass_through() {
        let words = vec![
            make_frame_header(STACK_FRAME, 2, 0, 1, 0),
            0xaaaa,
            0xbbbb,
            make_frame_header(STACK_FRAME, 0, 0, 1, 0),
        ];
        let bytes = bytes_from_words(&words);
        let mut leftover = Vec::new();

        let used = fixup_usb_buffer(&bytes, &mut leftover);

        assert_eq!(used, bytes.len());
        assert!(leftover.is_empty());
    }

    #[test]
    fn a_cut_frame_moves_to_the_leftover() {
        let words = vec![
            make_frame_header(STACK_FRAME, 1, 0, 1, 0),
            0xaaaa,
            make_frame_header(STACK_FRAME, 3, 0, 1, 0),
            0x1111,
        ];
        let bytes = bytes_from_words(&words);
        let mut leftover = Vec::new();

        let used = fixup_usb_buffer(&bytes, &mut leftover);

        assert_eq!(used, 8);
        assert_eq!(leftover.len(), 8);
        assert_eq!(LittleEndian::read_u32(&leftover[0..4]), words[2]);
    }

    #[test]
    fn a_partial_header_word_moves_to_the_leftover() {
        let words = vec![make_frame_header(STACK_FRAME, 0, 0, 1, 0)];
        let mut bytes = bytes_from_words(&words);
        bytes.extend_from_slice(&[0x12, 0x34]);
        let mut leftover = Vec::new();

        let used = fixup_usb_buffer(&bytes, &mut leftover);

        assert_eq!(used, 4);
        assert_eq!(leftover, vec![0x12, 0x34]);
    }

    #[test]
    fn non_header_words_are_skipped_word_wise() {
        let words = vec![0x0000_0001, make_frame_header(STACK_FRAME, 1, 0, 1, 0), 0xcccc];
        let bytes = bytes_from_words(&words);
        let mut leftover = Vec::new();

        let used = fixup_usb_buffer(&bytes, &mut leftover);

        assert_eq!(used, bytes.len());
        assert!(leftover.is_empty());
    }

    #[test]
    fn any_cut_position_reassembles_the_usb_stream() {
        let words = vec![
            make_frame_header(STACK_FRAME, 2, 0, 1, 0),
            0x0101,
            0x0202,
            make_frame_header(STACK_FRAME, 0, 0, 2, 0),
            make_frame_header(STACK_FRAME, 1, 0, 1, 0),
            0x0303,
        ];
        let stream = bytes_from_words(&words);

        for cut in 0..=stream.len() {
            let mut leftover = Vec::new();
            let mut reassembled = Vec::new();

            let used = fixup_usb_buffer(&stream[..cut], &mut leftover);
            reassembled.extend_from_slice(&stream[..used]);

            let mut second = leftover;
            second.extend_from_slice(&stream[cut..]);

            let mut tail = Vec::new();
            let used = fixup_usb_buffer(&second, &mut tail);
            reassembled.extend_from_slice(&second[..used]);

            assert!(tail.is_empty(), "cut at {cut} left {} bytes", tail.len());
            assert_eq!(reassembled, stream, "cut at {cut}");
        }
    }

    #[test]
    fn any_cut_position_reassembles_the_eth_stream() {
        let p1 = make_packet_headers(0, 1, 0, 2, 0, 0);
        let p2 = make_packet_headers(0, 2, 0, 1, 0, 0);
        let words = vec![p1.header0, p1.header1, 0xa, 0xb, p2.header0, p2.header1, 0xc];
        let stream = bytes_from_words(&words);

        for cut in 0..=stream.len() {
            let mut leftover = Vec::new();
            let mut reassembled = Vec::new();

            let used = fixup_eth_buffer(&stream[..cut], &mut leftover);
            reassembled.extend_from_slice(&stream[..used]);

            let mut second = leftover;
            second.extend_from_slice(&stream[cut..]);

            let mut tail = Vec::new();
            let used = fixup_eth_buffer(&second, &mut tail);
            reassembled.extend_from_slice(&second[..used]);

            assert!(tail.is_empty(), "cut at {cut}");
            assert_eq!(reassembled, stream, "cut at {cut}");
        }
    }

    #[test]
    fn eth_fixup_cuts_at_packet_boundaries() {
        let h1 = make_packet_headers(0, 1, 0, 2, 0, 0);
        let h2 = make_packet_headers(0, 2, 0, 3, 0, 0);

        let words = vec![h1.header0, h1.header1, 0xa, 0xb, h2.header0, h2.header1, 0x1];
        let bytes = bytes_from_words(&words);
        let mut leftover = Vec::new();

        let used = fixup_eth_buffer(&bytes, &mut leftover);

        // the second packet declares 3 payload words but only 1 arrived
        assert_eq!(used, 16);
        assert_eq!(leftover.len(), 12);
    }
}
