// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use mvlc_common::{MvlcError, Protected};
use mvlc_proto::constants::super_commands::{REFERENCE_WORD, SUPER_CMD_SHIFT};
use mvlc_proto::constants::{limits, stacks, Pipe, VmeDataWidth};
use mvlc_proto::frame::{
    is_known_frame_header, is_stack_continuation_header, is_stack_error_header,
    is_stack_frame_header, is_super_frame_header, Frame,
};
use mvlc_proto::stack_commands::{make_stack_buffer, StackCommandBuilder};
use mvlc_proto::super_commands::{
    make_command_buffer, make_stack_upload_commands, split_into_transaction_parts, SuperCommand,
    SuperCommandBuilder,
};
use mvlc_proto::{bytes_from_words, words_from_bytes, PipeIo};

/// Upper bound on the total time spent inside one read-response loop while
/// only stack error notifications arrive.
pub const READ_RESPONSE_MAX_WAIT: Duration = Duration::from_secs(60);

/// Identifies one distinct stack error notification source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackErrorKey {
    pub stack: u8,
    pub line: u16,
    pub flags: u8,
}

/// Accumulated stack error notifications, keyed by (stack, line, flags).
#[derive(Debug, Default, Clone)]
pub struct StackErrorCounters {
    pub counts: HashMap<StackErrorKey, u64>,
    /// 0xF7 frames whose payload was too short to carry a line number.
    pub short_frames: u64,
}

impl StackErrorCounters {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    fn record_frame(&mut self, words: &[u32]) {
        let Some(Frame::StackError { flags, stack, .. }) =
            words.first().copied().and_then(Frame::decode)
        else {
            return;
        };

        match words.get(1) {
            Some(&line_word) => {
                let key = StackErrorKey {
                    stack,
                    line: (line_word & 0xffff) as u16,
                    flags: flags.0,
                };
                *self.counts.entry(key).or_insert(0) += 1;
            }
            None => self.short_frames += 1,
        }
    }
}

/// Verify that `response` mirrors `request` in words `[1..len-1]`, i.e.
/// everything between the buffer start/end markers.
pub fn check_mirror(request: &[u32], response: &[u32]) -> Result<(), MvlcError> {
    if request.is_empty() {
        return Err(MvlcError::MirrorEmptyRequest);
    }

    if response.is_empty() {
        return Err(MvlcError::MirrorEmptyResponse);
    }

    if response.len() < request.len() - 1 {
        return Err(MvlcError::MirrorShortResponse);
    }

    for i in 1..request.len() - 1 {
        if request[i] != response[i] {
            return Err(MvlcError::MirrorNotEqual);
        }
    }

    Ok(())
}

/// The dialog layer. Owns the rolling reference word, a response scratch
/// buffer and the shared stack-error counters. All operations run on the
/// command pipe of the underlying transport; the caller is responsible for
/// serializing dialog use (the top-level handle holds the command lock).
pub struct Dialog<T: PipeIo> {
    io: T,
    reference_word: u16,
    response_buffer: Vec<u32>,
    stack_error_counters: Arc<Protected<StackErrorCounters>>,
}

impl<T: PipeIo> Dialog<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            reference_word: 1,
            response_buffer: Vec::new(),
            stack_error_counters: Arc::new(Protected::new(StackErrorCounters::default())),
        }
    }

    pub fn io(&self) -> &T {
        &self.io
    }

    /// Shared handle to the stack-error counters for observers.
    pub fn stack_error_counters(&self) -> Arc<Protected<StackErrorCounters>> {
        Arc::clone(&self.stack_error_counters)
    }

    pub fn next_reference_word(&mut self) -> u16 {
        let ref_word = self.reference_word;
        self.reference_word = self.reference_word.wrapping_add(1);
        ref_word
    }

    fn do_write(&self, words: &[u32]) -> Result<(), MvlcError> {
        let bytes = bytes_from_words(words);
        let written = self.io.write(Pipe::Command, &bytes)?;

        if written != bytes.len() {
            warn!(wanted = bytes.len(), written, "short write on command pipe");
            return Err(MvlcError::ShortWrite);
        }

        Ok(())
    }

    /// Read exactly `count` words from the command pipe into `dest`.
    ///
    /// When connected over USB2 a zero-byte timeout is retried once: the
    /// driver sporadically reports a timeout even though data is available
    /// at the endpoint.
    fn read_words(&mut self, count: usize, dest: &mut Vec<u32>) -> Result<(), MvlcError> {
        dest.clear();

        if count == 0 {
            return Ok(());
        }

        let mut bytes = vec![0u8; count * 4];
        let mut attempts_left = if self.io.needs_usb2_read_retry() { 2 } else { 1 };

        let transferred = loop {
            match self.io.read(Pipe::Command, &mut bytes) {
                Ok(n) => break n,
                Err(e) if e.is_timeout() && attempts_left > 1 => {
                    attempts_left -= 1;
                    debug!("retrying read after zero-byte timeout");
                }
                Err(e) => return Err(e),
            }
        };

        dest.extend(words_from_bytes(&bytes[..transferred - transferred % 4]));

        if transferred != bytes.len() {
            return Err(MvlcError::ShortRead);
        }

        Ok(())
    }

    /// Read one frame: a known header word plus its declared payload.
    /// On a short payload read `dest` holds what arrived.
    fn read_known_buffer(&mut self, dest: &mut Vec<u32>) -> Result<(), MvlcError> {
        dest.clear();

        let mut header_word = Vec::with_capacity(1);
        self.read_words(1, &mut header_word)?;

        let header = header_word[0];

        if !is_known_frame_header(header) {
            dest.push(header);
            return Err(MvlcError::InvalidBufferHeader(header));
        }

        let len = Frame::decode(header).map(|f| usize::from(f.len())).unwrap_or(0);

        dest.push(header);

        let mut payload = Vec::with_capacity(len);
        let result = self.read_words(len, &mut payload);
        dest.extend_from_slice(&payload);

        result
    }

    /// The lowest-level read loop: read frames until one validates against
    /// `validator`. Stack error notifications can be interleaved at any
    /// time; they are consumed into the counters and the loop continues,
    /// bounded by [`READ_RESPONSE_MAX_WAIT`].
    pub fn read_response(
        &mut self,
        validator: fn(u32) -> bool,
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        let start = Instant::now();

        loop {
            self.read_known_buffer(dest)?;

            let header = dest[0];

            if is_stack_error_header(header) {
                self.stack_error_counters.access().record_frame(dest);
            } else {
                break;
            }

            if start.elapsed() >= READ_RESPONSE_MAX_WAIT {
                return Err(MvlcError::ReadResponseMaxWaitExceeded);
            }
        }

        let header = dest[0];

        if !validator(header) {
            warn!(header = format_args!("0x{header:08x}"), "response header validation failed");
            return Err(MvlcError::UnexpectedBufferHeader(header));
        }

        Ok(())
    }

    /// Write a super command buffer and verify the mirrored response.
    /// Pure timeouts are retried up to three times.
    pub fn super_transaction(
        &mut self,
        request: &[u32],
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        if request.len() > limits::MIRROR_TRANSACTION_MAX_WORDS {
            return Err(MvlcError::MirrorTransactionMaxWordsExceeded);
        }

        for attempt in 1..=limits::MIRROR_MAX_RETRIES {
            if let Err(e) = self.do_write(request) {
                warn!(%e, attempt, "super transaction write error");
                if e.is_timeout() {
                    continue;
                }
                return Err(e);
            }

            if let Err(e) = self.read_response(is_super_frame_header, dest) {
                warn!(%e, attempt, "super transaction read error");
                if e.is_timeout() {
                    continue;
                }
                return Err(e);
            }

            return check_mirror(request, dest);
        }

        Err(MvlcError::MirrorMaxTriesExceeded)
    }

    /// Run a super command list as one transaction.
    pub fn run_super_builder(
        &mut self,
        commands: &[SuperCommand],
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        let request = make_command_buffer(commands);
        self.super_transaction(&request, dest)
    }

    fn check_super_reference(&self, ref_word: u16) -> Result<(), MvlcError> {
        let expected = (u32::from(REFERENCE_WORD) << SUPER_CMD_SHIFT) | u32::from(ref_word);

        match self.response_buffer.get(1) {
            Some(&echoed) if echoed == expected => Ok(()),
            _ => Err(MvlcError::SuperReferenceMismatch),
        }
    }

    pub fn write_register(&mut self, address: u16, value: u32) -> Result<(), MvlcError> {
        let ref_word = self.next_reference_word();

        let mut sb = SuperCommandBuilder::new();
        sb.add_reference_word(ref_word);
        sb.add_write_local(address, value);

        let request = make_command_buffer(sb.commands());
        let mut response = std::mem::take(&mut self.response_buffer);
        let result = self.super_transaction(&request, &mut response);
        let len = response.len();
        self.response_buffer = response;
        result?;
        self.check_super_reference(ref_word)?;

        // header + ref mirror + WriteLocal mirror (2 words)
        if len != 4 {
            return Err(MvlcError::UnexpectedResponseSize { wanted: 4, got: len });
        }

        Ok(())
    }

    pub fn read_register(&mut self, address: u16) -> Result<u32, MvlcError> {
        let ref_word = self.next_reference_word();

        let mut sb = SuperCommandBuilder::new();
        sb.add_reference_word(ref_word);
        sb.add_read_local(address);

        let request = make_command_buffer(sb.commands());
        let mut response = std::mem::take(&mut self.response_buffer);
        let result = self.super_transaction(&request, &mut response);
        self.response_buffer = response;
        result?;
        self.check_super_reference(ref_word)?;

        // header + ref mirror + ReadLocal mirror + value
        if self.response_buffer.len() < 4 {
            return Err(MvlcError::UnexpectedResponseSize {
                wanted: 4,
                got: self.response_buffer.len(),
            });
        }

        Ok(self.response_buffer[3])
    }

    /// Read the framed stack response following an immediate stack
    /// execution: one StackFrame, then StackContinuation frames while the
    /// Continue flag is set. Terminal frame flags map to errors.
    fn read_stack_response(&mut self, dest: &mut Vec<u32>) -> Result<(), MvlcError> {
        self.read_response(is_stack_frame_header, dest)?;

        let mut flags = Frame::decode(dest[0]).map(|f| f.flags()).unwrap_or_default();

        if flags.continue_flag() {
            let mut continuation = Vec::new();

            while flags.continue_flag() {
                self.read_response(is_stack_continuation_header, &mut continuation)?;
                dest.extend_from_slice(&continuation);

                flags = continuation
                    .first()
                    .copied()
                    .and_then(Frame::decode)
                    .map(|f| f.flags())
                    .unwrap_or_default();
            }
        }

        if flags.timeout() {
            return Err(MvlcError::NoVmeResponse);
        }

        if flags.syntax_error() {
            return Err(MvlcError::StackSyntaxError);
        }

        Ok(())
    }

    /// Upload `stack` to the immediate slot, execute it and collect the
    /// response. A reference marker is placed at the head of the stack and
    /// verified against the second word of the response.
    pub fn stack_transaction(
        &mut self,
        stack: &StackCommandBuilder,
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        let ref_word = self.next_reference_word();

        let mut marked = StackCommandBuilder::new();
        marked.add_write_marker(u32::from(ref_word));
        for cmd in stack.commands() {
            marked.add_command(cmd);
        }

        let stack_words = make_stack_buffer(&marked, Pipe::Command);

        if stack_words.len() > usize::from(stacks::IMMEDIATE_STACK_RESERVED_WORDS) {
            return Err(MvlcError::StackMemoryExceeded);
        }

        let upload = make_stack_upload_commands(
            stacks::IMMEDIATE_STACK_START_OFFSET_WORDS * stacks::ADDRESS_INCREMENT,
            &stack_words,
        );

        let request = make_command_buffer(&upload);
        self.super_transaction(&request, dest)?;

        self.exec_immediate_stack(0, dest)?;

        match dest.get(1) {
            Some(&marker) if marker == u32::from(ref_word) => Ok(()),
            Some(_) => Err(MvlcError::StackReferenceMismatch),
            None => Err(MvlcError::UnexpectedResponseSize { wanted: 2, got: dest.len() }),
        }
    }

    /// Point the immediate slot at `stack_memory_offset` (a byte offset
    /// into stack memory) and trigger it, collecting the response.
    pub fn exec_immediate_stack(
        &mut self,
        stack_memory_offset: u16,
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        self.write_register(stacks::STACK0_OFFSET_REGISTER, u32::from(stack_memory_offset))?;
        self.write_register(
            stacks::STACK0_TRIGGER_REGISTER,
            1 << stacks::IMMEDIATE_SHIFT,
        )?;

        self.read_stack_response(dest)
    }

    /// Upload a stack buffer to `stack_memory_offset`, split into as many
    /// mirror transactions as needed to respect the transaction limit.
    pub fn upload_stack(
        &mut self,
        out_pipe: Pipe,
        stack_memory_offset: u16,
        stack: &StackCommandBuilder,
        response: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        let stack_words = make_stack_buffer(stack, out_pipe);
        self.upload_stack_words(stack_memory_offset, &stack_words, response)
    }

    pub fn upload_stack_words(
        &mut self,
        stack_memory_offset: u16,
        stack_words: &[u32],
        response: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        let end = usize::from(stacks::STACK_MEMORY_BEGIN)
            + usize::from(stack_memory_offset)
            + stack_words.len() * 4;

        if end >= usize::from(stacks::STACK_MEMORY_END) {
            return Err(MvlcError::StackMemoryExceeded);
        }

        let upload = make_stack_upload_commands(stack_memory_offset, stack_words);
        let parts =
            split_into_transaction_parts(&upload, limits::MIRROR_TRANSACTION_MAX_CONTENTS_WORDS);
        let part_count = parts.len();

        for (i, part) in parts.into_iter().enumerate() {
            let request = make_command_buffer(part);
            trace!(part = i, part_count, words = request.len(), "uploading stack part");
            self.super_transaction(&request, response)?;
        }

        debug!(part_count, words = stack_words.len(), "stack upload done");

        Ok(())
    }

    pub fn vme_write(
        &mut self,
        address: u32,
        value: u32,
        amod: u8,
        dw: VmeDataWidth,
    ) -> Result<(), MvlcError> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_write(address, value, amod, dw);

        let mut response = std::mem::take(&mut self.response_buffer);
        let result = self.stack_transaction(&stack, &mut response);
        let len = response.len();
        self.response_buffer = response;
        result?;

        // header + marker
        if len != 2 {
            return Err(MvlcError::UnexpectedResponseSize { wanted: 2, got: len });
        }

        Ok(())
    }

    pub fn vme_read(
        &mut self,
        address: u32,
        amod: u8,
        dw: VmeDataWidth,
    ) -> Result<u32, MvlcError> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_read(address, amod, dw);

        let mut response = std::mem::take(&mut self.response_buffer);
        let result = self.stack_transaction(&stack, &mut response);
        self.response_buffer = response;
        result?;

        // header + marker + value
        if self.response_buffer.len() != 3 {
            return Err(MvlcError::UnexpectedResponseSize {
                wanted: 3,
                got: self.response_buffer.len(),
            });
        }

        let mask: u32 = match dw {
            VmeDataWidth::D16 => 0x0000_ffff,
            VmeDataWidth::D32 => 0xffff_ffff,
        };

        Ok(self.response_buffer[2] & mask)
    }

    /// Execute an arbitrary command stack on the immediate slot and parse
    /// the response against the stack's groups.
    ///
    /// The reference marker heading the stack is attributed to a hidden
    /// group and not part of the returned results.
    pub fn run_stack(
        &mut self,
        stack: &StackCommandBuilder,
    ) -> Result<Vec<mvlc_proto::response::GroupResult>, MvlcError> {
        let mut response = std::mem::take(&mut self.response_buffer);
        let result = self.stack_transaction(stack, &mut response);
        self.response_buffer = response;
        result?;

        // Re-create the executed command list including the head marker
        // so the response walk stays aligned, then drop the marker group.
        let marker = self.response_buffer.get(1).copied().unwrap_or(0);

        let mut executed = StackCommandBuilder::new();
        executed.begin_group("reference_marker");
        executed.add_write_marker(marker);
        for group in stack.groups() {
            executed.begin_group(group.name.clone());
            for cmd in &group.commands {
                executed.add_command(*cmd);
            }
        }

        let mut groups =
            mvlc_proto::response::parse_response_groups(&executed, &self.response_buffer)?;
        groups.remove(0);

        Ok(groups)
    }

    /// Block read returning the raw framed response in `dest`:
    /// `[StackFrame header, marker, BlockRead frames...]`.
    pub fn vme_block_read(
        &mut self,
        address: u32,
        amod: u8,
        max_transfers: u16,
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        if !mvlc_proto::constants::vme_amods::is_block_mode(amod) {
            return Err(MvlcError::NonBlockAddressMode(amod));
        }

        let mut stack = StackCommandBuilder::new();
        stack.add_vme_block_read(address, amod, max_transfers);

        self.stack_transaction(&stack, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_check_accepts_an_exact_echo() {
        let request = vec![0xF100_0000, 0x0101_0001, 0x0102_1100, 0xF200_0000];
        let response = vec![0xF100_0003, 0x0101_0001, 0x0102_1100, 0xdead_beef];
        assert!(check_mirror(&request, &response).is_ok());
    }

    #[test]
    fn mirror_check_rejects_differing_words() {
        let request = vec![0xF100_0000, 0x0101_0001, 0xF200_0000];
        let response = vec![0xF100_0002, 0x0101_0002, 0x0000_0000];
        assert!(matches!(
            check_mirror(&request, &response),
            Err(MvlcError::MirrorNotEqual)
        ));
    }

    #[test]
    fn mirror_check_rejects_empty_and_short_buffers() {
        assert!(matches!(check_mirror(&[], &[1]), Err(MvlcError::MirrorEmptyRequest)));
        assert!(matches!(check_mirror(&[1], &[]), Err(MvlcError::MirrorEmptyResponse)));
        assert!(matches!(
            check_mirror(&[1, 2, 3, 4], &[1, 2]),
            Err(MvlcError::MirrorShortResponse)
        ));
    }

    #[test]
    fn stack_error_counters_accumulate_by_key() {
        use mvlc_proto::constants::{frame_flags, frame_headers};
        use mvlc_proto::frame::make_frame_header;

        let mut counters = StackErrorCounters::default();

        let frame = vec![
            make_frame_header(frame_headers::STACK_ERROR, 1, frame_flags::TIMEOUT, 2, 0),
            0x0000_002a,
        ];

        counters.record_frame(&frame);
        counters.record_frame(&frame);

        let key = StackErrorKey {
            stack: 2,
            line: 0x2a,
            flags: frame_flags::TIMEOUT,
        };
        assert_eq!(counters.counts.get(&key), Some(&2));
        assert_eq!(counters.total(), 2);
    }
}
