// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Super command primitives and the command buffer encoding.
//!
//! A super command buffer is the unit of one mirror transaction on the
//! command pipe: `[CmdBufferStart, <encoded primitives>, CmdBufferEnd]`.
//! The MVLC echoes words `[1..len-1]` of the request back in a SuperFrame.

use crate::constants::stacks;
use crate::constants::super_commands::*;

/// A single super command primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperCommand {
    /// A 16-bit client-chosen tag echoed back verbatim in the response.
    ReferenceWord(u16),
    /// Read an MVLC-local register.
    ReadLocal { address: u16 },
    /// Write an MVLC-local register.
    WriteLocal { address: u16, value: u32 },
    /// Inter-frame delay applied to the ETH data pipe, in microseconds.
    EthDelay { delay_us: u16 },
}

impl SuperCommand {
    /// Encoded size in 32-bit words. A pure function of the variant.
    pub fn encoded_size(&self) -> usize {
        match self {
            SuperCommand::ReferenceWord(_) => 1,
            SuperCommand::ReadLocal { .. } => 1,
            SuperCommand::WriteLocal { .. } => 2,
            SuperCommand::EthDelay { .. } => 1,
        }
    }

    fn encode_into(&self, out: &mut Vec<u32>) {
        match *self {
            SuperCommand::ReferenceWord(value) => {
                out.push(cmd_word(REFERENCE_WORD, value));
            }
            SuperCommand::ReadLocal { address } => {
                out.push(cmd_word(READ_LOCAL, address));
            }
            SuperCommand::WriteLocal { address, value } => {
                out.push(cmd_word(WRITE_LOCAL, address));
                out.push(value);
            }
            SuperCommand::EthDelay { delay_us } => {
                out.push(cmd_word(ETH_DELAY, delay_us));
            }
        }
    }
}

fn cmd_word(cmd: u16, arg: u16) -> u32 {
    (u32::from(cmd) << SUPER_CMD_SHIFT) | u32::from(arg)
}

impl std::fmt::Display for SuperCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            SuperCommand::ReferenceWord(value) => write!(f, "ref_word 0x{value:04x}"),
            SuperCommand::ReadLocal { address } => write!(f, "read_local 0x{address:04x}"),
            SuperCommand::WriteLocal { address, value } => {
                write!(f, "write_local 0x{address:04x} 0x{value:08x}")
            }
            SuperCommand::EthDelay { delay_us } => write!(f, "eth_delay {delay_us}us"),
        }
    }
}

/// Ordered list of super commands, built incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperCommandBuilder {
    commands: Vec<SuperCommand>,
}

impl SuperCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference_word(&mut self, value: u16) -> &mut Self {
        self.commands.push(SuperCommand::ReferenceWord(value));
        self
    }

    pub fn add_read_local(&mut self, address: u16) -> &mut Self {
        self.commands.push(SuperCommand::ReadLocal { address });
        self
    }

    pub fn add_write_local(&mut self, address: u16, value: u32) -> &mut Self {
        self.commands.push(SuperCommand::WriteLocal { address, value });
        self
    }

    pub fn add_eth_delay(&mut self, delay_us: u16) -> &mut Self {
        self.commands.push(SuperCommand::EthDelay { delay_us });
        self
    }

    pub fn commands(&self) -> &[SuperCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// Encode a list of super commands into a full command buffer, bracketed by
/// the buffer start/end markers.
pub fn make_command_buffer(commands: &[SuperCommand]) -> Vec<u32> {
    let contents: usize = commands.iter().map(SuperCommand::encoded_size).sum();
    let mut out = Vec::with_capacity(contents + 2);

    out.push(u32::from(CMD_BUFFER_START) << SUPER_CMD_SHIFT);
    for cmd in commands {
        cmd.encode_into(&mut out);
    }
    out.push(u32::from(CMD_BUFFER_END) << SUPER_CMD_SHIFT);

    out
}

/// Total encoded size of a command buffer including the start/end markers.
pub fn get_encoded_buffer_size(commands: &[SuperCommand]) -> usize {
    2 + commands.iter().map(SuperCommand::encoded_size).sum::<usize>()
}

/// Generate the WriteLocal commands that place `stack_words` into stack
/// memory starting at the given word-aligned byte offset.
pub fn make_stack_upload_commands(stack_memory_offset: u16, stack_words: &[u32]) -> Vec<SuperCommand> {
    let mut address = stacks::STACK_MEMORY_BEGIN + stack_memory_offset;

    stack_words
        .iter()
        .map(|&value| {
            let cmd = SuperCommand::WriteLocal { address, value };
            address += stacks::ADDRESS_INCREMENT;
            cmd
        })
        .collect()
}

/// Partition `commands` into consecutive parts whose encoded contents each
/// fit within `max_contents_words`. Every part becomes its own mirror
/// transaction during a stack upload.
pub fn split_into_transaction_parts(
    commands: &[SuperCommand],
    max_contents_words: usize,
) -> Vec<&[SuperCommand]> {
    let mut parts = Vec::new();
    let mut first = 0;

    while first < commands.len() {
        let mut last = first;
        let mut encoded = 0;

        while last < commands.len() {
            let size = commands[last].encoded_size();
            if encoded + size > max_contents_words {
                break;
            }
            encoded += size;
            last += 1;
        }

        debug_assert!(last > first, "a single command exceeds the transaction limit");
        parts.push(&commands[first..last]);
        first = last;
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::limits;

    #[test]
    fn command_buffer_is_bracketed() {
        let mut sb = SuperCommandBuilder::new();
        sb.add_reference_word(0xabcd).add_read_local(0x1100);

        let buffer = make_command_buffer(sb.commands());

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer[0], 0xF100_0000);
        assert_eq!(buffer[1], 0x0101_abcd);
        assert_eq!(buffer[2], 0x0102_1100);
        assert_eq!(buffer[3], 0xF200_0000);
    }

    #[test]
    fn write_local_encodes_as_two_words() {
        let mut sb = SuperCommandBuilder::new();
        sb.add_write_local(0x1304, 0x8765_4321);

        let buffer = make_command_buffer(sb.commands());

        assert_eq!(buffer, vec![0xF100_0000, 0x0204_1304, 0x8765_4321, 0xF200_0000]);
        assert_eq!(get_encoded_buffer_size(sb.commands()), 4);
    }

    #[test]
    fn eth_delay_carries_the_delay_in_the_low_half() {
        let mut sb = SuperCommandBuilder::new();
        sb.add_eth_delay(1000);
        let buffer = make_command_buffer(sb.commands());
        assert_eq!(buffer[1], 0x0207_03e8);
    }

    #[test]
    fn upload_commands_advance_the_register_address() {
        let words = [0xF300_0000, 0x1111_1111, 0xF400_0000];
        let cmds = make_stack_upload_commands(0x100, &words);

        assert_eq!(cmds.len(), 3);
        assert_eq!(
            cmds[0],
            SuperCommand::WriteLocal { address: 0x2100, value: 0xF300_0000 }
        );
        assert_eq!(
            cmds[2],
            SuperCommand::WriteLocal { address: 0x2108, value: 0xF400_0000 }
        );
    }

    #[test]
    fn transaction_splitting_respects_the_contents_limit() {
        // WriteLocal encodes as two words, so 100 of them need three parts
        // when at most 96 contents words fit into one transaction.
        let cmds: Vec<_> = (0..100)
            .map(|i| SuperCommand::WriteLocal { address: 0x2000 + 4 * i, value: u32::from(i) })
            .collect();

        let parts = split_into_transaction_parts(&cmds, 96);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 48);
        assert_eq!(parts[1].len(), 48);
        assert_eq!(parts[2].len(), 4);
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), 100);

        for part in parts {
            let encoded: usize = part.iter().map(SuperCommand::encoded_size).sum();
            assert!(encoded <= 96);
        }
    }

    #[test]
    fn full_transaction_limit_allows_the_maximum_contents() {
        let cmds: Vec<_> = (0..limits::MIRROR_TRANSACTION_MAX_CONTENTS_WORDS)
            .map(|_| SuperCommand::ReferenceWord(1))
            .collect();

        let parts = split_into_transaction_parts(&cmds, limits::MIRROR_TRANSACTION_MAX_CONTENTS_WORDS);
        assert_eq!(parts.len(), 1);
        assert_eq!(
            get_encoded_buffer_size(parts[0]),
            limits::MIRROR_TRANSACTION_MAX_WORDS
        );
    }
}
