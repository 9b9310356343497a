// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Parsing of stack responses against the command list that produced them.
//!
//! The response buffer is the raw dialog output: a StackFrame header,
//! payload words, and possibly interleaved StackContinuation headers when
//! the response spans multiple frames. Walking the originating commands
//! attributes each produced word: a VME read yields one word, a block read
//! yields one BlockRead sub-frame (plus continuations), markers and
//! specials yield their literal word, writes and pure control commands
//! yield nothing.

use mvlc_common::MvlcError;

use crate::frame::Frame;
use crate::stack_commands::{StackCommand, StackCommandBuilder, StackGroup};

/// One command paired with the response words it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: StackCommand,
    pub data: Vec<u32>,
}

/// Results of one group of commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResult {
    pub name: String,
    pub results: Vec<CommandResult>,
}

/// Cursor over a framed response that transparently crosses
/// StackContinuation boundaries.
struct FrameCursor<'a> {
    words: &'a [u32],
    pos: usize,
    frame_remaining: usize,
}

impl<'a> FrameCursor<'a> {
    fn new(words: &'a [u32]) -> Result<Self, MvlcError> {
        let header = *words.first().ok_or(MvlcError::MirrorEmptyResponse)?;

        match Frame::decode(header) {
            Some(Frame::Stack { len, .. }) => Ok(FrameCursor {
                words,
                pos: 1,
                frame_remaining: len as usize,
            }),
            _ => Err(MvlcError::UnexpectedBufferHeader(header)),
        }
    }

    fn next_word(&mut self) -> Result<u32, MvlcError> {
        while self.frame_remaining == 0 {
            let header = *self
                .words
                .get(self.pos)
                .ok_or(MvlcError::UnexpectedResponseSize {
                    wanted: self.pos + 1,
                    got: self.words.len(),
                })?;

            match Frame::decode(header) {
                Some(Frame::StackContinuation { len, .. }) => {
                    self.pos += 1;
                    self.frame_remaining = len as usize;
                }
                _ => return Err(MvlcError::UnexpectedBufferHeader(header)),
            }
        }

        let word = *self
            .words
            .get(self.pos)
            .ok_or(MvlcError::UnexpectedResponseSize {
                wanted: self.pos + 1,
                got: self.words.len(),
            })?;

        self.pos += 1;
        self.frame_remaining -= 1;
        Ok(word)
    }
}

/// Number of response words a command produces, or None for block reads
/// whose size comes from the BlockRead frame header.
fn fixed_output_words(cmd: &StackCommand) -> Option<usize> {
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

/// Walk `response` against the commands that produced it.
pub fn parse_response_list(
    commands: &[StackCommand],
    response: &[u32],
) -> Result<Vec<CommandResult>, MvlcError> {
    let mut cursor = FrameCursor::new(response)?;
    let mut results = Vec::with_capacity(commands.len());

    for &command in commands {
        let data = match fixed_output_words(&command) {
            Some(n) => {
                let mut data = Vec::with_capacity(n);
                for _ in 0..n {
                    data.push(cursor.next_word()?);
                }
                data
            }
            None => read_block_frames(&mut cursor)?,
        };

        results.push(CommandResult { command, data });
    }

    Ok(results)
}

fn read_block_frames(cursor: &mut FrameCursor<'_>) -> Result<Vec<u32>, MvlcError> {
    let mut data = Vec::new();

    loop {
        let header = cursor.next_word()?;

        let (len, flags) = match Frame::decode(header) {
            Some(Frame::BlockRead { len, flags, .. }) => (len, flags),
            _ => return Err(MvlcError::UnexpectedBufferHeader(header)),
        };

        for _ in 0..len {
            data.push(cursor.next_word()?);
        }

        if !flags.continue_flag() {
            break;
        }
    }

    Ok(data)
}

/// Like [`parse_response_list`] but grouped by the originating stack groups.
pub fn parse_response_groups(
    builder: &StackCommandBuilder,
    response: &[u32],
) -> Result<Vec<GroupResult>, MvlcError> {
    let flat = parse_response_list(&builder.commands(), response)?;
    let mut it = flat.into_iter();

    let groups = builder
        .groups()
        .iter()
        .map(|g: &StackGroup| GroupResult {
            name: g.name.clone(),
            results: it.by_ref().take(g.commands.len()).collect(),
        })
        .collect();

    Ok(groups)
}
