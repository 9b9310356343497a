// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Listfile container access.
//!
//! A listfile is a ZIP archive whose first contained file starts with an
//! 8-byte magic identifying the payload layout: `MVLC_USB` for a raw
//! frame stream or `MVLC_ETH` for reconstructed packets. Entries ending
//! in `.lz4` carry an LZ4-framed stream inside the archive entry.
//!
//! Reading streams through a decompression thread: the zip entry reader
//! borrows the archive, so a background thread owns archive and entry
//! and hands chunks over a bounded channel.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crossbeam_channel::{bounded, Receiver};
use tracing::debug;

use mvlc_common::MvlcError;
use mvlc_proto::TransportKind;

pub const MAGIC_LEN: usize = 8;
pub const MAGIC_USB: &[u8; MAGIC_LEN] = b"MVLC_USB";
pub const MAGIC_ETH: &[u8; MAGIC_LEN] = b"MVLC_ETH";

pub fn magic_for(kind: TransportKind) -> &'static [u8; MAGIC_LEN] {
    match kind {
        TransportKind::Usb => MAGIC_USB,
        TransportKind::Eth => MAGIC_ETH,
    }
}

pub fn kind_from_magic(magic: &[u8]) -> Option<TransportKind> {
    if magic.starts_with(MAGIC_USB) {
        Some(TransportKind::Usb)
    } else if magic.starts_with(MAGIC_ETH) {
        Some(TransportKind::Eth)
    } else {
        None
    }
}

/// Byte source for replay. `read` returns 0 at end of stream.
pub trait ReadHandle: Send {
    fn read(&mut self, dest: &mut [u8]) -> Result<usize, MvlcError>;
}

impl ReadHandle for File {
    fn read(&mut self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        Ok(Read::read(self, dest)?)
    }
}

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 16;

/// Streams the first entry of a listfile ZIP archive, transparently
/// decompressing `.lz4` entries.
pub struct ZipReadHandle {
    chunks: Receiver<Result<Vec<u8>, String>>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ZipReadHandle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MvlcError> {
        let file = File::open(path.as_ref())?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| MvlcError::Listfile(e.to_string()))?;

        if archive.len() == 0 {
            return Err(MvlcError::Listfile("archive contains no entries".into()));
        }

        let entry_name = archive
            .by_index(0)
            .map_err(|e| MvlcError::Listfile(e.to_string()))?
            .name()
            .to_owned();

        let lz4 = entry_name.ends_with(".lz4");

        debug!(entry = %entry_name, lz4, "opening listfile entry");

        let (tx, rx) = bounded(CHANNEL_DEPTH);

        std::thread::Builder::new()
            .name("listfile_reader".into())
            .spawn(move || {
                let entry = match archive.by_index(0) {
                    Ok(entry) => entry,
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let mut reader: Box<dyn Read> = if lz4 {
                    Box::new(lz4_flex::frame::FrameDecoder::new(entry))
                } else {
                    Box::new(entry)
                };

                loop {
                    let mut chunk = vec![0u8; CHUNK_SIZE];
                    match reader.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            chunk.truncate(n);
                            if tx.send(Ok(chunk)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.to_string()));
                            break;
                        }
                    }
                }
            })
            .map_err(MvlcError::Io)?;

        Ok(Self {
            chunks: rx,
            current: Vec::new(),
            pos: 0,
            done: false,
        })
    }
}

impl ReadHandle for ZipReadHandle {
    fn read(&mut self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        let mut written = 0;

        while written < dest.len() {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(dest.len() - written);
                dest[written..written + n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                written += n;
                continue;
            }

            if self.done {
                break;
            }

            match self.chunks.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(message)) => return Err(MvlcError::Listfile(message)),
                Err(_) => {
                    self.done = true;
                }
            }
        }

        Ok(written)
    }
}

/// The consumed preamble of a listfile stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub magic: [u8; MAGIC_LEN],
    pub kind: TransportKind,
}

/// Read and validate the 8-byte magic at the start of a listfile stream.
pub fn read_preamble(handle: &mut dyn ReadHandle) -> Result<Preamble, MvlcError> {
    let mut magic = [0u8; MAGIC_LEN];
    let mut got = 0;

    while got < MAGIC_LEN {
        let n = handle.read(&mut magic[got..])?;
        if n == 0 {
            return Err(MvlcError::UnknownListfileFormat);
        }
        got += n;
    }

    let kind = kind_from_magic(&magic).ok_or(MvlcError::UnknownListfileFormat)?;

    Ok(Preamble { magic, kind })
}

/// Writes a single-entry listfile archive. Kept minimal: the magic
/// followed by raw buffer contents, optionally LZ4-framed.
pub struct ZipWriteHandle {
    writer: Option<Lz4OrPlain>,
}

enum Lz4OrPlain {
    Plain(zip::ZipWriter<File>),
    Lz4(lz4_flex::frame::FrameEncoder<zip::ZipWriter<File>>),
}

impl ZipWriteHandle {
    pub fn create(
        path: impl AsRef<Path>,
        entry_name: &str,
        kind: TransportKind,
    ) -> Result<Self, MvlcError> {
        let file = File::create(path.as_ref())?;
        let mut writer = zip::ZipWriter::new(file);

        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(true);

        writer
            .start_file(entry_name, options)
            .map_err(|e| MvlcError::Listfile(e.to_string()))?;

        let mut inner = if entry_name.ends_with(".lz4") {
            Lz4OrPlain::Lz4(lz4_flex::frame::FrameEncoder::new(writer))
        } else {
            Lz4OrPlain::Plain(writer)
        };

        inner.write_all(magic_for(kind))?;

        Ok(Self {
            writer: Some(inner),
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), MvlcError> {
        match &mut self.writer {
            Some(w) => Ok(w.write_all(bytes)?),
            None => Err(MvlcError::Listfile("writer already closed".into())),
        }
    }

    pub fn finish(mut self) -> Result<(), MvlcError> {
        if let Some(writer) = self.writer.take() {
            let zip_writer = match writer {
                Lz4OrPlain::Plain(w) => w,
                Lz4OrPlain::Lz4(encoder) => encoder
                    .finish()
                    .map_err(|e| MvlcError::Listfile(e.to_string()))?,
            };
            zip_writer
                .finish()
                .map_err(|e| MvlcError::Listfile(e.to_string()))?;
        }
        Ok(())
    }
}

impl Lz4OrPlain {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Lz4OrPlain::Plain(w) => w.write_all(bytes),
            Lz4OrPlain::Lz4(w) => w.write_all(bytes),
        }
    }
}

impl ZipWriteHandle {
    /// Append a system event frame carrying `payload`. Long payloads are
    /// split over continuation frames, each below the frame length limit.
    pub fn write_system_event(&mut self, subtype: u8, payload: &[u32]) -> Result<(), MvlcError> {
        use mvlc_proto::constants::frame_headers::LENGTH_MASK;
        use mvlc_proto::frame::make_system_event_header;

        let max_chunk = LENGTH_MASK as usize;
        let mut chunks = payload.chunks(max_chunk).peekable();

        // An empty payload still produces one header word.
        if chunks.peek().is_none() {
            let header = make_system_event_header(subtype, 0, false, 0);
            return self.write(&mvlc_proto::bytes_from_words(&[header]));
        }

        while let Some(chunk) = chunks.next() {
            let continues = chunks.peek().is_some();
            let header = make_system_event_header(subtype, chunk.len() as u16, continues, 0);

            let mut words = Vec::with_capacity(chunk.len() + 1);
            words.push(header);
            words.extend_from_slice(chunk);

            self.write(&mvlc_proto::bytes_from_words(&words))?;
        }

        Ok(())
    }

    /// The standard run prefix: an endian marker followed by a BeginRun
    /// event.
    pub fn write_run_start(&mut self, run_number: u32) -> Result<(), MvlcError> {
        use mvlc_proto::constants::system_event::{subtype, ENDIAN_MARKER_VALUE};

        self.write_system_event(subtype::ENDIAN_MARKER, &[ENDIAN_MARKER_VALUE])?;
        self.write_system_event(subtype::BEGIN_RUN, &[run_number])
    }

    /// The standard run suffix: EndRun followed by an end-of-file marker.
    pub fn write_run_end(&mut self, run_number: u32) -> Result<(), MvlcError> {
        use mvlc_proto::constants::system_event::subtype;

        self.write_system_event(subtype::END_RUN, &[run_number])?;
        self.write_system_event(subtype::END_OF_FILE, &[])
    }
}

/// One system event found in a listfile preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreambleSection {
    pub subtype: u8,
    /// Payload words with continuation frames already merged.
    pub payload: Vec<u32>,
}

/// The preamble of a listfile: the magic plus the system events preceding
/// the first readout frame (endian marker, configs, BeginRun).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPreamble {
    pub kind: TransportKind,
    pub sections: Vec<PreambleSection>,
    /// Bytes consumed from the stream, including the magic.
    pub consumed: usize,
}

/// Read the magic and all leading system events of a listfile stream.
/// Stops at the first non-system frame or after BeginRun.
pub fn read_full_preamble(handle: &mut dyn ReadHandle) -> Result<FullPreamble, MvlcError> {
    use mvlc_proto::constants::system_event::subtype::BEGIN_RUN;
    use mvlc_proto::frame::Frame;
    use mvlc_proto::words_from_bytes;

    let preamble = read_preamble(handle)?;

    // Buffer enough of the head of the stream; preambles are small
    // compared to this.
    let mut head = vec![0u8; 1024 * 1024];
    let mut filled = 0;

    while filled < head.len() {
        let n = handle.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let words = words_from_bytes(&head[..filled]);

    // System events in the preamble are software generated and carry no
    // packet framing, so USB and ETH layouts read the same here.
    let mut sections: Vec<PreambleSection> = Vec::new();
    let mut pos = 0;
    let mut continuing = false;

    loop {
        let Some(&header) = words.get(pos) else { break };

        match Frame::decode(header) {
            Some(Frame::SystemEvent { len, subtype, continue_flag, .. }) => {
                let end = (pos + 1 + usize::from(len)).min(words.len());
                let payload = &words[pos + 1..end];

                if continuing {
                    if let Some(last) = sections.last_mut() {
                        last.payload.extend_from_slice(payload);
                    }
                } else {
                    sections.push(PreambleSection {
                        subtype,
                        payload: payload.to_vec(),
                    });
                }

                continuing = continue_flag;
                pos = end;

                if subtype == BEGIN_RUN && !continue_flag {
                    break;
                }
            }
            _ => break,
        }
    }

    Ok(FullPreamble {
        kind: preamble.kind,
        sections,
        consumed: MAGIC_LEN + pos * 4,
    })
}

/// Per-type frame statistics of one listfile stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListfileSummary {
    pub kind: Option<TransportKind>,
    pub total_bytes: u64,
    pub stack_frames: u64,
    pub stack_continuations: u64,
    pub block_read_frames: u64,
    pub stack_error_frames: u64,
    pub system_events: u64,
    /// System event counts by subtype.
    pub system_event_subtypes: std::collections::HashMap<u8, u64>,
    pub eth_packets: u64,
    pub unknown_words: u64,
}

/// Scan a whole listfile stream and summarize its frame contents.
/// USB streams are walked frame by frame; ETH streams packet by packet
/// with the MVLC frames inside.
pub fn scan_listfile(handle: &mut dyn ReadHandle) -> Result<ListfileSummary, MvlcError> {
    use mvlc_proto::fixup::{fixup_eth_buffer, fixup_usb_buffer};
    use mvlc_proto::words_from_bytes;

    let preamble = read_preamble(handle)?;

    let mut summary = ListfileSummary {
        kind: Some(preamble.kind),
        total_bytes: MAGIC_LEN as u64,
        ..Default::default()
    };

    let mut leftover: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 1024 * 1024];

    loop {
        let mut buffer = std::mem::take(&mut leftover);
        let n = handle.read(&mut chunk)?;

        if n == 0 && buffer.is_empty() {
            break;
        }

        buffer.extend_from_slice(&chunk[..n]);
        summary.total_bytes += n as u64;

        let used = match preamble.kind {
            TransportKind::Usb => fixup_usb_buffer(&buffer, &mut leftover),
            TransportKind::Eth => fixup_eth_buffer(&buffer, &mut leftover),
        };

        if used == 0 && n == 0 {
            // nothing but an incomplete tail left
            summary.unknown_words += (buffer.len() / 4) as u64;
            break;
        }

        let words = words_from_bytes(&buffer[..used]);

        match preamble.kind {
            TransportKind::Eth => {
                // Strip the per-packet framing words; raw SystemEvent
                // frames sit between packets and pass through as-is.
                let mut payload = Vec::with_capacity(words.len());
                let mut pos = 0;

                while pos < words.len() {
                    if let Some(mvlc_proto::Frame::SystemEvent { len, .. }) =
                        mvlc_proto::Frame::decode(words[pos])
                    {
                        let end = (pos + 1 + usize::from(len)).min(words.len());
                        payload.extend_from_slice(&words[pos..end]);
                        pos = end;
                        continue;
                    }

                    if pos + 2 > words.len() {
                        break;
                    }

                    summary.eth_packets += 1;
                    let data_words = (words[pos] & 0x1fff) as usize;
                    let end = (pos + 2 + data_words).min(words.len());
                    payload.extend_from_slice(&words[pos + 2..end]);
                    pos = end;
                }

                summarize_frames(&payload, &mut summary);
            }
            TransportKind::Usb => {
                summarize_frames(&words, &mut summary);
            }
        }
    }

    Ok(summary)
}

/// Count the frames of a contiguous frame stream. Returns the number of
/// words consumed.
fn summarize_frames(words: &[u32], summary: &mut ListfileSummary) -> usize {
    use mvlc_proto::frame::Frame;

    // Walk a stack frame's payload for nested block read frames; other
    // payload words are module data.
    fn count_nested_blocks(payload: &[u32], summary: &mut ListfileSummary) {
        let mut inner = 0;

        while inner < payload.len() {
            if let Some(Frame::BlockRead { len, .. }) = Frame::decode(payload[inner]) {
                summary.block_read_frames += 1;
                inner += 1 + usize::from(len);
            } else {
                inner += 1;
            }
        }
    }

    let mut pos = 0;

    while pos < words.len() {
        match Frame::decode(words[pos]) {
            Some(Frame::Stack { len, .. }) => {
                summary.stack_frames += 1;
                let end = (pos + 1 + usize::from(len)).min(words.len());
                count_nested_blocks(&words[pos + 1..end], summary);
                pos = end;
            }
            Some(Frame::StackContinuation { len, .. }) => {
                summary.stack_continuations += 1;
                let end = (pos + 1 + usize::from(len)).min(words.len());
                count_nested_blocks(&words[pos + 1..end], summary);
                pos = end;
            }
            Some(Frame::StackError { len, .. }) => {
                summary.stack_error_frames += 1;
                pos += 1 + usize::from(len);
            }
            Some(Frame::SystemEvent { len, subtype, .. }) => {
                summary.system_events += 1;
                *summary.system_event_subtypes.entry(subtype).or_insert(0) += 1;
                pos += 1 + usize::from(len);
            }
            Some(frame) => {
                // top-level block read or super frames do not occur in
                // listfile streams; skip them structurally anyway
                pos += 1 + usize::from(frame.len());
            }
            None => {
                summary.unknown_words += 1;
                pos += 1;
            }
        }
    }

    pos
}
