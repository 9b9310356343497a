// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The minimal transport contract the dialog layer and the readout
//! workers operate against.

use mvlc_common::MvlcError;

use crate::constants::Pipe;

/// Which transport variant a connection uses. Also tags readout buffers
/// and listfiles, since the buffer framing differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Eth,
}

/// Byte-level access to the two MVLC pipes.
///
/// Writes are atomic at the protocol level: one call transfers one
/// complete super command buffer. Reads fill as much of `buf` as arrives
/// within the transport's read timeout; a timeout with no data at all is
/// an error, a partial transfer is returned as a short `Ok`.
pub trait PipeIo: Send + Sync {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError>;

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError>;

    fn kind(&self) -> TransportKind;

    /// True when the connection needs the USB2 quirk: a zero-byte read
    /// timeout may be spurious and is worth one retry.
    fn needs_usb2_read_retry(&self) -> bool {
        false
    }
}

impl<T: PipeIo + ?Sized> PipeIo for &T {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        (**self).write(pipe, buf)
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        (**self).read(pipe, buf)
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn needs_usb2_read_retry(&self) -> bool {
        (**self).needs_usb2_read_retry()
    }
}

impl<T: PipeIo + ?Sized> PipeIo for std::sync::Arc<T> {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        (**self).write(pipe, buf)
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        (**self).read(pipe, buf)
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn needs_usb2_read_retry(&self) -> bool {
        (**self).needs_usb2_read_retry()
    }
}
