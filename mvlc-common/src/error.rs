// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Error codes shared by all MVLC driver crates.
//!
//! Every code maps onto one of the five coarse [`ErrorKind`] conditions.
//! Only [`ErrorKind::Connection`] is fatal to a session; timeouts are
//! recoverable with bounded retry, VME errors are reported per command.

use std::io;

/// The coarse error condition a concrete [`MvlcError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection to the MVLC is unusable. Fatal to the session.
    Connection,
    /// A bounded wait elapsed. Recoverable by retrying.
    Timeout,
    /// Fewer bytes than requested were transferred.
    ShortTransfer,
    /// The MVLC or this library violated the wire protocol.
    Protocol,
    /// The VME bus reported an error for a cycle.
    Vme,
}

/// Error codes produced by the MVLC driver stack.
#[derive(Debug, thiserror::Error)]
pub enum MvlcError {
    #[error("already connected")]
    IsConnected,
    #[error("not connected")]
    IsDisconnected,
    #[error("another client is using the MVLC (DAQ mode is enabled)")]
    InUse,
    #[error("host lookup failed for '{0}'")]
    HostLookup(String),
    #[error("USB chip configuration does not match the MVLC requirements")]
    UsbChipConfigError,
    #[error("device does not identify as an MVLC (hardware id 0x{0:04x})")]
    WrongDeviceIdentity(u32),
    #[error("USB error: {0}")]
    Usb(String),

    #[error("wrote fewer bytes than requested")]
    ShortWrite,
    #[error("read fewer bytes than requested")]
    ShortRead,

    #[error("mirror request is empty")]
    MirrorEmptyRequest,
    #[error("mirror response is empty")]
    MirrorEmptyResponse,
    #[error("mirror response is shorter than the request")]
    MirrorShortResponse,
    #[error("mirror response does not equal the request")]
    MirrorNotEqual,
    #[error("mirror transaction failed after the maximum number of tries")]
    MirrorMaxTriesExceeded,
    #[error("mirror transaction exceeds the maximum transaction size")]
    MirrorTransactionMaxWordsExceeded,
    #[error("super response reference word does not match the request")]
    SuperReferenceMismatch,
    #[error("stack response reference word does not match the request")]
    StackReferenceMismatch,

    #[error("received word 0x{0:08x} is not a known frame header")]
    InvalidBufferHeader(u32),
    #[error("received frame header 0x{0:08x} does not validate against the expected response type")]
    UnexpectedBufferHeader(u32),
    #[error("no usable response frame arrived within the maximum wait time")]
    ReadResponseMaxWaitExceeded,
    #[error("unexpected response size: wanted {wanted} words, got {got}")]
    UnexpectedResponseSize { wanted: usize, got: usize },

    #[error("stack id out of range")]
    StackCountExceeded,
    #[error("stack contents exceed the on-device stack memory")]
    StackMemoryExceeded,
    #[error("stack 0 is reserved for immediate execution")]
    Stack0IsReserved,
    #[error("MVLC flagged a stack syntax error")]
    StackSyntaxError,
    #[error("word 0x{0:08x} is not a valid stack start header")]
    InvalidStackHeader(u32),
    #[error("address mode 0x{0:02x} is not a block transfer mode")]
    NonBlockAddressMode(u8),

    #[error("UDP packet channel {0} is out of range")]
    UdpPacketChannelOutOfRange(u8),
    #[error("UDP dataWordCount {words} exceeds the received packet size of {packet_words} words")]
    UdpDataWordCountExceedsPacketSize { words: u16, packet_words: usize },
    #[error("timeout reading from socket")]
    SocketReadTimeout,
    #[error("timeout writing to socket")]
    SocketWriteTimeout,

    #[error("no VME response (bus timeout)")]
    NoVmeResponse,
    #[error("VME bus error")]
    VmeBusError,

    #[error("listfile does not start with a known MVLC magic")]
    UnknownListfileFormat,
    #[error("listfile error: {0}")]
    Listfile(String),
    #[error("worker is not idle")]
    WorkerNotIdle,
    #[error("worker is not running")]
    WorkerNotRunning,
    #[error("worker is not paused")]
    WorkerNotPaused,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MvlcError {
    /// Classify this error into its coarse [`ErrorKind`] condition.
    pub fn kind(&self) -> ErrorKind {
        use MvlcError::*;

        match self {
            IsConnected | IsDisconnected | InUse | HostLookup(_) | UsbChipConfigError
            | WrongDeviceIdentity(_) | Usb(_) | MirrorMaxTriesExceeded => ErrorKind::Connection,

            ShortWrite | ShortRead => ErrorKind::ShortTransfer,

            SocketReadTimeout | SocketWriteTimeout | ReadResponseMaxWaitExceeded => {
                ErrorKind::Timeout
            }

            NoVmeResponse | VmeBusError => ErrorKind::Vme,

            MirrorEmptyRequest | MirrorEmptyResponse | MirrorShortResponse | MirrorNotEqual
            | MirrorTransactionMaxWordsExceeded | SuperReferenceMismatch
            | StackReferenceMismatch | InvalidBufferHeader(_) | UnexpectedBufferHeader(_)
            | UnexpectedResponseSize { .. } | StackCountExceeded | StackMemoryExceeded
            | Stack0IsReserved | StackSyntaxError | InvalidStackHeader(_)
            | NonBlockAddressMode(_) | UdpPacketChannelOutOfRange(_)
            | UdpDataWordCountExceedsPacketSize { .. } | UnknownListfileFormat
            | Listfile(_) | WorkerNotIdle | WorkerNotRunning | WorkerNotPaused => {
                ErrorKind::Protocol
            }

            Io(e) => match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
                _ => ErrorKind::Connection,
            },
        }
    }

    /// True if retrying the operation may succeed.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub fn is_vme_error(&self) -> bool {
        self.kind() == ErrorKind::Vme
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_error_taxonomy() {
        assert_eq!(MvlcError::IsDisconnected.kind(), ErrorKind::Connection);
        assert_eq!(MvlcError::InUse.kind(), ErrorKind::Connection);
        assert_eq!(MvlcError::MirrorMaxTriesExceeded.kind(), ErrorKind::Connection);
        assert_eq!(MvlcError::ShortRead.kind(), ErrorKind::ShortTransfer);
        assert_eq!(MvlcError::SocketReadTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            MvlcError::ReadResponseMaxWaitExceeded.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(MvlcError::MirrorNotEqual.kind(), ErrorKind::Protocol);
        assert_eq!(MvlcError::StackMemoryExceeded.kind(), ErrorKind::Protocol);
        assert_eq!(MvlcError::NoVmeResponse.kind(), ErrorKind::Vme);
        assert_eq!(MvlcError::VmeBusError.kind(), ErrorKind::Vme);
    }

    #[test]
    fn io_timeouts_classify_as_timeouts() {
        let e = MvlcError::from(io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(e.is_timeout());

        let e = MvlcError::from(io::Error::new(io::ErrorKind::ConnectionReset, "r"));
        assert!(e.is_connection_error());
    }
}
