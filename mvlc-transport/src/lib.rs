// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! MVLC transports.
//!
//! Two variants exist behind one capability set: USB3/USB2 through the
//! FT60x FIFO bridge, and Gigabit Ethernet through three UDP sockets
//! (command, data, delay). Packet-loss accounting and readout throttling
//! belong to the ETH variant only.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod eth;
mod post_connect;
#[cfg(target_os = "linux")]
mod throttle;
#[cfg(not(target_os = "linux"))]
#[path = "throttle_stub.rs"]
mod throttle;
pub mod usb;

pub use eth::{EthThrottleCounters, EthTransport, PacketChannelStats, PipeStats};
pub use usb::{DeviceInfo, UsbTransport};

use mvlc_common::MvlcError;
use mvlc_proto::{Pipe, PipeIo, TransportKind};

/// The MVLC connection as a sum of the two transport variants.
pub enum Transport {
    Usb(UsbTransport),
    Eth(EthTransport),
}

impl Transport {
    /// Connect to an MVLC over UDP.
    pub fn eth(host: impl Into<String>) -> Transport {
        Transport::Eth(EthTransport::new(host))
    }

    /// Connect to the first MVLC found on USB.
    pub fn usb() -> Transport {
        Transport::Usb(UsbTransport::first())
    }

    pub fn usb_by_serial(serial: impl Into<String>) -> Transport {
        Transport::Usb(UsbTransport::by_serial(serial))
    }

    /// Acquire endpoints, apply default timeouts, verify the device
    /// identity and deal with leftover DAQ-mode state from a prior
    /// session.
    pub fn connect(&mut self) -> Result<(), MvlcError> {
        match self {
            Transport::Usb(t) => t.connect(),
            Transport::Eth(t) => t.connect(),
        }
    }

    /// Idempotent release. The second call reports `IsDisconnected`.
    pub fn disconnect(&mut self) -> Result<(), MvlcError> {
        match self {
            Transport::Usb(t) => t.disconnect(),
            Transport::Eth(t) => t.disconnect(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Usb(t) => t.is_connected(),
            Transport::Eth(t) => t.is_connected(),
        }
    }

    /// When set (the default), a DAQ mode left enabled by a previous
    /// session is cleared during connect instead of failing with `InUse`.
    pub fn set_disable_triggers_on_connect(&mut self, value: bool) {
        match self {
            Transport::Usb(t) => t.set_disable_triggers_on_connect(value),
            Transport::Eth(t) => t.set_disable_triggers_on_connect(value),
        }
    }

    pub fn connection_info(&self) -> String {
        match self {
            Transport::Usb(t) => t.connection_info(),
            Transport::Eth(t) => t.connection_info(),
        }
    }

    /// ETH only: receive one raw data packet, framing words included.
    pub fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        match self {
            Transport::Usb(_) => Err(MvlcError::Usb(
                "read_data_packet is only available on the ETH transport".into(),
            )),
            Transport::Eth(t) => t.read_data_packet(dest),
        }
    }
}

/// What the readout worker needs from a connection: pipe IO plus raw
/// data-packet reads on the ETH variant.
pub trait ReadoutTransport: PipeIo {
    fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError>;
}

impl ReadoutTransport for Transport {
    fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        Transport::read_data_packet(self, dest)
    }
}

impl<T: ReadoutTransport + ?Sized> ReadoutTransport for &T {
    fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        (**self).read_data_packet(dest)
    }
}

impl<T: ReadoutTransport + ?Sized> ReadoutTransport for std::sync::Arc<T> {
    fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        (**self).read_data_packet(dest)
    }
}

impl PipeIo for Transport {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        match self {
            Transport::Usb(t) => t.write(pipe, buf),
            Transport::Eth(t) => t.write(pipe, buf),
        }
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        match self {
            Transport::Usb(t) => t.read(pipe, buf),
            Transport::Eth(t) => t.read(pipe, buf),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            Transport::Usb(_) => TransportKind::Usb,
            Transport::Eth(_) => TransportKind::Eth,
        }
    }

    fn needs_usb2_read_retry(&self) -> bool {
        match self {
            Transport::Usb(t) => t.needs_usb2_read_retry(),
            Transport::Eth(_) => false,
        }
    }
}
