// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The USB transport.
//!
//! The MVLC sits behind an FTDI FT60x USB3 FIFO bridge exposing two
//! channels as vendor bulk endpoint pairs: 0x02/0x82 for the command pipe
//! and 0x03/0x83 for the data pipe. Device discovery matches the product
//! description against "MVLC". At connect time the FT60x chip
//! configuration is read back and verified: 100 MHz FIFO clock, 600-mode
//! FIFO, two channels, self-powered with remote wakeup and no optional
//! features enabled.

use std::sync::Mutex;
use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};
use tracing::{debug, info, warn};

use mvlc_common::MvlcError;
use mvlc_proto::constants::usb::{
    ENDPOINTS, FT600_PRODUCT_ID, FT601_PRODUCT_ID, FTDI_VENDOR_ID,
};
use mvlc_proto::{Pipe, PipeIo, TransportKind};

use crate::post_connect::verify_and_cleanup;

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// FT60x chip configuration access: vendor IN control transfer.
const FT60X_REQUEST_GET_CONFIG: u8 = 0xCF;
const FT60X_CONFIG_SIZE: usize = 152;

// Byte offsets and expected values within the FT60x configuration block.
const CFG_OFFSET_POWER_ATTRIBUTES: usize = 133;
const CFG_OFFSET_FIFO_CLOCK: usize = 137;
const CFG_OFFSET_FIFO_MODE: usize = 138;
const CFG_OFFSET_CHANNEL_CONFIG: usize = 139;
const CFG_OFFSET_OPTIONAL_FEATURES: usize = 140;

const CFG_FIFO_CLK_100MHZ: u8 = 0;
const CFG_FIFO_MODE_600: u8 = 1;
const CFG_CHANNEL_CONFIG_2: u8 = 2;
const CFG_POWER_SELF_POWERED: u8 = 0x40;
const CFG_POWER_REMOTE_WAKEUP: u8 = 0x20;
const CFG_OPTIONAL_FEATURES_DISABLE_ALL: u16 = 0;

/// How a device is selected at connect time.
#[derive(Debug, Clone)]
enum ConnectMode {
    First,
    ByIndex(usize),
    BySerial(String),
}

/// Description of one enumerated MVLC USB device.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub index: usize,
    pub serial: String,
    pub description: String,
    pub usb2: bool,
    pub usb3: bool,
}

fn map_usb_err(e: rusb::Error) -> MvlcError {
    match e {
        rusb::Error::Timeout => MvlcError::SocketReadTimeout,
        other => MvlcError::Usb(other.to_string()),
    }
}

/// Enumerate FT60x devices whose description contains "MVLC".
pub fn get_device_info_list() -> Result<Vec<DeviceInfo>, MvlcError> {
    let devices = rusb::devices().map_err(map_usb_err)?;
    let mut result = Vec::new();

    for (index, device) in devices.iter().enumerate() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        if descriptor.vendor_id() != FTDI_VENDOR_ID
            || !matches!(descriptor.product_id(), FT600_PRODUCT_ID | FT601_PRODUCT_ID)
        {
            continue;
        }

        let Ok(handle) = device.open() else {
            continue;
        };

        let description = handle
            .read_product_string_ascii(&descriptor)
            .unwrap_or_default();

        if !description.contains("MVLC") {
            continue;
        }

        let serial = handle
            .read_serial_number_string_ascii(&descriptor)
            .unwrap_or_default();

        let speed = device.speed();

        result.push(DeviceInfo {
            index,
            serial,
            description,
            usb2: matches!(speed, rusb::Speed::High | rusb::Speed::Full),
            usb3: matches!(speed, rusb::Speed::Super | rusb::Speed::SuperPlus),
        });
    }

    Ok(result)
}

fn check_chip_configuration(handle: &DeviceHandle<GlobalContext>) -> Result<(), MvlcError> {
    let mut config = [0u8; FT60X_CONFIG_SIZE];

    let request_type = rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    );

    let read = handle
        .read_control(
            request_type,
            FT60X_REQUEST_GET_CONFIG,
            1,
            0,
            &mut config,
            READ_TIMEOUT,
        )
        .map_err(map_usb_err)?;

    if read < FT60X_CONFIG_SIZE {
        return Err(MvlcError::UsbChipConfigError);
    }

    let power = config[CFG_OFFSET_POWER_ATTRIBUTES];
    let optional = u16::from_le_bytes([
        config[CFG_OFFSET_OPTIONAL_FEATURES],
        config[CFG_OFFSET_OPTIONAL_FEATURES + 1],
    ]);

    if config[CFG_OFFSET_FIFO_CLOCK] != CFG_FIFO_CLK_100MHZ
        || config[CFG_OFFSET_FIFO_MODE] != CFG_FIFO_MODE_600
        || config[CFG_OFFSET_CHANNEL_CONFIG] != CFG_CHANNEL_CONFIG_2
        || power & CFG_POWER_SELF_POWERED == 0
        || power & CFG_POWER_REMOTE_WAKEUP == 0
        || optional != CFG_OPTIONAL_FEATURES_DISABLE_ALL
    {
        return Err(MvlcError::UsbChipConfigError);
    }

    Ok(())
}

struct UsbConnection {
    handle: DeviceHandle<GlobalContext>,
    device_info: DeviceInfo,
    // One writer/reader at a time per pipe.
    pipe_locks: [Mutex<()>; 2],
}

impl UsbConnection {
    fn endpoints(pipe: Pipe) -> (u8, u8) {
        ENDPOINTS[pipe as usize]
    }
}

impl PipeIo for UsbConnection {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        let _guard = match self.pipe_locks[pipe as usize].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (out_ep, _) = Self::endpoints(pipe);

        match self.handle.write_bulk(out_ep, buf, WRITE_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Err(MvlcError::SocketWriteTimeout),
            Err(e) => Err(map_usb_err(e)),
        }
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        let _guard = match self.pipe_locks[pipe as usize].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (_, in_ep) = Self::endpoints(pipe);

        match self.handle.read_bulk(in_ep, buf, READ_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Err(MvlcError::SocketReadTimeout),
            Err(e) => Err(map_usb_err(e)),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn needs_usb2_read_retry(&self) -> bool {
        self.device_info.usb2
    }
}

/// The USB transport variant.
pub struct UsbTransport {
    connect_mode: ConnectMode,
    conn: Option<UsbConnection>,
    disable_triggers_on_connect: bool,
}

impl UsbTransport {
    pub fn first() -> Self {
        Self::with_mode(ConnectMode::First)
    }

    pub fn by_index(index: usize) -> Self {
        Self::with_mode(ConnectMode::ByIndex(index))
    }

    pub fn by_serial(serial: impl Into<String>) -> Self {
        Self::with_mode(ConnectMode::BySerial(serial.into()))
    }

    fn with_mode(connect_mode: ConnectMode) -> Self {
        Self {
            connect_mode,
            conn: None,
            disable_triggers_on_connect: true,
        }
    }

    pub fn set_disable_triggers_on_connect(&mut self, value: bool) {
        self.disable_triggers_on_connect = value;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.conn.as_ref().map(|c| &c.device_info)
    }

    pub fn connection_info(&self) -> String {
        match &self.conn {
            Some(c) => format!(
                "mvlc_usb: serial={}, speed={}",
                c.device_info.serial,
                if c.device_info.usb3 { "USB3" } else { "USB2" }
            ),
            None => "mvlc_usb: not connected".into(),
        }
    }

    pub fn connect(&mut self) -> Result<(), MvlcError> {
        if self.is_connected() {
            return Err(MvlcError::IsConnected);
        }

        let info_list = get_device_info_list()?;

        let device_info = match &self.connect_mode {
            ConnectMode::First => info_list.first().cloned(),
            ConnectMode::ByIndex(index) => info_list.iter().find(|d| d.index == *index).cloned(),
            ConnectMode::BySerial(serial) => {
                info_list.iter().find(|d| &d.serial == serial).cloned()
            }
        }
        .ok_or_else(|| MvlcError::Usb("no matching MVLC USB device found".into()))?;

        debug!(serial = %device_info.serial, "opening USB device");

        // With USB2 chipsets the open sporadically fails on the first try.
        let mut handle = None;
        let mut last_err = rusb::Error::NoDevice;

        for _attempt in 0..3 {
            match open_by_bus_index(device_info.index) {
                Ok(h) => {
                    handle = Some(h);
                    break;
                }
                Err(e) => last_err = e,
            }
        }

        let mut handle = handle.ok_or_else(|| map_usb_err(last_err))?;

        check_chip_configuration(&handle)?;
        debug!("chip configuration check done");

        for interface in [0u8, 1u8] {
            if let Err(e) = handle.claim_interface(interface) {
                warn!(interface, %e, "claiming USB interface failed");
                return Err(map_usb_err(e));
            }
        }

        let conn = UsbConnection {
            handle,
            device_info: device_info.clone(),
            pipe_locks: [Mutex::new(()), Mutex::new(())],
        };

        if self.disable_triggers_on_connect {
            // Retried once: right after power-up the first transaction can
            // time out while the device is still settling.
            let mut result = Ok(());
            for _try in 0..2 {
                result = verify_and_cleanup(&conn, true);
                if result.is_ok() {
                    break;
                }
            }
            result?;
        } else {
            verify_and_cleanup(&conn, false)?;
        }

        info!(serial = %device_info.serial, "opened USB device");

        self.conn = Some(conn);
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), MvlcError> {
        match self.conn.take() {
            Some(mut conn) => {
                for interface in [0u8, 1u8] {
                    let _ = conn.handle.release_interface(interface);
                }
                Ok(())
            }
            None => Err(MvlcError::IsDisconnected),
        }
    }
}

fn open_by_bus_index(index: usize) -> Result<DeviceHandle<GlobalContext>, rusb::Error> {
    let devices = rusb::devices()?;

    devices
        .iter()
        .nth(index)
        .ok_or(rusb::Error::NoDevice)?
        .open()
}

impl PipeIo for UsbTransport {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        match &self.conn {
            Some(conn) => conn.write(pipe, buf),
            None => Err(MvlcError::IsDisconnected),
        }
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        match &self.conn {
            Some(conn) => conn.read(pipe, buf),
            None => Err(MvlcError::IsDisconnected),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn needs_usb2_read_retry(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| c.needs_usb2_read_retry())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_without_connect_reports_disconnected() {
        let mut t = UsbTransport::first();
        assert!(matches!(t.disconnect(), Err(MvlcError::IsDisconnected)));
        assert!(!t.is_connected());
    }

    #[test]
    fn chip_config_offsets_are_inside_the_block() {
        assert!(CFG_OFFSET_OPTIONAL_FEATURES + 1 < FT60X_CONFIG_SIZE);
        assert!(CFG_OFFSET_POWER_ATTRIBUTES < FT60X_CONFIG_SIZE);
    }

    #[test]
    fn io_on_a_disconnected_transport_fails() {
        let t = UsbTransport::first();
        let mut buf = [0u8; 4];
        assert!(matches!(
            t.read(Pipe::Command, &mut buf),
            Err(MvlcError::IsDisconnected)
        ));
        assert!(matches!(
            t.write(Pipe::Data, &buf),
            Err(MvlcError::IsDisconnected)
        ));
    }
}
