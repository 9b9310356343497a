// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The central MVLC handle.
//!
//! Combines a transport with the dialog layer behind two lock lanes: the
//! command lock (the dialog mutex) serializes super and stack
//! transactions on the command pipe; the data lock is acquired by the
//! readout worker for batched reads on the data pipe. Command traffic and
//! readout proceed concurrently because they use different pipes.

use std::sync::{Arc, Mutex, RwLock};

use mvlc_common::{MvlcError, Protected};
use mvlc_dialog::{Dialog, StackErrorCounters};
use mvlc_proto::constants::{Pipe, VmeDataWidth};
use mvlc_proto::{PipeIo, TransportKind};
use mvlc_readout::{BufferPool, ReadoutWorker};
use mvlc_transport::{ReadoutTransport, Transport};

/// Cheaply clonable transport handle. IO takes a shared lock; connect and
/// disconnect take the exclusive lock.
#[derive(Clone)]
pub struct SharedTransport(Arc<RwLock<Transport>>);

impl SharedTransport {
    fn new(transport: Transport) -> Self {
        Self(Arc::new(RwLock::new(transport)))
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Transport> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Transport> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PipeIo for SharedTransport {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        self.read_guard().write(pipe, buf)
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        self.read_guard().read(pipe, buf)
    }

    fn kind(&self) -> TransportKind {
        self.read_guard().kind()
    }

    fn needs_usb2_read_retry(&self) -> bool {
        self.read_guard().needs_usb2_read_retry()
    }
}

impl ReadoutTransport for SharedTransport {
    fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        self.read_guard().read_data_packet(dest)
    }
}

/// An MVLC controller handle.
pub struct Mvlc {
    transport: SharedTransport,
    dialog: Mutex<Dialog<SharedTransport>>,
    data_lock: Arc<Mutex<()>>,
}

impl Mvlc {
    /// Wrap an unconnected transport.
    pub fn new(transport: Transport) -> Self {
        let shared = SharedTransport::new(transport);

        Self {
            dialog: Mutex::new(Dialog::new(shared.clone())),
            transport: shared,
            data_lock: Arc::new(Mutex::new(())),
        }
    }

    /// An MVLC reached over UDP.
    pub fn eth(host: impl Into<String>) -> Self {
        Self::new(Transport::eth(host))
    }

    /// The first MVLC found on USB.
    pub fn usb() -> Self {
        Self::new(Transport::usb())
    }

    pub fn usb_by_serial(serial: impl Into<String>) -> Self {
        Self::new(Transport::usb_by_serial(serial))
    }

    pub fn connect(&self) -> Result<(), MvlcError> {
        self.transport.write_guard().connect()
    }

    pub fn disconnect(&self) -> Result<(), MvlcError> {
        self.transport.write_guard().disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.read_guard().is_connected()
    }

    pub fn connection_info(&self) -> String {
        self.transport.read_guard().connection_info()
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn set_disable_triggers_on_connect(&self, value: bool) {
        self.transport.write_guard().set_disable_triggers_on_connect(value);
    }

    fn dialog_guard(&self) -> std::sync::MutexGuard<'_, Dialog<SharedTransport>> {
        match self.dialog.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run a closure with the dialog layer under the command lock.
    pub fn with_dialog<T>(
        &self,
        f: impl FnOnce(&mut Dialog<SharedTransport>) -> Result<T, MvlcError>,
    ) -> Result<T, MvlcError> {
        f(&mut self.dialog_guard())
    }

    pub fn read_register(&self, address: u16) -> Result<u32, MvlcError> {
        self.dialog_guard().read_register(address)
    }

    pub fn write_register(&self, address: u16, value: u32) -> Result<(), MvlcError> {
        self.dialog_guard().write_register(address, value)
    }

    pub fn vme_read(&self, address: u32, amod: u8, dw: VmeDataWidth) -> Result<u32, MvlcError> {
        self.dialog_guard().vme_read(address, amod, dw)
    }

    pub fn vme_write(
        &self,
        address: u32,
        value: u32,
        amod: u8,
        dw: VmeDataWidth,
    ) -> Result<(), MvlcError> {
        self.dialog_guard().vme_write(address, value, amod, dw)
    }

    pub fn vme_block_read(
        &self,
        address: u32,
        amod: u8,
        max_transfers: u16,
        dest: &mut Vec<u32>,
    ) -> Result<(), MvlcError> {
        self.dialog_guard()
            .vme_block_read(address, amod, max_transfers, dest)
    }

    pub fn stack_error_counters(&self) -> Arc<Protected<StackErrorCounters>> {
        self.dialog_guard().stack_error_counters()
    }

    /// The lock lane the readout worker shares with other data-pipe
    /// users.
    pub fn data_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.data_lock)
    }

    /// A readout worker bound to this controller's data pipe.
    pub fn readout_worker(&self, pool: Arc<BufferPool>) -> ReadoutWorker<SharedTransport> {
        ReadoutWorker::new(self.transport.clone(), self.data_lock(), pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_on_a_disconnected_controller_fail() {
        let mvlc = Mvlc::eth("127.0.0.1");

        assert!(!mvlc.is_connected());
        assert!(matches!(
            mvlc.read_register(0x1100),
            Err(MvlcError::IsDisconnected)
        ));
        assert!(matches!(mvlc.disconnect(), Err(MvlcError::IsDisconnected)));
    }

    #[test]
    fn kind_follows_the_transport() {
        assert_eq!(Mvlc::eth("localhost").kind(), TransportKind::Eth);
        assert_eq!(Mvlc::usb().kind(), TransportKind::Usb);
    }
}
