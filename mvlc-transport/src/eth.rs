// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! The UDP transport.
//!
//! Three sockets talk to the MVLC: command (request/response), data
//! (receive only) and delay (send only). All three are `connect()`ed to
//! the device address so the kernel drops stray datagrams. Reads on a pipe
//! coalesce packet payloads into the caller's buffer; the two framing
//! words of each packet are validated, padding is truncated and packet
//! loss is accounted per packet channel.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use mvlc_common::{MvlcError, Protected};
use mvlc_proto::constants::eth::{
    COMMAND_PORT, DATA_PORT, DELAY_PORT, HEADER_BYTES, JUMBO_FRAME_MAX_SIZE,
    MAX_OUTGOING_PAYLOAD_SIZE, NUM_PACKET_CHANNELS,
};
use mvlc_proto::eth::{calc_packet_loss, parse_packet};
use mvlc_proto::{words_from_bytes, Pipe, PipeIo, TransportKind};

use crate::post_connect::verify_and_cleanup;
use crate::throttle::ThrottleHandle;

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Receive buffer space requested from the OS for the command and data
/// sockets. Less being granted is not an error; the granted size is
/// recorded.
const DESIRED_RECEIVE_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Per-pipe receive statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeStats {
    pub receive_attempts: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub short_packets: u64,
    pub packets_with_residue: u64,
    pub no_header: u64,
    pub header_out_of_range: u64,
    pub lost_packets: u64,
}

/// Per packet-channel receive statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketChannelStats {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub lost_packets: u64,
    pub no_header: u64,
}

/// Snapshot of the throttler state.
#[derive(Debug, Default, Clone, Copy)]
pub struct EthThrottleCounters {
    pub current_delay: u16,
    pub max_delay: u16,
    pub avg_delay: f32,
    pub rcv_buffer_size: u32,
    pub rcv_buffer_used: u32,
    pub delay_commands_sent: u64,
}

#[derive(Debug, Default)]
struct EthStats {
    pipes: [PipeStats; 2],
    channels: [PacketChannelStats; NUM_PACKET_CHANNELS],
    last_packet_numbers: [i32; NUM_PACKET_CHANNELS],
}

/// Payload bytes of the last received packet that were not yet consumed
/// by a caller.
#[derive(Debug, Default)]
struct ReceiveBuffer {
    bytes: Vec<u8>,
    start: usize,
}

impl ReceiveBuffer {
    fn available(&self) -> usize {
        self.bytes.len() - self.start
    }

    fn take_into(&mut self, dest: &mut [u8], dest_pos: &mut usize) {
        let to_copy = self.available().min(dest.len() - *dest_pos);
        if to_copy > 0 {
            dest[*dest_pos..*dest_pos + to_copy]
                .copy_from_slice(&self.bytes[self.start..self.start + to_copy]);
            self.start += to_copy;
            *dest_pos += to_copy;
        }
    }
}

/// The connected state: sockets plus receive bookkeeping.
pub(crate) struct EthConnection {
    cmd_sock: UdpSocket,
    data_sock: UdpSocket,
    delay_sock: UdpSocket,
    receive_buffers: [Mutex<ReceiveBuffer>; 2],
    stats: Protected<EthStats>,
    data_rcvbuf_size: usize,
}

impl EthConnection {
    fn socket(&self, pipe: Pipe) -> &UdpSocket {
        match pipe {
            Pipe::Command => &self.cmd_sock,
            Pipe::Data => &self.data_sock,
        }
    }

    pub(crate) fn data_rcvbuf_size(&self) -> usize {
        self.data_rcvbuf_size
    }

    pub(crate) fn try_clone_delay_sock(&self) -> Result<UdpSocket, MvlcError> {
        Ok(self.delay_sock.try_clone()?)
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn data_sock_inode(&self) -> Option<u64> {
        use std::os::unix::io::AsRawFd;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.data_sock.as_raw_fd(), &mut stat) };

        (rc == 0).then_some(stat.st_ino)
    }

    /// Receive one datagram into `dest`, validating the framing words and
    /// updating loss statistics. Returns the packet size in bytes after
    /// padding truncation, framing words included.
    pub(crate) fn recv_packet_into(&self, pipe: Pipe, dest: &mut [u8]) -> Result<usize, MvlcError> {
        {
            let mut stats = self.stats.access();
            stats.pipes[pipe as usize].receive_attempts += 1;
        }

        let received = match self.socket(pipe).recv(dest) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Err(MvlcError::SocketReadTimeout)
            }
            Err(e) => return Err(e.into()),
        };

        let bytes = &dest[..received];
        let words = words_from_bytes(bytes);

        let mut stats = self.stats.access();
        let pipe_stats = &mut stats.pipes[pipe as usize];
        pipe_stats.received_packets += 1;
        pipe_stats.received_bytes += received as u64;

        if received < HEADER_BYTES {
            pipe_stats.short_packets += 1;
            warn!(pipe = ?pipe, received, "received packet smaller than the framing headers");
            return Err(MvlcError::ShortRead);
        }

        let view = match parse_packet(bytes, &words) {
            Ok(view) => view,
            Err(e) => {
                if matches!(e, MvlcError::UdpPacketChannelOutOfRange(_)) {
                    warn!(pipe = ?pipe, %e, "dropping packet");
                }
                return Err(e);
            }
        };

        if view.leftover_bytes > 0 {
            pipe_stats.packets_with_residue += 1;
        }

        let channel = usize::from(view.headers.packet_channel());
        let packet_number = view.headers.packet_number();

        let channel_stats = &mut stats.channels[channel];
        channel_stats.received_packets += 1;
        channel_stats.received_bytes += received as u64;

        let last = stats.last_packet_numbers[channel];

        if last >= 0 {
            let loss = calc_packet_loss(last as u16, packet_number);
            if loss > 0 {
                debug!(channel, last, packet_number, loss, "packet loss detected");
                stats.pipes[pipe as usize].lost_packets += u64::from(loss);
                stats.channels[channel].lost_packets += u64::from(loss);
            }
        }

        stats.last_packet_numbers[channel] = i32::from(packet_number);

        if !view.headers.has_header_pointer() {
            stats.pipes[pipe as usize].no_header += 1;
            stats.channels[channel].no_header += 1;
        } else if usize::from(view.headers.next_header_pointer()) > view.payload.len() {
            stats.pipes[pipe as usize].header_out_of_range += 1;
            trace!(
                pointer = view.headers.next_header_pointer(),
                payload_words = view.payload.len(),
                "nextHeaderPointer out of range"
            );
        }

        let payload_bytes = view.payload.len() * 4;

        Ok(HEADER_BYTES + payload_bytes)
    }

    /// Receive one datagram and buffer its payload words for consumption
    /// through [`PipeIo::read`]. Returns the number of payload bytes made
    /// available.
    fn read_packet(&self, pipe: Pipe) -> Result<usize, MvlcError> {
        let mut packet = [0u8; JUMBO_FRAME_MAX_SIZE];
        let total = self.recv_packet_into(pipe, &mut packet)?;
        let payload_bytes = total - HEADER_BYTES;

        let mut rb = match self.receive_buffers[pipe as usize].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rb.bytes.clear();
        rb.bytes
            .extend_from_slice(&packet[HEADER_BYTES..total]);
        rb.start = 0;

        Ok(payload_bytes)
    }

    /// Raw data-pipe packet read for the readout path: the packet lands in
    /// `dest` with its two framing words intact.
    pub(crate) fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        self.recv_packet_into(Pipe::Data, dest)
    }
}

impl PipeIo for EthConnection {
    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize, MvlcError> {
        debug_assert!(buf.len() <= MAX_OUTGOING_PAYLOAD_SIZE);

        match self.socket(pipe).send(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Err(MvlcError::SocketWriteTimeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize, MvlcError> {
        let mut pos = 0;

        {
            let mut rb = match self.receive_buffers[pipe as usize].lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rb.take_into(buf, &mut pos);
        }

        if pos == buf.len() {
            return Ok(pos);
        }

        let start = Instant::now();

        while pos < buf.len() {
            match self.read_packet(pipe) {
                Ok(_) => {
                    let mut rb = match self.receive_buffers[pipe as usize].lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    rb.take_into(buf, &mut pos);
                }
                Err(e) if e.is_timeout() && pos > 0 => return Ok(pos),
                Err(e) => return Err(e),
            }

            if start.elapsed() >= READ_TIMEOUT {
                if pos > 0 {
                    return Ok(pos);
                }
                return Err(MvlcError::SocketReadTimeout);
            }
        }

        Ok(pos)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Eth
    }
}

/// The ETH transport variant.
pub struct EthTransport {
    host: String,
    conn: Option<EthConnection>,
    throttle: Option<ThrottleHandle>,
    throttle_counters: std::sync::Arc<Protected<EthThrottleCounters>>,
    disable_triggers_on_connect: bool,
}

impl EthTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            conn: None,
            throttle: None,
            throttle_counters: std::sync::Arc::new(Protected::new(
                EthThrottleCounters::default(),
            )),
            disable_triggers_on_connect: true,
        }
    }

    pub fn set_disable_triggers_on_connect(&mut self, value: bool) {
        self.disable_triggers_on_connect = value;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connection_info(&self) -> String {
        format!("mvlc_eth: host={}", self.host)
    }

    pub fn pipe_stats(&self) -> [PipeStats; 2] {
        self.conn
            .as_ref()
            .map(|c| c.stats.access().pipes)
            .unwrap_or_default()
    }

    pub fn packet_channel_stats(&self) -> [PacketChannelStats; NUM_PACKET_CHANNELS] {
        self.conn
            .as_ref()
            .map(|c| c.stats.access().channels)
            .unwrap_or_default()
    }

    pub fn throttle_counters(&self) -> EthThrottleCounters {
        *self.throttle_counters.access()
    }

    fn lookup(&self, port: u16) -> Result<SocketAddr, MvlcError> {
        if self.host.is_empty() {
            return Err(MvlcError::HostLookup(String::new()));
        }

        (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| MvlcError::HostLookup(self.host.clone()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| MvlcError::HostLookup(self.host.clone()))
    }

    pub fn connect(&mut self) -> Result<(), MvlcError> {
        if self.is_connected() {
            return Err(MvlcError::IsConnected);
        }

        debug!(host = %self.host, "looking up MVLC address");

        let cmd_addr = self.lookup(COMMAND_PORT)?;
        let mut data_addr = cmd_addr;
        data_addr.set_port(DATA_PORT);
        let mut delay_addr = cmd_addr;
        delay_addr.set_port(DELAY_PORT);

        let cmd_sock = UdpSocket::bind("0.0.0.0:0")?;
        let data_sock = UdpSocket::bind("0.0.0.0:0")?;
        let delay_sock = UdpSocket::bind("0.0.0.0:0")?;

        // Connect the sockets so only datagrams from the MVLC arrive.
        cmd_sock.connect(cmd_addr)?;
        data_sock.connect(data_addr)?;
        delay_sock.connect(delay_addr)?;

        for sock in [&cmd_sock, &data_sock] {
            sock.set_write_timeout(Some(WRITE_TIMEOUT))?;
            sock.set_read_timeout(Some(READ_TIMEOUT))?;
        }
        delay_sock.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let data_rcvbuf_size = request_receive_buffer(&data_sock);
        let cmd_rcvbuf_size = request_receive_buffer(&cmd_sock);

        debug!(
            cmd_rcvbuf = cmd_rcvbuf_size,
            data_rcvbuf = data_rcvbuf_size,
            "socket receive buffers granted"
        );

        let conn = EthConnection {
            cmd_sock,
            data_sock,
            delay_sock,
            receive_buffers: [Mutex::default(), Mutex::default()],
            stats: Protected::new(EthStats::default()),
            data_rcvbuf_size,
        };

        verify_and_cleanup(&conn, self.disable_triggers_on_connect)?;

        *self.throttle_counters.access() = EthThrottleCounters::default();

        self.throttle = ThrottleHandle::spawn(&conn, std::sync::Arc::clone(&self.throttle_counters))
            .map_err(|e| {
                warn!(%e, "readout throttler could not be started");
                e
            })
            .ok();

        self.conn = Some(conn);

        debug!("ETH connect sequence finished");

        Ok(())
    }

    /// Receive one raw data packet (framing words included) into `dest`.
    pub fn read_data_packet(&self, dest: &mut [u8]) -> Result<usize, MvlcError> {
        match &self.conn {
            Some(conn) => conn.read_data_packet(dest),
            None => Err(MvlcError::IsDisconnected),
        }
    }

    pub fn disconnect(&mut self) -> Result<(), MvlcError> {
        if self.conn.is_none() {
            return Err(MvlcError::IsDisconnected);
        }

        if let Some(throttle) = self.throttle.take() {
            throttle.stop();
        }

        self.conn = None;
        Ok(())
    }
}

impl PipeIo for EthTransport {
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
        TransportKind::Eth
    }
}

#[cfg(unix)]
fn request_receive_buffer(sock: &UdpSocket) -> usize {
    use nix::sys::socket::{getsockopt, setsockopt, sockopt::RcvBuf};

    if let Err(e) = setsockopt(sock, RcvBuf, &DESIRED_RECEIVE_BUFFER_SIZE) {
        warn!(%e, "setting the socket receive buffer size failed");
    }

    getsockopt(sock, RcvBuf).unwrap_or(0)
}

#[cfg(not(unix))]
fn request_receive_buffer(_sock: &UdpSocket) -> usize {
    DESIRED_RECEIVE_BUFFER_SIZE
}
