// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! ETH readout throttling.
//!
//! The MVLC accepts delay commands on the delay port; the delay is applied
//! between outgoing data-pipe frames, which makes the device block readout
//! triggers when its internal buffers fill instead of losing datagrams.
//!
//! A background thread samples the data socket's receive-queue fill level
//! through the netlink `SOCK_DIAG` interface (`INET_DIAG_SKMEMINFO`) and
//! applies exponential backoff: at 50% fill the delay starts at 1 µs and
//! doubles over 16 increments spread across the 0.5..0.95 fill range, up
//! to 2^16-1 µs.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use mvlc_common::{MvlcError, Protected};
use mvlc_proto::constants::super_commands::{ETH_DELAY, SUPER_CMD_SHIFT};

use crate::eth::{EthConnection, EthThrottleCounters};

const THROTTLE_THRESHOLD: f64 = 0.5;
const THROTTLE_RANGE: f64 = 0.45;
const THROTTLE_STEPS: u32 = 16;
const QUERY_DELAY: Duration = Duration::from_millis(5);

/// Exponential backoff policy mapping a buffer fill ratio to a delay in
/// microseconds.
pub(crate) fn throttle_exponential(used: u32, capacity: u32) -> u16 {
    if capacity == 0 {
        return 0;
    }

    let fill = f64::from(used) / f64::from(capacity);

    if fill < THROTTLE_THRESHOLD {
        return 0;
    }

    let increment = THROTTLE_RANGE / f64::from(THROTTLE_STEPS);
    let increments = (((fill - THROTTLE_THRESHOLD) / increment).floor() as u32).min(THROTTLE_STEPS);

    (1u32 << increments).min(u32::from(u16::MAX)) as u16
}

fn calc_avg_delay(current: u16, last_avg: f32) -> f32 {
    const SMOOTHING: f32 = 0.75;
    SMOOTHING * f32::from(current) + (1.0 - SMOOTHING) * last_avg
}

pub(crate) fn send_delay_command(delay_sock: &UdpSocket, delay_us: u16) -> Result<(), MvlcError> {
    let cmd: u32 = (u32::from(ETH_DELAY) << SUPER_CMD_SHIFT) | u32::from(delay_us);
    let bytes = cmd.to_le_bytes();

    let written = delay_sock.send(&bytes)?;

    if written != bytes.len() {
        return Err(MvlcError::ShortWrite);
    }

    Ok(())
}

pub(crate) struct ThrottleHandle {
    quit: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ThrottleHandle {
    pub(crate) fn spawn(
        conn: &EthConnection,
        counters: Arc<Protected<EthThrottleCounters>>,
    ) -> Result<Self, MvlcError> {
        let delay_sock = conn.try_clone_delay_sock()?;
        let inode = conn.data_sock_inode().ok_or_else(|| {
            MvlcError::Io(std::io::Error::other("data socket inode unavailable"))
        })?;
        let capacity = conn.data_rcvbuf_size() as u32;

        let quit = Arc::new(AtomicBool::new(false));
        let quit2 = Arc::clone(&quit);

        let join = std::thread::Builder::new()
            .name("eth_throttler".into())
            .spawn(move || throttler_loop(delay_sock, inode, capacity, counters, quit2))
            .map_err(MvlcError::Io)?;

        Ok(Self {
            quit,
            join: Some(join),
        })
    }

    pub(crate) fn stop(mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ThrottleHandle {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn throttler_loop(
    delay_sock: UdpSocket,
    data_sock_inode: u64,
    default_capacity: u32,
    counters: Arc<Protected<EthThrottleCounters>>,
    quit: Arc<AtomicBool>,
) {
    let diag = match DiagSocket::open() {
        Ok(diag) => diag,
        Err(e) => {
            warn!(%e, "could not create netlink diag socket, throttling disabled");
            return;
        }
    };

    let mut last_sent_delay: i32 = -1;

    debug!("eth throttler entering loop");

    while !quit.load(Ordering::Relaxed) {
        if let Ok(Some(snapshot)) = diag.query(data_sock_inode) {
            let capacity = if snapshot.capacity > 0 {
                snapshot.capacity
            } else {
                default_capacity
            };

            let delay = throttle_exponential(snapshot.used, capacity);

            if last_sent_delay != i32::from(delay) {
                debug!(last_sent_delay, delay, "sending delay command");
                if send_delay_command(&delay_sock, delay).is_ok() {
                    counters.access().delay_commands_sent += 1;
                }
                last_sent_delay = i32::from(delay);
            }

            let mut c = counters.access();
            c.current_delay = delay;
            c.max_delay = c.max_delay.max(delay);
            c.avg_delay = calc_avg_delay(delay, c.avg_delay);
            c.rcv_buffer_size = capacity;
            c.rcv_buffer_used = snapshot.used;
        }

        std::thread::sleep(QUERY_DELAY);
    }

    debug!("eth throttler leaving loop");
}

/// Receive-queue usage of one socket as reported by the kernel.
#[derive(Debug, Default, Clone, Copy)]
struct ReceiveBufferSnapshot {
    used: u32,
    capacity: u32,
}

// Netlink SOCK_DIAG plumbing. Neither libc nor nix exports the inet_diag
// structures, so they are declared here.

const SOCK_DIAG_BY_FAMILY: u16 = 20;
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_MATCH: u16 = 0x0200;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;
const INET_DIAG_SKMEMINFO: u16 = 7;
const SK_MEMINFO_RMEM_ALLOC: usize = 0;
const SK_MEMINFO_RCVBUF: usize = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct InetDiagSockId {
    idiag_sport: u16,
    idiag_dport: u16,
    idiag_src: [u32; 4],
    idiag_dst: [u32; 4],
    idiag_if: u32,
    idiag_cookie: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct InetDiagReqV2 {
    sdiag_family: u8,
    sdiag_protocol: u8,
    idiag_ext: u8,
    pad: u8,
    idiag_states: u32,
    id: InetDiagSockId,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct InetDiagMsg {
    idiag_family: u8,
    idiag_state: u8,
    idiag_timer: u8,
    idiag_retrans: u8,
    id: InetDiagSockId,
    idiag_expires: u32,
    idiag_rqueue: u32,
    idiag_wqueue: u32,
    idiag_uid: u32,
    idiag_inode: u32,
}

#[repr(C)]
struct DiagRequest {
    nlh: NlMsgHdr,
    req: InetDiagReqV2,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RtAttr {
    rta_len: u16,
    rta_type: u16,
}

struct DiagSocket {
    fd: i32,
}

impl DiagSocket {
    fn open() -> Result<Self, MvlcError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };

        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self { fd })
    }

    /// Query all UDP sockets and return the memory snapshot of the one
    /// matching `inode`, if present in the response.
    fn query(&self, inode: u64) -> Result<Option<ReceiveBufferSnapshot>, MvlcError> {
        self.send_query()?;
        self.receive_response(inode)
    }

    fn send_query(&self) -> Result<(), MvlcError> {
        let request = DiagRequest {
            nlh: NlMsgHdr {
                nlmsg_len: std::mem::size_of::<DiagRequest>() as u32,
                nlmsg_type: SOCK_DIAG_BY_FAMILY,
                nlmsg_flags: NLM_F_REQUEST | NLM_F_MATCH,
                nlmsg_seq: 0,
                nlmsg_pid: 0,
            },
            req: InetDiagReqV2 {
                sdiag_family: libc::AF_INET as u8,
                sdiag_protocol: libc::IPPROTO_UDP as u8,
                idiag_ext: 1 << (INET_DIAG_SKMEMINFO - 1),
                pad: 0,
                // All states; zero filters out every socket.
                idiag_states: u32::MAX,
                id: InetDiagSockId::default(),
            },
        };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;

        let rc = unsafe {
            libc::sendto(
                self.fd,
                std::ptr::addr_of!(request).cast(),
                std::mem::size_of::<DiagRequest>(),
                0,
                std::ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };

        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(())
    }

    fn receive_response(&self, inode: u64) -> Result<Option<ReceiveBufferSnapshot>, MvlcError> {
        let mut buf = vec![0u8; 8192];
        let mut result = None;

        loop {
            let received = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0)
            };

            if received < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let mut offset = 0usize;
            let received = received as usize;

            while offset + std::mem::size_of::<NlMsgHdr>() <= received {
                let nlh: NlMsgHdr =
                    unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset).cast()) };
                let msg_len = nlh.nlmsg_len as usize;

                if msg_len < std::mem::size_of::<NlMsgHdr>() || offset + msg_len > received {
                    return Ok(result);
                }

                match nlh.nlmsg_type {
                    NLMSG_DONE => return Ok(result),
                    NLMSG_ERROR => return Ok(None),
                    SOCK_DIAG_BY_FAMILY => {
                        let payload = &buf[offset + std::mem::size_of::<NlMsgHdr>()..offset + msg_len];
                        if let Some(snapshot) = parse_diag_message(payload, inode) {
                            result = Some(snapshot);
                        }
                    }
                    _ => return Ok(result),
                }

                // netlink messages are 4-byte aligned
                offset += (msg_len + 3) & !3;
            }
        }
    }
}

impl Drop for DiagSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn parse_diag_message(payload: &[u8], inode: u64) -> Option<ReceiveBufferSnapshot> {
    let msg_size = std::mem::size_of::<InetDiagMsg>();

    if payload.len() < msg_size {
        return None;
    }

    let msg: InetDiagMsg = unsafe { std::ptr::read_unaligned(payload.as_ptr().cast()) };

    if u64::from(msg.idiag_inode) != inode || msg.idiag_family != libc::AF_INET as u8 {
        return None;
    }

    // Walk the rtattrs looking for SKMEMINFO.
    let mut offset = msg_size;

    while offset + std::mem::size_of::<RtAttr>() <= payload.len() {
        let attr: RtAttr = unsafe { std::ptr::read_unaligned(payload.as_ptr().add(offset).cast()) };
        let attr_len = attr.rta_len as usize;

        if attr_len < std::mem::size_of::<RtAttr>() || offset + attr_len > payload.len() {
            break;
        }

        if attr.rta_type == INET_DIAG_SKMEMINFO {
            let data = &payload[offset + std::mem::size_of::<RtAttr>()..offset + attr_len];
            if data.len() >= 4 * (SK_MEMINFO_RCVBUF + 1) {
                let word = |i: usize| {
                    u32::from_le_bytes([data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]])
                };
                return Some(ReceiveBufferSnapshot {
                    used: word(SK_MEMINFO_RMEM_ALLOC),
                    capacity: word(SK_MEMINFO_RCVBUF),
                });
            }
        }

        offset += (attr_len + 3) & !3;
    }

    // Fall back to the receive queue byte count from the base message.
    Some(ReceiveBufferSnapshot {
        used: msg.idiag_rqueue,
        capacity: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_throttling_below_the_threshold() {
        assert_eq!(throttle_exponential(0, 100), 0);
        assert_eq!(throttle_exponential(49, 100), 0);
    }

    #[test]
    fn delay_doubles_over_the_fill_range() {
        let capacity = 10_000_000;

        // exactly at threshold: first increment
        assert_eq!(throttle_exponential(capacity / 2, capacity), 1);

        // half way into the range
        let fill = (0.5 + 0.45 / 2.0 * 0.999) * f64::from(capacity);
        let delay = throttle_exponential(fill as u32, capacity);
        assert_eq!(delay, 1 << 7);

        // saturated
        assert_eq!(throttle_exponential(capacity, capacity), u16::MAX);
    }

    #[test]
    fn zero_capacity_never_throttles() {
        assert_eq!(throttle_exponential(100, 0), 0);
    }

    #[test]
    fn average_delay_is_smoothed() {
        let avg = calc_avg_delay(100, 0.0);
        assert!((avg - 75.0).abs() < f32::EPSILON);
    }
}
