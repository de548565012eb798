// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! High-concurrency RTSP load generator.
//!
//! This crate establishes and maintains large numbers of simultaneous RTSP
//! client sessions against a target server, receives RTP media over them
//! (TCP-interleaved or UDP), and measures packet loss, connect latency, and
//! stability. The pieces:
//!
//! *   [`client`]: one RTSP session — handshake, media reception, keep-alive,
//!     teardown.
//! *   [`rtp`]: per-track sequence tracking and the shared loss/byte
//!     aggregator.
//! *   [`bench`]: the orchestrator (fixed-target or real-world load), its
//!     counters, and the stats surface.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use log::trace;
use rand::Rng;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::Range;
use std::time::Duration;

pub mod bench;
pub mod client;
mod error;
pub mod rtp;

mod tokio;

#[cfg(test)]
mod testutil;

pub use error::Error;

/// Default RTSP control port.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Timeout for establishing the TCP control connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between `GET_PARAMETER` keep-alives while playing.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Media transport negotiated at `SETUP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// RTP/RTCP interleaved on the control connection (`RTP/AVP/TCP`).
    Tcp,
    /// RTP/RTCP on a pair of unicast datagram sockets (`RTP/AVP`).
    Udp,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => f.pad("tcp"),
            Transport::Udp => f.pad("udp"),
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            _ => Err(Error::InvalidArgument(format!(
                "transport {s:?} not understood (expected tcp or udp)"
            ))),
        }
    }
}

/// Returns the range within `buf` that represents `subset`.
/// If `subset` is empty, returns None; otherwise panics if `subset` is not within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

/// A pair of local UDP sockets used for RTP and RTCP reception.
///
/// The RTP port is always even, and the RTCP port is always the following
/// (odd) integer. Receive buffers are enlarged so a burst of media while the
/// session task is momentarily busy (e.g. a keep-alive round trip) is not
/// dropped by the kernel.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

/// Receive buffer requested for each media socket.
const UDP_RECV_BUFFER: usize = 2 << 20;

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        const ALLOWED_RTP_RANGE: Range<u16> = 5000..65000; // stolen from ffmpeg's defaults.
        let mut rng = rand::thread_rng();
        for i in 0..MAX_TRIES {
            let rtp_port = rng.gen_range(ALLOWED_RTP_RANGE) & !0b1;
            let rtp_addr = SocketAddr::new(ip_addr, rtp_port);
            let rtp_socket = match UdpSocket::bind(rtp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("Try {}/{}: unable to bind RTP addr {:?}", i, MAX_TRIES, rtp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_addr = SocketAddr::new(ip_addr, rtp_port + 1);
            let rtcp_socket = match UdpSocket::bind(rtcp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!(
                        "Try {}/{}: unable to bind RTCP addr {:?}",
                        i,
                        MAX_TRIES,
                        rtcp_addr
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            // Best-effort: the OS may clamp to rmem_max.
            let _ = socket2::SockRef::from(&rtp_socket).set_recv_buffer_size(UDP_RECV_BUFFER);
            let _ = socket2::SockRef::from(&rtcp_socket).set_recv_buffer_size(UDP_RECV_BUFFER);
            return Ok(Self {
                rtp_port,
                rtp_socket,
                rtcp_socket,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "Unable to find even/odd pair in {}:{}..{} after {} tries",
                ip_addr, ALLOWED_RTP_RANGE.start, ALLOWED_RTP_RANGE.end, MAX_TRIES
            ),
        ))
    }
}
