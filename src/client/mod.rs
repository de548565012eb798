// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One RTSP client session.
//!
//! A session is a small state machine: connect, then
//! `OPTIONS → DESCRIBE → SETUP(track 0) → SETUP(track 1) → PLAY`, then a
//! media-receive loop (TCP-interleaved or UDP) with periodic keep-alives,
//! then a best-effort `TEARDOWN`. The DESCRIBE body is consumed but not
//! parsed; tracks are assumed to be `trackID=0` (video) and optionally
//! `trackID=1` (audio), which is what mainstream servers (MediaMTX,
//! GStreamer) serve.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::debug;
use rtsp_types::{Message, Method};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::rtp::{Aggregator, SequenceTracker};
use crate::tokio::{Connection, UdpPair};
use crate::{Error, Transport, CONNECT_TIMEOUT, DEFAULT_RTSP_PORT, KEEPALIVE_INTERVAL};

mod parse;

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = "rtsp-bench/0.1";

/// Refreshed deadline on the UDP media socket; expiry is not an error.
const UDP_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between minimal RTCP receiver reports on UDP transport.
const RTCP_RR_INTERVAL: Duration = Duration::from_secs(5);

/// Budget for the best-effort `TEARDOWN` exchange.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// UDP receive buffer; large enough for jumbo frames.
const UDP_RECV_BUF: usize = 65_536;

/// Immutable per-session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// `rtsp://host[:port]/path`.
    pub url: Url,
    pub transport: Transport,
    /// How long to keep receiving media before tearing down.
    pub lifetime: Duration,
}

/// The raw control connection: CSeq bookkeeping and request/response pairing,
/// without session state.
pub(crate) struct RtspConnection {
    stream: Connection,
    next_cseq: u32,
}

impl RtspConnection {
    /// Establishes the control connection, bounded by [`CONNECT_TIMEOUT`].
    pub(crate) async fn connect(url: &Url) -> Result<Self, Error> {
        if url.scheme() != "rtsp" {
            return Err(Error::InvalidArgument(format!(
                "unsupported scheme {:?} (only rtsp)",
                url.scheme()
            )));
        }
        let host = url
            .host()
            .ok_or_else(|| Error::InvalidArgument(format!("must specify host in rtsp url {url}")))?;
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, Connection::connect(host, port))
            .await
        {
            Err(_) => return Err(Error::ConnectTimeout),
            Ok(Err(e)) => return Err(Error::Connect(e)),
            Ok(Ok(stream)) => stream,
        };
        Ok(Self {
            stream,
            next_cseq: 1,
        })
    }

    /// Fills out `CSeq` and `User-Agent` headers, returning the CSeq used.
    fn fill_req(&mut self, req: &mut rtsp_types::Request<Bytes>) -> u32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        req.insert_header(rtsp_types::headers::CSEQ, cseq.to_string());
        req.insert_header(rtsp_types::headers::USER_AGENT, USER_AGENT.to_string());
        cseq
    }

    /// Sends a request and waits for its response. Interleaved data frames
    /// and stale responses (late keep-alive replies) arriving first are
    /// discarded. A status ≥ 400 is an error.
    pub(crate) async fn send(
        &mut self,
        req: &mut rtsp_types::Request<Bytes>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let cseq = self.fill_req(req);
        self.stream.send(Message::Request(req.clone())).await?;
        loop {
            let msg = self
                .stream
                .next()
                .await
                .ok_or_else(|| {
                    Error::Read(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "EOF while waiting for reply",
                    ))
                })??;
            match msg {
                Message::Response(resp) => {
                    if parse::get_cseq(&resp) != Some(cseq) {
                        continue;
                    }
                    let status = u16::from(resp.status());
                    if status >= 400 {
                        return Err(Error::ResponseError {
                            method: req.method().clone(),
                            cseq,
                            status,
                        });
                    }
                    return Ok(resp);
                }
                Message::Data(_) => {}
                Message::Request(r) => debug!("ignoring server-initiated {:?}", r.method()),
            }
        }
    }
}

/// Media sockets for UDP transport. `connected` records whether the server
/// announced `server_port` and the sockets were `connect()`ed to it.
struct UdpStreams {
    pair: UdpPair,
    connected: bool,
}

/// One RTSP session. Owns its control connection and any datagram sockets
/// exclusively; everything is released on every exit path.
pub struct RtspSession {
    config: SessionConfig,
    aggregator: Arc<Aggregator>,
    conn: Option<RtspConnection>,
    session_id: Option<Box<str>>,
    /// Index 0: video (interleaved channel 0 / the UDP socket).
    /// Index 1: audio (interleaved channel 2).
    trackers: [SequenceTracker; 2],
    udp: Option<UdpStreams>,
    /// Our SSRC for outgoing RTCP receiver reports.
    ssrc: u32,
    closed: bool,
}

impl RtspSession {
    /// Establishes the TCP control connection (5 s timeout). The RTSP
    /// handshake itself happens at the start of [`RtspSession::run`].
    pub async fn connect(
        config: SessionConfig,
        aggregator: Arc<Aggregator>,
    ) -> Result<Self, Error> {
        let conn = RtspConnection::connect(&config.url).await?;
        Ok(Self {
            config,
            aggregator,
            conn: Some(conn),
            session_id: None,
            trackers: Default::default(),
            udp: None,
            ssrc: rand::random(),
            closed: false,
        })
    }

    /// Drives the session to completion: handshake, media reception until
    /// the lifetime elapses or `cancel` fires, then best-effort teardown.
    ///
    /// Returns `Ok(())` for clean terminations (lifetime elapsed, run
    /// cancelled, and any error that raced with the cancellation); `Err` is
    /// always a genuine session failure.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let deadline = tokio::time::sleep(self.config.lifetime);
        tokio::pin!(deadline);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = deadline.as_mut() => Err(Error::DeadlineExceeded),
            r = self.handshake() => r,
        };
        let result = match result {
            Ok(()) => match self.config.transport {
                Transport::Tcp => self.run_tcp(cancel, deadline.as_mut()).await,
                Transport::Udp => self.run_udp(cancel, deadline.as_mut()).await,
            },
            Err(e) => Err(e),
        };

        self.teardown().await;
        match result {
            Err(e) if e.is_cancellation() => Ok(()),
            Err(e) if cancel.is_cancelled() => {
                debug!("ignoring error during cancellation: {e}");
                Ok(())
            }
            r => r,
        }
    }

    /// `OPTIONS → DESCRIBE → SETUP(0) → SETUP(1) → PLAY`.
    async fn handshake(&mut self) -> Result<(), Error> {
        let Self {
            config,
            conn,
            session_id,
            udp,
            ..
        } = self;
        let conn = conn
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("session already closed".to_owned()))?;

        let mut req = rtsp_types::Request::builder(Method::Options, rtsp_types::Version::V1_0)
            .request_uri(config.url.clone())
            .build(Bytes::new());
        conn.send(&mut req).await?;

        let mut req = rtsp_types::Request::builder(Method::Describe, rtsp_types::Version::V1_0)
            .request_uri(config.url.clone())
            .header(rtsp_types::headers::ACCEPT, "application/sdp")
            .build(Bytes::new());
        conn.send(&mut req).await?;

        // SETUP video. For UDP the datagram sockets must exist first so
        // their ports can go into the Transport header.
        let video_transport = match config.transport {
            Transport::Tcp => "RTP/AVP/TCP;unicast;interleaved=0-1".to_owned(),
            Transport::Udp => {
                let pair = UdpPair::for_ip(conn.stream.local_ip()).map_err(Error::Connect)?;
                let header = format!(
                    "RTP/AVP;unicast;client_port={}-{}",
                    pair.rtp_port,
                    pair.rtp_port + 1
                );
                *udp = Some(UdpStreams {
                    pair,
                    connected: false,
                });
                header
            }
        };
        let mut req = rtsp_types::Request::builder(Method::Setup, rtsp_types::Version::V1_0)
            .request_uri(track_url(&config.url, 0)?)
            .header(rtsp_types::headers::TRANSPORT, video_transport)
            .build(Bytes::new());
        let resp = conn.send(&mut req).await?;
        *session_id = parse::session_id(&resp);
        if session_id.is_none() {
            debug!("no Session header in SETUP response; continuing without one");
        }

        // Connect the media sockets to the server's announced ports so stray
        // traffic is filtered and RTCP RRs have a destination. Servers that
        // omit server_port get best-effort unconnected sockets.
        if let Some(udp) = udp.as_mut() {
            match parse::server_ports(&resp) {
                Some((rtp_port, rtcp_port)) => {
                    let peer = conn.stream.peer_ip();
                    udp.pair
                        .rtp_socket
                        .connect((peer, rtp_port))
                        .await
                        .map_err(Error::Connect)?;
                    udp.pair
                        .rtcp_socket
                        .connect((peer, rtcp_port))
                        .await
                        .map_err(Error::Connect)?;
                    udp.connected = true;
                }
                None => debug!("no server_port in SETUP response; sockets left unconnected"),
            }
        }

        // SETUP audio. Failures are non-fatal: video-only sessions are fine.
        if let Some(id) = session_id.as_deref() {
            let audio_transport = match (config.transport, udp.as_ref()) {
                (Transport::Tcp, _) => "RTP/AVP/TCP;unicast;interleaved=2-3".to_owned(),
                // Reuse the video client ports; demux would need SSRC
                // inspection, which is out of scope.
                (Transport::Udp, Some(udp)) => format!(
                    "RTP/AVP;unicast;client_port={}-{}",
                    udp.pair.rtp_port,
                    udp.pair.rtp_port + 1
                ),
                (Transport::Udp, None) => unreachable!("UDP sockets bound during video SETUP"),
            };
            let mut req = rtsp_types::Request::builder(Method::Setup, rtsp_types::Version::V1_0)
                .request_uri(track_url(&config.url, 1)?)
                .header(rtsp_types::headers::SESSION, id.to_string())
                .header(rtsp_types::headers::TRANSPORT, audio_transport)
                .build(Bytes::new());
            if let Err(e) = conn.send(&mut req).await {
                debug!("audio SETUP failed, continuing video-only: {e}");
            }
        }

        let mut req = rtsp_types::Request::builder(Method::Play, rtsp_types::Version::V1_0)
            .request_uri(config.url.clone())
            .header(rtsp_types::headers::RANGE, "npt=0.000-");
        if let Some(id) = session_id.as_deref() {
            req = req.header(rtsp_types::headers::SESSION, id.to_string());
        }
        conn.send(&mut req.build(Bytes::new())).await?;
        Ok(())
    }

    /// TCP-interleaved media loop. The session task is the single owner of
    /// the control connection: keep-alives are sent from this loop and their
    /// responses are consumed (and dropped) by the same loop, so control I/O
    /// stays strictly ordered without a lock.
    async fn run_tcp(
        &mut self,
        cancel: &CancellationToken,
        mut deadline: Pin<&mut Sleep>,
    ) -> Result<(), Error> {
        let Self {
            config,
            conn,
            session_id,
            trackers,
            aggregator,
            ..
        } = self;
        let conn = conn
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("session already closed".to_owned()))?;
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        enum Step {
            Quit(Error),
            Keepalive,
            Msg(Option<Result<Message<Bytes>, Error>>),
        }
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Quit(Error::Cancelled),
                _ = deadline.as_mut() => Step::Quit(Error::DeadlineExceeded),
                _ = keepalive.tick() => Step::Keepalive,
                m = conn.stream.next() => Step::Msg(m),
            };
            match step {
                Step::Quit(e) => return Err(e),
                Step::Keepalive => {
                    // Sent without waiting for the reply: the reply arrives
                    // interleaved with media and is dropped below. Waiting
                    // here would stall the read path for a round trip.
                    if let Some(id) = session_id.as_deref() {
                        let mut req = keepalive_request(&config.url, id);
                        conn.fill_req(&mut req);
                        conn.stream
                            .send(Message::Request(req))
                            .await
                            .map_err(|e| Error::Keepalive(Box::new(e)))?;
                    }
                }
                Step::Msg(None) => {
                    return Err(Error::Read(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the control connection",
                    )))
                }
                Step::Msg(Some(Err(e))) => return Err(e),
                Step::Msg(Some(Ok(msg))) => match msg {
                    Message::Data(data) => {
                        let channel = data.channel_id();
                        let body = data.into_body();
                        match channel {
                            0 => process_rtp(&mut trackers[0], aggregator, &body),
                            2 => process_rtp(&mut trackers[1], aggregator, &body),
                            // Odd channels carry RTCP; anything else is a
                            // server quirk. Both are discarded.
                            _ => {}
                        }
                    }
                    Message::Response(_) => {}
                    Message::Request(r) => debug!("ignoring server-initiated {:?}", r.method()),
                },
            }
        }
    }

    /// UDP media loop. The control connection is parked in a mutex and a
    /// dedicated task runs the keep-alive request/response cycle under the
    /// lock, so control I/O stays strictly request-then-response while this
    /// loop reads datagrams.
    async fn run_udp(
        &mut self,
        cancel: &CancellationToken,
        mut deadline: Pin<&mut Sleep>,
    ) -> Result<(), Error> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| Error::InvalidArgument("session already closed".to_owned()))?;
        let conn = Arc::new(tokio::sync::Mutex::new(conn));
        let Self {
            config,
            session_id,
            trackers,
            aggregator,
            udp,
            ssrc,
            ..
        } = self;
        let udp = udp
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("UDP sockets missing after SETUP".to_owned()))?;

        let ka_cancel = cancel.child_token();
        let mut ka_handle = session_id.as_deref().map(|id| {
            let conn = Arc::clone(&conn);
            let url = config.url.clone();
            let id = id.to_string();
            let token = ka_cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval_at(
                    tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
                    KEEPALIVE_INTERVAL,
                );
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tick.tick() => {
                            let mut conn = conn.lock().await;
                            conn.send(&mut keepalive_request(&url, &id)).await?;
                        }
                    }
                }
            })
        });

        let mut rr_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + RTCP_RR_INTERVAL,
            RTCP_RR_INTERVAL,
        );
        let mut buf = vec![0u8; UDP_RECV_BUF];

        enum Step {
            Quit(Error),
            KeepaliveDone(Result<(), Error>),
            ReceiverReport,
            Recv(Result<Result<(usize, std::net::SocketAddr), std::io::Error>, tokio::time::error::Elapsed>),
        }
        let result = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Quit(Error::Cancelled),
                _ = deadline.as_mut() => Step::Quit(Error::DeadlineExceeded),
                res = join_keepalive(&mut ka_handle) => Step::KeepaliveDone(res),
                _ = rr_tick.tick() => Step::ReceiverReport,
                r = tokio::time::timeout(UDP_READ_TIMEOUT, udp.pair.rtp_socket.recv_from(&mut buf)) => Step::Recv(r),
            };
            match step {
                Step::Quit(e) => break Err(e),
                Step::KeepaliveDone(Ok(())) => break Err(Error::Cancelled),
                Step::KeepaliveDone(Err(e)) => break Err(Error::Keepalive(Box::new(e))),
                Step::ReceiverReport => {
                    if udp.connected {
                        // Minimal RR (RC=0): keeps servers and middleboxes
                        // from expiring the UDP flow.
                        let mut pkt = [0u8; 8];
                        pkt[0] = 0x80;
                        pkt[1] = 201;
                        pkt[2..4].copy_from_slice(&1u16.to_be_bytes());
                        pkt[4..8].copy_from_slice(&ssrc.to_be_bytes());
                        if let Err(e) = udp.pair.rtcp_socket.send(&pkt).await {
                            debug!("RTCP RR send failed: {e}");
                        }
                    }
                }
                // Quiet stream: refresh the deadline and keep waiting.
                Step::Recv(Err(_elapsed)) => continue,
                Step::Recv(Ok(Err(e))) => break Err(Error::UdpRecv(e)),
                Step::Recv(Ok(Ok((n, _from)))) => {
                    process_rtp(&mut trackers[0], aggregator, &buf[..n]);
                }
            }
        };

        ka_cancel.cancel();
        if let Some(handle) = ka_handle.take() {
            let _ = handle.await;
        }
        match Arc::try_unwrap(conn) {
            Ok(conn) => self.conn = Some(conn.into_inner()),
            Err(_) => debug!("control connection still held at loop exit; teardown skipped"),
        }
        result
    }

    /// Sends `TEARDOWN` best-effort (bounded, errors ignored) and releases
    /// the connection. Guarded against re-entry by `closed`.
    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(id) = self.session_id.clone() else {
            self.conn = None;
            return;
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let mut req = rtsp_types::Request::builder(Method::Teardown, rtsp_types::Version::V1_0)
            .request_uri(self.config.url.clone())
            .header(rtsp_types::headers::SESSION, id.to_string())
            .build(Bytes::new());
        match tokio::time::timeout(TEARDOWN_TIMEOUT, conn.send(&mut req)).await {
            Ok(Ok(_)) => debug!("TEARDOWN {id} ok"),
            Ok(Err(e)) => debug!("TEARDOWN {id} failed: {e}"),
            Err(_) => debug!("TEARDOWN {id} timed out"),
        }
        self.conn = None;
    }

    /// Per-track counters, exposed for tests and debugging.
    pub fn tracker_totals(&self) -> (u64, u64) {
        let packets = self.trackers.iter().map(|t| t.total_packets()).sum();
        let lost = self.trackers.iter().map(|t| t.total_lost()).sum();
        (packets, lost)
    }
}

/// Resolves when the keep-alive task ends; pends forever if there is none.
async fn join_keepalive(
    handle: &mut Option<tokio::task::JoinHandle<Result<(), Error>>>,
) -> Result<(), Error> {
    match handle {
        Some(h) => {
            let res = h.await;
            *handle = None;
            match res {
                Ok(r) => r,
                Err(e) => Err(Error::Read(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                ))),
            }
        }
        None => std::future::pending().await,
    }
}

/// Feeds one RTP packet's sequence number into the tracker and the shared
/// aggregator. Only bytes 2–3 (the sequence number) are inspected; packets
/// shorter than a minimal RTP header are dropped.
fn process_rtp(tracker: &mut SequenceTracker, aggregator: &Aggregator, payload: &[u8]) {
    if payload.len() < 12 {
        return;
    }
    let seq = u16::from_be_bytes([payload[2], payload[3]]);
    let lost = tracker.push(seq);
    if lost > 0 {
        aggregator.add_loss(lost);
    }
    aggregator.add_packets(1);
    aggregator.add_bytes(payload.len() as u64);
}

fn keepalive_request(url: &Url, session_id: &str) -> rtsp_types::Request<Bytes> {
    rtsp_types::Request::builder(Method::GetParameter, rtsp_types::Version::V1_0)
        .request_uri(url.clone())
        .header(rtsp_types::headers::SESSION, session_id.to_string())
        .build(Bytes::new())
}

/// `rtsp://host/path` → `rtsp://host/path/trackID=N`.
fn track_url(base: &Url, track: u32) -> Result<Url, Error> {
    let raw = format!("{}/trackID={}", base.as_str().trim_end_matches('/'), track);
    Url::parse(&raw).map_err(|e| Error::InvalidArgument(format!("bad track url {raw:?}: {e}")))
}
