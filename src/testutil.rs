// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test helpers: a scripted in-process RTSP server.
//!
//! The mock accepts control connections, answers each request by method with
//! a canned response (echoing `CSeq`), and after `PLAY` streams canned RTP —
//! interleaved frames on the control connection or datagrams to the
//! `client_port` announced in `SETUP`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use url::Url;

/// Parses a canned response for header-level tests.
pub(crate) fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

pub(crate) struct MockServerConfig {
    pub(crate) describe_status: u16,
    pub(crate) setup_status: u16,
    /// Interleaved RTP frames to stream on channel 0 after `PLAY`.
    pub(crate) interleaved_frames: usize,
    /// Datagrams to stream after `PLAY`; enables UDP mode in `SETUP`.
    pub(crate) udp_datagrams: usize,
    pub(crate) frame_gap: Duration,
    /// Sequence numbers to use; defaults to `1..`.
    pub(crate) sequence_numbers: Option<Vec<u16>>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            describe_status: 200,
            setup_status: 200,
            interleaved_frames: 0,
            udp_datagrams: 0,
            frame_gap: Duration::from_millis(2),
            sequence_numbers: None,
        }
    }
}

pub(crate) struct MockServer {
    addr: std::net::SocketAddr,
    teardowns: Arc<AtomicUsize>,
}

impl MockServer {
    pub(crate) async fn start(config: MockServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let teardowns = Arc::new(AtomicUsize::new(0));
        let config = Arc::new(config);
        let counter = teardowns.clone();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(conn, config.clone(), counter.clone()));
            }
        });
        Self { addr, teardowns }
    }

    pub(crate) fn url(&self, path: &str) -> Url {
        Url::parse(&format!("rtsp://{}{}", self.addr, path)).unwrap()
    }

    pub(crate) fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: Arc<MockServerConfig>,
    teardowns: Arc<AtomicUsize>,
) {
    let (mut rd, wr) = stream.into_split();
    let wr = Arc::new(Mutex::new(wr));
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];
    let mut client_rtp_port: Option<u16> = None;
    let mut udp_sender: Option<Arc<UdpSocket>> = None;

    loop {
        let req_end = loop {
            if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            match rd.read(&mut tmp).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        };
        let req = String::from_utf8_lossy(&buf[..req_end]).into_owned();
        buf.drain(..req_end);
        let method = req.split_whitespace().next().unwrap_or("").to_owned();
        let cseq: u32 = header_value(&req, "cseq")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if let Some(transport) = header_value(&req, "transport") {
            if let Some(ports) = transport
                .split(';')
                .find_map(|p| p.trim().strip_prefix("client_port="))
            {
                client_rtp_port = ports.split('-').next().and_then(|p| p.parse().ok());
            }
        }

        let response = match method.as_str() {
            "OPTIONS" => simple_response(
                200,
                cseq,
                &[("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER, TEARDOWN".into())],
            ),
            "DESCRIBE" => {
                if config.describe_status != 200 {
                    simple_response(config.describe_status, cseq, &[])
                } else {
                    let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=mock\r\n\
                               m=video 0 RTP/AVP 96\r\na=control:trackID=0\r\n";
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\
                         Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{sdp}",
                        sdp.len()
                    )
                }
            }
            "SETUP" => {
                if config.setup_status != 200 {
                    simple_response(config.setup_status, cseq, &[])
                } else if config.udp_datagrams > 0 {
                    let sender = match &udp_sender {
                        Some(s) => s.clone(),
                        None => {
                            let s = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
                            udp_sender = Some(s.clone());
                            s
                        }
                    };
                    let rtp_port = sender.local_addr().unwrap().port();
                    simple_response(
                        200,
                        cseq,
                        &[
                            ("Session", "12345678;timeout=60".into()),
                            (
                                "Transport",
                                format!(
                                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                                    client_rtp_port.unwrap_or(0),
                                    client_rtp_port.unwrap_or(0) + 1,
                                    rtp_port,
                                    rtp_port + 1
                                ),
                            ),
                        ],
                    )
                } else {
                    simple_response(
                        200,
                        cseq,
                        &[
                            ("Session", "12345678;timeout=60".into()),
                            ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1".into()),
                        ],
                    )
                }
            }
            "PLAY" => simple_response(200, cseq, &[("Session", "12345678".into())]),
            "GET_PARAMETER" => simple_response(200, cseq, &[("Session", "12345678".into())]),
            "TEARDOWN" => {
                teardowns.fetch_add(1, Ordering::SeqCst);
                simple_response(200, cseq, &[("Session", "12345678".into())])
            }
            _ => simple_response(405, cseq, &[]),
        };
        if wr.lock().await.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        // Media starts only once the PLAY response is on the wire, so frames
        // can never precede it in the stream.
        if method == "PLAY" {
            if config.interleaved_frames > 0 {
                tokio::spawn(stream_interleaved(wr.clone(), config.clone()));
            }
            if config.udp_datagrams > 0 {
                if let (Some(sender), Some(port)) = (udp_sender.clone(), client_rtp_port) {
                    tokio::spawn(stream_datagrams(sender, port, config.clone()));
                }
            }
        }
    }
}

async fn stream_interleaved(wr: Arc<Mutex<OwnedWriteHalf>>, config: Arc<MockServerConfig>) {
    for i in 0..config.interleaved_frames {
        let seq = sequence_number(&config, i);
        let pkt = rtp_packet(seq);
        let mut frame = Vec::with_capacity(4 + pkt.len());
        frame.push(b'$');
        frame.push(0);
        frame.extend_from_slice(&(pkt.len() as u16).to_be_bytes());
        frame.extend_from_slice(&pkt);
        if wr.lock().await.write_all(&frame).await.is_err() {
            return;
        }
        tokio::time::sleep(config.frame_gap).await;
    }
}

async fn stream_datagrams(sender: Arc<UdpSocket>, client_rtp_port: u16, config: Arc<MockServerConfig>) {
    for i in 0..config.udp_datagrams {
        let seq = sequence_number(&config, i);
        let pkt = rtp_packet(seq);
        if sender
            .send_to(&pkt, ("127.0.0.1", client_rtp_port))
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(config.frame_gap).await;
    }
}

fn sequence_number(config: &MockServerConfig, i: usize) -> u16 {
    match &config.sequence_numbers {
        Some(seqs) => seqs[i % seqs.len()],
        None => (i + 1) as u16,
    }
}

/// A minimal RTP packet: 12-byte header with the given sequence number,
/// followed by a fixed dummy payload.
fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; 172];
    pkt[0] = 0x80;
    pkt[1] = 96;
    pkt[2..4].copy_from_slice(&seq.to_be_bytes());
    pkt[8..12].copy_from_slice(&1u32.to_be_bytes());
    pkt
}

fn simple_response(status: u16, cseq: u32, headers: &[(&str, String)]) -> String {
    let phrase = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let mut out = format!("RTSP/1.0 {status} {phrase}\r\nCSeq: {cseq}\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

fn header_value<'a>(req: &'a str, name: &str) -> Option<&'a str> {
    req.lines().find_map(|line| {
        let (header, value) = line.split_once(':')?;
        header.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
