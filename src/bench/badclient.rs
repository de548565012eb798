// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deliberately misbehaving clients.
//!
//! These exercise the server's resilience, not the measurement path: a bad
//! client contributes to the `bad_clients` counter and the per-type tally
//! and nothing else. Errors are expected and discarded by the orchestrator.
//! New behaviors only need a [`Misbehavior`] impl and an entry in [`ALL`].

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

use crate::{Error, CONNECT_TIMEOUT, DEFAULT_RTSP_PORT};

/// One adversarial behavior. `run` returns when cancelled or when the
/// behavior terminates (including by server disconnect).
pub trait Misbehavior: Send + Sync {
    fn name(&self) -> &'static str;
    fn run<'a>(&'a self, url: &'a Url, cancel: &'a CancellationToken)
        -> BoxFuture<'a, Result<(), Error>>;
}

/// Every known behavior; selection is uniform.
pub const ALL: &[&dyn Misbehavior] = &[
    &SlowSender,
    &GarbageSender,
    &MalformedRequests,
    &IncompleteHandshake,
    &RandomDisconnect,
    &ResourceHog,
];

pub fn random_misbehavior() -> &'static dyn Misbehavior {
    ALL[rand::thread_rng().gen_range(0..ALL.len())]
}

async fn connect(url: &Url) -> Result<TcpStream, Error> {
    let host = url
        .host()
        .ok_or_else(|| Error::InvalidArgument(format!("must specify host in rtsp url {url}")))?;
    let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
    let connect = async {
        match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }
    };
    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Err(_) => Err(Error::ConnectTimeout),
        Ok(Err(e)) => Err(Error::Connect(e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Sleeps unless cancelled first; true means the caller should stop.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Sends syntactically valid RTSP one byte at a time with long delays.
pub struct SlowSender;

impl Misbehavior for SlowSender {
    fn name(&self) -> &'static str {
        "slow-sender"
    }

    fn run<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut stream = connect(url).await?;
            let mut cseq = 1u32;
            loop {
                let message = if cseq % 2 == 1 {
                    format!("OPTIONS * RTSP/1.0\r\nCSeq: {cseq}\r\n\r\n")
                } else {
                    format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: {cseq}\r\n\r\n")
                };
                for byte in message.bytes() {
                    let delay = Duration::from_millis(rand::thread_rng().gen_range(50..500));
                    if pause(cancel, delay).await {
                        return Ok(());
                    }
                    stream.write_all(&[byte]).await.map_err(Error::Write)?;
                }
                cseq += 1;
                let gap = Duration::from_secs(rand::thread_rng().gen_range(5..15));
                if pause(cancel, gap).await {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}

/// Sends non-RTSP garbage: wrong protocols, binary noise, random bytes.
pub struct GarbageSender;

const GARBAGE: &[&[u8]] = &[
    b"GET / HTTP/1.1\r\n\r\n",
    b"HELLO RTSP SERVER\n",
    b"\x00\x01\x02\x03\x04\x05\x06\x07",
    b"OPTIONS * RTSP/2.0\r\n\r\n",
    b"<?xml version=\"1.0\"?><root></root>",
    b"CONNECT proxy.example.com:443 HTTP/1.1\r\n\r\n",
];

impl Misbehavior for GarbageSender {
    fn name(&self) -> &'static str {
        "garbage-sender"
    }

    fn run<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut stream = connect(url).await?;
            loop {
                let payload: Vec<u8> = {
                    let mut rng = rand::thread_rng();
                    if rng.gen_bool(0.3) {
                        let len = rng.gen_range(100..1000);
                        (0..len).map(|_| rng.gen()).collect()
                    } else {
                        GARBAGE[rng.gen_range(0..GARBAGE.len())].to_vec()
                    }
                };
                stream.write_all(&payload).await.map_err(Error::Write)?;
                let delay = Duration::from_millis(rand::thread_rng().gen_range(100..2100));
                if pause(cancel, delay).await {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}

/// Sends structurally broken RTSP requests: huge headers, absurd header
/// counts, null bytes, kilometric URLs.
pub struct MalformedRequests;

impl Misbehavior for MalformedRequests {
    fn name(&self) -> &'static str {
        "malformed-requests"
    }

    fn run<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut stream = connect(url).await?;
            let mut cseq = 1u32;
            loop {
                let request = {
                    let mut rng = rand::thread_rng();
                    match rng.gen_range(0..6) {
                        0 => format!(
                            "OPTIONS * RTSP/1.0\r\nCSeq: {cseq}\r\nUser-Agent: {}\r\n\r\n",
                            "A".repeat(10_000)
                        ),
                        1 => {
                            let mut r = format!("OPTIONS * RTSP/1.0\r\nCSeq: {cseq}\r\n");
                            for i in 0..1000 {
                                r.push_str(&format!("X-Header-{i}: value\r\n"));
                            }
                            r.push_str("\r\n");
                            r
                        }
                        2 => format!("OPTIONS * RTSP/1.0\r\nCSeq: {cseq}\r\nX-Test: 你好世界\r\n\r\n"),
                        3 => format!(
                            "OPTIONS * RTSP/1.0\r\nCSeq: {cseq}\r\nX-Null: \x00\x00\x00\r\n\r\n"
                        ),
                        4 => format!(
                            "DESCRIBE rtsp://example.com/{} RTSP/1.0\r\nCSeq: {cseq}\r\n\r\n",
                            "path/".repeat(1000)
                        ),
                        _ => {
                            let methods = ["OpTiOnS", "options", "OPTIONS", "oPtIoNs"];
                            format!(
                                "{} * RTSP/1.0\r\nCSeq: {cseq}\r\n\r\n",
                                methods[rng.gen_range(0..methods.len())]
                            )
                        }
                    }
                };
                stream.write_all(request.as_bytes()).await.map_err(Error::Write)?;

                // Read and discard whatever the server answers.
                let mut buf = [0u8; 4096];
                let _ = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;

                cseq += 1;
                let delay = Duration::from_millis(rand::thread_rng().gen_range(200..1000));
                if pause(cancel, delay).await {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}

/// Starts a handshake and never finishes it, holding the connection open.
pub struct IncompleteHandshake;

impl Misbehavior for IncompleteHandshake {
    fn name(&self) -> &'static str {
        "incomplete-handshake"
    }

    fn run<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut stream = connect(url).await?;
            stream
                .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n")
                .await
                .map_err(Error::Write)?;
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;

            // DESCRIBE without the terminating blank line.
            let describe = format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\n");
            stream
                .write_all(describe.as_bytes())
                .await
                .map_err(Error::Write)?;

            cancel.cancelled().await;
            Ok(())
        }
        .boxed()
    }
}

/// Behaves for a moment, then disconnects without teardown.
pub struct RandomDisconnect;

impl Misbehavior for RandomDisconnect {
    fn name(&self) -> &'static str {
        "random-disconnect"
    }

    fn run<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut stream = connect(url).await?;
            stream
                .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n")
                .await
                .map_err(Error::Write)?;
            let wait = Duration::from_secs(rand::thread_rng().gen_range(1..30));
            pause(cancel, wait).await;
            // Dropping the stream is the abrupt close.
            Ok(())
        }
        .boxed()
    }
}

/// Holds a connection and its server-side state while doing almost nothing.
pub struct ResourceHog;

impl Misbehavior for ResourceHog {
    fn name(&self) -> &'static str {
        "resource-hog"
    }

    fn run<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut stream = connect(url).await?;
            stream
                .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n")
                .await
                .map_err(Error::Write)?;
            let mut buf = [0u8; 4096];
            let _ = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;

            loop {
                if pause(cancel, Duration::from_secs(30)).await {
                    return Ok(());
                }
                // One byte: enough to look alive, never a complete command.
                if stream.write_all(b"O").await.is_err() {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}
