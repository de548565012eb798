// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based RTSP control [`Connection`] and the media socket pair.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use pretty_hex::PrettyHex;
use rtsp_types::{Data, Message};
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use url::Host;

use crate::Error;

/// Control-channel read buffer. SDP bodies from some servers are large, and
/// the decoder must be able to hold a full message before parsing it.
const READ_BUFFER_SIZE: usize = 1 << 20;

/// An RTSP control connection which implements `Stream`, `Sink`, and `Unpin`.
///
/// The stream yields complete RTSP messages: interleaved data frames are
/// decoded by a fast path, everything else is parsed as a full RTSP message.
pub(crate) struct Connection {
    framed: Framed<TcpStream, Codec>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Connection {
    pub(crate) async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            framed: Framed::with_capacity(stream, Codec, READ_BUFFER_SIZE),
            local_addr,
            peer_addr,
        })
    }

    pub(crate) fn local_ip(&self) -> IpAddr {
        self.local_addr.ip()
    }

    pub(crate) fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }
}

impl Stream for Connection {
    type Item = Result<Message<Bytes>, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.framed.poll_next_unpin(cx).map_err(|e| match e {
            CodecError::Io(source) => Error::Read(source),
            CodecError::Parse { description } => Error::Framing { description },
        })
    }
}

impl Sink<Message<Bytes>> for Connection {
    type Error = Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.framed.poll_ready_unpin(cx).map_err(CodecError::into_write_err)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.framed
            .start_send_unpin(item)
            .map_err(CodecError::into_write_err)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.framed.poll_flush_unpin(cx).map_err(CodecError::into_write_err)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.framed.poll_close_unpin(cx).map_err(CodecError::into_write_err)
    }
}

/// Encodes and decodes RTSP messages.
struct Codec;

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`.
#[derive(Debug)]
enum CodecError {
    Io(std::io::Error),
    Parse { description: String },
}

impl CodecError {
    fn into_write_err(self) -> Error {
        match self {
            CodecError::Io(source) => Error::Write(source),
            CodecError::Parse { .. } => unreachable!("encoding is infallible"),
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<Message<Bytes>>, CodecError> {
        // Skip leading CRLF as `rtsp-types` does. It must also happen here or
        // the interleaved fast path below would miss a `$` behind keep-alive
        // padding.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Fast path for interleaved data, avoiding a full message parse
            // per media frame.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some(Message::Data(Data::new(channel_id, msg.freeze()))));
        }

        // Anything that doesn't start with `$` must be a complete RTSP
        // message (e.g. an unsolicited or late keep-alive response). If it
        // isn't, fail the connection rather than hunt for the next `$`.
        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::Parse {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        (&src[..src.len().min(128)]).hex_dump(),
                    ),
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Map the message body to a `Bytes` representation and advance `src`.
        // The double `replace_body` exists because the parsed message borrows
        // `src`, which needs to be split before the owned body can be taken.
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Request(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Request(msg.replace_body(Bytes::new()))
                }
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Response(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Response(msg.replace_body(Bytes::new()))
                }
            }
            Message::Data(_) => unreachable!(),
        };
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = Message<Bytes>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.parse_msg(src)
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}

/// tokio-specific version of [`crate::UdpPair`].
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        let inner = crate::UdpPair::for_ip(ip_addr)?;
        inner.rtp_socket.set_nonblocking(true)?;
        inner.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port: inner.rtp_port,
            rtp_socket: UdpSocket::from_std(inner.rtp_socket)?,
            rtcp_socket: UdpSocket::from_std(inner.rtcp_socket)?,
        })
    }
}
