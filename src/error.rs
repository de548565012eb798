// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Error type for session establishment and media reception.
///
/// The orchestrator only distinguishes two classes: errors that count toward
/// `total_failures` and clean terminations ([`Error::is_cancellation`]).
/// Everything else is carried for human-readable logging.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller provided an invalid argument (bad URL, unsupported scheme).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unable to establish the TCP control connection. Retryable.
    #[error("unable to connect to RTSP server: {0}")]
    Connect(#[source] std::io::Error),

    /// The control connection could not be established within the timeout.
    /// Retryable.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Unparseable or unexpected bytes on the control channel.
    #[error("RTSP framing error: {description}")]
    Framing { description: String },

    /// The server answered a request with an error status.
    #[error("{status} response to {} CSeq={cseq}", Into::<&str>::into(.method))]
    ResponseError {
        method: rtsp_types::Method,
        cseq: u32,
        status: u16,
    },

    /// Read error on the control channel.
    #[error("error reading from RTSP peer: {0}")]
    Read(#[source] std::io::Error),

    /// Write error on the control channel.
    #[error("error writing to RTSP peer: {0}")]
    Write(#[source] std::io::Error),

    /// Error receiving an RTP datagram on an established stream.
    #[error("error receiving UDP packet: {0}")]
    UdpRecv(#[source] std::io::Error),

    /// The periodic keep-alive failed; the session is considered dead.
    #[error("keepalive failed: {0}")]
    Keepalive(#[source] Box<Error>),

    /// The run-level token was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The session's lifetime elapsed.
    #[error("deadline elapsed")]
    DeadlineExceeded,
}

impl Error {
    /// True for the termination kinds that are *not* failures: the session
    /// ended because the run was cancelled or its lifetime elapsed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// True for errors worth another connection attempt during establishment.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::ConnectTimeout)
    }
}
