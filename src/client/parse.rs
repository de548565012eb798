// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Header parsing helpers for the RTSP client.

use bytes::Bytes;

/// Returns the `CSeq` of a response, if parseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str(), 10).ok())
}

/// Extracts the session id from a `SETUP` response: the portion of the
/// `Session` header before the first `;` (parameters such as `timeout` are
/// dropped), trimmed of whitespace.
pub(crate) fn session_id(response: &rtsp_types::Response<Bytes>) -> Option<Box<str>> {
    let value = response.header(&rtsp_types::headers::SESSION)?;
    let id = match value.as_str().split_once(';') {
        Some((id, _params)) => id,
        None => value.as_str(),
    }
    .trim();
    if id.is_empty() {
        return None;
    }
    Some(id.into())
}

/// Extracts `server_port=rtp-rtcp` from a `SETUP` response's `Transport`
/// header. The RTCP port defaults to RTP + 1 when the server announces a
/// single port.
pub(crate) fn server_ports(response: &rtsp_types::Response<Bytes>) -> Option<(u16, u16)> {
    let transport = response.header(&rtsp_types::headers::TRANSPORT)?;
    for part in transport.as_str().split(';') {
        let Some(ports) = part.trim().strip_prefix("server_port=") else {
            continue;
        };
        let (rtp, rtcp) = match ports.split_once('-') {
            Some((rtp, rtcp)) => (rtp, Some(rtcp)),
            None => (ports, None),
        };
        let rtp: u16 = rtp.trim().parse().ok()?;
        let rtcp = match rtcp {
            Some(p) => p.trim().parse().ok()?,
            None => rtp.wrapping_add(1),
        };
        return Some((rtp, rtcp));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::response;

    #[test]
    fn session_id_strips_parameters() {
        let r = response(
            b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: 0E6914A0;timeout=60\r\n\r\n",
        );
        assert_eq!(session_id(&r).as_deref(), Some("0E6914A0"));
        assert_eq!(get_cseq(&r), Some(2));
    }

    #[test]
    fn session_id_without_parameters() {
        let r = response(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: abc123\r\n\r\n");
        assert_eq!(session_id(&r).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_session_header() {
        let r = response(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n\r\n");
        assert_eq!(session_id(&r), None);
    }

    #[test]
    fn server_ports_range() {
        let r = response(
            b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\
              Transport: RTP/AVP;unicast;client_port=5000-5001;server_port=6000-6001\r\n\r\n",
        );
        assert_eq!(server_ports(&r), Some((6000, 6001)));
    }

    #[test]
    fn server_ports_single() {
        let r = response(
            b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\
              Transport: RTP/AVP;unicast;server_port=6000\r\n\r\n",
        );
        assert_eq!(server_ports(&r), Some((6000, 6001)));
    }

    #[test]
    fn server_ports_absent() {
        let r = response(
            b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        assert_eq!(server_ports(&r), None);
    }
}
