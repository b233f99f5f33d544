//! Broker gateway wire-protocol constants and framing.
//! Grounded on an IB-TWS-style length-prefixed, version-negotiated framing:
//! a 4-byte big-endian length prefix followed by a payload whose first
//! field is a numeric message id (spec §4.1, §6). Generalized beyond the
//! IB reference with an explicit reqId field in every frame, since this
//! adapter must correlate async responses itself rather than relying on
//! a client library that already does it.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Length-prefix header size.
pub const HEADER_LEN: usize = 4;

/// Size in bytes of the `message_id` field that follows the length prefix.
pub const MESSAGE_ID_LEN: usize = 4;

/// Size in bytes of the `req_id` field that follows `message_id`.
pub const REQ_ID_LEN: usize = 8;

/// Minimum supported gateway protocol version; lower versions log a warning
/// but the handshake may still proceed (config-driven floor, spec §6).
pub const DEFAULT_MIN_VERSION: i32 = 100;

/// Client-side protocol version this adapter speaks.
pub const CLIENT_VERSION: i32 = 150;

pub mod incoming {
    pub const ORDER_STATUS: i32 = 3;
    pub const ERR_MSG: i32 = 4;
    pub const EXECUTION_DATA: i32 = 11;
    pub const REAL_TIME_BARS: i32 = 50;
    pub const ACCOUNT_UPDATE: i32 = 6;
    pub const MARKET_DEPTH: i32 = 12;
    pub const SNAPSHOT_END: i32 = 57;
    pub const NEXT_VALID_ID: i32 = 9;
    /// This adapter's own generic acknowledgement, sent once the gateway
    /// has durably accepted a request with no other response of its own
    /// (e.g. cancel-all). The upstream IB protocol has no equivalent; every
    /// one of its requests implies completion through a specific reply.
    pub const REQUEST_COMPLETE: i32 = 100;
}

pub mod outgoing {
    pub const PLACE_ORDER: i32 = 3;
    pub const CANCEL_ORDER: i32 = 4;
    pub const REQ_REAL_TIME_BARS: i32 = 50;
    pub const CANCEL_REAL_TIME_BARS: i32 = 51;
    pub const REQ_ACCOUNT_UPDATES: i32 = 6;
    pub const REQ_MARKET_DEPTH: i32 = 10;
    pub const CANCEL_MARKET_DEPTH: i32 = 11;
    /// Cancel every working order for this session (used by the EOD
    /// flatten scheduler, spec §4.4).
    pub const CANCEL_ALL_ORDERS: i32 = 12;
}

/// Gateway error codes below this threshold (informational / stale-data
/// warnings) must be swallowed rather than failing the ticket (spec §4.1).
pub fn is_fatal_error_code(code: i32) -> bool {
    !matches!(code, 2100..=2200 | 300..=399)
}

/// Encodes one frame: `[length:4 BE][message_id:4 BE][req_id:8 BE][body]`,
/// where `length` covers everything after itself.
pub fn encode_frame(message_id: i32, req_id: i64, body: &[u8]) -> Vec<u8> {
    let payload_len = (MESSAGE_ID_LEN + REQ_ID_LEN + body.len()) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len as usize);
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(&message_id.to_be_bytes());
    frame.extend_from_slice(&req_id.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Encodes an `ERR_MSG` body: `[code:4 BE][message bytes]`.
pub fn encode_error_body(code: i32, message: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + message.len());
    body.extend_from_slice(&code.to_be_bytes());
    body.extend_from_slice(message.as_bytes());
    body
}

/// Decodes an `ERR_MSG` body back into `(code, message)`; a body too short
/// to hold a code is reported as code 0 with the raw bytes as the message.
pub fn decode_error_body(body: &[u8]) -> (i32, String) {
    if body.len() < 4 {
        return (0, String::from_utf8_lossy(body).into_owned());
    }
    let code = i32::from_be_bytes(body[0..4].try_into().unwrap());
    let message = String::from_utf8_lossy(&body[4..]).into_owned();
    (code, message)
}

/// Reads one length-prefixed frame from `reader`. `Ok(None)` signals a
/// clean EOF (the gateway closed the connection) rather than an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<(i32, i64, Vec<u8>)>> {
    let mut len_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let message_id = i32::from_be_bytes(payload[0..MESSAGE_ID_LEN].try_into().unwrap());
    let req_id = i64::from_be_bytes(
        payload[MESSAGE_ID_LEN..MESSAGE_ID_LEN + REQ_ID_LEN]
            .try_into()
            .unwrap(),
    );
    let body = payload[MESSAGE_ID_LEN + REQ_ID_LEN..].to_vec();
    Ok(Some((message_id, req_id, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_data_warnings_are_non_fatal() {
        assert!(!is_fatal_error_code(2104));
        assert!(!is_fatal_error_code(2106));
    }

    #[test]
    fn unclassified_codes_are_fatal() {
        assert!(is_fatal_error_code(502));
        assert!(is_fatal_error_code(10001));
    }

    #[tokio::test]
    async fn frame_round_trips_through_read_frame() {
        let frame = encode_frame(outgoing::PLACE_ORDER, 42, b"hello");
        let mut cursor = std::io::Cursor::new(frame);
        let (message_id, req_id, body) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(message_id, outgoing::PLACE_ORDER);
        assert_eq!(req_id, 42);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn error_body_round_trips() {
        let body = encode_error_body(2104, "market data farm connection is OK");
        let (code, message) = decode_error_body(&body);
        assert_eq!(code, 2104);
        assert_eq!(message, "market data farm connection is OK");
    }

    #[tokio::test]
    async fn read_frame_reports_clean_eof_as_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }
}
