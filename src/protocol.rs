//! Frame codec for the file transfer protocol.
//!
//! Every request and response is a frame terminated by `\r\n\r\n`:
//! - Request: `<COMMAND> [arg1] [arg2...]\r\n\r\n`
//! - Response: `<json object>\r\n\r\n`
//!
//! Decoding is pure buffer manipulation. A frame is only handed out once its
//! delimiter has been seen; partial frames stay in the caller's buffer.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame terminator shared by requests and responses
pub const DELIMITER: &[u8] = b"\r\n\r\n";

/// Encode a command line into a request frame.
pub fn encode(command_line: &str) -> Bytes {
    let mut frame = BytesMut::with_capacity(command_line.len() + DELIMITER.len());
    frame.put_slice(command_line.as_bytes());
    frame.put_slice(DELIMITER);
    frame.freeze()
}

/// Incremental frame extractor.
///
/// Remembers how much of the buffer has already been searched so that a
/// large frame arriving in many small reads is scanned only once.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split the first complete frame off the front of `buffer`.
    ///
    /// Returns the frame without its delimiter and leaves the remainder in
    /// `buffer`, or returns `None` if no delimiter is present yet.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> Option<BytesMut> {
        // A delimiter may straddle the previous scan boundary
        let start = self.scanned.saturating_sub(DELIMITER.len() - 1);
        match find_delimiter(&buffer[..], start) {
            Some(pos) => {
                let mut frame = buffer.split_to(pos + DELIMITER.len());
                frame.truncate(pos);
                self.scanned = 0;
                Some(frame)
            }
            None => {
                self.scanned = buffer.len();
                None
            }
        }
    }
}

/// Find the position of the first delimiter at or after `from`.
fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < DELIMITER.len() || from > buffer.len() - DELIMITER.len() {
        return None;
    }
    buffer[from..]
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
        .map(|pos| pos + from)
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// A decoded response.
///
/// `data` carries the listing or a message; `GET` responses use
/// `data_namafile` and `data_file` (base64) instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_namafile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,
}

impl Response {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            status: Status::Ok,
            data: Some(data.into()),
            data_namafile: None,
            data_file: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            data: Some(Value::String(message.into())),
            data_namafile: None,
            data_file: None,
        }
    }

    /// Successful `GET` carrying base64 file content
    pub fn file(name: impl Into<String>, content_b64: String) -> Self {
        Self {
            status: Status::Ok,
            data: None,
            data_namafile: Some(name.into()),
            data_file: Some(content_b64),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Human readable message carried in `data`.
    pub fn message(&self) -> String {
        match &self.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "Unknown error".to_string(),
        }
    }
}

/// Serialize a response into a frame.
pub fn encode_response(response: &Response) -> Bytes {
    let mut frame = BytesMut::new();
    match serde_json::to_vec(response) {
        Ok(json) => frame.put_slice(&json),
        Err(e) => {
            let fallback = serde_json::json!({ "status": "ERROR", "data": e.to_string() });
            frame.put_slice(fallback.to_string().as_bytes());
        }
    }
    frame.put_slice(DELIMITER);
    frame.freeze()
}

/// Parse a response frame payload.
///
/// Malformed payloads become an `ERROR` response describing the failure.
pub fn parse_response(payload: &[u8]) -> Response {
    match serde_json::from_slice::<Response>(payload) {
        Ok(response) => response,
        Err(e) => Response::error(format!("Malformed response from server: {e}")),
    }
}
