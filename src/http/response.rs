//! A complete response held in memory.
//!
//! [`Response`] is what a [`ResponseCapture`](super::ResponseCapture) collects
//! and what the cache stores. It can be built directly with the fluent
//! builder, replayed into any [`ResponseWriter`], or serialized for the wire.

use bytes::BytesMut;

use super::{Headers, ResponseWriter, StatusCode, WireWriter};

/// A status code, an ordered header multi-map, and a body.
///
/// # Examples
///
/// ```
/// use hamster::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes(true);
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub(crate) fn from_parts(status: StatusCode, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the recorded headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn body_slice(&self) -> &[u8] {
        &self.body
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Writes this response into `writer`: every header value (appended,
    /// never overwriting), then the status, then the body.
    pub fn replay(&self, writer: &mut dyn ResponseWriter) {
        for (name, value) in self.headers.iter() {
            writer.append_header(name, value);
        }
        writer.write_status(self.status);
        if !self.body.is_empty() {
            writer.write(&self.body);
        }
    }

    /// Serializes the response into HTTP/1.1 wire format.
    ///
    /// Adds `Content-Length` when the headers don't carry one, and
    /// `Content-Type: text/plain; charset=utf-8` for a non-empty body with no
    /// declared type.
    pub fn into_bytes(mut self, keep_alive: bool) -> BytesMut {
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .append("Content-Type", "text/plain; charset=utf-8");
        }
        if !self.status.is_bodyless() && !self.headers.contains("content-length") {
            self.headers
                .append("Content-Length", self.body.len().to_string());
        }

        let mut wire = WireWriter::new(keep_alive);
        self.replay(&mut wire);
        wire.finish()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
