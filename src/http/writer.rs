//! The response sink capability shared by every pipeline stage.
//!
//! A handler never builds a response value and returns it; it writes into a
//! [`ResponseWriter`]. Three sinks implement the trait:
//!
//! | Sink | Where the bytes go |
//! |---|---|
//! | [`WireWriter`] | HTTP/1.1 wire format, bound for the client socket |
//! | [`ResponseCapture`](super::ResponseCapture) | memory, for inspection and replay |
//! | [`GzipWriter`](crate::compression::GzipWriter) | compressed, into another sink |
//!
//! Middleware depends only on the trait, so any stage can sit above or below
//! any other.

use bytes::{BufMut, BytesMut};
use tracing::warn;

use super::{Headers, StatusCode};

/// A response sink: mutable header map, a status setter, and a body writer.
///
/// Ordering follows the usual server-side convention: headers may be mutated
/// until the status is written; the first body write without an explicit
/// status implies `200 OK`.
pub trait ResponseWriter: Send {
    /// The header map that will accompany the status line.
    fn headers_mut(&mut self) -> &mut Headers;

    /// Records the response status.
    fn write_status(&mut self, status: StatusCode);

    /// Appends body bytes, returning the number of bytes accepted.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Appends a header value; never replaces existing values.
    fn append_header(&mut self, name: &str, value: &str) {
        self.headers_mut().append(name, value);
    }

    /// Writes a complete plain-text reply: content type, status, body.
    fn reply(&mut self, status: StatusCode, body: &str) {
        self.append_header("Content-Type", "text/plain; charset=utf-8");
        self.write_status(status);
        self.write(body.as_bytes());
    }
}

/// The live sink: serializes a response into HTTP/1.1 wire format.
///
/// The head (status line and headers) is emitted the moment the status is
/// written, or on the first body write. Without a `Content-Length` header the
/// body is sent with `Transfer-Encoding: chunked`. Call [`finish`](Self::finish)
/// to terminate the message and take the bytes.
///
/// # Examples
///
/// ```
/// use hamster::http::{ResponseWriter, StatusCode, WireWriter};
///
/// let mut w = WireWriter::new(true);
/// w.append_header("Content-Length", "2");
/// w.write_status(StatusCode::Ok);
/// w.write(b"hi");
/// let text = String::from_utf8(w.finish().to_vec()).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.ends_with("\r\n\r\nhi"));
/// ```
#[derive(Debug)]
pub struct WireWriter {
    buf: BytesMut,
    headers: Headers,
    status: Option<StatusCode>,
    keep_alive: bool,
    head_only: bool,
    chunked: bool,
    bodyless: bool,
}

/// Initial capacity of the outbound buffer.
const INITIAL_BUF_SIZE: usize = 1024;

impl WireWriter {
    /// Creates a sink that will advertise `Connection: keep-alive` or `close`.
    pub fn new(keep_alive: bool) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            headers: Headers::new(),
            status: None,
            keep_alive,
            head_only: false,
            chunked: false,
            bodyless: false,
        }
    }

    /// Marks the response as answering a `HEAD` request: the head goes out
    /// as usual and every body byte is discarded.
    #[must_use]
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    /// Returns the status sent on the wire, if the head has gone out.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Terminates the message and returns the serialized bytes.
    ///
    /// Emits a `200 OK` head if the handler wrote nothing at all.
    pub fn finish(mut self) -> BytesMut {
        if self.status.is_none() {
            self.write_head(StatusCode::Ok);
        }
        if self.chunked {
            self.buf.put(&b"0\r\n\r\n"[..]);
        }
        self.buf
    }

    fn write_head(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.bodyless = self.head_only || status.is_bodyless();

        if !self.bodyless && !self.headers.contains("content-length") {
            self.chunked = true;
            self.headers.append("Transfer-Encoding", "chunked");
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.headers.append("Connection", connection);

        self.buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            self.buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        self.buf.put(&b"\r\n"[..]);
    }
}

impl ResponseWriter for WireWriter {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        if let Some(sent) = self.status {
            warn!(sent = %sent, ignored = %status, "superfluous write_status");
            return;
        }
        self.write_head(status);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        if self.status.is_none() {
            self.write_head(StatusCode::Ok);
        }
        if bytes.is_empty() || self.bodyless {
            return bytes.len();
        }
        if self.chunked {
            self.buf.put(format!("{:x}\r\n", bytes.len()).as_bytes());
            self.buf.put(bytes);
            self.buf.put(&b"\r\n"[..]);
        } else {
            self.buf.put(bytes);
        }
        bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn chunked_without_content_length() {
        let mut w = WireWriter::new(true);
        w.write(b"Hello");
        w.write(b", world");
        let s = to_string(w.finish());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert!(s.contains("Connection: keep-alive\r\n"));
        assert!(s.ends_with("\r\n\r\n5\r\nHello\r\n7\r\n, world\r\n0\r\n\r\n"));
    }

    #[test]
    fn identity_with_content_length() {
        let mut w = WireWriter::new(false);
        w.append_header("Content-Length", "5");
        w.write(b"Hello");
        let s = to_string(w.finish());
        assert!(!s.contains("Transfer-Encoding"));
        assert!(s.contains("Connection: close\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn status_emits_head_and_freezes_headers() {
        let mut w = WireWriter::new(true);
        w.append_header("X-Before", "1");
        w.write_status(StatusCode::NotFound);
        w.append_header("X-After", "2");
        w.write_status(StatusCode::Ok);
        assert_eq!(w.status(), Some(StatusCode::NotFound));
        let s = to_string(w.finish());
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.contains("X-Before: 1\r\n"));
        assert!(!s.contains("X-After"));
    }

    #[test]
    fn empty_handler_yields_empty_ok() {
        let s = to_string(WireWriter::new(true).finish());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.ends_with("\r\n\r\n0\r\n\r\n"));
    }

    #[test]
    fn no_content_has_no_body_framing() {
        let mut w = WireWriter::new(true);
        w.write_status(StatusCode::NoContent);
        w.write(b"ignored");
        let s = to_string(w.finish());
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!s.contains("Transfer-Encoding"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(!s.contains("ignored"));
    }

    #[test]
    fn head_response_keeps_headers_and_drops_body() {
        let mut w = WireWriter::new(true).head_only(true);
        w.append_header("Content-Length", "13");
        w.write_status(StatusCode::Ok);
        w.write(b"<h1>home</h1>");
        let s = to_string(w.finish());
        assert!(s.contains("Content-Length: 13\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(!s.contains("home"));

        let mut w = WireWriter::new(true).head_only(true);
        w.reply(StatusCode::NotFound, "file /nope.txt not found");
        let s = to_string(w.finish());
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!s.contains("Transfer-Encoding"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn reply_sets_plain_text() {
        let mut w = WireWriter::new(true);
        w.reply(StatusCode::Forbidden, "nope");
        let s = to_string(w.finish());
        assert!(s.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(s.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(s.contains("4\r\nnope\r\n"));
    }
}
