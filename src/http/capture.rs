//! In-memory response sink.

use super::{Headers, Response, ResponseWriter, StatusCode};

/// A [`ResponseWriter`] that records instead of transmitting.
///
/// Hand a capture to an inner handler, then [`collect`](Self::collect) the
/// result to inspect or transform it, and [`Response::replay`] it into the
/// real sink once done. Nothing is ever sent anywhere by the capture itself.
///
/// - Headers only accumulate.
/// - The status is last-writer-wins; a body write before any status records `200`.
/// - Body writes append in order and always succeed.
///
/// # Examples
///
/// ```
/// use hamster::http::{ResponseCapture, ResponseWriter, StatusCode};
///
/// let mut capture = ResponseCapture::new();
/// capture.append_header("Content-Type", "image/png");
/// capture.write(b"\x89PNG");
///
/// let response = capture.collect();
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.headers().get("content-type"), Some("image/png"));
/// assert_eq!(response.body_slice(), b"\x89PNG");
/// ```
#[derive(Debug, Default)]
pub struct ResponseCapture {
    status: Option<StatusCode>,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// The status recorded so far, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Snapshot of everything recorded. Repeatable; does not reset the capture.
    ///
    /// A handler that wrote neither a status nor a body yields `200 OK`.
    pub fn collect(&self) -> Response {
        Response::from_parts(
            self.status.unwrap_or(StatusCode::Ok),
            self.headers.clone(),
            self.body.clone(),
        )
    }

    /// Consumes the capture without copying the body.
    pub fn into_response(self) -> Response {
        Response::from_parts(
            self.status.unwrap_or(StatusCode::Ok),
            self.headers,
            self.body,
        )
    }
}

impl ResponseWriter for ResponseCapture {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        if self.status.is_none() {
            self.status = Some(StatusCode::Ok);
        }
        self.body.extend_from_slice(bytes);
        bytes.len()
    }
}
