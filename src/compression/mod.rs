//! Transparent gzip compression of response bodies.
//!
//! [`GzipMiddleware`] checks the request's `Accept-Encoding`; when the client
//! accepts gzip it checks a compressor out of a [`GzipPool`], wraps the outer
//! sink in a [`GzipWriter`], and lets the inner handler write through it.
//! Clients that don't advertise gzip get the inner handler's bytes untouched.
//!
//! Compressors are raw deflate streams ([`flate2::Compress`]) with the gzip
//! member framing (RFC 1952) written around them, so a pooled compressor can
//! be reset and reused instead of rebuilt per request.

use std::sync::{Mutex, MutexGuard};

use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use tracing::{debug, error};

use crate::http::{Headers, Method, Request, ResponseWriter, StatusCode};
use crate::middleware::{BoxFuture, Handler};

/// Fixed gzip member header: magic, CM=deflate, no flags, no mtime, XFL=0, OS=unknown.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];

/// Minimum spare output capacity reserved before each deflate call.
const OUTPUT_CHUNK: usize = 8 * 1024;

/// Default number of idle compressors the pool retains.
pub const DEFAULT_POOL_IDLE: usize = 64;

/// A reusable gzip compressor: deflate state, running CRC, and an output buffer.
pub struct Gzipper {
    deflate: Compress,
    crc: Crc,
    out: Vec<u8>,
    started: bool,
}

impl Gzipper {
    pub fn new(level: Compression) -> Self {
        Self {
            deflate: Compress::new(level, false),
            crc: Crc::new(),
            out: Vec::with_capacity(OUTPUT_CHUNK),
            started: false,
        }
    }

    /// Clears all stream state so the next write begins a fresh gzip member.
    pub fn reset(&mut self) {
        self.deflate.reset();
        self.crc.reset();
        self.out.clear();
        self.started = false;
    }

    /// Compresses `input`, returning whatever compressed output is ready.
    ///
    /// The returned slice is valid until the next call.
    pub fn compress(&mut self, input: &[u8]) -> Result<&[u8], flate2::CompressError> {
        self.out.clear();
        self.start();
        self.crc.update(input);

        let mut remaining = input;
        while !remaining.is_empty() {
            self.out.reserve(OUTPUT_CHUNK);
            let before = self.deflate.total_in();
            self.deflate
                .compress_vec(remaining, &mut self.out, FlushCompress::None)?;
            let consumed = (self.deflate.total_in() - before) as usize;
            remaining = &remaining[consumed..];
        }
        Ok(&self.out)
    }

    /// Ends the gzip member: flushes deflate and appends the CRC32/ISIZE trailer.
    pub fn finish(&mut self) -> Result<&[u8], flate2::CompressError> {
        self.out.clear();
        self.start();

        loop {
            self.out.reserve(OUTPUT_CHUNK);
            match self
                .deflate
                .compress_vec(&[], &mut self.out, FlushCompress::Finish)?
            {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => continue,
            }
        }
        self.out.extend_from_slice(&self.crc.sum().to_le_bytes());
        self.out.extend_from_slice(&self.crc.amount().to_le_bytes());
        Ok(&self.out)
    }

    fn start(&mut self) {
        if !self.started {
            self.out.extend_from_slice(&GZIP_HEADER);
            self.started = true;
        }
    }
}

/// A concurrency-safe free list of [`Gzipper`]s.
///
/// [`checkout`](Self::checkout) hands out a [`PooledGzipper`] guard; dropping
/// the guard resets the compressor and returns it, on every exit path.
pub struct GzipPool {
    idle: Mutex<Vec<Gzipper>>,
    level: Compression,
    max_idle: usize,
}

impl GzipPool {
    pub fn new(level: Compression) -> Self {
        Self::with_max_idle(level, DEFAULT_POOL_IDLE)
    }

    /// A pool that retains at most `max_idle` returned compressors; extras are dropped.
    pub fn with_max_idle(level: Compression, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            level,
            max_idle,
        }
    }

    /// Takes an idle compressor, or builds one if none is free.
    pub fn checkout(&self) -> PooledGzipper<'_> {
        let gz = self
            .lock()
            .pop()
            .unwrap_or_else(|| Gzipper::new(self.level));
        PooledGzipper {
            pool: self,
            gz: Some(gz),
        }
    }

    /// Number of compressors currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, mut gz: Gzipper) {
        gz.reset();
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(gz);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Gzipper>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for GzipPool {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

/// A checked-out compressor. Returned to its pool on drop.
pub struct PooledGzipper<'p> {
    pool: &'p GzipPool,
    gz: Option<Gzipper>,
}

impl std::ops::Deref for PooledGzipper<'_> {
    type Target = Gzipper;

    fn deref(&self) -> &Gzipper {
        // Only `Drop` takes the compressor out.
        self.gz.as_ref().expect("compressor present until drop")
    }
}

impl std::ops::DerefMut for PooledGzipper<'_> {
    fn deref_mut(&mut self) -> &mut Gzipper {
        self.gz.as_mut().expect("compressor present until drop")
    }
}

impl Drop for PooledGzipper<'_> {
    fn drop(&mut self) {
        if let Some(gz) = self.gz.take() {
            self.pool.release(gz);
        }
    }
}

/// A sink that gzips body bytes before passing them to the wrapped sink.
///
/// Headers and status pass straight through, except that `Content-Length` is
/// removed before the status goes out: the compressed length differs from
/// whatever the inner handler declared.
///
/// Responses that carry no body (`HEAD` answers, `204`, `304`, `1xx`) get no
/// gzip member at all.
pub struct GzipWriter<'w, 'p> {
    inner: &'w mut dyn ResponseWriter,
    gz: PooledGzipper<'p>,
    head_sent: bool,
    head_only: bool,
    bodyless: bool,
    failed: bool,
}

impl<'w, 'p> GzipWriter<'w, 'p> {
    pub fn new(inner: &'w mut dyn ResponseWriter, gz: PooledGzipper<'p>) -> Self {
        Self {
            inner,
            gz,
            head_sent: false,
            head_only: false,
            bodyless: false,
            failed: false,
        }
    }

    /// Marks the response as answering a `HEAD` request.
    #[must_use]
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    /// Terminates the gzip stream and writes the trailer to the wrapped sink.
    ///
    /// The compressor itself goes back to the pool when the writer is dropped.
    pub fn finish(mut self) {
        self.send_head(StatusCode::Ok);
        if self.failed || self.bodyless {
            return;
        }
        match self.gz.finish() {
            Ok(tail) => {
                self.inner.write(tail);
            }
            Err(e) => error!(error = %e, "gzip finish failed"),
        }
    }

    fn send_head(&mut self, status: StatusCode) {
        if self.head_sent {
            return;
        }
        self.head_sent = true;
        self.bodyless = self.head_only || status.is_bodyless();
        self.inner.headers_mut().remove("content-length");
        self.inner.write_status(status);
    }
}

impl ResponseWriter for GzipWriter<'_, '_> {
    fn headers_mut(&mut self) -> &mut Headers {
        self.inner.headers_mut()
    }

    fn write_status(&mut self, status: StatusCode) {
        self.send_head(status);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        self.send_head(StatusCode::Ok);
        if self.failed || self.bodyless || bytes.is_empty() {
            return bytes.len();
        }
        match self.gz.compress(bytes) {
            Ok(out) => {
                if !out.is_empty() {
                    self.inner.write(out);
                }
            }
            Err(e) => {
                error!(error = %e, "gzip compression failed; dropping remaining body");
                self.failed = true;
            }
        }
        bytes.len()
    }
}

/// Gzips responses for clients that advertise `gzip` in `Accept-Encoding`.
///
/// # Behavior
///
/// - No `gzip` in any `Accept-Encoding` value → the inner handler writes
///   directly to the outer sink, and no `Content-Encoding` is added.
/// - Otherwise → `Content-Encoding: gzip` and `Vary: Accept-Encoding` are
///   appended, and the inner handler writes through a [`GzipWriter`].
pub struct GzipMiddleware<H> {
    pool: GzipPool,
    inner: H,
}

impl<H: Handler> GzipMiddleware<H> {
    pub fn new(inner: H) -> Self {
        Self::with_pool(GzipPool::default(), inner)
    }

    pub fn with_pool(pool: GzipPool, inner: H) -> Self {
        Self { pool, inner }
    }

    /// The compressor pool shared by all requests through this middleware.
    pub fn pool(&self) -> &GzipPool {
        &self.pool
    }
}

/// Returns `true` if the request advertises gzip support.
pub fn accepts_gzip(request: &Request) -> bool {
    request
        .headers()
        .any_value_contains("accept-encoding", "gzip")
}

impl<H: Handler> Handler for GzipMiddleware<H> {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if !accepts_gzip(&request) {
                self.inner.serve(request, writer).await;
                return;
            }

            debug!(path = %request.path(), "gzip response");
            writer.append_header("Content-Encoding", "gzip");
            writer.append_header("Vary", "Accept-Encoding");

            let head_only = *request.method() == Method::Head;
            let mut gz = GzipWriter::new(writer, self.pool.checkout()).head_only(head_only);
            self.inner.serve(request, &mut gz).await;
            gz.finish();
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use flate2::read::GzDecoder;
    use tokio::task::JoinSet;

    use super::*;
    use crate::http::{Response, ResponseCapture};
    use crate::middleware::handler_fn;

    fn make_request(accept_encoding: Option<&str>) -> Request {
        request_for("GET", "/page", accept_encoding)
    }

    fn request_for(method: &str, path: &str, accept_encoding: Option<&str>) -> Request {
        let extra = accept_encoding
            .map(|v| format!("Accept-Encoding: {v}\r\n"))
            .unwrap_or_default();
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n{extra}\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
        out
    }

    fn page_handler() -> impl Handler {
        handler_fn(|_req, w| {
            Box::pin(async move {
                let body = "<p>hello hamster</p>".repeat(200);
                w.append_header("Content-Type", "text/html");
                w.append_header("Content-Length", &body.len().to_string());
                w.write_status(StatusCode::Ok);
                w.write(&body.as_bytes()[..1000]);
                w.write(&body.as_bytes()[1000..]);
            })
        })
    }

    async fn run(handler: &impl Handler, accept_encoding: Option<&str>) -> Response {
        let mut capture = ResponseCapture::new();
        handler
            .serve(make_request(accept_encoding), &mut capture)
            .await;
        capture.into_response()
    }

    #[test]
    fn gzipper_round_trips_across_resets() {
        let mut gz = Gzipper::new(Compression::default());
        let payloads: [&[u8]; 3] = [b"first payload", b"", b"second, different payload"];
        for payload in payloads {
            let mut stream = gz.compress(payload).unwrap().to_vec();
            stream.extend_from_slice(gz.finish().unwrap());
            assert_eq!(gunzip(&stream), payload);
            gz.reset();
        }
    }

    #[tokio::test]
    async fn compresses_when_accepted() {
        let gzip = GzipMiddleware::new(page_handler());
        let r = run(&gzip, Some("deflate, gzip")).await;

        assert_eq!(r.status(), StatusCode::Ok);
        assert_eq!(r.headers().get("content-encoding"), Some("gzip"));
        assert_eq!(r.headers().get("vary"), Some("Accept-Encoding"));
        assert!(!r.headers().contains("content-length"));
        assert_eq!(r.headers().get("content-type"), Some("text/html"));

        let plain = gunzip(r.body_slice());
        assert_eq!(plain, "<p>hello hamster</p>".repeat(200).into_bytes());
        assert!(r.body_slice().len() < plain.len());
    }

    #[tokio::test]
    async fn passes_through_without_accept_encoding() {
        let gzip = GzipMiddleware::new(page_handler());
        let direct = run(&page_handler(), None).await;

        for ae in [None, Some("br, deflate"), Some("identity")] {
            let r = run(&gzip, ae).await;
            assert!(!r.headers().contains("content-encoding"));
            assert_eq!(r, direct);
        }
    }

    #[tokio::test]
    async fn status_without_body_still_yields_valid_gzip() {
        let gzip = GzipMiddleware::new(handler_fn(|_req, w| {
            Box::pin(async move {
                w.write_status(StatusCode::NotFound);
            })
        }));
        let r = run(&gzip, Some("gzip")).await;
        assert_eq!(r.status(), StatusCode::NotFound);
        assert!(gunzip(r.body_slice()).is_empty());
    }

    #[tokio::test]
    async fn head_and_no_content_get_no_gzip_member() {
        let gzip = GzipMiddleware::new(page_handler());
        let mut capture = ResponseCapture::new();
        gzip.serve(request_for("HEAD", "/page", Some("gzip")), &mut capture)
            .await;
        let r = capture.into_response();
        assert_eq!(r.status(), StatusCode::Ok);
        assert_eq!(r.headers().get("content-encoding"), Some("gzip"));
        assert!(r.body_slice().is_empty());

        let no_content = GzipMiddleware::new(handler_fn(|_req, w| {
            Box::pin(async move {
                w.write_status(StatusCode::NoContent);
            })
        }));
        let r = run(&no_content, Some("gzip")).await;
        assert_eq!(r.status(), StatusCode::NoContent);
        assert!(r.body_slice().is_empty());
        assert_eq!(no_content.pool().idle(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_decode_to_their_own_bodies() {
        fn body_for(path: &str) -> String {
            format!("{path} ").repeat(300)
        }

        let gzip = Arc::new(GzipMiddleware::new(handler_fn(|req, w| {
            Box::pin(async move {
                let body = body_for(req.path());
                w.write(&body.as_bytes()[..body.len() / 2]);
                tokio::task::yield_now().await;
                w.write(&body.as_bytes()[body.len() / 2..]);
            })
        })));

        let mut tasks = JoinSet::new();
        for i in 0..32 {
            let gzip = Arc::clone(&gzip);
            tasks.spawn(async move {
                let path = format!("/page/{i}");
                let mut capture = ResponseCapture::new();
                gzip.serve(request_for("GET", &path, Some("gzip")), &mut capture)
                    .await;
                (path, capture.into_response())
            });
        }

        while let Some(res) = tasks.join_next().await {
            let (path, r) = res.unwrap();
            assert_eq!(gunzip(r.body_slice()), body_for(&path).into_bytes());
        }
        assert!(gzip.pool().idle() >= 1);
    }

    #[tokio::test]
    async fn compressor_returns_to_pool() {
        let gzip = GzipMiddleware::new(page_handler());
        assert_eq!(gzip.pool().idle(), 0);

        run(&gzip, Some("gzip")).await;
        assert_eq!(gzip.pool().idle(), 1);

        // Reused, not duplicated; output stays independent of the last request.
        let r = run(&gzip, Some("gzip")).await;
        assert_eq!(gzip.pool().idle(), 1);
        assert_eq!(
            gunzip(r.body_slice()),
            "<p>hello hamster</p>".repeat(200).into_bytes()
        );
    }

    #[test]
    fn guard_releases_on_unwind() {
        let pool = GzipPool::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut gz = pool.checkout();
            gz.compress(b"partial").unwrap();
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);

        // The returned compressor starts a clean member.
        let mut gz = pool.checkout();
        let mut stream = gz.compress(b"fresh").unwrap().to_vec();
        stream.extend_from_slice(gz.finish().unwrap());
        assert_eq!(gunzip(&stream), b"fresh");
    }

    #[test]
    fn pool_caps_idle_compressors() {
        let pool = GzipPool::with_max_idle(Compression::fast(), 1);
        let a = pool.checkout();
        let b = pool.checkout();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }
}
