//! Handlers and middleware, the composable request pipeline.
//!
//! Everything that answers a request implements [`Handler`]: it receives the
//! [`Request`] by value and a borrowed [`ResponseWriter`] to write into.
//! Middleware is nothing special: a struct that owns an inner handler and is
//! itself a `Handler`. A stage can:
//!
//! - **Pass through**: call `inner.serve(request, writer)` unchanged.
//! - **Short-circuit**: write a response itself and never call the inner handler.
//! - **Capture**: call the inner handler against a
//!   [`ResponseCapture`](crate::http::ResponseCapture), inspect or transform
//!   the result, then replay it into the outer writer.
//! - **Wrap the sink**: hand the inner handler a writer that transforms the
//!   bytes on their way out (see [`GzipWriter`](crate::compression::GzipWriter)).
//!
//! Composition is by construction, outermost first:
//!
//! ```rust,no_run
//! use hamster::cache::{CacheMiddleware, CacheStore};
//! use hamster::compression::GzipMiddleware;
//! use hamster::files::ServeDir;
//! use hamster::resize::ResizeMiddleware;
//!
//! let pipeline = GzipMiddleware::new(CacheMiddleware::new(
//!     CacheStore::new(),
//!     ResizeMiddleware::new(640, ServeDir::new("static")),
//! ));
//! ```

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;
use tracing::info;

use crate::http::{Headers, Request, ResponseWriter, StatusCode};

/// A heap-allocated, `Send` future borrowed for the lifetime of one request.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// The core trait for everything that serves a request.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because one handler instance is
///   shared by every connection task.
/// - The returned future borrows `self` and `writer`; everything the handler
///   wants the client to see must be written before it resolves.
/// - Implementations **should not** hold a `std::sync` lock guard across an
///   `.await` point.
pub trait Handler: Send + Sync + 'static {
    /// Serve `request` by writing into `writer`.
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        (**self).serve(request, writer)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        (**self).serve(request, writer)
    }
}

/// A [`Handler`] backed by a closure. Construct with [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Turns a closure returning a boxed future into a [`Handler`].
///
/// # Examples
///
/// ```rust
/// use hamster::http::{ResponseWriter, StatusCode};
/// use hamster::middleware::handler_fn;
///
/// let hello = handler_fn(|_req, w| {
///     Box::pin(async move {
///         w.reply(StatusCode::Ok, "hello");
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(Request, &'a mut dyn ResponseWriter) -> BoxFuture<'a> + Send + Sync + 'static,
{
    HandlerFn { f }
}

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(Request, &'a mut dyn ResponseWriter) -> BoxFuture<'a> + Send + Sync + 'static,
{
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        (self.f)(request, writer)
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the downstream handler completes.
/// `LoggerMiddleware` never short-circuits and never alters the response.
pub struct LoggerMiddleware<H> {
    inner: H,
}

impl<H: Handler> LoggerMiddleware<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: Handler> Handler for LoggerMiddleware<H> {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().as_str().to_owned();
            let uri = request.target();

            let mut recorder = StatusRecorder {
                inner: writer,
                status: None,
            };
            self.inner.serve(request, &mut recorder).await;

            let status = recorder.status.unwrap_or(StatusCode::Ok).as_u16();
            info!(
                method = %method,
                uri = %uri,
                status,
                elapsed = ?start.elapsed(),
                "request served"
            );
        })
    }
}

// Pass-through sink that remembers the first status the handler produced.
struct StatusRecorder<'w> {
    inner: &'w mut dyn ResponseWriter,
    status: Option<StatusCode>,
}

impl ResponseWriter for StatusRecorder<'_> {
    fn headers_mut(&mut self) -> &mut Headers {
        self.inner.headers_mut()
    }

    fn write_status(&mut self, status: StatusCode) {
        self.status.get_or_insert(status);
        self.inner.write_status(status);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        self.status.get_or_insert(StatusCode::Ok);
        self.inner.write(bytes)
    }
}
