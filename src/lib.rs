//! # hamster
//!
//! A small async HTTP/1.1 server for a personal website, built around a
//! response-capturing middleware pipeline.
//!
//! Handlers write into a [`ResponseWriter`](http::ResponseWriter). Middleware
//! can pass a request straight through, answer it itself, run the inner
//! handler against an in-memory [`ResponseCapture`](http::ResponseCapture)
//! and transform what it wrote, or wrap the outgoing sink. The stock stages:
//!
//! - [`CacheMiddleware`](cache::CacheMiddleware) replays stored `GET` responses.
//! - [`ResizeMiddleware`](resize::ResizeMiddleware) turns PNG and JPEG responses into thumbnails.
//! - [`GzipMiddleware`](compression::GzipMiddleware) compresses for clients that accept gzip.
//! - [`LoggerMiddleware`](middleware::LoggerMiddleware) logs one line per request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hamster::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let server = Server::bind(&config.bind_addr).await?;
//!     server.run(hamster::site(&config)).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod compression;
pub mod config;
pub mod files;
pub mod http;
pub mod middleware;
pub mod resize;
pub mod router;
pub mod server;

pub use config::{Config, ConfigError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::Handler;
pub use server::{Server, ServerError};

use cache::{CacheMiddleware, CacheStore};
use compression::{GzipMiddleware, GzipPool};
use files::ServeDir;
use middleware::LoggerMiddleware;
use resize::ResizeMiddleware;
use router::{Router, StripPrefix};

/// Builds the site's handler pipeline from `config`.
///
/// `/resize/<path>` serves a cached thumbnail of `<path>`; every other path
/// is a static file. Everything is gzipped for clients that accept it.
pub fn site(config: &Config) -> impl Handler + use<> {
    let store = match config.cache_capacity {
        Some(capacity) => CacheStore::bounded(capacity),
        None => CacheStore::new(),
    };

    let thumbnails = CacheMiddleware::new(
        store,
        ResizeMiddleware::new(
            config.resize_max_width,
            StripPrefix::new("/resize", ServeDir::new(&config.static_dir)),
        )
        .with_jpeg_quality(config.jpeg_quality),
    );

    let mut router = Router::new();
    router.handle("/resize/*", thumbnails);
    router.handle("/*", ServeDir::new(&config.static_dir));

    let pool = GzipPool::new(flate2::Compression::new(config.gzip_level));
    GzipMiddleware::with_pool(pool, LoggerMiddleware::new(router))
}
