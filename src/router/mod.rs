//! Request routing: map URL patterns to handlers.
//!
//! [`Router`] is a path multiplexer: it picks a downstream [`Handler`] by the
//! request path alone and leaves method checks to the handler. Two pattern
//! styles are supported:
//!
//! | Pattern       | Example match              |
//! |---------------|----------------------------|
//! | `/main.css`   | `/main.css`                |
//! | `/resize/*`   | `/resize`, `/resize/a.png` |
//! | `/*`          | every path                 |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/about/` and
//! `/about` are treated as equivalent.
//!
//! Routes are matched in registration order; the first route whose pattern matches wins.
//!
//! [`StripPrefix`] pairs with a wildcard route to hand the inner handler a path relative
//! to the mount point.

use tracing::debug;

use crate::http::{Request, ResponseWriter, StatusCode};
use crate::middleware::{BoxFuture, Handler};

// Compiled representation of a route pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    // Matches one exact path string, e.g. `/main.css`.
    Exact(String),
    // Matches the prefix itself and anything below it, e.g. `/resize/*`.
    Wildcard(String),
}

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// True when `path` is `prefix` or lies below it at a segment boundary.
fn is_under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

impl Pattern {
    /// Parse a route pattern string.
    ///
    /// A pattern ending in `/*` is a wildcard over everything below its prefix;
    /// anything else matches literally.
    fn parse(pattern: &str) -> Self {
        let pattern = normalize(pattern);
        match pattern.strip_suffix("/*") {
            Some(prefix) => Pattern::Wildcard(prefix.to_string()),
            None => Pattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Wildcard(prefix) => is_under(path, prefix),
        }
    }
}

struct Route {
    pattern: Pattern,
    handler: Box<dyn Handler>,
}

/// Dispatches each request to the first registered handler whose pattern
/// matches the request path. Unmatched requests get `404 Not Found`.
///
/// # Examples
///
/// ```rust,no_run
/// use hamster::files::ServeDir;
/// use hamster::resize::ResizeMiddleware;
/// use hamster::router::{Router, StripPrefix};
///
/// let mut router = Router::new();
/// router.handle(
///     "/resize/*",
///     ResizeMiddleware::new(640, StripPrefix::new("/resize", ServeDir::new("static"))),
/// );
/// router.handle("/*", ServeDir::new("static"));
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamster::router::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `handler` for paths matching `pattern`.
    pub fn handle(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.routes.push(Route {
            pattern: Pattern::parse(pattern),
            handler: Box::new(handler),
        });
        self
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Handler for Router {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            let route = self
                .routes
                .iter()
                .find(|route| route.pattern.matches(request.path()));

            match route {
                Some(route) => route.handler.serve(request, writer).await,
                None => {
                    debug!(path = %request.path(), "no route");
                    writer.reply(StatusCode::NotFound, "404 page not found");
                }
            }
        })
    }
}

/// Removes a leading path prefix before delegating, so a handler mounted at
/// `/resize/*` sees `/photo.png` rather than `/resize/photo.png`.
///
/// Requests whose path is not under the prefix get `404 Not Found`.
pub struct StripPrefix<H> {
    prefix: String,
    inner: H,
}

impl<H: Handler> StripPrefix<H> {
    pub fn new(prefix: impl Into<String>, inner: H) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: normalize(&prefix).to_string(),
            inner,
        }
    }
}

impl<H: Handler> Handler for StripPrefix<H> {
    fn serve<'a>(&'a self, mut request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if !is_under(request.path(), &self.prefix) {
                writer.reply(StatusCode::NotFound, "404 page not found");
                return;
            }

            let rest = &request.path()[self.prefix.len()..];
            let stripped = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            };
            request.set_path(stripped);
            self.inner.serve(request, writer).await;
        })
    }
}
