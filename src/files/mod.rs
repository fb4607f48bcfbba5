//! Static file serving.
//!
//! [`ServeDir`] maps request paths onto a directory tree and is usually the
//! innermost stage of a pipeline: the resizer thumbnails what it serves and
//! the cache keeps the result.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::http::{Method, Request, ResponseWriter, StatusCode};
use crate::middleware::{BoxFuture, Handler};

/// Serves files below a root directory.
///
/// - Only `GET` and `HEAD` are allowed; anything else is `405`.
/// - A path with a `..` segment is refused with `403`.
/// - A path ending in `/` (or naming a directory) serves its `index.html`.
/// - The content type comes from the file extension.
pub struct ServeDir {
    root: PathBuf,
}

impl ServeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut file = self.root.join(path.trim_start_matches('/'));
        if path.ends_with('/') {
            file.push("index.html");
        }
        file
    }
}

/// Guesses a MIME type from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("txt" | "md") => "text/plain; charset=utf-8",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn has_dot_dot(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

impl Handler for ServeDir {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            let head_only = match request.method() {
                Method::Get => false,
                Method::Head => true,
                _ => {
                    writer.append_header("Allow", "GET, HEAD");
                    writer.reply(StatusCode::MethodNotAllowed, "method not allowed");
                    return;
                }
            };

            let path = request.path();
            if has_dot_dot(path) {
                writer.reply(StatusCode::Forbidden, "\"..\" forbidden in URL");
                return;
            }

            let mut file = self.resolve(path);
            if tokio::fs::metadata(&file)
                .await
                .is_ok_and(|meta| meta.is_dir())
            {
                file.push("index.html");
            }

            let contents = match tokio::fs::read(&file).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %path, file = %file.display(), "file not found");
                    writer.reply(StatusCode::NotFound, &format!("file {path} not found"));
                    return;
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    writer.reply(StatusCode::Forbidden, "forbidden");
                    return;
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "failed to read file");
                    writer.reply(StatusCode::InternalServerError, "internal server error");
                    return;
                }
            };

            debug!(path = %path, bytes = contents.len(), "serving file");
            writer.append_header("Content-Type", content_type_for(&file));
            writer.append_header("Content-Length", &contents.len().to_string());
            writer.write_status(StatusCode::Ok);
            if !head_only {
                writer.write(&contents);
            }
        })
    }
}
