//! On-the-fly image thumbnails.
//!
//! [`ResizeMiddleware`] runs its inner handler (usually a static file server)
//! against a capture, then decodes the captured PNG or JPEG, scales it down to
//! a maximum width with Lanczos resampling, and re-encodes it in the same
//! format. Anything else gets a diagnostic error response.
//!
//! | Captured response | Result |
//! |---|---|
//! | status ≠ 200 | replayed verbatim |
//! | no `Content-Type` | `501 could not determine content type of image` |
//! | `image/png`, `image/jpeg` | `200` thumbnail, same format |
//! | `text/html` | `415 can't resize html files` |
//! | anything else | `501 unimplemented` |
//! | decode / encode failure | `501` with the codec's message |
//!
//! This stage never caches; wrap it in a
//! [`CacheMiddleware`](crate::cache::CacheMiddleware) so that repeat requests
//! skip both the decode and the encode.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat};
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::{Headers, Request, ResponseCapture, ResponseWriter, StatusCode};
use crate::middleware::{BoxFuture, Handler};

/// Height bound handed to the resampler; effectively unconstrained.
const MAX_HEIGHT: u32 = 100_000;

/// JPEG quality used unless overridden with [`ResizeMiddleware::with_jpeg_quality`].
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Raster formats the resizer can round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
}

impl ImageKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// Why a captured response could not be turned into a thumbnail.
///
/// The `Display` text is sent to the client as the response body.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("could not determine content type of image")]
    MissingContentType,

    #[error("can't resize html files")]
    Html,

    #[error("unimplemented")]
    Unsupported(String),

    #[error("error while decoding {}: {source}", kind.name())]
    Decode {
        kind: ImageKind,
        #[source]
        source: ImageError,
    },

    #[error("error while encoding {}: {source}", kind.name())]
    Encode {
        kind: ImageKind,
        #[source]
        source: ImageError,
    },

    #[error("resize task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl TranscodeError {
    /// The status the client sees for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Html => StatusCode::UnsupportedMediaType,
            Self::MissingContentType
            | Self::Unsupported(_)
            | Self::Decode { .. }
            | Self::Encode { .. }
            | Self::Task(_) => StatusCode::NotImplemented,
        }
    }
}

/// Classifies a response by its first `Content-Type` value.
///
/// Parameters after `;` are ignored and the media type compares
/// case-insensitively; the body is never sniffed.
pub fn classify(headers: &Headers) -> Result<ImageKind, TranscodeError> {
    let raw = headers
        .get("content-type")
        .ok_or(TranscodeError::MissingContentType)?;
    let media = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match media.as_str() {
        "image/png" => Ok(ImageKind::Png),
        "image/jpeg" => Ok(ImageKind::Jpeg),
        "text/html" => Err(TranscodeError::Html),
        "" => Err(TranscodeError::MissingContentType),
        _ => Err(TranscodeError::Unsupported(media)),
    }
}

/// Decodes `bytes` as `kind`, scales it to at most `max_width` pixels wide
/// (aspect ratio kept, never upscaled), and re-encodes it as `kind`.
pub fn thumbnail(
    bytes: &[u8],
    kind: ImageKind,
    max_width: u32,
    jpeg_quality: u8,
) -> Result<Vec<u8>, TranscodeError> {
    let image = image::load_from_memory_with_format(bytes, kind.format())
        .map_err(|source| TranscodeError::Decode { kind, source })?;

    let resized = if image.width() > max_width {
        image.resize(max_width, MAX_HEIGHT, FilterType::Lanczos3)
    } else {
        image
    };
    debug!(width = resized.width(), height = resized.height(), "thumbnail dimensions");

    encode(&resized, kind, jpeg_quality).map_err(|source| TranscodeError::Encode { kind, source })
}

fn encode(image: &DynamicImage, kind: ImageKind, jpeg_quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut out = Vec::new();
    match kind {
        ImageKind::Png => image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?,
        ImageKind::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, jpeg_quality).encode_image(&rgb)?;
        }
    }
    Ok(out)
}

/// Thumbnails the inner handler's image responses. See the [module docs](self).
pub struct ResizeMiddleware<H> {
    max_width: u32,
    jpeg_quality: u8,
    inner: H,
}

impl<H: Handler> ResizeMiddleware<H> {
    /// Resizes to at most `max_width` pixels wide.
    pub fn new(max_width: u32, inner: H) -> Self {
        Self {
            max_width,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            inner,
        }
    }

    /// Sets the JPEG re-encode quality (1–100).
    #[must_use]
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

impl<H: Handler> Handler for ResizeMiddleware<H> {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            let path = request.path().to_owned();

            let mut capture = ResponseCapture::new();
            self.inner.serve(request, &mut capture).await;
            let original = capture.into_response();

            if original.status() != StatusCode::Ok {
                original.replay(writer);
                return;
            }

            let kind = match classify(original.headers()) {
                Ok(kind) => kind,
                Err(e) => {
                    debug!(path = %path, error = %e, "not resizable");
                    writer.reply(e.status(), &e.to_string());
                    return;
                }
            };

            let original_len = original.body_slice().len();
            let body = original.into_body();
            let (max_width, quality) = (self.max_width, self.jpeg_quality);
            let result = tokio::task::spawn_blocking(move || {
                thumbnail(&body, kind, max_width, quality)
            })
            .await
            .map_err(TranscodeError::from)
            .and_then(|r| r);

            match result {
                Ok(resized) => {
                    debug!(
                        path = %path,
                        format = kind.name(),
                        original_len,
                        resized_len = resized.len(),
                        "resized image"
                    );
                    writer.append_header("Content-Type", kind.content_type());
                    writer.append_header("Content-Length", &resized.len().to_string());
                    writer.write_status(StatusCode::Ok);
                    writer.write(&resized);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "resize failed");
                    writer.reply(e.status(), &e.to_string());
                }
            }
        })
    }
}
