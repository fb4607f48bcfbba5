//! Server configuration from command-line flags and environment variables.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("jpeg quality must be between 1 and 100, got {0}")]
    JpegQuality(u8),

    #[error("gzip level must be between 0 and 9, got {0}")]
    GzipLevel(u32),

    #[error("resize width must be greater than zero")]
    ResizeWidth,
}

/// hamster - static files with cached thumbnails and gzip.
///
/// Every flag can also be set through the environment variable named next to it.
#[derive(Parser, Debug, Clone)]
#[command(name = "hamster", version, about, long_about = None)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "HAMSTER_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: String,

    /// Directory served as the site root.
    #[arg(long, env = "HAMSTER_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Maximum thumbnail width in pixels for `/resize/` requests.
    #[arg(long, env = "HAMSTER_RESIZE_WIDTH", default_value_t = 640)]
    pub resize_max_width: u32,

    /// Quality used when re-encoding JPEG thumbnails (1-100).
    #[arg(long, env = "HAMSTER_JPEG_QUALITY", default_value_t = 90)]
    pub jpeg_quality: u8,

    /// Gzip compression level (0-9).
    #[arg(long, env = "HAMSTER_GZIP_LEVEL", default_value_t = 6)]
    pub gzip_level: u32,

    /// Maximum number of cached thumbnails; unbounded when unset.
    #[arg(long, env = "HAMSTER_CACHE_CAPACITY")]
    pub cache_capacity: Option<usize>,
}

impl Config {
    /// Parses flags and environment, then validates the result.
    ///
    /// Exits the process with a usage message when parsing fails, like any
    /// `clap` program.
    pub fn load() -> Result<Self, ConfigError> {
        Self::parse().validate()
    }

    /// Checks value ranges and logs the accepted configuration.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::JpegQuality(self.jpeg_quality));
        }
        if self.gzip_level > 9 {
            return Err(ConfigError::GzipLevel(self.gzip_level));
        }
        if self.resize_max_width == 0 {
            return Err(ConfigError::ResizeWidth);
        }

        tracing::info!(
            bind_addr = %self.bind_addr,
            static_dir = %self.static_dir.display(),
            resize_max_width = self.resize_max_width,
            jpeg_quality = self.jpeg_quality,
            gzip_level = self.gzip_level,
            cache_capacity = ?self.cache_capacity,
            "configuration loaded"
        );

        Ok(self)
    }
}
