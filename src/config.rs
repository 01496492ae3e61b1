//! Service configuration, loaded once from environment variables at startup.
//!
//! Configuration is immutable for the process lifetime. Any missing or
//! invalid value is fatal before the listener is bound.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Serving mode: persist transformed images, or always transform fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    Cache,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Mode::Stream),
            "cache" => Ok(Mode::Cache),
            other => Err(format!("expected \"stream\" or \"cache\", got {other:?}")),
        }
    }
}

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute base URL images are fetched from. Always ends with a slash.
    pub origin_url: String,

    /// Serving mode.
    pub mode: Mode,

    /// Cache directory for transformed images. Required in cache mode.
    pub resize_dir: Option<PathBuf>,

    /// Maximum accepted origin payload size in bytes.
    pub max_image_size: u64,

    /// Re-encode quality (0-100).
    pub quality: u8,

    /// Deadline for the outbound origin request.
    pub request_timeout: Duration,

    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let origin_url = require("ORIGIN_URL")?;
        let origin_url = normalize_origin_url(&origin_url)?;

        let mode: Mode = require("MODE")?
            .parse()
            .map_err(|reason| ConfigError::Invalid { var: "MODE", reason })?;

        let resize_dir = std::env::var("RESIZE_DIR").ok().map(PathBuf::from);
        if mode == Mode::Cache {
            match &resize_dir {
                None => return Err(ConfigError::Missing("RESIZE_DIR")),
                Some(dir) if !dir.is_absolute() => {
                    return Err(ConfigError::Invalid {
                        var: "RESIZE_DIR",
                        reason: "must be an absolute path".to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        let max_image_size: u64 = parse_var("MAX_IMAGE_SIZE", &require("MAX_IMAGE_SIZE")?)?;
        if max_image_size == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_IMAGE_SIZE",
                reason: "must be a positive number of bytes".to_string(),
            });
        }

        let quality: u8 = parse_var("QUALITY", &require("QUALITY")?)?;
        if quality > 100 {
            return Err(ConfigError::Invalid {
                var: "QUALITY",
                reason: "must be in 0..=100".to_string(),
            });
        }

        let timeout_secs: u64 = match std::env::var("IMAGE_REQUEST_TIMEOUT") {
            Ok(v) => parse_var("IMAGE_REQUEST_TIMEOUT", &v)?,
            Err(_) => 5,
        };

        let listen_addr: SocketAddr = std::env::var("IMGPROXY_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                var: "IMGPROXY_LISTEN_ADDR",
                reason: e.to_string(),
            })?;

        let log_level = std::env::var("IMGPROXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            origin_url,
            mode,
            resize_dir,
            max_image_size,
            quality,
            request_timeout: Duration::from_secs(timeout_secs),
            listen_addr,
            log_level,
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

/// Validate the origin URL and guarantee a trailing slash, so joining
/// a relative path never produces a sibling of the configured base.
fn normalize_origin_url(raw: &str) -> Result<String, ConfigError> {
    if !raw.starts_with("http://") && !raw.starts_with("https://") {
        return Err(ConfigError::Invalid {
            var: "ORIGIN_URL",
            reason: "must be an absolute http(s) URL".to_string(),
        });
    }
    if raw.ends_with('/') {
        Ok(raw.to_string())
    } else {
        Ok(format!("{raw}/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_exhaustively() {
        assert_eq!("stream".parse::<Mode>().unwrap(), Mode::Stream);
        assert_eq!("cache".parse::<Mode>().unwrap(), Mode::Cache);
        assert!("proxy".parse::<Mode>().is_err());
        assert!("Cache".parse::<Mode>().is_err());
    }

    #[test]
    fn origin_url_gains_trailing_slash() {
        assert_eq!(
            normalize_origin_url("https://example.com").unwrap(),
            "https://example.com/"
        );
        assert_eq!(
            normalize_origin_url("https://example.com/base/").unwrap(),
            "https://example.com/base/"
        );
    }

    #[test]
    fn origin_url_must_be_http() {
        assert!(normalize_origin_url("ftp://example.com").is_err());
        assert!(normalize_origin_url("example.com").is_err());
    }
}
