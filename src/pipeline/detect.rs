//! Input format detection for untrusted origin responses.
//!
//! Detection happens before any decode attempt so unsupported payloads
//! never reach the transform engine. Precedence: Content-Type header,
//! then magic bytes, then the file extension in the request path.

use thiserror::Error;

/// Errors from format detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unsupported image format (content-type: {content_type:?}, path: {path})")]
    Unsupported {
        content_type: Option<String>,
        path: String,
    },
}

/// Image formats the service can decode and encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    /// MIME type for the encoded output.
    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
        }
    }

    /// File extension used in cache entry names.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn from_content_type(value: &str) -> Option<Self> {
        // Strip parameters like "; charset=binary".
        let essence = value.split(';').next().unwrap_or(value).trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/gif" => Some(ImageFormat::Gif),
            "image/webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    /// Sniff the leading bytes of a payload.
    pub fn from_magic_bytes(prefix: &[u8]) -> Option<Self> {
        if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if prefix.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if prefix.starts_with(b"GIF87a") || prefix.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if prefix.len() >= 12 && &prefix[..4] == b"RIFF" && &prefix[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }

    fn from_path_hint(path: &str) -> Option<Self> {
        let ext = path.rsplit('.').next()?;
        Self::from_extension(ext)
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageFormat::from_extension(s).ok_or_else(|| format!("unknown image format {s:?}"))
    }
}

/// Determine the input format of an origin response.
pub fn detect(
    content_type: Option<&str>,
    body_prefix: &[u8],
    path_hint: &str,
) -> Result<ImageFormat, DetectError> {
    content_type
        .and_then(ImageFormat::from_content_type)
        .or_else(|| ImageFormat::from_magic_bytes(body_prefix))
        .or_else(|| ImageFormat::from_path_hint(path_hint))
        .ok_or_else(|| DetectError::Unsupported {
            content_type: content_type.map(str::to_string),
            path: path_hint.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("jpg", Some(ImageFormat::Jpeg))]
    #[case("JPEG", Some(ImageFormat::Jpeg))]
    #[case("png", Some(ImageFormat::Png))]
    #[case("gif", Some(ImageFormat::Gif))]
    #[case("webp", Some(ImageFormat::Webp))]
    #[case("bmp", None)]
    #[case("txt", None)]
    fn extension_mapping(#[case] ext: &str, #[case] expected: Option<ImageFormat>) {
        assert_eq!(ImageFormat::from_extension(ext), expected);
    }

    #[test]
    fn content_type_wins_over_sniff_and_hint() {
        // PNG magic bytes and a .gif hint, but the header says JPEG.
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let format = detect(Some("image/jpeg"), &png_magic, "photos/a.gif").unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        assert_eq!(
            ImageFormat::from_content_type("image/png; charset=binary"),
            Some(ImageFormat::Png)
        );
    }

    #[test]
    fn sniff_wins_over_hint_when_header_unrecognized() {
        let format = detect(Some("application/octet-stream"), b"GIF89a...", "a.png").unwrap();
        assert_eq!(format, ImageFormat::Gif);
    }

    #[test]
    fn extension_hint_is_last_resort() {
        let format = detect(None, b"not an image header", "photos/cat.JPEG").unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn webp_riff_container_is_sniffed() {
        let mut prefix = Vec::from(*b"RIFF");
        prefix.extend_from_slice(&1234u32.to_le_bytes());
        prefix.extend_from_slice(b"WEBP");
        assert_eq!(
            ImageFormat::from_magic_bytes(&prefix),
            Some(ImageFormat::Webp)
        );
    }

    #[test]
    fn unknown_everything_is_unsupported() {
        let err = detect(Some("text/html"), b"<html>", "page.html").unwrap_err();
        assert!(matches!(err, DetectError::Unsupported { .. }));
    }
}
