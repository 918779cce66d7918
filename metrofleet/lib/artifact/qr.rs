use std::{
    fmt::{self, Display, Write as _},
    str::FromStr,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use image::{codecs::png::PngEncoder, ExtendedColorType, GrayImage, ImageEncoder, Luma};
use qrcode::{types::QrError, Color, EcLevel, QrCode};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ArtifactConfig, DEFAULT_QR_MARGIN, DEFAULT_QR_SIZE},
    FleetError, FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The encoding of a generated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrFormat {
    /// Self-contained SVG markup.
    #[default]
    Svg,

    /// Base64-encoded PNG bytes, without a data-URI prefix.
    Png,
}

/// How much of a code can be damaged while staying readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCorrectionLevel {
    /// About 7%.
    L,

    /// About 15%.
    #[default]
    M,

    /// About 25%.
    Q,

    /// About 30%.
    H,
}

/// How to render a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QrOptions {
    /// The side of the image in pixels. The module grid wins when it is larger.
    pub size: u32,

    /// The output encoding.
    pub format: QrFormat,

    /// The preferred error-correction level.
    pub error_correction_level: ErrorCorrectionLevel,

    /// The quiet zone in modules.
    pub margin: u32,
}

/// A rendered connection code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrArtifact {
    /// SVG markup or base64 PNG, depending on `format`.
    pub data: String,

    /// The encoding of `data`.
    pub format: QrFormat,

    /// The encoded URL.
    pub url: String,

    /// When the code was rendered.
    pub generated_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QrOptions {
    /// The options configured for artifacts, rendered as SVG.
    pub fn from_config(config: &ArtifactConfig) -> Self {
        Self {
            size: *config.get_size(),
            margin: *config.get_margin(),
            ..Self::default()
        }
    }
}

impl ErrorCorrectionLevel {
    /// This level followed by every weaker one.
    fn fallbacks(self) -> impl Iterator<Item = ErrorCorrectionLevel> {
        [Self::H, Self::Q, Self::M, Self::L]
            .into_iter()
            .filter(move |level| *level <= self)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders `url` as a QR code.
///
/// When `url` does not fit at the requested error-correction level, weaker levels are tried
/// before giving up with [`FleetError::Artifact`].
pub fn generate_qr_code(url: &str, options: &QrOptions) -> FleetResult<QrArtifact> {
    let code = encode(url, options.error_correction_level)?;

    let data = match options.format {
        QrFormat::Svg => render_svg(&code, options.size, options.margin),
        QrFormat::Png => STANDARD.encode(render_png(&code, options.size, options.margin)?),
    };

    Ok(QrArtifact {
        data,
        format: options.format,
        url: url.to_string(),
        generated_at: Utc::now(),
    })
}

fn encode(url: &str, preferred: ErrorCorrectionLevel) -> FleetResult<QrCode> {
    for level in preferred.fallbacks() {
        match QrCode::with_error_correction_level(url, level.into()) {
            Ok(code) => {
                if level != preferred {
                    tracing::debug!(%preferred, %level, "lowered qr error correction level");
                }
                return Ok(code);
            }
            Err(QrError::DataTooLong) => continue,
            Err(e) => return Err(FleetError::Artifact(format!("cannot encode url: {e}"))),
        }
    }

    Err(FleetError::Artifact(format!(
        "url of {} bytes does not fit in a qr code",
        url.len()
    )))
}

fn render_svg(code: &QrCode, size: u32, margin: u32) -> String {
    let width = code.width() as u32;
    let total = width + 2 * margin;
    let side = size.max(total);
    let colors = code.to_colors();

    let mut path = String::new();
    for (y, row) in colors.chunks(width as usize).enumerate() {
        let mut x = 0;
        while x < row.len() {
            if row[x] != Color::Dark {
                x += 1;
                continue;
            }

            let start = x;
            while x < row.len() && row[x] == Color::Dark {
                x += 1;
            }

            let run = x - start;
            let _ = write!(
                path,
                "M{},{}h{run}v1h-{run}z",
                start as u32 + margin,
                y as u32 + margin
            );
        }
    }

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<svg xmlns="http://www.w3.org/2000/svg" version="1.1" width="{side}" height="{side}" "#,
            r#"viewBox="0 0 {total} {total}" shape-rendering="crispEdges">"#,
            r##"<rect width="{total}" height="{total}" fill="#ffffff"/>"##,
            r##"<path fill="#000000" d="{path}"/>"##,
            "</svg>"
        ),
        side = side,
        total = total,
        path = path,
    )
}

fn render_png(code: &QrCode, size: u32, margin: u32) -> FleetResult<Vec<u8>> {
    let width = code.width() as u32;
    let total = width + 2 * margin;
    let scale = (size / total).max(1);
    let side = size.max(total);
    let offset = (side - total * scale) / 2 + margin * scale;

    let mut image = GrayImage::from_pixel(side, side, Luma([255]));
    for (index, color) in code.to_colors().into_iter().enumerate() {
        if color != Color::Dark {
            continue;
        }

        let column = index as u32 % width;
        let row = index as u32 / width;
        for dy in 0..scale {
            for dx in 0..scale {
                image.put_pixel(
                    offset + column * scale + dx,
                    offset + row * scale + dy,
                    Luma([0]),
                );
            }
        }
    }

    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(image.as_raw(), side, side, ExtendedColorType::L8)
        .map_err(|e| FleetError::Artifact(format!("cannot encode png: {e}")))?;

    Ok(bytes)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for QrOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_QR_SIZE,
            format: QrFormat::default(),
            error_correction_level: ErrorCorrectionLevel::default(),
            margin: DEFAULT_QR_MARGIN,
        }
    }
}

impl From<ErrorCorrectionLevel> for EcLevel {
    fn from(level: ErrorCorrectionLevel) -> Self {
        match level {
            ErrorCorrectionLevel::L => EcLevel::L,
            ErrorCorrectionLevel::M => EcLevel::M,
            ErrorCorrectionLevel::Q => EcLevel::Q,
            ErrorCorrectionLevel::H => EcLevel::H,
        }
    }
}

impl Display for QrFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QrFormat::Svg => write!(f, "svg"),
            QrFormat::Png => write!(f, "png"),
        }
    }
}

impl FromStr for QrFormat {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svg" => Ok(QrFormat::Svg),
            "png" => Ok(QrFormat::Png),
            other => Err(FleetError::Artifact(format!("unknown format: {other}"))),
        }
    }
}

impl Display for ErrorCorrectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            ErrorCorrectionLevel::L => "L",
            ErrorCorrectionLevel::M => "M",
            ErrorCorrectionLevel::Q => "Q",
            ErrorCorrectionLevel::H => "H",
        };
        write!(f, "{level}")
    }
}

impl FromStr for ErrorCorrectionLevel {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L" => Ok(ErrorCorrectionLevel::L),
            "M" => Ok(ErrorCorrectionLevel::M),
            "Q" => Ok(ErrorCorrectionLevel::Q),
            "H" => Ok(ErrorCorrectionLevel::H),
            other => Err(FleetError::Artifact(format!(
                "unknown error correction level: {other}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://metro-task-1.up.railway.app";

    fn png(size: u32) -> QrOptions {
        QrOptions {
            size,
            format: QrFormat::Png,
            ..Default::default()
        }
    }

    #[test]
    fn test_svg_is_self_contained_markup() {
        let artifact = generate_qr_code(URL, &QrOptions::default()).unwrap();
        assert_eq!(artifact.format, QrFormat::Svg);
        assert_eq!(artifact.url, URL);
        assert!(artifact.data.starts_with("<?xml"));
        assert!(artifact.data.contains(r#"width="300""#));
        assert!(artifact.data.ends_with("</svg>"));
    }

    #[test]
    fn test_png_is_base64_without_prefix() {
        let artifact = generate_qr_code(URL, &png(200)).unwrap();
        assert!(!artifact.data.starts_with("data:"));

        let bytes = STANDARD.decode(&artifact.data).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_larger_png_has_more_bytes() {
        let small = generate_qr_code(URL, &png(100)).unwrap();
        let large = generate_qr_code(URL, &png(400)).unwrap();
        assert!(large.data.len() > small.data.len());
    }

    #[test]
    fn test_every_level_and_margin_renders_long_urls() {
        let url = format!("{URL}/?token={}", "a".repeat(1_500));
        for level in [
            ErrorCorrectionLevel::L,
            ErrorCorrectionLevel::M,
            ErrorCorrectionLevel::Q,
            ErrorCorrectionLevel::H,
        ] {
            for margin in [0, 4, 10] {
                for format in [QrFormat::Svg, QrFormat::Png] {
                    let options = QrOptions {
                        size: 300,
                        format,
                        error_correction_level: level,
                        margin,
                    };
                    let artifact = generate_qr_code(&url, &options).unwrap();
                    assert!(!artifact.data.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_oversized_data_is_an_artifact_error() {
        let url = format!("{URL}/?token={}", "a".repeat(8_000));
        let err = generate_qr_code(&url, &QrOptions::default()).unwrap_err();
        assert!(matches!(err, FleetError::Artifact(_)));
    }

    #[test]
    fn test_fallback_levels() {
        let levels: Vec<_> = ErrorCorrectionLevel::Q.fallbacks().collect();
        assert_eq!(
            levels,
            vec![
                ErrorCorrectionLevel::Q,
                ErrorCorrectionLevel::M,
                ErrorCorrectionLevel::L
            ]
        );
        assert_eq!("h".parse::<ErrorCorrectionLevel>().unwrap(), ErrorCorrectionLevel::H);
        assert_eq!("PNG".parse::<QrFormat>().unwrap(), QrFormat::Png);
    }
}
