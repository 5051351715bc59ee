//! Provider payload normalization.
//!
//! Every image sent to a provider goes through the same steps: decode (with a
//! converter fallback for containers the decoder can't read), downscale the
//! long side to the provider's ceiling, flatten transparency onto white, and
//! JPEG-encode at decreasing quality until the payload fits the provider's
//! byte limit. An image that still doesn't fit at the quality floor is an
//! error; an oversized payload is never returned.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use crate::config::NormalizeConfig;
use crate::error::NormalizeError;
use crate::provider::ImagePayload;
use crate::types::ProviderDescriptor;

/// Size and quality limits for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizePolicy {
    /// Long-side ceiling in pixels
    pub max_dimension: u32,
    /// Ceiling for the encoded JPEG, in bytes
    pub max_payload_bytes: usize,
    pub start_quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
}

impl NormalizePolicy {
    pub fn new(max_dimension: u32, max_payload_bytes: usize) -> Self {
        let defaults = NormalizeConfig::default();
        Self {
            max_dimension,
            max_payload_bytes,
            start_quality: defaults.start_quality,
            min_quality: defaults.min_quality,
            quality_step: defaults.quality_step,
        }
    }

    pub fn for_descriptor(descriptor: &ProviderDescriptor, config: &NormalizeConfig) -> Self {
        Self {
            max_dimension: descriptor.max_dimension,
            max_payload_bytes: descriptor.max_payload_bytes,
            start_quality: config.start_quality,
            min_quality: config.min_quality,
            quality_step: config.quality_step,
        }
    }

    /// Qualities to try, highest first, always ending at the floor.
    ///
    /// With defaults: 85, 75, 65, 55, 45, 35, 25, 20.
    pub fn quality_ladder(&self) -> Vec<u8> {
        let floor = self.min_quality.min(self.start_quality);
        let step = self.quality_step.max(1);
        let mut ladder = Vec::new();
        let mut quality = self.start_quality;
        loop {
            ladder.push(quality);
            if quality <= floor {
                break;
            }
            quality = quality.saturating_sub(step).max(floor);
        }
        ladder
    }
}

/// A JPEG payload that satisfies a [`NormalizePolicy`].
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// JPEG quality that produced `bytes`
    pub quality: u8,
    /// Whether the external converter was needed to decode the source
    pub converted: bool,
}

impl NormalizedImage {
    pub fn to_payload(&self) -> ImagePayload {
        ImagePayload::from_bytes(&self.bytes, "jpeg")
    }
}

/// Converts containers the built-in decoder can't read (HEIC, RAW, ...) into
/// something it can.
pub trait FormatConverter: Send + Sync {
    /// Convert the file at `input`, writing a decodable image to `output`.
    fn convert(&self, input: &Path, output: &Path) -> Result<(), NormalizeError>;
}

/// Runs an external program built from a command template.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    template: Vec<String>,
}

impl CommandConverter {
    /// `template[0]` is the program; `{input}` / `{output}` in any element are
    /// replaced with the temp file paths.
    pub fn new(template: Vec<String>) -> Self {
        Self { template }
    }

    fn render(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.template
            .iter()
            .map(|part| part.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

impl FormatConverter for CommandConverter {
    fn convert(&self, input: &Path, output: &Path) -> Result<(), NormalizeError> {
        let argv = self.render(input, output);
        let Some((program, args)) = argv.split_first() else {
            return Err(NormalizeError::Conversion {
                path: input.to_path_buf(),
                message: "empty converter command".to_string(),
            });
        };
        let result = Command::new(program).args(args).output().map_err(|e| {
            NormalizeError::Conversion {
                path: input.to_path_buf(),
                message: format!("cannot run {program}: {e}"),
            }
        })?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(NormalizeError::Conversion {
                path: input.to_path_buf(),
                message: format!("{program} exited with {}: {}", result.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Produces provider-acceptable JPEG payloads.
#[derive(Clone, Default)]
pub struct ImageNormalizer {
    converter: Option<Arc<dyn FormatConverter>>,
}

impl ImageNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_converter(converter: Arc<dyn FormatConverter>) -> Self {
        Self {
            converter: Some(converter),
        }
    }

    pub fn from_config(config: &NormalizeConfig) -> Self {
        match &config.converter {
            Some(template) => Self::with_converter(Arc::new(CommandConverter::new(template.clone()))),
            None => Self::new(),
        }
    }

    /// Normalize raw file bytes. `hint` is the source file extension, used for
    /// error messages and temp file naming.
    ///
    /// CPU-bound; call from a blocking context.
    pub fn normalize(
        &self,
        bytes: &[u8],
        hint: Option<&str>,
        policy: &NormalizePolicy,
    ) -> Result<NormalizedImage, NormalizeError> {
        let (image, converted) = self.decode(bytes, hint)?;
        let image = downscale(image, policy.max_dimension);
        let rgb = flatten_to_rgb(&image);
        let (width, height) = rgb.dimensions();

        let mut smallest = None;
        for quality in policy.quality_ladder() {
            let encoded = encode_jpeg(&rgb, quality)?;
            tracing::trace!(quality, size = encoded.len(), "Encoded candidate payload");
            if encoded.len() <= policy.max_payload_bytes {
                return Ok(NormalizedImage {
                    bytes: encoded,
                    width,
                    height,
                    quality,
                    converted,
                });
            }
            smallest = Some((encoded.len(), quality));
        }

        let (size, quality) = smallest.unwrap_or((0, policy.min_quality));
        Err(NormalizeError::TooLarge {
            size,
            max_bytes: policy.max_payload_bytes,
            quality,
        })
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<(DynamicImage, bool), NormalizeError> {
        match decode_bytes(bytes) {
            Ok(image) => Ok((image, false)),
            Err(message) => match &self.converter {
                Some(converter) => {
                    tracing::debug!(
                        "Decoder rejected {} input ({message}), trying converter",
                        hint.unwrap_or("unknown")
                    );
                    self.decode_converted(converter.as_ref(), bytes, hint)
                        .map(|image| (image, true))
                }
                None => Err(NormalizeError::Decode {
                    hint: hint.map(String::from),
                    message,
                }),
            },
        }
    }

    /// Round-trip through temp files. Both files are removed when dropped,
    /// on success and on every error path.
    fn decode_converted(
        &self,
        converter: &dyn FormatConverter,
        bytes: &[u8],
        hint: Option<&str>,
    ) -> Result<DynamicImage, NormalizeError> {
        let suffix = format!(".{}", hint.unwrap_or("bin"));
        let temp_err = |e: std::io::Error| NormalizeError::Conversion {
            path: std::env::temp_dir(),
            message: format!("temp file: {e}"),
        };

        let input = tempfile::Builder::new()
            .prefix("glimpse-src-")
            .suffix(&suffix)
            .tempfile()
            .map_err(temp_err)?;
        std::fs::write(input.path(), bytes).map_err(temp_err)?;

        let output = tempfile::Builder::new()
            .prefix("glimpse-conv-")
            .suffix(".jpg")
            .tempfile()
            .map_err(temp_err)?;

        converter.convert(input.path(), output.path())?;

        let converted = std::fs::read(output.path()).map_err(|e| NormalizeError::Conversion {
            path: output.path().to_path_buf(),
            message: format!("cannot read converter output: {e}"),
        })?;
        decode_bytes(&converted).map_err(|message| NormalizeError::Decode {
            hint: hint.map(String::from),
            message: format!("converted output still undecodable: {message}"),
        })
    }
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, String> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| format!("Cannot detect image format: {e}"))?;
    if reader.format().is_none() {
        return Err("Unrecognized image format".to_string());
    }
    reader.decode().map_err(|e| e.to_string())
}

/// Shrink so the long side is at most `max_dimension`, keeping aspect ratio.
fn downscale(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width.max(height) <= max_dimension {
        return image;
    }
    image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
}

/// Composite onto a white background and drop the alpha channel.
pub fn flatten_to_rgb(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut rgb = RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |c: u8| -> u8 { ((u16::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8 };
        rgb.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    rgb
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| NormalizeError::Encode(e.to_string()))?;
    Ok(buffer)
}
