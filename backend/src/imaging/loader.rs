use base64::{engine::general_purpose, Engine as _};
use image::error::{ImageError, LimitError, LimitErrorKind};
use image::{ImageReader, Limits, RgbImage};
use reqwest::Client;
use sha2::{Digest, Sha256};
use shared::ImageSource;
use std::io::Cursor;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Invalid image URL: {0}")]
    InvalidUrl(String),
    #[error("Image host responded with {0}")]
    Status(reqwest::StatusCode),
    #[error("Failed to fetch image: {0}")]
    Fetch(String),
    #[error("Invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Image data is empty")]
    Empty,
    #[error("Image exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("Unable to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Where the raw image bytes for a request come from.
#[derive(Debug, Clone)]
pub enum ImageInput {
    Url(String),
    Base64(String),
    Upload(Vec<u8>),
}

impl ImageInput {
    pub fn source(&self) -> ImageSource {
        match self {
            ImageInput::Url(_) => ImageSource::Url,
            ImageInput::Base64(_) => ImageSource::Base64,
            ImageInput::Upload(_) => ImageSource::Upload,
        }
    }
}

/// Caps on what a decoded image may cost. The encoded size says nothing
/// about the decoded size, so these are checked against the header before
/// any pixel buffer is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_dimension: u32,
    pub max_pixels: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_dimension: 8192,
            max_pixels: 40_000_000,
        }
    }
}

impl DecodeLimits {
    fn reader_limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        // 16-bit RGBA is the widest layout a decoder hands back.
        limits.max_alloc = Some(self.max_pixels.saturating_mul(8));
        limits
    }
}

#[derive(Clone)]
pub struct ImageLoader {
    client: Client,
    max_bytes: usize,
    limits: DecodeLimits,
}

impl ImageLoader {
    pub fn new(fetch_timeout: Duration, max_bytes: usize) -> Result<Self, LoadError> {
        let client = Client::builder()
            .timeout(fetch_timeout)
            .user_agent(concat!("dermascan/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoadError::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            max_bytes,
            limits: DecodeLimits::default(),
        })
    }

    pub fn with_decode_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, LoadError> {
        decode_image(bytes, &self.limits)
    }

    /// Resolves the input to raw encoded image bytes. A URL costs exactly one
    /// GET; nothing is retried.
    pub async fn acquire(&self, input: ImageInput) -> Result<Vec<u8>, LoadError> {
        let bytes = match input {
            ImageInput::Url(url) => self.fetch_bytes(&url).await?,
            ImageInput::Base64(text) => decode_base64(&text)?,
            ImageInput::Upload(bytes) => bytes,
        };
        self.check_size(&bytes)?;
        Ok(bytes)
    }

    pub async fn fetch_bytes(&self, raw_url: &str) -> Result<Vec<u8>, LoadError> {
        let url = Url::parse(raw_url.trim()).map_err(|e| LoadError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LoadError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        log::debug!("Fetching image from {}", url);
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| LoadError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Image host {} responded with {}", url, status);
            return Err(LoadError::Status(status));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(LoadError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LoadError::Fetch(e.to_string()))?
        {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(LoadError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    fn check_size(&self, bytes: &[u8]) -> Result<(), LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(LoadError::TooLarge {
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Decodes standard-alphabet base64, tolerating embedded whitespace and a
/// `data:<mime>;base64,` prefix.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, LoadError> {
    let trimmed = text.trim();
    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once("base64,")
            .map(|(_, data)| data)
            .unwrap_or(rest),
        None => trimmed,
    };
    let compact: String = payload.split_whitespace().collect();
    if compact.is_empty() {
        return Err(LoadError::Empty);
    }
    Ok(general_purpose::STANDARD.decode(compact)?)
}

/// Decodes any supported format and normalizes it to 3-channel RGB,
/// dropping alpha and expanding grayscale. Images over `limits` are
/// rejected from their header alone.
pub fn decode_image(bytes: &[u8], limits: &DecodeLimits) -> Result<RgbImage, LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::Empty);
    }

    let (width, height) = guess_format(bytes)?.into_dimensions()?;
    if width > limits.max_dimension
        || height > limits.max_dimension
        || u64::from(width) * u64::from(height) > limits.max_pixels
    {
        log::warn!(
            "Rejecting {}x{} image, limits are {} per side and {} pixels",
            width,
            height,
            limits.max_dimension,
            limits.max_pixels
        );
        return Err(LoadError::Image(ImageError::Limits(LimitError::from_kind(
            LimitErrorKind::DimensionError,
        ))));
    }

    let mut reader = guess_format(bytes)?;
    reader.limits(limits.reader_limits());
    Ok(reader.decode()?.into_rgb8())
}

fn guess_format(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, LoadError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| LoadError::Image(ImageError::IoError(e)))
}

pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
