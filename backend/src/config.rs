use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::imaging::loader::DecodeLimits;
use crate::imaging::preprocess::TensorLayout;
use crate::model::handler::OutputActivation;
use crate::model::labels::{LabelError, LabelTable};

const DEFAULT_MODEL_PATH: &str = "./skin_cancer_model.onnx";
const DEFAULT_HISTORY_TABLE: &str = "prediction_history";
const DEFAULT_MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("Cannot infer model format from {0}; set MODEL_FORMAT")]
    UnknownModelFormat(String),
    #[error("Invalid CLASS_LABELS: {0}")]
    Labels(#[from] LabelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Onnx,
    TorchScript,
}

impl FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(ModelFormat::Onnx),
            "torchscript" | "torch" | "pt" => Ok(ModelFormat::TorchScript),
            other => Err(format!("unknown model format '{}'", other)),
        }
    }
}

impl ModelFormat {
    fn from_extension(path: &std::path::Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "onnx" => Some(ModelFormat::Onnx),
            "pt" | "pth" | "torchscript" => Some(ModelFormat::TorchScript),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBackend {
    None,
    Memory,
    DynamoDb,
}

impl FromStr for HistoryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "disabled" => Ok(HistoryBackend::None),
            "memory" => Ok(HistoryBackend::Memory),
            "dynamodb" => Ok(HistoryBackend::DynamoDb),
            other => Err(format!("unknown history backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub format: ModelFormat,
    pub threads: usize,
    pub labels: LabelTable,
    pub threshold: Option<f32>,
    pub activation: OutputActivation,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
    pub layout: TensorLayout,
    pub max_bytes: usize,
    pub decode_limits: DecodeLimits,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub backend: HistoryBackend,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub image: ImageConfig,
    pub history: HistoryConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let server = ServerConfig {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("PORT", get("PORT"), 8000)?,
        };

        let path = PathBuf::from(get("MODEL_PATH").unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()));
        let format = match get("MODEL_FORMAT") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "MODEL_FORMAT",
                reason,
            })?,
            None => ModelFormat::from_extension(&path)
                .ok_or_else(|| ConfigError::UnknownModelFormat(path.display().to_string()))?,
        };
        let labels = match get("CLASS_LABELS") {
            Some(raw) => LabelTable::parse(&raw)?,
            None => LabelTable::default(),
        };
        let threshold = match get("CONFIDENCE_THRESHOLD") {
            Some(raw) => Some(parse_threshold(&raw)?),
            None => None,
        };
        let model = ModelConfig {
            path,
            format,
            threads: parse_or("MODEL_THREADS", get("MODEL_THREADS"), 4)?,
            labels,
            threshold,
            activation: match get("OUTPUT_ACTIVATION") {
                Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
                    key: "OUTPUT_ACTIVATION",
                    reason,
                })?,
                None => OutputActivation::Identity,
            },
            required: parse_or("REQUIRE_MODEL", get("REQUIRE_MODEL"), false)?,
        };

        let (width, height) = match get("IMAGE_SIZE") {
            Some(raw) => parse_image_size(&raw)?,
            None => (224, 224),
        };
        let layout = match get("TENSOR_LAYOUT") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "TENSOR_LAYOUT",
                reason,
            })?,
            None => TensorLayout::Nhwc,
        };
        let image = ImageConfig {
            width,
            height,
            layout,
            max_bytes: parse_or("MAX_IMAGE_BYTES", get("MAX_IMAGE_BYTES"), DEFAULT_MAX_IMAGE_BYTES)?,
            decode_limits: DecodeLimits {
                max_dimension: parse_positive(
                    "MAX_IMAGE_DIMENSION",
                    get("MAX_IMAGE_DIMENSION"),
                    DecodeLimits::default().max_dimension,
                )?,
                max_pixels: parse_positive(
                    "MAX_IMAGE_PIXELS",
                    get("MAX_IMAGE_PIXELS"),
                    DecodeLimits::default().max_pixels,
                )?,
            },
            fetch_timeout: Duration::from_secs(parse_or(
                "FETCH_TIMEOUT_SECS",
                get("FETCH_TIMEOUT_SECS"),
                10,
            )?),
        };

        let history = HistoryConfig {
            backend: match get("HISTORY_BACKEND") {
                Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
                    key: "HISTORY_BACKEND",
                    reason,
                })?,
                None => HistoryBackend::None,
            },
            table: get("DYNAMODB_HISTORY_TABLE").unwrap_or_else(|| DEFAULT_HISTORY_TABLE.to_string()),
        };

        Ok(Self {
            server,
            model,
            image,
            history,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_positive<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(key, raw, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            reason: "must be positive".to_string(),
        });
    }
    Ok(value)
}

fn parse_threshold(raw: &str) -> Result<f32, ConfigError> {
    let value: f32 = raw.trim().parse().map_err(|e: std::num::ParseFloatError| {
        ConfigError::InvalidValue {
            key: "CONFIDENCE_THRESHOLD",
            reason: e.to_string(),
        }
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key: "CONFIDENCE_THRESHOLD",
            reason: format!("{} is outside [0, 1]", value),
        });
    }
    Ok(value)
}

/// Accepts `N` for a square input or `WxH`.
fn parse_image_size(raw: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "IMAGE_SIZE",
        reason,
    };
    let parse_dim = |s: &str| -> Result<u32, ConfigError> {
        let dim: u32 = s
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
        if dim == 0 {
            return Err(invalid("dimensions must be positive".to_string()));
        }
        Ok(dim)
    };

    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.split_once('x') {
        Some((width, height)) => Ok((parse_dim(width)?, parse_dim(height)?)),
        None => {
            let side = parse_dim(&lowered)?;
            Ok((side, side))
        }
    }
}
