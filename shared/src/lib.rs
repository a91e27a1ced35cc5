use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub const UNRELATED_CLASS: &str = "unrelated";
pub const UNRELATED_DESCRIPTION: &str = "Not related to known skin lesion types";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PatientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_age: Option<u32>,
    #[serde(
        default,
        deserialize_with = "contact_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub contact_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scar_duration: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContactValue {
    Text(String),
    Number(u64),
}

// Older clients send the contact number as a JSON integer.
fn contact_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<ContactValue>::deserialize(deserializer)?.map(|value| match value {
            ContactValue::Text(text) => text,
            ContactValue::Number(number) => number.to_string(),
        }),
    )
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PredictRequest {
    #[serde(default)]
    pub base64_image: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(flatten)]
    pub patient: PatientInfo,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassProbability {
    pub class: String,
    pub probability: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassificationResult {
    pub predicted_class: String,
    pub description: String,
    pub confidence: f32,
    pub probabilities: Vec<ClassProbability>,
}

impl ClassificationResult {
    pub fn is_unrelated(&self) -> bool {
        self.predicted_class == UNRELATED_CLASS
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PredictResponse {
    pub success: bool,
    pub result: ClassificationResult,
}

impl PredictResponse {
    pub fn new(result: ClassificationResult) -> Self {
        Self {
            success: true,
            result,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClassifyResponse {
    pub predictions: Vec<ClassProbability>,
    pub top_prediction: ClassProbability,
}

impl From<ClassificationResult> for ClassifyResponse {
    fn from(result: ClassificationResult) -> Self {
        let top_prediction = ClassProbability {
            class: result.predicted_class,
            probability: (result.confidence * 10_000.0).round() / 10_000.0,
        };
        Self {
            predictions: result.probabilities,
            top_prediction,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub model_loaded: bool,
}

impl HealthResponse {
    pub fn from_model_state(model_loaded: bool) -> Self {
        let status = if model_loaded {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Self {
            status,
            model_loaded,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageSource {
    Url,
    Base64,
    Upload,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(flatten)]
    pub patient: PatientInfo,
    pub result: ClassificationResult,
    pub image_source: ImageSource,
    pub image_sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HistoryResponse {
    pub success: bool,
    pub records: Vec<HistoryRecord>,
}
