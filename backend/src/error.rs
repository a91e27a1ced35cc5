use actix_web::{error::BlockingError, http::StatusCode, HttpResponse, ResponseError};
use shared::ErrorResponse;

use crate::history::HistoryError;
use crate::imaging::loader::LoadError;
use crate::imaging::preprocess::PreprocessError;
use crate::model::ModelError;

/// Every failure a request can end in. Rendered as
/// `{"success": false, "error": ...}` with a matching HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    MissingInput(String),
    #[error("Invalid request body: {0}")]
    InvalidJson(String),
    #[error("Invalid multipart upload: {0}")]
    InvalidMultipart(String),
    #[error("Only image files are accepted")]
    UnsupportedMedia,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("Failed to preprocess image: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BlockingError> for ApiError {
    fn from(err: BlockingError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingInput(_)
            | ApiError::InvalidJson(_)
            | ApiError::InvalidMultipart(_)
            | ApiError::UnsupportedMedia => StatusCode::BAD_REQUEST,
            ApiError::Load(err) => match err {
                LoadError::InvalidUrl(_) | LoadError::Base64(_) | LoadError::Empty => {
                    StatusCode::BAD_REQUEST
                }
                LoadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                LoadError::Image(_) => StatusCode::UNPROCESSABLE_ENTITY,
                LoadError::Status(_) | LoadError::Fetch(_) => StatusCode::BAD_GATEWAY,
            },
            ApiError::Preprocess(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Model(ModelError::NotLoaded) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Model(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::History(HistoryError::Disabled) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::History(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed ({}): {}", status, self);
        } else {
            log::warn!("Request rejected ({}): {}", status, self);
        }
        HttpResponse::build(status).json(ErrorResponse::new(self.to_string()))
    }
}
