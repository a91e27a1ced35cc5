pub mod handler;
pub mod labels;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod runtime;
#[cfg(feature = "torch")]
pub mod torch;

use crate::config::ModelFormat;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not loaded")]
    NotLoaded,
    #[error("Model already loaded")]
    AlreadyLoaded,
    #[error("Model not found at path: {0}")]
    NotFound(String),
    #[error("Model format {0:?} is not compiled into this build")]
    UnsupportedFormat(ModelFormat),
    #[error("Input shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Model produced {outputs} scores but {labels} class labels are configured")]
    LabelMismatch { outputs: usize, labels: usize },
    #[error("Model produced no finite scores")]
    NoScores,
    #[error("Inference runtime error: {0}")]
    Runtime(String),
    #[error("Model handle is poisoned")]
    Poisoned,
}

pub(crate) fn runtime_error(err: impl std::fmt::Display) -> ModelError {
    ModelError::Runtime(err.to_string())
}
