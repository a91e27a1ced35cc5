use ndarray::ArrayView4;

use super::ModelError;
use crate::config::{ModelConfig, ModelFormat};

/// A loaded model artifact able to run a single forward pass.
///
/// Implementations are driven through `&mut self`; the handler serializes
/// access, so they need not be thread-safe beyond `Send`.
pub trait InferenceRuntime: Send {
    fn name(&self) -> &str;

    /// Returns the flattened per-class scores for a batch of one.
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError>;
}

pub fn load_runtime(config: &ModelConfig) -> Result<Box<dyn InferenceRuntime>, ModelError> {
    if !config.path.exists() {
        return Err(ModelError::NotFound(config.path.display().to_string()));
    }

    log::info!(
        "Loading {:?} model from {}",
        config.format,
        config.path.display()
    );
    match config.format {
        ModelFormat::Onnx => load_onnx(config),
        ModelFormat::TorchScript => load_torch(config),
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(config: &ModelConfig) -> Result<Box<dyn InferenceRuntime>, ModelError> {
    let runtime = super::onnx::OnnxRuntime::load(&config.path, config.threads)?;
    Ok(Box::new(runtime))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(_config: &ModelConfig) -> Result<Box<dyn InferenceRuntime>, ModelError> {
    Err(ModelError::UnsupportedFormat(ModelFormat::Onnx))
}

#[cfg(feature = "torch")]
fn load_torch(config: &ModelConfig) -> Result<Box<dyn InferenceRuntime>, ModelError> {
    let runtime = super::torch::TorchRuntime::load(&config.path)?;
    Ok(Box::new(runtime))
}

#[cfg(not(feature = "torch"))]
fn load_torch(_config: &ModelConfig) -> Result<Box<dyn InferenceRuntime>, ModelError> {
    Err(ModelError::UnsupportedFormat(ModelFormat::TorchScript))
}
