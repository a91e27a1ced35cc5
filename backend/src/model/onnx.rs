use ndarray::ArrayView4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

use super::runtime::InferenceRuntime;
use super::{runtime_error, ModelError};

/// ONNX Runtime session over the first declared input and output.
pub struct OnnxRuntime {
    session: Session,
    input_name: String,
    name: String,
}

impl OnnxRuntime {
    pub fn load(path: &Path, threads: usize) -> Result<Self, ModelError> {
        let session = Session::builder()
            .map_err(runtime_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(runtime_error)?
            .with_intra_threads(threads)
            .map_err(runtime_error)?
            .commit_from_file(path)
            .map_err(runtime_error)?;

        for (i, input) in session.inputs.iter().enumerate() {
            log::info!("  Input {}: {} ({:?})", i, input.name, input.input_type);
        }
        for (i, output) in session.outputs.iter().enumerate() {
            log::info!("  Output {}: {} ({:?})", i, output.name, output.output_type);
        }

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ModelError::Runtime("model declares no inputs".to_string()))?;

        Ok(Self {
            session,
            input_name,
            name: path.display().to_string(),
        })
    }
}

impl InferenceRuntime for OnnxRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        let tensor = Tensor::from_array(input.to_owned()).map_err(runtime_error)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(runtime_error)?;

        let (_, scores) = outputs[0].try_extract_tensor::<f32>().map_err(runtime_error)?;
        Ok(scores.to_vec())
    }
}
