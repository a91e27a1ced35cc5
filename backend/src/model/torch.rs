use ndarray::ArrayView4;
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};

use super::runtime::InferenceRuntime;
use super::{runtime_error, ModelError};

/// TorchScript module. Outputs are returned as the graph produces them.
pub struct TorchRuntime {
    module: CModule,
    device: Device,
    name: String,
}

impl TorchRuntime {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path, device).map_err(runtime_error)?;
        log::info!("Loaded TorchScript module {} on {:?}", path.display(), device);
        Ok(Self {
            module,
            device,
            name: path.display().to_string(),
        })
    }
}

impl InferenceRuntime for TorchRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let contiguous = input.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| ModelError::Runtime("input tensor is not contiguous".to_string()))?;

        let tensor = Tensor::from_slice(data)
            .view(shape.as_slice())
            .to_device(self.device);
        let output = tch::no_grad(|| self.module.forward_ts(&[tensor])).map_err(runtime_error)?;

        let flat = output
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .view([-1]);
        let len = flat.size()[0] as usize;
        let mut scores = vec![0.0f32; len];
        flat.copy_data(&mut scores, len);
        Ok(scores)
    }
}
