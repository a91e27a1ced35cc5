use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array4, Axis};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("Tensor layout error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Axis order of the emitted tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, what Keras/TFLite exports expect.
    Nhwc,
    /// `[1, 3, H, W]`, what most PyTorch exports expect.
    Nchw,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Ok(TensorLayout::Nhwc),
            "nchw" => Ok(TensorLayout::Nchw),
            other => Err(format!("unknown tensor layout '{}'", other)),
        }
    }
}

/// Stretch-resizes an RGB image to the model input size and scales pixel
/// intensities to `[0, 1]`. No cropping, padding or mean/std normalization.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(width: u32, height: u32, layout: TensorLayout) -> Self {
        Self {
            width,
            height,
            layout,
        }
    }

    pub fn input_shape(&self) -> [usize; 4] {
        let (h, w) = (self.height as usize, self.width as usize);
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, 3],
            TensorLayout::Nchw => [1, 3, h, w],
        }
    }

    pub fn tensor(&self, image: &RgbImage) -> Result<Array4<f32>, PreprocessError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(PreprocessError::EmptyImage { width, height });
        }

        // Catmull-Rom is the bicubic filter PIL applies by default.
        let resized = imageops::resize(image, self.width, self.height, FilterType::CatmullRom);

        let data: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|v| v as f32 / 255.0)
            .collect();

        // Raw RGB buffer is row-major [H, W, C].
        let hwc = Array4::from_shape_vec(
            (1, self.height as usize, self.width as usize, 3),
            data,
        )?;

        match self.layout {
            TensorLayout::Nhwc => Ok(hwc),
            TensorLayout::Nchw => {
                let chw = hwc
                    .index_axis_move(Axis(0), 0)
                    .permuted_axes([2, 0, 1])
                    .insert_axis(Axis(0));
                Ok(chw.as_standard_layout().to_owned())
            }
        }
    }
}
