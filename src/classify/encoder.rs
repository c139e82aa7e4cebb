use std::path::Path;

use anyhow::Result;

use crate::frame::Frame;

/// Image embedding model used by the prompt classifier.
pub trait ImageEncoder: Send + Sync {
    /// Length of the vectors returned by [`ImageEncoder::encode`].
    fn dimension(&self) -> usize;

    fn encode(&self, image: &Frame) -> Result<Vec<f32>>;
}

#[cfg(feature = "backend-tract")]
pub(crate) fn load_image_encoder(path: &Path) -> Result<Box<dyn ImageEncoder>> {
    Ok(Box::new(TractImageEncoder::new(path)?))
}

#[cfg(not(feature = "backend-tract"))]
pub(crate) fn load_image_encoder(path: &Path) -> Result<Box<dyn ImageEncoder>> {
    anyhow::bail!(
        "image encoder {} requires the backend-tract feature",
        path.display()
    )
}

#[cfg(feature = "backend-tract")]
pub use tract_encoder::TractImageEncoder;

#[cfg(feature = "backend-tract")]
mod tract_encoder {
    use std::path::Path;

    use anyhow::{anyhow, Context, Result};
    use image::imageops::{self, FilterType};
    use tract_onnx::prelude::*;

    use super::ImageEncoder;
    use crate::frame::Frame;

    const INPUT_SIDE: u32 = 224;
    const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
    const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

    /// ONNX export of a CLIP-style visual tower (`[1,3,224,224]` → `[1,D]`).
    pub struct TractImageEncoder {
        model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
        dimension: usize,
    }

    impl TractImageEncoder {
        pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
            let model_path = model_path.as_ref();
            let side = INPUT_SIDE as usize;
            let model = tract_onnx::onnx()
                .model_for_path(model_path)
                .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
                )
                .context("failed to set input fact")?
                .into_optimized()
                .context("failed to optimize ONNX model")?
                .into_runnable()
                .context("failed to build runnable ONNX model")?;

            let mut encoder = Self {
                model,
                dimension: 0,
            };
            encoder.dimension = encoder
                .run(&Frame::filled(INPUT_SIDE, INPUT_SIDE, [128, 128, 128]))?
                .len();
            Ok(encoder)
        }

        /// Resize the short side to 224, center-crop, CLIP-normalize.
        fn build_input(&self, image: &Frame) -> Result<Tensor> {
            let (w, h) = (image.width(), image.height());
            if w == 0 || h == 0 {
                return Err(anyhow!("empty crop"));
            }
            let scale = INPUT_SIDE as f32 / w.min(h) as f32;
            let nw = ((w as f32 * scale).round() as u32).max(INPUT_SIDE);
            let nh = ((h as f32 * scale).round() as u32).max(INPUT_SIDE);
            let resized = imageops::resize(image.image(), nw, nh, FilterType::CatmullRom);
            let x0 = (nw - INPUT_SIDE) / 2;
            let y0 = (nh - INPUT_SIDE) / 2;
            let crop = imageops::crop_imm(&resized, x0, y0, INPUT_SIDE, INPUT_SIDE).to_image();

            let side = INPUT_SIDE as usize;
            let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
                let v = crop.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0;
                (v - MEAN[c]) / STD[c]
            });
            Ok(input.into_tensor())
        }

        fn run(&self, image: &Frame) -> Result<Vec<f32>> {
            let input = self.build_input(image)?;
            let outputs = self
                .model
                .run(tvec!(input.into()))
                .context("ONNX inference failed")?;
            let output = outputs
                .first()
                .ok_or_else(|| anyhow!("model produced no outputs"))?;
            let view = output
                .to_array_view::<f32>()
                .context("model output tensor was not f32")?;
            Ok(view.iter().copied().collect())
        }
    }

    impl ImageEncoder for TractImageEncoder {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn encode(&self, image: &Frame) -> Result<Vec<f32>> {
            self.run(image)
        }
    }
}
