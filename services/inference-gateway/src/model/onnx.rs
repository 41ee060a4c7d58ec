//! ONNX predictor blobs executed with tract. Expects a `[1, n]` f32 input and
//! reads the first element of the first output.

use std::fmt;

use tract_onnx::prelude::*;

use super::{Predictor, PredictorError};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub struct OnnxPredictor {
    plan: Plan,
    width: usize,
}

impl fmt::Debug for OnnxPredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxPredictor").field("width", &self.width).finish()
    }
}

impl OnnxPredictor {
    pub fn from_bytes(bytes: &[u8], width: usize) -> TractResult<Self> {
        let plan = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))?
            .with_input_fact(0, f32::fact([1, width]).into())?
            .into_optimized()?
            .into_runnable()?;
        Ok(Self { plan, width })
    }
}

impl Predictor for OnnxPredictor {
    fn kind(&self) -> &'static str { "onnx" }

    fn input_width(&self) -> Option<usize> { Some(self.width) }

    fn predict(&self, features: &[f64]) -> Result<f64, PredictorError> {
        let input: Vec<f32> = features.iter().map(|v| *v as f32).collect();
        let tensor = Tensor::from_shape(&[1, self.width], &input).map_err(|e| PredictorError(e.to_string()))?;
        let outputs = self.plan.run(tvec!(tensor.into())).map_err(|e| PredictorError(e.to_string()))?;
        first_scalar(&outputs)
    }
}

fn first_scalar(outputs: &[TValue]) -> Result<f64, PredictorError> {
    let first = outputs.first().ok_or_else(|| PredictorError("model produced no outputs".into()))?;
    let view = first.to_array_view::<f32>().map_err(|e| PredictorError(e.to_string()))?;
    view.iter().next().map(|v| *v as f64).ok_or_else(|| PredictorError("empty model output".into()))
}
