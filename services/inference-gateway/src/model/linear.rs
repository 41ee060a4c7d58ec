use serde::Deserialize;

use super::{Predictor, PredictorError};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Link { Linear, Logistic }

/// `intercept + w·x`, optionally squashed through the logistic function.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    #[serde(rename = "kind")]
    pub link: Link,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl Predictor for LinearModel {
    fn kind(&self) -> &'static str {
        match self.link { Link::Linear => "linear", Link::Logistic => "logistic" }
    }

    fn input_width(&self) -> Option<usize> { Some(self.coefficients.len()) }

    fn predict(&self, features: &[f64]) -> Result<f64, PredictorError> {
        if features.len() != self.coefficients.len() {
            return Err(PredictorError(format!("expected {} inputs, got {}", self.coefficients.len(), features.len())));
        }
        let z = self.intercept + self.coefficients.iter().zip(features).map(|(w, x)| w * x).sum::<f64>();
        let y = match self.link { Link::Linear => z, Link::Logistic => 1.0 / (1.0 + (-z).exp()) };
        if y.is_finite() { Ok(y) } else { Err(PredictorError(format!("non-finite output {y}"))) }
    }
}
