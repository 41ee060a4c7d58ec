//! Turns verified artifact files into the process-wide, immutable
//! [`ModelArtifact`]. Loading happens once; afterwards the artifact is only
//! ever read, so request handlers share it through an `Arc` without locks.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::artifact::ArtifactPaths;

mod linear;
#[cfg(feature = "onnx")]
mod onnx;

pub use linear::{LinearModel, Link};
#[cfg(feature = "onnx")]
pub use onnx::OnnxPredictor;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PredictorError(pub String);

pub trait Predictor: Send + Sync + fmt::Debug {
    fn kind(&self) -> &'static str;
    /// Number of inputs the predictor consumes, when it can tell.
    fn input_width(&self) -> Option<usize>;
    fn predict(&self, features: &[f64]) -> Result<f64, PredictorError>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model loader already ran in this process")]
    AlreadyLoaded,
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("predictor blob is corrupt: {0}")]
    CorruptPredictor(String),
    #[error("predictor blob format is not supported by this build")]
    UnsupportedFormat,
    #[error("feature schema is corrupt: {0}")]
    CorruptSchema(String),
    #[error("feature schema is empty")]
    EmptySchema,
    #[error("feature schema lists `{0}` more than once")]
    DuplicateFeature(String),
    #[error("predictor expects {expected} inputs but the feature schema lists {actual}")]
    SchemaMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub kind: String,
}

/// Loaded predictor plus the feature order it was trained with.
#[derive(Debug)]
pub struct ModelArtifact {
    predictor: Box<dyn Predictor>,
    feature_order: Vec<String>,
    info: ModelInfo,
}

impl ModelArtifact {
    /// Checks the schema invariants: non-empty, no duplicates, width agrees with the predictor.
    pub fn new(predictor: Box<dyn Predictor>, feature_order: Vec<String>, name: &str, version: &str) -> Result<Self, LoadError> {
        validate_schema(&feature_order)?;
        if let Some(expected) = predictor.input_width() {
            if expected != feature_order.len() {
                return Err(LoadError::SchemaMismatch { expected, actual: feature_order.len() });
            }
        }
        let info = ModelInfo { name: name.to_string(), version: version.to_string(), kind: predictor.kind().to_string() };
        Ok(Self { predictor, feature_order, info })
    }

    pub fn feature_order(&self) -> &[String] { &self.feature_order }
    pub fn predictor(&self) -> &dyn Predictor { self.predictor.as_ref() }
    pub fn info(&self) -> &ModelInfo { &self.info }
}

fn validate_schema(features: &[String]) -> Result<(), LoadError> {
    if features.is_empty() { return Err(LoadError::EmptySchema); }
    let mut seen = HashSet::with_capacity(features.len());
    for f in features {
        if f.trim().is_empty() { return Err(LoadError::CorruptSchema("blank feature name".into())); }
        if !seen.insert(f.as_str()) { return Err(LoadError::DuplicateFeature(f.clone())); }
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaDoc {
    List(Vec<String>),
    Object { feature_order: Vec<String> },
}

pub fn parse_schema(bytes: &[u8]) -> Result<Vec<String>, LoadError> {
    let doc: SchemaDoc = serde_json::from_slice(bytes).map_err(|e| LoadError::CorruptSchema(e.to_string()))?;
    Ok(match doc { SchemaDoc::List(v) => v, SchemaDoc::Object { feature_order } => feature_order })
}

/// Decode a predictor blob. JSON documents describe linear models; anything
/// else is treated as an ONNX graph when that support is compiled in.
pub fn parse_predictor(bytes: &[u8], width: usize) -> Result<Box<dyn Predictor>, LoadError> {
    let first = bytes.iter().copied().find(|b| !b.is_ascii_whitespace());
    if first == Some(b'{') {
        let m: LinearModel = serde_json::from_slice(bytes).map_err(|e| LoadError::CorruptPredictor(e.to_string()))?;
        return Ok(Box::new(m));
    }
    if first.is_none() { return Err(LoadError::CorruptPredictor("blob is empty".into())); }
    #[cfg(feature = "onnx")]
    {
        let m = OnnxPredictor::from_bytes(bytes, width).map_err(|e| LoadError::CorruptPredictor(e.to_string()))?;
        Ok(Box::new(m))
    }
    #[cfg(not(feature = "onnx"))]
    {
        let _ = width;
        Err(LoadError::UnsupportedFormat)
    }
}

/// Single-use loader. The second call fails instead of building a second model.
#[derive(Debug, Default)]
pub struct ModelLoader { used: AtomicBool }

impl ModelLoader {
    pub fn new() -> Self { Self::default() }

    pub fn load(&self, paths: &ArtifactPaths, name: &str, version: &str) -> Result<ModelArtifact, LoadError> {
        if self.used.swap(true, Ordering::SeqCst) { return Err(LoadError::AlreadyLoaded); }
        let feature_order = parse_schema(&read(&paths.schema)?)?;
        validate_schema(&feature_order)?;
        let predictor = parse_predictor(&read(&paths.model)?, feature_order.len())?;
        let artifact = ModelArtifact::new(predictor, feature_order, name, version)?;
        info!(model = %artifact.info.name, version = %artifact.info.version, kind = %artifact.info.kind, features = artifact.feature_order.len(), "model loaded");
        Ok(artifact)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, LoadError> {
    std::fs::read(path).map_err(|source| LoadError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifacts(model: &str, schema: &str) -> (tempfile::TempDir, ArtifactPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths { model: dir.path().join("model.bin"), schema: dir.path().join("features.json") };
        std::fs::write(&paths.model, model).unwrap();
        std::fs::write(&paths.schema, schema).unwrap();
        (dir, paths)
    }

    const MODEL: &str = r#"{"kind":"linear","intercept":0.5,"coefficients":[0.01,0.0001,0.2]}"#;

    #[test]
    fn loads_linear_model_and_schema() {
        let (_d, paths) = write_artifacts(MODEL, r#"["age","income","tenure"]"#);
        let m = ModelLoader::new().load(&paths, "churn", "v1").unwrap();
        assert_eq!(m.feature_order(), ["age", "income", "tenure"]);
        assert_eq!(m.info().kind, "linear");
        assert!(!m.feature_order().is_empty());
    }

    #[test]
    fn schema_object_form_is_accepted() {
        let (_d, paths) = write_artifacts(MODEL, r#"{"feature_order":["age","income","tenure"]}"#);
        assert!(ModelLoader::new().load(&paths, "churn", "v1").is_ok());
    }

    #[test]
    fn loader_runs_once() {
        let (_d, paths) = write_artifacts(MODEL, r#"["age","income","tenure"]"#);
        let loader = ModelLoader::new();
        loader.load(&paths, "churn", "v1").unwrap();
        assert!(matches!(loader.load(&paths, "churn", "v1"), Err(LoadError::AlreadyLoaded)));
    }

    #[test]
    fn schema_invariants_are_enforced() {
        let (_d, paths) = write_artifacts(MODEL, "[]");
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::EmptySchema)));

        let (_d, paths) = write_artifacts(MODEL, r#"["age","income","age"]"#);
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::DuplicateFeature(f)) if f == "age"));

        let (_d, paths) = write_artifacts(MODEL, r#"["age","income"]"#);
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::SchemaMismatch { expected: 3, actual: 2 })));
    }

    #[test]
    fn corrupt_inputs_are_load_errors() {
        let (_d, paths) = write_artifacts("{not json", r#"["a"]"#);
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::CorruptPredictor(_))));

        let (_d, paths) = write_artifacts(MODEL, "features: a, b");
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::CorruptSchema(_))));

        let (_d, paths) = write_artifacts("", r#"["a"]"#);
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::CorruptPredictor(_))));
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn binary_blob_without_onnx_support() {
        let (_d, paths) = write_artifacts("\u{8}ONNX", r#"["a"]"#);
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::UnsupportedFormat)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths { model: dir.path().join("model.bin"), schema: dir.path().join("features.json") };
        assert!(matches!(ModelLoader::new().load(&paths, "m", "v"), Err(LoadError::Io { .. })));
    }
}
