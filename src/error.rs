use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a Node invocation and, through it, the whole pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("stage '{stage}' received no input items")]
    EmptyInput { stage: String },
    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest {} is malformed: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestEntryError,
    },
    #[error("seed source failed: {0}")]
    Seed(String),
    #[error("stage '{stage}' failed (params: {params}): {source}")]
    StageFailed {
        stage: String,
        params: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A single item's transform failure. Logged and isolated; never aborts a batch.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("stage does not accept {kind} items")]
    Unsupported { kind: &'static str },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("browser fetch failed: {0}")]
    Browser(String),
    #[error("model call failed: {0}")]
    Model(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decoding failure for one manifest entry.
#[derive(Debug, Error)]
pub enum ManifestEntryError {
    #[error("manifest root is not a JSON array")]
    NotAnArray,
    #[error("entry {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("entry {index} has no string 'data_type' field")]
    MissingDataType { index: usize },
    #[error("entry {index} has unknown data_type '{data_type}'")]
    UnknownDataType { index: usize, data_type: String },
    #[error("entry {index} ({data_type}) has an unexpected shape: {source}")]
    Shape {
        index: usize,
        data_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
