use std::fmt;

use thiserror::Error;

/// Errors raised while parsing a resource path or walking a field path.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("malformed resource path {path:?}: {reason}")]
    MalformedPath { path: String, reason: &'static str },

    #[error("k8s resource kind {0:?} is not supported")]
    UnsupportedKind(String),

    #[error("no field path specified")]
    EmptyPath,

    #[error("failed to parse slice index {index:?} of segment {segment:?}")]
    InvalidIndex { segment: String, index: String },

    #[error("could not find field with tag {tag:?} in {object}")]
    FieldNotFound { tag: String, object: String },

    #[error("expected {tag:?} to be a slice, got {found} instead")]
    NotASlice { tag: String, found: &'static str },

    #[error("index {index} of {tag:?} is out of range (len {len})")]
    IndexOutOfRange { tag: String, index: usize, len: usize },

    #[error("directly setting a slice element ({tag:?}) is not supported")]
    UnsupportedSliceTerminal { tag: String },

    #[error("expected {tag:?} to be a string field, got {found} instead")]
    NotAString { tag: String, found: &'static str },

    #[error("object codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Ordered accumulator for failures that must not stop a run.
///
/// Every entry is rendered as one `- <message>` line so the combined error
/// reads as a list.
#[derive(Debug, Default, Clone)]
pub struct ErrorList {
    errors: Vec<String>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(format!("- {}", message.into()));
    }

    pub fn push_err(&mut self, context: impl fmt::Display, err: impl fmt::Display) {
        self.push(format!("{context}, err: {err}"));
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), CombinedError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CombinedError(self.errors.join("\n")))
        }
    }
}

/// The single error returned at the end of a run with partial failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CombinedError(String);

impl CombinedError {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.0.lines()
    }
}
