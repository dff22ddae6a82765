//! Error types for waggle-node.

use thiserror::Error;

/// Node agent error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required environment variable is not set.
    #[error("Required environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// Broker management API error.
    #[error("Broker error: {0}")]
    Broker(#[from] rabbitmq_api::Error),

    /// Node identity library error.
    #[error("Node identity error: {0}")]
    Node(#[from] waggle_node_lib::Error),

    /// Image could not be inspected.
    #[error("Failed to inspect image {image}: {message}")]
    ImageInspect { image: String, message: String },

    /// Image lacks a label needed to identify the plugin.
    #[error("Image is missing label {0}")]
    MissingLabel(&'static str),

    /// Image label has a value that cannot be used.
    #[error("Invalid value {value:?} for label {label}")]
    InvalidLabel { label: &'static str, value: String },

    /// Execution layer failed to converge.
    #[error("Execution error: {0}")]
    Execution(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True if the broker rejected a declaration as incompatible with
    /// existing state. These are not retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Broker(rabbitmq_api::Error::Conflict { .. }))
    }
}

/// Result type alias for waggle-node.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of one item in a multi-item pass.
#[derive(Debug)]
pub struct ItemOutcome {
    pub name: String,
    pub result: Result<()>,
}

/// Per-item results of a batch where one failure does not stop the rest.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn record(&mut self, name: impl Into<String>, result: Result<()>) {
        self.items.push(ItemOutcome {
            name: name.into(),
            result,
        });
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|i| i.result.is_ok())
            .map(|i| i.name.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.items
            .iter()
            .filter_map(|i| i.result.as_ref().err().map(|e| (i.name.as_str(), e)))
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    pub fn is_success(&self) -> bool {
        self.failure_count() == 0
    }
}
