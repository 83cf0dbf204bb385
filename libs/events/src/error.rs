use thiserror::Error;

/// A line from the engine's event stream that could not be turned into an
/// [`EngineEvent`](crate::EngineEvent).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("undecodable engine event at line {line}, column {column}: {reason}")]
pub struct EventError {
    pub line: usize,
    pub column: usize,
    pub reason: String,
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError {
            line: err.line(),
            column: err.column(),
            reason: err.to_string(),
        }
    }
}
