use thiserror::Error;

/// Errors surfaced by the fuzzer itself.
///
/// Engine failures are never reported through this type: they are captured
/// into an [`crate::executor::Outcome`] so that the fuzz loop keeps running.
#[derive(Debug, Error)]
pub enum FuzzerError {
    #[error("function catalog is empty, nothing to fuzz")]
    EmptyCatalog,
    #[error("signature templates are registered but no supported key types are available")]
    NoKeyTypes,
    #[error("invalid fuzzer options: {0}")]
    InvalidOptions(String),
    #[error("input generator registered for unknown function `{0}`")]
    UnknownInputGenerator(String),
    #[error("input generator for `{function}` returned malformed data: {reason}")]
    MalformedInput { function: String, reason: String },
    #[error("memory pool `{pool}`: {reason}")]
    Memory { pool: String, reason: String },
    #[error("defect found at iteration {iteration} (seed {seed}): {reason}")]
    Defect {
        iteration: usize,
        seed: u64,
        reason: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = FuzzerError> = std::result::Result<T, E>;

/// Failure raised by a [`crate::engine::QueryEngine`] while executing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The input or the query is invalid, e.g. an integer overflow.
    #[error("user error: {0}")]
    User(String),
    /// The engine itself misbehaved.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl EngineError {
    pub fn is_user_error(&self) -> bool {
        matches!(self, EngineError::User(_))
    }
}
