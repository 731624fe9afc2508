use crate::types::{BlockKey, StatementId};
use thiserror::Error;

/// Errors surfaced at the engine's contract boundaries.
///
/// Contract violations abort the current operation and propagate to the
/// caller of `push_block`/`handle`. Everything recoverable (missing memory,
/// compilation miss) is an `Option`, never an error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("block key is missing (nil)")]
    MissingBlockKey,

    #[error("stack depth limit {limit} reached pushing block {key}")]
    StackOverflow { key: BlockKey, limit: usize },

    #[error("action queue exceeded {limit} iterations; aborting drain (cyclic action graph?)")]
    QueueOverflow { limit: usize },

    #[error("runtime is disposed")]
    Disposed,

    #[error("unknown statement id {0}")]
    UnknownStatement(StatementId),

    #[error("invalid behavior configuration: {0}")]
    InvalidConfig(String),
}
