//! Crate-wide error taxonomy (§7). The event path never returns one of
//! these: a malformed state there is handled inline as a no-op.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error at line {line}: {message}")]
    ConfigParse { line: usize, message: String },

    #[error("failed to register input hook: {0}")]
    HookRegistration(String),

    #[error("injection failed: {0}")]
    Injection(String),
}
