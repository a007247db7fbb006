use std::path::PathBuf;

use thiserror::Error;

/// Failures callers are expected to tell apart.
/// Everything else travels as a plain `anyhow::Error` with context attached;
/// these are raised through `anyhow` too, and recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("unknown character: {name}{}", suggestion.as_ref().map(|s| format!(". Did you mean {}?", s)).unwrap_or_default())]
    UnknownCharacter {
        name: String,
        suggestion: Option<String>,
    },

    #[error("template not found: {0}")]
    TemplateNotFound(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("account {0} is not approved")]
    AccountNotApproved(String),

    #[error("the generation service returned no prompt_id")]
    NoJobId,

    #[error("job {prompt_id} did not complete within {seconds}s")]
    TimedOut { prompt_id: String, seconds: u64 },

    #[error("no history recorded for job {0}")]
    NoHistory(String),

    #[error("job {prompt_id} failed: {message}")]
    ExecutionFailed { prompt_id: String, message: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
