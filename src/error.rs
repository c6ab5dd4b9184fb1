//! Failure kinds shared by the pipelines.
//!
//! Transport problems surface as [`GeminiError`] and are retried by the
//! invoker. Once retries (or extraction attempts) are used up the failure is
//! escalated to a [`PipelineError`], which halts the run at the current unit.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gemini API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("response blocked: {0}")]
    Blocked(String),

    #[error("response contained no text")]
    Empty,

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl GeminiError {
    /// Client errors other than timeouts and rate limiting can never succeed
    /// on a resend, so they are not worth a backoff sleep.
    pub fn is_retryable(&self) -> bool {
        match self {
            GeminiError::Api { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            GeminiError::Transport(_)
            | GeminiError::Blocked(_)
            | GeminiError::Empty
            | GeminiError::Malformed(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    ContentGeneration {
        operation: String,
        attempts: u32,
        #[source]
        source: GeminiError,
    },

    #[error("could not extract a document from the model output for {operation} after {attempts} attempt(s)")]
    ContentExtraction { operation: String, attempts: u32 },

    #[error("model output for {operation} was still truncated after {attempts} attempt(s) ({chars} chars received)")]
    UnfinishedDocument {
        operation: String,
        attempts: u32,
        chars: usize,
    },

    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("required file not found: {}", path.display())]
    MissingFile { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("no document structure found in response")]
    NoStructure,

    #[error("cleaned document is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable_except_timeouts_and_rate_limits() {
        let api = |status| GeminiError::Api {
            status,
            message: "x".to_owned(),
        };
        assert!(!api(400).is_retryable());
        assert!(!api(403).is_retryable());
        assert!(api(408).is_retryable());
        assert!(api(429).is_retryable());
        assert!(api(500).is_retryable());
        assert!(api(503).is_retryable());
        assert!(GeminiError::Empty.is_retryable());
    }

    #[test]
    fn generation_error_names_operation() {
        let err = PipelineError::ContentGeneration {
            operation: "chapter 3".to_owned(),
            attempts: 2,
            source: GeminiError::Empty,
        };
        let msg = err.to_string();
        assert!(msg.contains("chapter 3"));
        assert!(msg.contains("2 attempt"));
    }
}
