//! Generative text service contract

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Result type for generative calls
pub type GenerateResult<T> = Result<T, GenerateError>;

/// Generative call failures. All of them are soft: callers degrade instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Prompt in, text out, fallible.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> GenerateResult<String>;
}

/// Run a generative call under a deadline and an optional cancellation token.
pub async fn generate_bounded(
    generator: &dyn Generator,
    prompt: &str,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> GenerateResult<String> {
    let call = tokio::time::timeout(timeout, generator.generate(prompt));
    let outcome = match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return Err(GenerateError::Cancelled),
            r = call => r,
        },
        None => call.await,
    };
    match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!(generator = generator.name(), ?timeout, "generative call timed out");
            Err(GenerateError::Timeout(timeout))
        }
    }
}
