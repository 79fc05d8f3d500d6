//! Error types for request-insights.

use std::time::Duration;
use thiserror::Error;

/// Boxed error accepted from user callbacks and inner services.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the instrumentation core.
///
/// Configuration errors are returned at setup time. Delivery errors
/// (`FlushTimeout`, `ChannelClosed`, `Transport`, `Http`) are logged by the
/// middleware and never reach the end user.
#[derive(Debug, Error)]
pub enum InsightsError {
    #[error("a request name resolver is already registered")]
    DuplicateRequestNameResolver,

    #[error("no instrumentation key was resolved")]
    MissingInstrumentationKey,

    #[error("flush did not complete within {0:?}")]
    FlushTimeout(Duration),

    #[error("telemetry channel is closed")]
    ChannelClosed,

    #[error("no tokio runtime available to run the telemetry sender")]
    NoRuntime,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to serialize telemetry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("enrichment stage {stage} failed: {source}")]
    Enrichment {
        stage: String,
        #[source]
        source: BoxError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrichment_error_keeps_source() {
        let err = InsightsError::Enrichment {
            stage: "property filler #2".to_string(),
            source: "boom".into(),
        };

        assert_eq!(
            err.to_string(),
            "enrichment stage property filler #2 failed: boom"
        );
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("boom".to_string())
        );
    }
}
