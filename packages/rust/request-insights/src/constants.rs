//! Constants for the request-insights package.
//!
//! This file centralizes all constants to ensure consistency across the codebase
//! and provide a single source of truth for configuration parameters.

/// Environment variable names for configuration.
pub mod env_vars {
    /// Instrumentation key used to authenticate with the telemetry backend.
    pub const INSTRUMENTATION_KEY: &str = "APPINSIGHTS_INSTRUMENTATION_KEY";

    /// Ingestion endpoint for the HTTP transport.
    pub const ENDPOINT: &str = "APPINSIGHTS_ENDPOINT";

    /// Maximum number of telemetry items queued per client.
    pub const QUEUE_SIZE: &str = "APPINSIGHTS_QUEUE_SIZE";

    /// Maximum number of telemetry items handed to the transport at once.
    pub const BATCH_SIZE: &str = "APPINSIGHTS_BATCH_SIZE";

    /// Upper bound, in milliseconds, for a single flush.
    pub const FLUSH_TIMEOUT_MS: &str = "APPINSIGHTS_FLUSH_TIMEOUT_MS";

    /// Build/version identifier reported with every request.
    pub const BUILD_VERSION: &str = "APPINSIGHTS_BUILD_VERSION";

    /// How enrichment failures are handled (propagate or isolate).
    pub const ENRICHMENT_FAILURE: &str = "APPINSIGHTS_ENRICHMENT_FAILURE";

    /// Log level for the internal logger (none, error, warn, info, debug).
    pub const LOG_LEVEL: &str = "APPINSIGHTS_LOG_LEVEL";

    /// Controls whether to enable the fmt layer for logging regardless of code settings.
    /// Set to "true" to force enable logging output.
    pub const ENABLE_FMT_LAYER: &str = "APPINSIGHTS_ENABLE_FMT_LAYER";

    /// Output format of the fmt layer ("JSON" for structured output).
    pub const LOG_FORMAT: &str = "APPINSIGHTS_LOG_FORMAT";

    /// Max request body bytes recorded in the `req_body` property.
    pub const RECORDED_BODY_LIMIT: &str = "APPINSIGHTS_RECORDED_BODY_LIMIT";
}

/// Keys of the application configuration store.
pub mod config_keys {
    /// Resolved instrumentation key.
    pub const INSTRUMENTATION_KEY: &str = "APPINSIGHTS_INSTRUMENTATION_KEY";

    /// Request name used when no resolver is registered.
    pub const DEFAULT_REQUEST_NAME: &str = "APPINSIGHTS_DEFAULT_REQUEST_NAME";
}

/// Default values for configuration parameters.
pub mod defaults {
    use std::time::Duration;

    /// Request name used when neither code nor configuration provide one.
    pub const REQUEST_NAME: &str = "HttpRequest";

    /// Default ingestion endpoint for the HTTP transport.
    pub const ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

    /// Default maximum queue size per client.
    pub const QUEUE_SIZE: usize = 2048;

    /// Default maximum batch size handed to the transport.
    pub const BATCH_SIZE: usize = 512;

    /// Default upper bound for a single flush.
    pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

    /// Max request body bytes recorded in the `req_body` property.
    pub const RECORDED_BODY_LIMIT: usize = 64 * 1024;

    /// Max transport calls in flight per client.
    pub const MAX_CONCURRENT_SENDS: usize = 4;

    /// Request timeout of the HTTP transport.
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound for the one-off `git describe` lookup.
    pub const VERSION_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default value for enabling fmt layer from environment.
    pub const ENABLE_FMT_LAYER: bool = false;

    /// Body of the generic response returned when a request faults.
    pub const FAULT_BODY: &str = "Internal Server Error";
}

/// Property keys recorded with every request.
pub mod properties {
    pub const REMOTE_ADDR: &str = "req_remote_addr";
    pub const PATH: &str = "req_path";
    pub const HOST: &str = "req_host";
    pub const METHOD: &str = "req_method";
    pub const QUERY: &str = "req_query";
    pub const BODY: &str = "req_body";
    pub const FORM_DATA: &str = "req_form_data";
    pub const STATUS_CODE: &str = "resp_status_code";
    pub const RESPONSE_CONTENT: &str = "resp_content";
    pub const EXCEPTION_TRACE: &str = "current_exc_trace";
    pub const COMMITTISH: &str = "committish";
    pub const WORKER_PID: &str = "worker_pid";
    pub const WORKER_TID: &str = "worker_tid";
}

/// Envelope names understood by the ingestion endpoint.
pub mod envelope {
    pub const REQUEST_NAME: &str = "Microsoft.ApplicationInsights.Request";
    pub const EXCEPTION_NAME: &str = "Microsoft.ApplicationInsights.Exception";
}
