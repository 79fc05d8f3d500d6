//! Setup facade: configuration, subscriber installation and the layer factory.
//!
//! - `init_insights`: main entry point, resolves configuration and builds [`Insights`]
//! - `InsightsConfig`: configuration builder with environment-based defaults
//! - `Insights`: holds the enrichment registrations and produces [`InsightsLayer`]s
//!
//! # Environment Configuration
//!
//! - `APPINSIGHTS_INSTRUMENTATION_KEY`: instrumentation key (below explicit, above app config)
//! - `APPINSIGHTS_ENDPOINT`: use the HTTP transport against this endpoint
//! - `APPINSIGHTS_QUEUE_SIZE` / `APPINSIGHTS_BATCH_SIZE` / `APPINSIGHTS_FLUSH_TIMEOUT_MS`: channel tuning
//! - `APPINSIGHTS_ENRICHMENT_FAILURE`: "propagate" (default) or "isolate"
//! - `APPINSIGHTS_BUILD_VERSION`: overrides the configured version source
//! - `APPINSIGHTS_ENABLE_FMT_LAYER`: force the fmt layer on ("true") or off ("false")
//! - `APPINSIGHTS_LOG_FORMAT`: "JSON" for structured fmt output
//! - `APPINSIGHTS_RECORDED_BODY_LIMIT`: max request body bytes kept in `req_body`
//! - `RUST_LOG`: subscriber filter, unless `env_var_name` names another variable
//!
//! # Basic Usage
//!
//! ```no_run
//! use request_insights::{init_insights, AppConfig, InsightsConfig, Properties};
//!
//! # fn main() -> Result<(), request_insights::InsightsError> {
//! let mut app_config = AppConfig::new();
//! let mut insights = init_insights(
//!     InsightsConfig::builder()
//!         .instrumentation_key("00000000-0000-0000-0000-000000000000".to_string())
//!         .enable_fmt_layer(true)
//!         .build(),
//!     &mut app_config,
//! )?;
//!
//! insights.register_property_filler(|request, _response| {
//!     let mut props = Properties::new();
//!     props.insert("user_agent".to_string(), request.header("user-agent").into());
//!     Ok(props)
//! });
//!
//! let layer = insights.layer();
//! # Ok(())
//! # }
//! ```

use crate::client::{ClientFactory, InsightsClientFactory};
use crate::config::{AppConfig, InstrumentationConfig};
use crate::constants::{defaults, env_vars};
use crate::context::ClientLifecycle;
use crate::enrichment::EnrichmentPipeline;
use crate::error::{BoxError, InsightsError};
use crate::event::{Measurements, Properties};
use crate::extractors::{RequestInfo, ResponseInfo};
use crate::layer::InsightsLayer;
use crate::logger::Logger;
use crate::mode::EnrichmentFailurePolicy;
use crate::transport::{HttpTransport, StdoutTransport, Transport};
use crate::version::VersionSource;
use bon::Builder;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static LOGGER: Logger = Logger::const_new("telemetry");

/// Configuration for [`init_insights`].
///
/// # Examples
///
/// ```
/// use request_insights::{EnrichmentFailurePolicy, InsightsConfig, VersionSource};
/// use std::time::Duration;
///
/// let config = InsightsConfig::builder()
///     .default_request_name("Api".to_string())
///     .enrichment_failure(EnrichmentFailurePolicy::Isolate)
///     .version_source(VersionSource::Static(env!("CARGO_PKG_VERSION").to_string()))
///     .flush_timeout(Duration::from_secs(2))
///     .build();
/// ```
#[derive(Builder, Debug)]
pub struct InsightsConfig {
    #[builder(field)]
    transport: Option<Arc<dyn Transport>>,

    /// Instrumentation key. Takes precedence over the environment and the
    /// application configuration.
    pub instrumentation_key: Option<String>,

    /// Request name used when no resolver is registered. Takes precedence
    /// over the application configuration.
    ///
    /// Default: `"HttpRequest"`
    pub default_request_name: Option<String>,

    /// What to do when a filler fails. `APPINSIGHTS_ENRICHMENT_FAILURE` wins.
    ///
    /// Default: [`EnrichmentFailurePolicy::Propagate`]
    pub enrichment_failure: Option<EnrichmentFailurePolicy>,

    /// Where the `committish` property comes from.
    ///
    /// Default: [`VersionSource::Disabled`]
    #[builder(default)]
    pub version_source: VersionSource,

    /// Per-client queue capacity. Default: `APPINSIGHTS_QUEUE_SIZE` or 2048.
    pub queue_size: Option<usize>,

    /// Max items per transport call. Default: `APPINSIGHTS_BATCH_SIZE` or 512.
    pub batch_size: Option<usize>,

    /// Upper bound for a single flush. Default: `APPINSIGHTS_FLUSH_TIMEOUT_MS` or 5s.
    pub flush_timeout: Option<Duration>,

    /// Max request body bytes kept in the `req_body` property. Longer bodies
    /// are truncated in telemetry only.
    ///
    /// Default: `APPINSIGHTS_RECORDED_BODY_LIMIT` or 64 KiB.
    pub recorded_body_limit: Option<usize>,

    /// Ingestion endpoint. When neither this nor `APPINSIGHTS_ENDPOINT` is
    /// set, telemetry is written to stdout.
    pub endpoint: Option<String>,

    /// Install a `tracing_subscriber` fmt layer for the crate's diagnostics.
    ///
    /// Default: `false`
    #[builder(default = false)]
    pub enable_fmt_layer: bool,

    /// Environment variable holding the subscriber filter.
    ///
    /// Default: `None` (uses `RUST_LOG`)
    pub env_var_name: Option<String>,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl<S: insights_config_builder::State> InsightsConfigBuilder<S> {
    /// Deliver telemetry through a custom transport instead of stdout/HTTP.
    pub fn with_transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }
}

/// Initialize request telemetry.
///
/// Resolves the instrumentation configuration (writing the key back into
/// `app_config`), installs the fmt subscriber when asked to, and builds the
/// default client factory. A missing key is not an error here: requests are
/// served normally and telemetry is skipped.
pub fn init_insights(
    config: InsightsConfig,
    app_config: &mut AppConfig,
) -> Result<Insights, InsightsError> {
    init_subscriber(&config);

    let instrumentation = InstrumentationConfig::resolve_from_env(
        config.instrumentation_key.as_deref(),
        config.default_request_name.as_deref(),
        app_config,
    );

    let transport = select_transport(config.transport, config.endpoint)?;
    LOGGER.debug(format!("init_insights: using transport {:?}", transport));

    let factory = InsightsClientFactory::builder()
        .transport(transport)
        .maybe_max_queue_size(config.queue_size)
        .maybe_max_batch_size(config.batch_size)
        .maybe_flush_timeout(config.flush_timeout)
        .build();

    let mut insights = Insights::with_client_factory(instrumentation, factory);
    insights.set_failure_policy(EnrichmentFailurePolicy::resolve(config.enrichment_failure));
    insights.set_version_source(config.version_source);
    insights.set_recorded_body_limit(
        config
            .recorded_body_limit
            .or_else(|| {
                env::var(env_vars::RECORDED_BODY_LIMIT)
                    .ok()
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(defaults::RECORDED_BODY_LIMIT),
    );
    Ok(insights)
}

fn select_transport(
    explicit: Option<Arc<dyn Transport>>,
    endpoint: Option<String>,
) -> Result<Arc<dyn Transport>, InsightsError> {
    if let Some(transport) = explicit {
        return Ok(transport);
    }

    let endpoint = endpoint
        .filter(|e| !e.is_empty())
        .or_else(|| env::var(env_vars::ENDPOINT).ok().filter(|e| !e.is_empty()));

    Ok(match endpoint {
        Some(endpoint) => Arc::new(HttpTransport::new(endpoint)?),
        None => Arc::new(StdoutTransport::new()),
    })
}

fn fmt_layer_enabled(config: &InsightsConfig) -> bool {
    match env::var(env_vars::ENABLE_FMT_LAYER)
        .map(|s| s.to_lowercase())
        .as_deref()
    {
        Ok("true") => true,
        Ok("false") => false,
        _ => config.enable_fmt_layer || defaults::ENABLE_FMT_LAYER,
    }
}

fn init_subscriber(config: &InsightsConfig) {
    if !fmt_layer_enabled(config) {
        return;
    }

    let env_var_name = config.env_var_name.as_deref().unwrap_or("RUST_LOG");
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var(env_var_name)
        .from_env_lossy();

    let is_json = env::var(env_vars::LOG_FORMAT)
        .unwrap_or_default()
        .to_uppercase()
        == "JSON";

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let result = if is_json {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_target(false).json())
            .try_init()
    } else {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false),
            )
            .try_init()
    };

    // A host that already installed a subscriber keeps it.
    if let Err(e) = result {
        LOGGER.debug(format!("init_insights: subscriber already installed: {}", e));
    }
}

/// Enrichment registrations plus everything needed to build layers.
pub struct Insights {
    config: Arc<InstrumentationConfig>,
    factory: Arc<dyn ClientFactory>,
    pipeline: EnrichmentPipeline,
    version_source: VersionSource,
    recorded_body_limit: usize,
}

impl fmt::Debug for Insights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Insights")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("version_source", &self.version_source)
            .field("recorded_body_limit", &self.recorded_body_limit)
            .finish_non_exhaustive()
    }
}

impl Insights {
    /// Build with a custom client factory, bypassing [`init_insights`].
    pub fn with_client_factory(
        config: InstrumentationConfig,
        factory: impl ClientFactory + 'static,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory: Arc::new(factory),
            pipeline: EnrichmentPipeline::new(),
            version_source: VersionSource::default(),
            recorded_body_limit: defaults::RECORDED_BODY_LIMIT,
        }
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn set_failure_policy(&mut self, policy: EnrichmentFailurePolicy) {
        self.pipeline.set_failure_policy(policy);
    }

    pub fn set_version_source(&mut self, source: VersionSource) {
        self.version_source = source;
    }

    pub fn set_recorded_body_limit(&mut self, limit: usize) {
        self.recorded_body_limit = limit;
    }

    pub fn register_property_filler<F>(&mut self, filler: F)
    where
        F: Fn(&RequestInfo, &ResponseInfo) -> Result<Properties, BoxError> + Send + Sync + 'static,
    {
        self.pipeline.register_property_filler(filler);
    }

    pub fn register_measurement_filler<F>(&mut self, filler: F)
    where
        F: Fn(&RequestInfo, &ResponseInfo) -> Result<Measurements, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.pipeline.register_measurement_filler(filler);
    }

    pub fn set_request_name_resolver<F>(&mut self, resolver: F) -> Result<(), InsightsError>
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        self.pipeline.set_request_name_resolver(resolver)
    }

    /// Freeze the current registrations into a layer.
    ///
    /// Registrations made afterwards only affect layers built later. The
    /// build identifier is resolved here, once per layer.
    pub fn layer(&self) -> InsightsLayer {
        let committish = self.version_source.resolve();
        LOGGER.debug(format!("Insights.layer: committish={:?}", committish));

        InsightsLayer::new(
            ClientLifecycle::new(Arc::clone(&self.config), Arc::clone(&self.factory)),
            Arc::new(self.pipeline.clone()),
            committish,
            self.recorded_body_limit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{config_keys, properties};
    use crate::transport::{EnvelopeData, RecordingTransport};
    use bytes::Bytes;
    use http::{Request, Response};
    use http_body_util::Full;
    use serial_test::serial;
    use std::convert::Infallible;
    use tower::{service_fn, Layer, ServiceExt};

    fn clear_env() {
        for name in [
            env_vars::INSTRUMENTATION_KEY,
            env_vars::ENDPOINT,
            env_vars::ENRICHMENT_FAILURE,
            env_vars::BUILD_VERSION,
            env_vars::ENABLE_FMT_LAYER,
            env_vars::RECORDED_BODY_LIMIT,
        ] {
            env::remove_var(name);
        }
    }

    async fn hit(layer: &InsightsLayer, uri: &str) -> Response<Full<Bytes>> {
        layer
            .layer(service_fn(|_req: Request<Full<Bytes>>| async {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("HIT"))))
            }))
            .oneshot(Request::get(uri).body(Full::new(Bytes::new())).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = InsightsConfig::default();
        assert!(config.instrumentation_key.is_none());
        assert!(config.default_request_name.is_none());
        assert_eq!(config.version_source, VersionSource::Disabled);
        assert!(!config.enable_fmt_layer);
        assert!(config.transport.is_none());
    }

    #[test]
    #[serial]
    fn test_fmt_layer_env_override() {
        clear_env();
        let enabled = InsightsConfig::builder().enable_fmt_layer(true).build();
        let disabled = InsightsConfig::default();

        assert!(fmt_layer_enabled(&enabled));
        assert!(!fmt_layer_enabled(&disabled));

        env::set_var(env_vars::ENABLE_FMT_LAYER, "TRUE");
        assert!(fmt_layer_enabled(&disabled));

        env::set_var(env_vars::ENABLE_FMT_LAYER, "false");
        assert!(!fmt_layer_enabled(&enabled));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_transport_selection() {
        clear_env();
        let stdout = select_transport(None, None).unwrap();
        assert!(format!("{:?}", stdout).starts_with("StdoutTransport"));

        let http = select_transport(None, Some("http://localhost:9999/track".to_string())).unwrap();
        assert!(format!("{:?}", http).contains("localhost:9999"));

        env::set_var(env_vars::ENDPOINT, "http://collector:8080/v2/track");
        let from_env = select_transport(None, None).unwrap();
        assert!(format!("{:?}", from_env).contains("collector:8080"));

        let explicit = select_transport(Some(Arc::new(RecordingTransport::default())), None).unwrap();
        assert!(format!("{:?}", explicit).starts_with("RecordingTransport"));
        clear_env();
    }

    #[tokio::test]
    #[serial]
    async fn test_init_insights_end_to_end() {
        clear_env();
        let transport = RecordingTransport::default();
        let mut app_config = AppConfig::new();
        let mut insights = init_insights(
            InsightsConfig::builder()
                .instrumentation_key("codekey".to_string())
                .version_source(VersionSource::Static("1.4.0".to_string()))
                .with_transport(transport.clone())
                .build(),
            &mut app_config,
        )
        .unwrap();
        insights
            .set_request_name_resolver(|request| format!("GET {}", request.path))
            .unwrap();

        assert_eq!(app_config.get(config_keys::INSTRUMENTATION_KEY), Some("codekey"));

        let response = hit(&insights.layer(), "/orders").await;
        assert_eq!(response.status(), 200);

        let envelopes = transport.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].instrumentation_key, "codekey");
        match &envelopes[0].data {
            EnvelopeData::Request(data) => {
                assert_eq!(data.name, "GET /orders");
                assert_eq!(data.response_code, "200");
                assert_eq!(
                    data.properties[properties::COMMITTISH].as_deref(),
                    Some("1.4.0")
                );
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_key_serves_without_telemetry() {
        clear_env();
        let transport = RecordingTransport::default();
        let mut app_config = AppConfig::new();
        let insights = init_insights(
            InsightsConfig::builder()
                .with_transport(transport.clone())
                .build(),
            &mut app_config,
        )
        .unwrap();

        assert!(insights.config().instrumentation_key().is_none());
        assert!(!app_config.contains_key(config_keys::INSTRUMENTATION_KEY));

        let response = hit(&insights.layer(), "/").await;
        assert_eq!(response.status(), 200);
        assert!(transport.envelopes().is_empty());
    }

    #[test]
    #[serial]
    fn test_duplicate_resolver_rejected() {
        clear_env();
        let mut insights = init_insights(InsightsConfig::default(), &mut AppConfig::new()).unwrap();
        insights.set_request_name_resolver(|_| "a".to_string()).unwrap();

        let err = insights
            .set_request_name_resolver(|_| "b".to_string())
            .unwrap_err();
        assert!(matches!(err, InsightsError::DuplicateRequestNameResolver));
    }

    #[test]
    #[serial]
    fn test_enrichment_policy_from_env() {
        clear_env();
        env::set_var(env_vars::ENRICHMENT_FAILURE, "isolate");
        let insights = init_insights(InsightsConfig::default(), &mut AppConfig::new()).unwrap();
        assert_eq!(
            insights.pipeline.failure_policy(),
            EnrichmentFailurePolicy::Isolate
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_recorded_body_limit_resolution() {
        clear_env();
        let insights = init_insights(InsightsConfig::default(), &mut AppConfig::new()).unwrap();
        assert_eq!(insights.recorded_body_limit, defaults::RECORDED_BODY_LIMIT);

        env::set_var(env_vars::RECORDED_BODY_LIMIT, "128");
        let insights = init_insights(InsightsConfig::default(), &mut AppConfig::new()).unwrap();
        assert_eq!(insights.recorded_body_limit, 128);

        let insights = init_insights(
            InsightsConfig::builder().recorded_body_limit(16).build(),
            &mut AppConfig::new(),
        )
        .unwrap();
        assert_eq!(insights.recorded_body_limit, 16);
        clear_env();
    }
}
