//! Request telemetry middleware for tower-based HTTP services.
//!
//! This crate records one structured telemetry event per inbound HTTP request
//! and forwards it asynchronously to a telemetry backend. Delivery never
//! blocks the response path, and telemetry failures never take the
//! application down.
//!
//! # Features
//!
//! - **Tower Layer**: works with any `tower::Service<http::Request<B>>` (hyper, axum, ...)
//! - **Rich Base Properties**: remote address, path, method, query, body, form data,
//!   status, error trace, build identifier, worker pid/tid
//! - **Enrichment Pipeline**: user property/measurement fillers and a request name resolver
//! - **Fault Capture**: errors and panics become `track_exception` plus a generic 500
//! - **Async Delivery**: bounded per-client queue, background batching, bounded flush
//!
//! # Architecture
//!
//! - [`config`]: instrumentation key and default request name resolution
//! - [`telemetry`]: initialization and the [`Insights`] registration facade
//! - [`layer`]: Tower middleware driving the per-request lifecycle
//! - [`enrichment`]: base properties and the filler pipeline
//! - [`client`], [`channel`], [`transport`]: client facade and delivery
//! - [`context`]: per-request client handle and phase tracking
//!
//! # Quick Start
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use request_insights::{init_insights, AppConfig, InsightsConfig, Measurements};
//! use std::convert::Infallible;
//! use tower::{ServiceBuilder, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut app_config = AppConfig::new();
//!     let mut insights = init_insights(InsightsConfig::default(), &mut app_config)?;
//!
//!     insights.register_measurement_filler(|request, _response| {
//!         let mut measurements = Measurements::new();
//!         measurements.insert("request_bytes".to_string(), request.body.len() as f64);
//!         Ok(measurements)
//!     });
//!
//!     let service = ServiceBuilder::new()
//!         .layer(insights.layer())
//!         .service_fn(|_req: Request<Full<Bytes>>| async {
//!             Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("HIT"))))
//!         });
//!
//!     let response = service.oneshot(Request::new(Full::new(Bytes::new()))).await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! - `APPINSIGHTS_INSTRUMENTATION_KEY`: instrumentation key
//! - `APPINSIGHTS_ENDPOINT`: HTTP ingestion endpoint (stdout when unset)
//! - `APPINSIGHTS_QUEUE_SIZE`: per-client queue capacity, defaults to 2048
//! - `APPINSIGHTS_BATCH_SIZE`: max items per transport call, defaults to 512
//! - `APPINSIGHTS_FLUSH_TIMEOUT_MS`: flush upper bound, defaults to 5000
//! - `APPINSIGHTS_ENRICHMENT_FAILURE`: "propagate" (default) or "isolate"
//! - `APPINSIGHTS_BUILD_VERSION`: build identifier override
//! - `APPINSIGHTS_RECORDED_BODY_LIMIT`: max request body bytes kept in `req_body`, defaults to 65536
//! - `APPINSIGHTS_LOG_LEVEL`: internal log level (none, error, warn, info, debug)
//!
//! See [`telemetry`] module for detailed configuration options.

pub mod channel;
pub mod client;
pub mod config;
pub mod constants;
pub mod context;
pub mod enrichment;
pub mod error;
pub mod event;
pub mod extractors;
pub mod layer;
pub mod logger;
pub mod mode;
pub mod telemetry;
pub mod transport;
pub mod version;

pub use channel::TelemetryChannel;
pub use client::{ClientFactory, InsightsClient, InsightsClientFactory, TelemetryClient};
pub use config::{AppConfig, InstrumentationConfig};
pub use context::{ClientLifecycle, ExecutionContext, RequestContext, RequestPhase};
pub use enrichment::{base_properties, Enrichment, EnrichmentPipeline};
pub use error::{BoxError, InsightsError};
pub use event::{ExceptionDetails, Measurements, Properties, PropertyValue, TelemetryEvent};
pub use extractors::{RequestInfo, ResponseInfo};
pub use layer::{InsightsLayer, InsightsService};
pub use mode::EnrichmentFailurePolicy;
pub use telemetry::{init_insights, Insights, InsightsConfig, InsightsConfigBuilder};
pub use transport::{Envelope, HttpTransport, StdoutTransport, Transport};
pub use version::VersionSource;
