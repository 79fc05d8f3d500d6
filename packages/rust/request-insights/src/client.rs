//! Telemetry client facade.
//!
//! [`TelemetryClient`] is the seam between the middleware and whatever
//! delivers telemetry. The default [`InsightsClient`] turns events into
//! envelopes and queues them on its own [`TelemetryChannel`]; tests and hosts
//! with their own backend plug in a different [`ClientFactory`].

use crate::channel::TelemetryChannel;
use crate::config::InstrumentationConfig;
use crate::error::InsightsError;
use crate::event::{ExceptionDetails, TelemetryEvent};
use crate::logger::Logger;
use crate::transport::{Envelope, Transport};
use async_trait::async_trait;
use bon::Builder;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

static LOGGER: Logger = Logger::const_new("client");

/// Records request and exception telemetry.
///
/// `track_*` calls only enqueue and never block the caller. `flush` waits
/// (bounded) until queued items have been handed to the transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    fn track_request(&self, event: TelemetryEvent);

    fn track_exception(&self, details: ExceptionDetails);

    async fn flush(&self) -> Result<(), InsightsError>;
}

/// Default client, bound to one instrumentation key.
#[derive(Debug)]
pub struct InsightsClient {
    instrumentation_key: String,
    channel: TelemetryChannel,
}

impl InsightsClient {
    pub fn new(instrumentation_key: impl Into<String>, channel: TelemetryChannel) -> Self {
        Self {
            instrumentation_key: instrumentation_key.into(),
            channel,
        }
    }

    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    pub fn dropped_count(&self) -> usize {
        self.channel.dropped_count()
    }
}

#[async_trait]
impl TelemetryClient for InsightsClient {
    fn track_request(&self, event: TelemetryEvent) {
        self.channel
            .send(Envelope::request(&self.instrumentation_key, &event));
    }

    fn track_exception(&self, details: ExceptionDetails) {
        self.channel.send(Envelope::exception(
            &self.instrumentation_key,
            &details,
            Utc::now(),
        ));
    }

    async fn flush(&self) -> Result<(), InsightsError> {
        self.channel.flush().await
    }
}

/// Creates telemetry clients for a resolved configuration.
#[cfg_attr(test, mockall::automock)]
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        config: &InstrumentationConfig,
    ) -> Result<Arc<dyn TelemetryClient>, InsightsError>;
}

/// Builds [`InsightsClient`]s that share one transport.
///
/// # Example
///
/// ```no_run
/// use request_insights::{HttpTransport, InsightsClientFactory};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), request_insights::InsightsError> {
/// let factory = InsightsClientFactory::builder()
///     .transport(Arc::new(HttpTransport::from_env()?))
///     .max_queue_size(4096)
///     .build();
/// # Ok(())
/// # }
/// ```
#[derive(Builder)]
pub struct InsightsClientFactory {
    transport: Arc<dyn Transport>,
    max_queue_size: Option<usize>,
    max_batch_size: Option<usize>,
    flush_timeout: Option<Duration>,
}

impl fmt::Debug for InsightsClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightsClientFactory")
            .field("transport", &self.transport)
            .field("max_queue_size", &self.max_queue_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}

impl ClientFactory for InsightsClientFactory {
    fn create(
        &self,
        config: &InstrumentationConfig,
    ) -> Result<Arc<dyn TelemetryClient>, InsightsError> {
        let key = config
            .instrumentation_key()
            .ok_or(InsightsError::MissingInstrumentationKey)?;

        let channel = TelemetryChannel::builder()
            .transport(Arc::clone(&self.transport))
            .maybe_max_queue_size(self.max_queue_size)
            .maybe_max_batch_size(self.max_batch_size)
            .maybe_flush_timeout(self.flush_timeout)
            .build()?;

        LOGGER.debug("InsightsClientFactory.create: client created");
        Ok(Arc::new(InsightsClient::new(key, channel)))
    }
}
