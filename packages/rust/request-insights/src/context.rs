//! Per-request state: the client handle and the request phase.
//!
//! An [`ExecutionContext`] lives exactly as long as one request. It is created
//! by the middleware, handed by `&mut` to each hook, and finally consumed by
//! [`ClientLifecycle::teardown`]. Nothing about it is global, so concurrent
//! requests never share a handle.
//!
//! If the request future is dropped before teardown runs (client disconnect,
//! timeout layer), the context flushes from its `Drop` impl on the current
//! tokio runtime so queued events still go out.

use crate::client::{ClientFactory, TelemetryClient};
use crate::config::InstrumentationConfig;
use crate::logger::Logger;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

static LOGGER: Logger = Logger::const_new("context");

/// Holds at most one client handle for the current request.
#[derive(Default)]
pub struct ExecutionContext {
    client: Option<Arc<dyn TelemetryClient>>,
    creation_failed: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("has_client", &self.client.is_some())
            .field("creation_failed", &self.creation_failed)
            .finish()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                LOGGER.debug("ExecutionContext.drop: request ended before teardown, flushing");
                runtime.spawn(async move {
                    if let Err(e) = client.flush().await {
                        LOGGER.warn(format!("ExecutionContext.drop: flush failed: {}", e));
                    }
                });
            }
            Err(_) => {
                LOGGER.warn("ExecutionContext.drop: no runtime available, queued telemetry may be lost");
            }
        }
    }
}

/// Creates clients on demand and releases them at the end of a request.
#[derive(Clone)]
pub struct ClientLifecycle {
    config: Arc<InstrumentationConfig>,
    factory: Arc<dyn ClientFactory>,
}

impl fmt::Debug for ClientLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLifecycle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientLifecycle {
    pub fn new(config: Arc<InstrumentationConfig>, factory: Arc<dyn ClientFactory>) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    /// Return the context's client, creating it on first use.
    ///
    /// A factory failure is logged once and cached for the rest of the
    /// context; `None` means telemetry is skipped for this request.
    pub fn get_or_create(&self, context: &mut ExecutionContext) -> Option<Arc<dyn TelemetryClient>> {
        if let Some(client) = &context.client {
            return Some(Arc::clone(client));
        }
        if context.creation_failed {
            return None;
        }

        match self.factory.create(&self.config) {
            Ok(client) => {
                context.client = Some(Arc::clone(&client));
                Some(client)
            }
            Err(e) => {
                context.creation_failed = true;
                LOGGER.error(format!(
                    "ClientLifecycle.get_or_create: telemetry disabled for this request: {}",
                    e
                ));
                None
            }
        }
    }

    /// Flush and release the context's client. A no-op when none was created.
    pub async fn teardown(&self, mut context: ExecutionContext) {
        let Some(client) = context.client.take() else {
            return;
        };
        if let Err(e) = client.flush().await {
            LOGGER.warn(format!("ClientLifecycle.teardown: flush failed: {}", e));
        }
    }
}

/// Phases of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    InRequest,
    Completed,
    Faulted,
    TornDown,
}

/// Timing and phase bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    started: Instant,
    start_time: DateTime<Utc>,
    phase: RequestPhase,
    fault_trace: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            start_time: Utc::now(),
            phase: RequestPhase::Idle,
            fault_trace: None,
        }
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> InRequest. Records the start instant.
    pub fn begin(&mut self) {
        if self.transition(&[RequestPhase::Idle], RequestPhase::InRequest) {
            self.started = Instant::now();
            self.start_time = Utc::now();
        }
    }

    /// InRequest -> Faulted, keeping the trace for the after-hook.
    pub fn fault(&mut self, trace: impl Into<String>) {
        if self.transition(&[RequestPhase::InRequest], RequestPhase::Faulted) {
            self.fault_trace = Some(trace.into());
        }
    }

    /// InRequest -> Completed. A faulted request stays Faulted.
    pub fn complete(&mut self) {
        if self.phase == RequestPhase::Faulted {
            return;
        }
        self.transition(&[RequestPhase::InRequest], RequestPhase::Completed);
    }

    /// Completed | Faulted -> TornDown.
    pub fn tear_down(&mut self) {
        self.transition(
            &[RequestPhase::Completed, RequestPhase::Faulted],
            RequestPhase::TornDown,
        );
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn is_faulted(&self) -> bool {
        self.fault_trace.is_some()
    }

    pub fn fault_trace(&self) -> Option<&str> {
        self.fault_trace.as_deref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Whole milliseconds since `begin`.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn transition(&mut self, from: &[RequestPhase], to: RequestPhase) -> bool {
        if !from.contains(&self.phase) {
            LOGGER.warn(format!(
                "RequestContext: illegal transition {:?} -> {:?}",
                self.phase, to
            ));
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.phase, to);
            return false;
        }
        self.phase = to;
        true
    }
}
