//! Enrichment pipeline: base properties plus user-registered fillers.
//!
//! Every request event starts from the same set of base properties. Property
//! fillers and measurement fillers then run in registration order, each
//! returning a map that is merged into the running result. Later keys
//! overwrite earlier ones, base keys included.
//!
//! # Example
//!
//! ```
//! use request_insights::{EnrichmentPipeline, Measurements, Properties};
//!
//! let mut pipeline = EnrichmentPipeline::new();
//! pipeline.register_property_filler(|request, _response| {
//!     let mut props = Properties::new();
//!     props.insert("tenant".to_string(), request.header("x-tenant").into());
//!     Ok(props)
//! });
//! pipeline.register_measurement_filler(|request, _response| {
//!     let mut measurements = Measurements::new();
//!     measurements.insert("body_bytes".to_string(), request.body.len() as f64);
//!     Ok(measurements)
//! });
//! pipeline
//!     .set_request_name_resolver(|request| format!("{} {}", request.method, request.path))
//!     .unwrap();
//! ```

use crate::constants::properties;
use crate::error::{BoxError, InsightsError};
use crate::event::{ExceptionDetails, Measurements, Properties, PropertyValue};
use crate::extractors::{RequestInfo, ResponseInfo};
use crate::logger::Logger;
use crate::mode::EnrichmentFailurePolicy;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

static LOGGER: Logger = Logger::const_new("enrichment");

pub type PropertyFiller =
    Arc<dyn Fn(&RequestInfo, &ResponseInfo) -> Result<Properties, BoxError> + Send + Sync>;
pub type MeasurementFiller =
    Arc<dyn Fn(&RequestInfo, &ResponseInfo) -> Result<Measurements, BoxError> + Send + Sync>;
pub type RequestNameResolver = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;

/// Registered enrichment stages and the request name resolver.
///
/// Registration happens during setup. Once the layer is built the pipeline
/// is frozen behind an `Arc` and only read.
#[derive(Clone, Default)]
pub struct EnrichmentPipeline {
    property_fillers: Vec<PropertyFiller>,
    measurement_fillers: Vec<MeasurementFiller>,
    request_name_resolver: Option<RequestNameResolver>,
    failure_policy: EnrichmentFailurePolicy,
}

impl fmt::Debug for EnrichmentPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichmentPipeline")
            .field("property_fillers", &self.property_fillers.len())
            .field("measurement_fillers", &self.measurement_fillers.len())
            .field("request_name_resolver", &self.request_name_resolver.is_some())
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

/// Result of a successful enrichment run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub properties: Properties,
    pub measurements: Measurements,
}

impl EnrichmentPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_policy(mut self, policy: EnrichmentFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn failure_policy(&self) -> EnrichmentFailurePolicy {
        self.failure_policy
    }

    pub fn set_failure_policy(&mut self, policy: EnrichmentFailurePolicy) {
        self.failure_policy = policy;
    }

    /// Append a property filler. Fillers run in registration order.
    pub fn register_property_filler<F>(&mut self, filler: F)
    where
        F: Fn(&RequestInfo, &ResponseInfo) -> Result<Properties, BoxError> + Send + Sync + 'static,
    {
        self.property_fillers.push(Arc::new(filler));
    }

    /// Append a measurement filler. Fillers run in registration order.
    pub fn register_measurement_filler<F>(&mut self, filler: F)
    where
        F: Fn(&RequestInfo, &ResponseInfo) -> Result<Measurements, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.measurement_fillers.push(Arc::new(filler));
    }

    /// Install the request name resolver. Only one may be registered; a
    /// second call fails and keeps the first resolver.
    pub fn set_request_name_resolver<F>(&mut self, resolver: F) -> Result<(), InsightsError>
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        if self.request_name_resolver.is_some() {
            return Err(InsightsError::DuplicateRequestNameResolver);
        }
        self.request_name_resolver = Some(Arc::new(resolver));
        Ok(())
    }

    pub fn has_request_name_resolver(&self) -> bool {
        self.request_name_resolver.is_some()
    }

    /// Name for the request event: the resolver's answer, or `default_name`.
    ///
    /// A panicking resolver is a stage failure and follows the failure
    /// policy; under `Isolate` the default name is used.
    pub fn resolve_request_name(
        &self,
        request: &RequestInfo,
        default_name: &str,
    ) -> Result<String, InsightsError> {
        let Some(resolver) = &self.request_name_resolver else {
            return Ok(default_name.to_string());
        };
        match run_stage(|| Ok(resolver(request))) {
            Ok(name) => Ok(name),
            Err(e) => {
                self.on_stage_failure("request name resolver".to_string(), e)?;
                Ok(default_name.to_string())
            }
        }
    }

    /// Run every registered stage on top of `base`.
    ///
    /// Under [`EnrichmentFailurePolicy::Propagate`] the first failing stage
    /// stops the run and its error is returned. Under
    /// [`EnrichmentFailurePolicy::Isolate`] failing stages are logged and skipped.
    /// A stage that panics counts as a failing stage.
    pub fn enrich(
        &self,
        request: &RequestInfo,
        response: &ResponseInfo,
        base: Properties,
    ) -> Result<Enrichment, InsightsError> {
        let mut enrichment = Enrichment {
            properties: base,
            measurements: Measurements::new(),
        };

        for (index, filler) in self.property_fillers.iter().enumerate() {
            match run_stage(|| filler(request, response)) {
                Ok(props) => enrichment.properties.extend(props),
                Err(e) => self.on_stage_failure(format!("property filler #{}", index + 1), e)?,
            }
        }

        for (index, filler) in self.measurement_fillers.iter().enumerate() {
            match run_stage(|| filler(request, response)) {
                Ok(measurements) => enrichment.measurements.extend(measurements),
                Err(e) => self.on_stage_failure(format!("measurement filler #{}", index + 1), e)?,
            }
        }

        Ok(enrichment)
    }

    fn on_stage_failure(&self, stage: String, source: BoxError) -> Result<(), InsightsError> {
        match self.failure_policy {
            EnrichmentFailurePolicy::Propagate => Err(InsightsError::Enrichment { stage, source }),
            EnrichmentFailurePolicy::Isolate => {
                LOGGER.error(format!(
                    "EnrichmentPipeline.enrich: {} failed, skipping: {}",
                    stage, source
                ));
                Ok(())
            }
        }
    }
}

/// Run one user stage, turning a panic into an ordinary stage error.
fn run_stage<T>(stage: impl FnOnce() -> Result<T, BoxError>) -> Result<T, BoxError> {
    match catch_unwind(AssertUnwindSafe(stage)) {
        Ok(result) => result,
        Err(payload) => {
            let details = ExceptionDetails::from_panic(payload.as_ref());
            Err(format!("panicked: {}", details.value).into())
        }
    }
}

/// Properties recorded for every request before any filler runs.
///
/// `fault_trace` is the trace of the failure that produced a 500, if any.
/// A 500 without a recorded fault gets a freshly captured backtrace so the
/// trace property is never empty for server errors.
pub fn base_properties(
    request: &RequestInfo,
    response: &ResponseInfo,
    fault_trace: Option<&str>,
    committish: Option<&str>,
) -> Properties {
    let mut props = Properties::new();
    let mut set = |key: &str, value: PropertyValue| {
        props.insert(key.to_string(), value);
    };

    set(properties::REMOTE_ADDR, request.remote_addr.clone().into());
    set(properties::PATH, request.path.as_str().into());
    set(properties::HOST, request.host.clone().into());
    set(properties::METHOD, request.method.as_str().into());
    set(properties::QUERY, request.query_string.as_str().into());
    set(properties::BODY, request.recorded_body().into());
    set(properties::FORM_DATA, request.form_json().into());
    set(properties::STATUS_CODE, response.status.into());

    let trace = if response.status == 500 {
        Some(match fault_trace {
            Some(trace) if !trace.is_empty() => trace.to_string(),
            _ => format!(
                "status 500 returned without an unhandled error\n{}",
                Backtrace::force_capture()
            ),
        })
    } else {
        None
    };
    set(properties::EXCEPTION_TRACE, trace.into());

    set(properties::COMMITTISH, committish.into());
    set(properties::WORKER_PID, std::process::id().into());
    set(
        properties::WORKER_TID,
        format!("{:?}", thread::current().id()).into(),
    );

    if response.status >= 400 {
        let content = match &response.content {
            Some(Ok(text)) => PropertyValue::String(text.clone()),
            Some(Err(e)) => PropertyValue::String(e.clone()),
            None => PropertyValue::Null,
        };
        set(properties::RESPONSE_CONTENT, content);
    }

    props
}
