//! Tower middleware recording one telemetry event per HTTP request.
//!
//! [`InsightsLayer`] wraps any `tower::Service<http::Request<B>>` and, for
//! every request:
//!
//! 1. starts the request clock and creates a fresh [`ExecutionContext`],
//! 2. buffers the request body so it can be recorded, then hands the inner
//!    service an identical request,
//! 3. catches errors and panics from the inner service, reports them with
//!    `track_exception` and answers with a generic `500`,
//! 4. builds the base properties, runs the enrichment pipeline, resolves the
//!    request name and calls `track_request` followed by `flush`,
//! 5. tears the context down, flushing its client once more.
//!
//! Telemetry failures never change the response, with one exception: under
//! [`EnrichmentFailurePolicy::Propagate`](crate::EnrichmentFailurePolicy) a
//! failing filler faults the request.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use request_insights::{init_insights, AppConfig, InsightsConfig};
//! use std::convert::Infallible;
//! use tower::{ServiceBuilder, ServiceExt};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let mut app_config = AppConfig::new();
//! let insights = init_insights(InsightsConfig::default(), &mut app_config)?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(insights.layer())
//!     .service_fn(|_req: Request<Full<Bytes>>| async {
//!         Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("HIT"))))
//!     });
//!
//! let response = service.oneshot(Request::new(Full::new(Bytes::new()))).await?;
//! assert_eq!(response.status(), 200);
//! # Ok(())
//! # }
//! ```

use crate::constants::defaults;
use crate::context::{ClientLifecycle, ExecutionContext, RequestContext};
use crate::enrichment::{base_properties, EnrichmentPipeline};
use crate::error::{BoxError, InsightsError};
use crate::event::{ExceptionDetails, TelemetryEvent};
use crate::extractors::{RequestInfo, ResponseInfo};
use crate::logger::Logger;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{header, HeaderValue, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{field::Empty, Instrument};

static LOGGER: Logger = Logger::const_new("layer");

struct Shared {
    lifecycle: ClientLifecycle,
    pipeline: Arc<EnrichmentPipeline>,
    committish: Option<String>,
    recorded_body_limit: usize,
}

/// Layer producing [`InsightsService`]s. Cheap to clone.
#[derive(Clone)]
pub struct InsightsLayer {
    shared: Arc<Shared>,
}

impl fmt::Debug for InsightsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightsLayer")
            .field("lifecycle", &self.shared.lifecycle)
            .field("pipeline", &self.shared.pipeline)
            .field("committish", &self.shared.committish)
            .field("recorded_body_limit", &self.shared.recorded_body_limit)
            .finish()
    }
}

impl InsightsLayer {
    /// Build a layer from a frozen pipeline and an already resolved build identifier.
    ///
    /// `recorded_body_limit` caps how many request body bytes end up in the
    /// `req_body` property. The inner service always sees the whole body.
    pub fn new(
        lifecycle: ClientLifecycle,
        pipeline: Arc<EnrichmentPipeline>,
        committish: Option<String>,
        recorded_body_limit: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                lifecycle,
                pipeline,
                committish,
                recorded_body_limit,
            }),
        }
    }
}

impl<S> Layer<S> for InsightsLayer {
    type Service = InsightsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InsightsService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service wrapping an inner HTTP service with request telemetry.
#[derive(Clone)]
pub struct InsightsService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S: fmt::Debug> fmt::Debug for InsightsService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightsService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InsightsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send + 'static,
    ReqBody: Body<Data = Bytes> + From<Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + From<Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one poll_ready was called on.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let shared = Arc::clone(&self.shared);

        let span = tracing::info_span!(
            "insights.request",
            http.method = %request.method(),
            http.path = %request.uri().path(),
            http.status_code = Empty,
        );

        Box::pin(async move { Ok(handle(shared, inner, request).await) }.instrument(span))
    }
}

enum Outcome<B> {
    Response(Response<B>),
    Fault(ExceptionDetails),
}

async fn handle<S, ReqBody, ResBody>(
    shared: Arc<Shared>,
    mut inner: S,
    request: Request<ReqBody>,
) -> Response<ResBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
    ReqBody: Body<Data = Bytes> + From<Bytes>,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + From<Bytes>,
    ResBody::Error: Into<BoxError>,
{
    let lifecycle = &shared.lifecycle;
    let mut execution = ExecutionContext::new();
    let mut request_context = RequestContext::new();
    request_context.begin();

    let (parts, body) = request.into_parts();
    let buffered: Result<Bytes, BoxError> = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(Into::into);

    let (request_info, outcome) = match buffered {
        Ok(bytes) => {
            let request_info = RequestInfo::from_parts(&parts, bytes.clone())
                .with_recorded_body_limit(shared.recorded_body_limit);
            let request = Request::from_parts(parts, ReqBody::from(bytes));
            (request_info, call_inner(&mut inner, request).await)
        }
        Err(e) => {
            LOGGER.warn(format!("InsightsService: failed to read request body: {}", e));
            let details = ExceptionDetails::from_error::<ReqBody::Error>(e.as_ref());
            (RequestInfo::from_parts(&parts, Bytes::new()), Outcome::Fault(details))
        }
    };

    let response = match outcome {
        Outcome::Response(response) => response,
        Outcome::Fault(details) => {
            LOGGER.error(format!(
                "InsightsService: unhandled failure on {} {}: {}",
                request_info.method, request_info.path, details.value
            ));
            request_context.fault(details.trace.clone());
            if let Some(client) = lifecycle.get_or_create(&mut execution) {
                client.track_exception(details);
            }
            fault_response()
        }
    };

    let (response, response_info) = capture_response(response).await;
    let response = after_request(
        &shared,
        &mut execution,
        &mut request_context,
        &request_info,
        response,
        response_info,
    )
    .await;

    tracing::Span::current().record("http.status_code", response.status().as_u16());

    request_context.tear_down();
    lifecycle.teardown(execution).await;
    response
}

async fn call_inner<S, ReqBody, ResBody>(
    inner: &mut S,
    request: Request<ReqBody>,
) -> Outcome<ResBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
{
    let result = AssertUnwindSafe(async move { inner.call(request).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(response)) => Outcome::Response(response),
        Ok(Err(e)) => {
            let e: BoxError = e.into();
            Outcome::Fault(ExceptionDetails::from_error::<S::Error>(e.as_ref()))
        }
        Err(payload) => Outcome::Fault(ExceptionDetails::from_panic(payload.as_ref())),
    }
}

async fn after_request<ResBody>(
    shared: &Shared,
    execution: &mut ExecutionContext,
    request_context: &mut RequestContext,
    request_info: &RequestInfo,
    response: Response<ResBody>,
    response_info: ResponseInfo,
) -> Response<ResBody>
where
    ResBody: From<Bytes>,
{
    let duration_ms = request_context.elapsed_ms();
    let base = base_properties(
        request_info,
        &response_info,
        request_context.fault_trace(),
        shared.committish.as_deref(),
    );

    let client = shared.lifecycle.get_or_create(execution);
    let default_name = shared.lifecycle.config().default_request_name();

    let enriched = shared
        .pipeline
        .enrich(request_info, &response_info, base)
        .and_then(|enrichment| {
            let name = shared.pipeline.resolve_request_name(request_info, default_name)?;
            Ok((name, enrichment))
        });

    match enriched {
        Ok((name, enrichment)) => {
            if let Some(client) = &client {
                client.track_request(TelemetryEvent {
                    name,
                    path: request_info.path.clone(),
                    success: response_info.is_success(),
                    status_code: response_info.status,
                    http_method: request_info.method.to_string(),
                    start_time: request_context.start_time(),
                    duration_ms,
                    properties: enrichment.properties,
                    measurements: enrichment.measurements,
                });
                flush(client.as_ref()).await;
            }
            request_context.complete();
            response
        }
        Err(e) => {
            LOGGER.error(format!("InsightsService: enrichment failed: {}", e));
            let details = ExceptionDetails::from_error::<InsightsError>(&e);
            if !request_context.is_faulted() {
                request_context.fault(details.trace.clone());
            }
            if let Some(client) = &client {
                client.track_exception(details);
                flush(client.as_ref()).await;
            }
            fault_response()
        }
    }
}

async fn flush(client: &dyn crate::client::TelemetryClient) {
    if let Err(e) = client.flush().await {
        LOGGER.warn(format!("InsightsService: flush failed: {}", e));
    }
}

/// Record the status and, for error statuses, the response text.
///
/// The body is only buffered when `status >= 400`; the response is rebuilt
/// from the same bytes. A body that fails to read is replaced by an empty one.
async fn capture_response<B>(response: Response<B>) -> (Response<B>, ResponseInfo)
where
    B: Body<Data = Bytes> + From<Bytes>,
    B::Error: Into<BoxError>,
{
    let status = response.status().as_u16();
    if status < 400 {
        return (response, ResponseInfo::new(status));
    }

    let (mut parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (
                Response::from_parts(parts, B::from(bytes)),
                ResponseInfo::new(status).with_content(Ok(text)),
            )
        }
        Err(e) => {
            let e: BoxError = e.into();
            parts.headers.remove(header::CONTENT_LENGTH);
            (
                Response::from_parts(parts, B::from(Bytes::new())),
                ResponseInfo::new(status).with_content(Err(e.to_string())),
            )
        }
    }
}

/// The generic response sent for faulted requests. Never carries error details.
fn fault_response<B: From<Bytes>>() -> Response<B> {
    let mut response = Response::new(B::from(Bytes::from_static(defaults::FAULT_BODY.as_bytes())));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
