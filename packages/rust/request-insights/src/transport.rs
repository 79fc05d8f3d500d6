//! Wire envelopes and the transports that deliver them.
//!
//! The channel hands batches of [`Envelope`]s to a [`Transport`]. Two
//! transports ship with the crate:
//!
//! - [`StdoutTransport`] writes each batch as a single JSON line, which is
//!   handy locally and in environments where a log shipper picks up stdout.
//! - [`HttpTransport`] POSTs each batch as a JSON array to an ingestion endpoint.
//!
//! Transports never retry. A failed batch is reported to the caller, logged
//! and discarded.

use crate::constants::{defaults, envelope, env_vars};
use crate::error::InsightsError;
use crate::event::{ExceptionDetails, Measurements, Properties, TelemetryEvent};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// One telemetry item as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub name: &'static str,
    pub time: String,
    #[serde(rename = "iKey")]
    pub instrumentation_key: String,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "baseType", content = "baseData")]
pub enum EnvelopeData {
    #[serde(rename = "RequestData")]
    Request(RequestData),
    #[serde(rename = "ExceptionData")]
    Exception(ExceptionData),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub name: String,
    pub url: String,
    pub success: bool,
    pub response_code: String,
    pub http_method: String,
    pub start_time: String,
    /// Elapsed time in whole milliseconds.
    pub duration: u64,
    pub properties: BTreeMap<String, Option<String>>,
    pub measurements: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    pub type_name: String,
    pub message: String,
    pub stack: String,
    pub properties: BTreeMap<String, Option<String>>,
}

fn wire_properties(properties: &Properties) -> BTreeMap<String, Option<String>> {
    properties
        .iter()
        .map(|(k, v)| (k.clone(), v.to_wire()))
        .collect()
}

fn wire_measurements(measurements: &Measurements) -> BTreeMap<String, f64> {
    measurements.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

fn iso8601(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Envelope {
    pub fn request(instrumentation_key: &str, event: &TelemetryEvent) -> Self {
        Self {
            name: envelope::REQUEST_NAME,
            time: iso8601(event.start_time),
            instrumentation_key: instrumentation_key.to_string(),
            data: EnvelopeData::Request(RequestData {
                name: event.name.clone(),
                url: event.path.clone(),
                success: event.success,
                response_code: event.status_code.to_string(),
                http_method: event.http_method.clone(),
                start_time: iso8601(event.start_time),
                duration: event.duration_ms,
                properties: wire_properties(&event.properties),
                measurements: wire_measurements(&event.measurements),
            }),
        }
    }

    pub fn exception(
        instrumentation_key: &str,
        details: &ExceptionDetails,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: envelope::EXCEPTION_NAME,
            time: iso8601(time),
            instrumentation_key: instrumentation_key.to_string(),
            data: EnvelopeData::Exception(ExceptionData {
                type_name: details.type_name.clone(),
                message: details.value.clone(),
                stack: details.trace.clone(),
                properties: BTreeMap::new(),
            }),
        }
    }
}

/// Delivers batches of envelopes.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(&self, batch: Vec<Envelope>) -> Result<(), InsightsError>;
}

/// Line-oriented sink used by [`StdoutTransport`].
trait Output: Send + Sync + Debug {
    fn write_line(&self, line: &str) -> Result<(), InsightsError>;
}

#[derive(Debug, Default)]
struct StdOutput;

impl Output for StdOutput {
    fn write_line(&self, line: &str) -> Result<(), InsightsError> {
        println!("{}", line);
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Default, Clone)]
struct TestOutput {
    buffer: Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl TestOutput {
    fn get_output(&self) -> Vec<String> {
        self.buffer.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Output for TestOutput {
    fn write_line(&self, line: &str) -> Result<(), InsightsError> {
        self.buffer.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// Writes every batch as one JSON line to stdout.
#[derive(Debug, Clone)]
pub struct StdoutTransport {
    output: Arc<dyn Output>,
}

impl Default for StdoutTransport {
    fn default() -> Self {
        Self {
            output: Arc::new(StdOutput),
        }
    }
}

impl StdoutTransport {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_test_output() -> (Self, TestOutput) {
        let output = TestOutput::default();
        (
            Self {
                output: Arc::new(output.clone()),
            },
            output,
        )
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, batch: Vec<Envelope>) -> Result<(), InsightsError> {
        if batch.is_empty() {
            return Ok(());
        }
        let line = serde_json::to_string(&batch)?;
        self.output.write_line(&line)
    }
}

/// POSTs every batch as a JSON array to an ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Transport with the default request timeout.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, InsightsError> {
        Self::with_timeout(endpoint, defaults::HTTP_TIMEOUT)
    }

    /// Transport whose requests give up after `timeout`.
    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, InsightsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint from `APPINSIGHTS_ENDPOINT`, or the public ingestion endpoint.
    pub fn from_env() -> Result<Self, InsightsError> {
        let endpoint = env::var(env_vars::ENDPOINT)
            .ok()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| defaults::ENDPOINT.to_string());
        Self::new(endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: Vec<Envelope>) -> Result<(), InsightsError> {
        if batch.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&batch)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InsightsError::Transport(format!(
                "ingestion endpoint returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// In-memory transport for tests in this crate.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingTransport {
    batches: Arc<std::sync::Mutex<Vec<Vec<Envelope>>>>,
    fail: bool,
}

#[cfg(test)]
impl RecordingTransport {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn envelopes(&self) -> Vec<Envelope> {
        self.batches().into_iter().flatten().collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, batch: Vec<Envelope>) -> Result<(), InsightsError> {
        if self.fail {
            return Err(InsightsError::Transport("recording transport set to fail".into()));
        }
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PropertyValue;
    use chrono::TimeZone;
    use serde_json::Value;
    use serial_test::serial;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> TelemetryEvent {
        let mut properties = Properties::new();
        properties.insert("req_path".to_string(), PropertyValue::from("/"));
        properties.insert("committish".to_string(), PropertyValue::Null);
        properties.insert("resp_status_code".to_string(), PropertyValue::Int(200));

        TelemetryEvent {
            name: "HttpRequest".to_string(),
            path: "/".to_string(),
            success: true,
            status_code: 200,
            http_method: "GET".to_string(),
            start_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            duration_ms: 12,
            properties,
            measurements: [("m1".to_string(), 4.9)].into_iter().collect(),
        }
    }

    #[test]
    fn test_request_envelope_shape() {
        let json = serde_json::to_value(Envelope::request("ikey", &event())).unwrap();

        assert_eq!(json["name"], envelope::REQUEST_NAME);
        assert_eq!(json["iKey"], "ikey");
        assert_eq!(json["time"], "2024-05-01T12:30:00.000Z");
        assert_eq!(json["data"]["baseType"], "RequestData");

        let base = &json["data"]["baseData"];
        assert_eq!(base["name"], "HttpRequest");
        assert_eq!(base["url"], "/");
        assert_eq!(base["success"], true);
        assert_eq!(base["responseCode"], "200");
        assert_eq!(base["httpMethod"], "GET");
        assert_eq!(base["duration"], 12);
        assert_eq!(base["properties"]["resp_status_code"], "200");
        assert_eq!(base["properties"]["committish"], Value::Null);
        assert_eq!(base["measurements"]["m1"], 4.9);
    }

    #[test]
    fn test_exception_envelope_shape() {
        let details = ExceptionDetails {
            type_name: "panic".to_string(),
            value: "boom".to_string(),
            trace: "panic: boom".to_string(),
        };
        let json = serde_json::to_value(Envelope::exception("ikey", &details, Utc::now())).unwrap();

        assert_eq!(json["name"], envelope::EXCEPTION_NAME);
        assert_eq!(json["data"]["baseType"], "ExceptionData");
        assert_eq!(json["data"]["baseData"]["typeName"], "panic");
        assert_eq!(json["data"]["baseData"]["message"], "boom");
        assert_eq!(json["data"]["baseData"]["stack"], "panic: boom");
    }

    #[tokio::test]
    async fn test_stdout_transport_writes_one_line_per_batch() {
        let (transport, output) = StdoutTransport::with_test_output();
        let batch = vec![
            Envelope::request("ikey", &event()),
            Envelope::request("ikey", &event()),
        ];

        transport.send(batch).await.unwrap();
        transport.send(Vec::new()).await.unwrap();

        let lines = output.get_output();
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_http_transport_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/track"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/v2/track", server.uri())).unwrap();
        transport
            .send(vec![Envelope::request("ikey", &event())])
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body[0]["iKey"], "ikey");
        assert_eq!(body[0]["data"]["baseData"]["name"], "HttpRequest");
    }

    #[tokio::test]
    async fn test_http_transport_reports_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri()).unwrap();
        let err = transport
            .send(vec![Envelope::request("ikey", &event())])
            .await
            .unwrap_err();

        match err {
            InsightsError::Transport(message) => assert!(message.contains("invalid key")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_transport_gives_up_on_slow_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = HttpTransport::with_timeout(server.uri(), Duration::from_millis(100)).unwrap();
        let started = std::time::Instant::now();
        let err = transport
            .send(vec![Envelope::request("ikey", &event())])
            .await
            .unwrap_err();

        assert!(matches!(err, InsightsError::Http(ref e) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_http_transport_endpoint_from_env() {
        env::remove_var(env_vars::ENDPOINT);
        assert_eq!(HttpTransport::from_env().unwrap().endpoint(), defaults::ENDPOINT);

        env::set_var(env_vars::ENDPOINT, "http://localhost:4318/track");
        assert_eq!(HttpTransport::from_env().unwrap().endpoint(), "http://localhost:4318/track");
        env::remove_var(env_vars::ENDPOINT);
    }
}
