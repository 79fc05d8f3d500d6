//! Request and response snapshots handed to enrichment stages.
//!
//! The middleware buffers the request body before calling the inner service,
//! so a [`RequestInfo`] can expose the raw body and decoded form data without
//! consuming anything the handler needs. A [`ResponseInfo`] only carries the
//! response content for error statuses (`>= 400`).
//!
//! # Remote address
//!
//! The remote address is taken from, in order:
//! 1. a [`SocketAddr`] request extension (inserted by most servers' connection info),
//! 2. the first entry of `x-forwarded-for`,
//! 3. `x-real-ip`.

use crate::constants::defaults;
use bytes::Bytes;
use http::{header, request::Parts, HeaderMap, Method};
use serde_json::{Map, Value};
use std::net::SocketAddr;

/// Snapshot of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    pub query_string: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<String>,
    pub host: Option<String>,
    /// Max body bytes copied into the `req_body` property.
    pub recorded_body_limit: usize,
}

impl RequestInfo {
    /// Capture the request parts along with the buffered body.
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query_string: parts.uri.query().unwrap_or_default().to_string(),
            headers: parts.headers.clone(),
            body,
            remote_addr: remote_addr(parts),
            host: host(parts),
            recorded_body_limit: defaults::RECORDED_BODY_LIMIT,
        }
    }

    pub fn with_recorded_body_limit(mut self, limit: usize) -> Self {
        self.recorded_body_limit = limit;
        self
    }

    /// The raw body as text (lossy for non UTF-8 content).
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The body as recorded in telemetry: at most `recorded_body_limit`
    /// bytes, with a marker noting how much was cut.
    pub fn recorded_body(&self) -> String {
        if self.body.len() <= self.recorded_body_limit {
            return self.body_text();
        }
        let kept = String::from_utf8_lossy(&self.body[..self.recorded_body_limit]);
        format!(
            "{}...[truncated {} bytes]",
            kept,
            self.body.len() - self.recorded_body_limit
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the body is `application/x-www-form-urlencoded`.
    pub fn is_form(&self) -> bool {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(|ct| ct.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
            .unwrap_or(false)
    }

    /// Form fields decoded from the body. Empty unless the body is form encoded.
    /// For repeated keys the first value wins.
    pub fn form(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if !self.is_form() {
            return fields;
        }

        let body = self.body_text();
        for pair in body.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_form_component(key);
            if !fields.contains_key(&key) {
                fields.insert(key, Value::String(decode_form_component(value)));
            }
        }
        fields
    }

    /// Form fields serialized as a JSON object.
    pub fn form_json(&self) -> String {
        Value::Object(self.form()).to_string()
    }
}

fn decode_form_component(component: &str) -> String {
    let component = component.replace('+', " ");
    urlencoding::decode(&component)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(component)
}

fn remote_addr(parts: &Parts) -> Option<String> {
    if let Some(addr) = parts.extensions.get::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }

    let header_value = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header_value("x-forwarded-for")
        .and_then(|ips| ips.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| header_value("x-real-ip").map(str::to_string))
}

fn host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

/// Snapshot of the final response.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    /// Response text, captured only when `status >= 400`. `Err` carries the
    /// stringified capture failure.
    pub content: Option<Result<String, String>>,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content: None,
        }
    }

    pub fn with_content(mut self, content: Result<String, String>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn test_request_info_basic_fields() {
        let parts = parts(
            Request::post("http://example.com/orders?id=7&x=1")
                .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
                .body(())
                .unwrap(),
        );
        let info = RequestInfo::from_parts(&parts, Bytes::from_static(b"payload"));

        assert_eq!(info.method, Method::POST);
        assert_eq!(info.path, "/orders");
        assert_eq!(info.query_string, "id=7&x=1");
        assert_eq!(info.body_text(), "payload");
        assert_eq!(info.remote_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(info.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_remote_addr_prefers_socket_extension() {
        let mut request = Request::get("/").header("x-real-ip", "10.9.9.9").body(()).unwrap();
        request
            .extensions_mut()
            .insert("192.168.1.20:5000".parse::<SocketAddr>().unwrap());
        let info = RequestInfo::from_parts(&parts(request), Bytes::new());
        assert_eq!(info.remote_addr.as_deref(), Some("192.168.1.20"));

        let request = Request::get("/").header("x-real-ip", "10.9.9.9").body(()).unwrap();
        let info = RequestInfo::from_parts(&parts(request), Bytes::new());
        assert_eq!(info.remote_addr.as_deref(), Some("10.9.9.9"));
    }

    #[test]
    fn test_host_header_wins_over_authority() {
        let request = Request::get("http://internal:8080/")
            .header("host", "public.example.com")
            .body(())
            .unwrap();
        let info = RequestInfo::from_parts(&parts(request), Bytes::new());
        assert_eq!(info.host.as_deref(), Some("public.example.com"));
    }

    #[test]
    fn test_form_decoding() {
        let request = Request::post("/submit")
            .header("content-type", "application/x-www-form-urlencoded; charset=utf-8")
            .body(())
            .unwrap();
        let info = RequestInfo::from_parts(
            &parts(request),
            Bytes::from_static(b"name=Jane+Doe&city=S%C3%A3o%20Paulo&name=ignored&flag"),
        );

        let form = info.form();
        assert_eq!(form["name"], "Jane Doe");
        assert_eq!(form["city"], "São Paulo");
        assert_eq!(form["flag"], "");
        assert_eq!(form.len(), 3);
    }

    #[test]
    fn test_non_form_body_yields_empty_object() {
        let request = Request::post("/submit")
            .header("content-type", "application/json")
            .body(())
            .unwrap();
        let info = RequestInfo::from_parts(&parts(request), Bytes::from_static(b"{\"a\":1}"));

        assert_eq!(info.form_json(), "{}");
        assert_eq!(info.body_text(), "{\"a\":1}");
    }

    #[test]
    fn test_recorded_body_is_capped() {
        let request = Request::post("/upload").body(()).unwrap();
        let info = RequestInfo::from_parts(&parts(request), Bytes::from_static(b"0123456789"))
            .with_recorded_body_limit(4);

        assert_eq!(info.recorded_body(), "0123...[truncated 6 bytes]");
        assert_eq!(info.body.len(), 10);
        assert_eq!(info.body_text(), "0123456789");

        let info = info.with_recorded_body_limit(10);
        assert_eq!(info.recorded_body(), "0123456789");
    }
}
