use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use request_insights::{
    init_insights, AppConfig, InsightsConfig, Measurements, Properties, VersionSource,
};
use std::time::Duration;
use tower::{ServiceBuilder, ServiceExt};
use tracing::info;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct RouteError(&'static str);

/// Tiny router: `/` answers after a short delay, `/error` fails and `/panic` panics.
async fn router(req: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>, RouteError> {
    match req.uri().path() {
        "/" => {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(Response::new(Full::new(Bytes::from("HIT"))))
        }
        "/error" => Err(RouteError("something went wrong")),
        "/panic" => panic!("handler panicked"),
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Falls back to a placeholder key so the demo prints envelopes out of the box
    let mut app_config: AppConfig = [("APPINSIGHTS_INSTRUMENTATION_KEY", "demo-key")]
        .into_iter()
        .collect();

    let mut insights = init_insights(
        InsightsConfig::builder()
            .default_request_name("Demo".to_string())
            .version_source(VersionSource::GitDescribe)
            .enable_fmt_layer(true)
            .build(),
        &mut app_config,
    )?;

    insights.register_property_filler(|request, _response| {
        let mut props = Properties::new();
        props.insert("user_agent".to_string(), request.header("user-agent").into());
        Ok(props)
    });
    insights.register_measurement_filler(|request, _response| {
        let mut measurements = Measurements::new();
        measurements.insert("request_bytes".to_string(), request.body.len() as f64);
        Ok(measurements)
    });

    let service = ServiceBuilder::new()
        .layer(insights.layer())
        .service_fn(router);

    for path in ["/", "/missing", "/error", "/panic"] {
        let request = Request::get(path)
            .header("user-agent", "request-insights-demo")
            .body(Full::new(Bytes::new()))?;
        let response = service.clone().oneshot(request).await?;
        info!(path, status = response.status().as_u16(), "request served");
    }

    Ok(())
}
