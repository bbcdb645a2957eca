use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts as PromOpts, Registry,
    TextEncoder,
};

use clonewatch::AnalysisResponse;

/// Routes that are scraped or probed too often to be worth recording.
const UNTRACKED_ROUTES: [&str; 2] = ["/metrics", "/healthz"];

/// Analyses take from milliseconds (cache hits) to tens of seconds (long uploads).
const ANALYSIS_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    request_seconds: HistogramVec,
    in_flight: IntGauge,
    analyses: IntCounterVec,
    analysis_seconds: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> prometheus::Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn build() -> prometheus::Result<Metrics> {
    let registry = Registry::new_custom(Some("clonewatch".to_owned()), None)?;

    let requests = register(
        &registry,
        IntCounterVec::new(
            PromOpts::new("http_requests_total", "HTTP requests by route and status."),
            &["route", "status"],
        )?,
    )?;
    let request_seconds = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds.",
            ),
            &["route", "status"],
        )?,
    )?;
    let in_flight = register(
        &registry,
        IntGauge::new("http_in_flight_requests", "HTTP requests being served.")?,
    )?;
    let analyses = register(
        &registry,
        IntCounterVec::new(
            PromOpts::new(
                "analyses_total",
                "Analyses by outcome (real, fake or an error kind).",
            ),
            &["outcome"],
        )?,
    )?;
    let analysis_seconds = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "analysis_duration_seconds",
                "Time spent in the analysis pipeline, in seconds.",
            )
            .buckets(ANALYSIS_BUCKETS.to_vec()),
            &["cached"],
        )?,
    )?;

    Ok(Metrics {
        registry,
        requests,
        request_seconds,
        in_flight,
        analyses,
        analysis_seconds,
    })
}

/// Register the metric families. Until this succeeds every recorder is a no-op.
pub fn init() -> prometheus::Result<()> {
    if METRICS.get().is_none() {
        let _ = METRICS.set(build()?);
    }
    Ok(())
}

pub async fn prometheus_metrics() -> Response {
    let Some(m) = METRICS.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics are disabled").into_response();
    };
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&m.registry.gather(), &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        buf,
    )
        .into_response()
}

fn outcome(resp: &AnalysisResponse) -> String {
    match resp {
        AnalysisResponse::Success(s) => s.classification.result.as_str().to_owned(),
        AnalysisResponse::Failure(f) => serde_json::to_value(f.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "error".to_owned()),
    }
}

pub fn record_analysis(resp: &AnalysisResponse) {
    let Some(m) = METRICS.get() else {
        return;
    };
    m.analyses.with_label_values(&[outcome(resp).as_str()]).inc();
    if let AnalysisResponse::Success(s) = resp {
        let cached = if s.processing_info.cached { "true" } else { "false" };
        m.analysis_seconds
            .with_label_values(&[cached])
            .observe(s.processing_info.processing_time);
    }
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let Some(m) = METRICS.get() else {
        return next.run(req).await;
    };
    // Unmatched paths share one label so arbitrary URLs cannot grow the series count.
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or("unmatched", |path| path.as_str())
        .to_owned();
    if UNTRACKED_ROUTES.contains(&route.as_str()) {
        return next.run(req).await;
    }

    let started = Instant::now();
    m.in_flight.inc();
    let response = next.run(req).await;
    m.in_flight.dec();

    let status = response.status().as_u16().to_string();
    let labels = [route.as_str(), status.as_str()];
    m.requests.with_label_values(&labels).inc();
    m.request_seconds
        .with_label_values(&labels)
        .observe(started.elapsed().as_secs_f64());

    response
}
