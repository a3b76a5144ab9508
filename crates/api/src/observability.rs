use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_REQUESTS_TOTAL: &str = "kindling_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "kindling_api_http_request_duration_seconds";
const HTTP_REQUEST_ERRORS_TOTAL: &str = "kindling_api_http_errors_total";
const COORDINATION_OUTCOMES_TOTAL: &str = "kindling_api_coordination_outcomes_total";
const STREAM_ROLES_TOTAL: &str = "kindling_api_stream_roles_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinationOutcome {
    Executed,
    Deduplicated,
    DedupFallback,
    PriorityReady,
    PriorityCancelled,
    PriorityTimeout,
    PriorityError,
}

impl CoordinationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Deduplicated => "deduplicated",
            Self::DedupFallback => "dedup_fallback",
            Self::PriorityReady => "priority_ready",
            Self::PriorityCancelled => "priority_cancelled",
            Self::PriorityTimeout => "priority_timeout",
            Self::PriorityError => "priority_error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamRole {
    Producer,
    Joiner,
}

impl StreamRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Joiner => "joiner",
        }
    }
}

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let status_code = status.as_u16().to_string();
    let duration_seconds = elapsed.as_secs_f64();
    let result = if status.is_server_error() {
        "error"
    } else {
        "success"
    };

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone(),
        "result" => result
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code
    )
    .record(duration_seconds);

    if status.is_server_error() {
        counter!(
            HTTP_REQUEST_ERRORS_TOTAL,
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status.as_u16().to_string()
        )
        .increment(1);
    }
}

pub fn register_coordination_outcome(path: &str, outcome: CoordinationOutcome) {
    counter!(
        COORDINATION_OUTCOMES_TOTAL,
        "path" => path.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn register_stream_role(role: StreamRole) {
    counter!(STREAM_ROLES_TOTAL, "role" => role.as_str()).increment(1);
}
