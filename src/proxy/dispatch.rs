use http::{Method, StatusCode};
use tracing::debug;

use super::AppContext;
use super::cache::transport::Transport;
use super::capture::ResponseCapture;
use super::http::HttpResponse;
use super::request::ProxyRequest;
use crate::metrics;

/// Reserved in-band endpoint: a GET for this path on any host returns the
/// Prometheus page and bypasses caching.
pub const METRICS_PATH: &str = "/_gitmproxy_metrics";

/// Routes one intercepted request: metrics endpoint, self-loop guard,
/// per-method accounting, then GET through the caching transport and
/// everything else through the passthrough transport. Transport errors
/// surface as a 500 with the error text as body.
pub async fn dispatch(app: &AppContext, req: &ProxyRequest) -> HttpResponse {
    if req.uri.path() == METRICS_PATH {
        let mut capture = ResponseCapture::new();
        capture.set_header("Content-Type", metrics::text_format_type());
        capture.write(&metrics::gather());
        return capture.into_response();
    }

    // Requests aimed back at the proxy itself would loop forever.
    let host = req.hostname();
    if host.starts_with("127.0.0.1") || host.starts_with("localhost") {
        return HttpResponse::synthetic(StatusCode::NOT_FOUND, Vec::new());
    }

    metrics::record_http_request(req.method.as_str());

    let transport = if req.method == Method::GET {
        &app.caching
    } else {
        &app.passthrough
    };

    match transport.round_trip(req).await {
        Ok(resp) => resp,
        Err(err) => {
            debug!(url = %req.url(), error = %err, "transport error");
            HttpResponse::synthetic(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string().into_bytes(),
            )
        }
    }
}
