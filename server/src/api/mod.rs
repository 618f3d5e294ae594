use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::metrics::Route;
use crate::Service;

mod hooks;
mod http;
#[cfg(test)]
mod tests;

pub struct Api {
    service: Arc<Service>,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn default_governor_config() -> Option<IpGovernorConfig> {
    GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .finish()
}

impl Api {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub fn router(&self) -> Router {
        let config = self.service.config();
        let allow_any_origin = config.allowed_origins.contains("*");
        if config.allowed_origins.is_empty() {
            tracing::warn!("ALLOWED_HTTP_ORIGINS is empty; all browser origins will be rejected");
        }
        let cors_origins = config
            .allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Invalid origin in ALLOWED_HTTP_ORIGINS: {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")]);

        let governor_conf = match (config.http_rate_limit_per_second, config.http_rate_limit_burst)
        {
            (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
                let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                let config = GovernorConfigBuilder::default()
                    .period(period)
                    .burst_size(burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .or_else(|| {
                        tracing::warn!("invalid rate-limit config; falling back to defaults");
                        default_governor_config()
                    });
                config.map(Arc::new)
            }
            _ => None,
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/metrics/prometheus", get(http::prometheus_metrics))
            .route("/referral/my-code", get(http::my_code))
            .route("/referral/stats", get(http::stats))
            .route("/referral/history", get(http::history))
            .route("/referral/request-payout", post(http::request_payout))
            .route("/referral/payout-history", get(http::payout_history))
            .route("/admin/referrals", get(http::list_referrals))
            .route("/admin/referrals/:id/approve", post(http::approve_referral))
            .route("/admin/referrals/:id/reject", post(http::reject_referral))
            .route("/admin/referrals/:id/mark-paid", post(http::mark_referral_paid))
            .route("/admin/referrals/:id/fraud-scan", post(http::rescan_referral))
            .route("/admin/payouts", get(http::list_payouts))
            .route("/admin/payouts/:id/resolve", post(http::admin_resolve_payout))
            .route(
                "/admin/referral-settings",
                get(http::get_settings).put(http::update_settings),
            )
            .route("/internal/signups", post(hooks::signup))
            .route("/internal/payments", post(hooks::payment))
            .route("/internal/refunds", post(hooks::refund))
            .route("/internal/holds/release", post(hooks::release_holds))
            .route("/internal/payouts/:id/resolve", post(hooks::resolve_payout));

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };
        let router = router.layer(cors);
        let router = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            self.service.clone(),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.service.clone())
    }
}

async fn request_id_middleware(
    AxumState(service): AxumState<Arc<Service>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();

    let metrics = service.http_metrics();
    metrics.record(Route::of(&path), elapsed);
    match response.status() {
        StatusCode::UNAUTHORIZED => metrics.inc_reject_unauthorized(),
        StatusCode::PAYLOAD_TOO_LARGE => metrics.inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => metrics.inc_reject_rate_limit(),
        status if status.is_server_error() => metrics.inc_server_error(),
        _ => {}
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "http.request"
    );
    response
}
