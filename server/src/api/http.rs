use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State as AxumState},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use referral_ledger_execution::{Caller, LedgerError, PageRequest, ReferrerProfile};
use referral_ledger_types::{
    api::{
        AdminPayoutList, AdminReferralList, HistoryResponse, MyCodeResponse, PayoutHistoryResponse,
        PayoutRequestBody, PayoutResolution, PayoutSummary, ReferralStats, RejectBody,
        SettingsResponse,
    },
    PayoutId, PayoutRequest, PayoutStatus, Referral, ReferralId, ReferralStatus, SettingsUpdate,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::config::AuthTokens;
use crate::metrics::LatencySnapshot;
use crate::Service;

/// Admin id recorded on audit fields when the gateway does not forward one.
const DEFAULT_ADMIN_ID: &str = "admin";

#[derive(Debug, ThisError)]
pub(super) enum ApiError {
    #[error("missing or invalid credentials")]
    Unauthenticated,
    #[error("{message}")]
    InvalidBody { status: StatusCode, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    fn invalid_body(message: impl Into<String>) -> Self {
        ApiError::InvalidBody {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Unauthorized => StatusCode::UNAUTHORIZED,
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        LedgerError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
        LedgerError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LedgerError::ProgramInactive => StatusCode::CONFLICT,
        LedgerError::Inconsistent { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized", "message": self.to_string() }),
            ),
            ApiError::InvalidBody { status, message } => (
                *status,
                json!({ "error": "invalid_request", "message": message }),
            ),
            ApiError::Ledger(err) => {
                let mut body = json!({ "error": err.kind(), "message": err.to_string() });
                match err {
                    LedgerError::NotFound { kind, id } => {
                        body["resource"] = json!(kind);
                        body["id"] = json!(id);
                    }
                    LedgerError::InvalidTransition { entity, from, to } => {
                        body["entity"] = json!(entity);
                        body["from"] = json!(from);
                        body["to"] = json!(to);
                    }
                    LedgerError::InsufficientBalance {
                        available_cents,
                        requested_cents,
                        min_payout_cents,
                    } => {
                        body["available_cents"] = json!(available_cents);
                        body["requested_cents"] = json!(requested_cents);
                        body["min_payout_cents"] = json!(min_payout_cents);
                    }
                    LedgerError::Inconsistent { referral_id, .. } => {
                        body["referral_id"] = json!(referral_id);
                    }
                    _ => {}
                }
                (ledger_status(err), body)
            }
        };
        (status, Json(body)).into_response()
    }
}

pub(super) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::InvalidBody {
            status: rejection.status(),
            message: rejection.body_text(),
        })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// `None` when the caller presented `expected` in `header_name` (or as a bearer token when
/// `allow_bearer`), or when no secret is configured.
fn shared_secret_error(
    expected: Option<&str>,
    headers: &HeaderMap,
    header_name: &str,
    allow_bearer: bool,
) -> Option<ApiError> {
    let expected = expected?;
    let presented = header_str(headers, header_name) == Some(expected)
        || (allow_bearer && bearer_token(headers) == Some(expected));
    (!presented).then_some(ApiError::Unauthenticated)
}

/// Validates admin authentication via x-admin-token header or Bearer token. Without a
/// configured admin token every admin request is refused.
pub(super) fn admin_caller(tokens: &AuthTokens, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let Some(expected) = tokens.admin.as_deref() else {
        return Err(ApiError::Unauthenticated);
    };
    if let Some(err) = shared_secret_error(Some(expected), headers, "x-admin-token", true) {
        return Err(err);
    }
    let admin_id = header_str(headers, "x-user-id").unwrap_or(DEFAULT_ADMIN_ID);
    Ok(Caller::admin(admin_id))
}

pub(super) fn billing_auth_error(tokens: &AuthTokens, headers: &HeaderMap) -> Option<ApiError> {
    shared_secret_error(
        tokens.billing_webhook.as_deref(),
        headers,
        "x-billing-token",
        false,
    )
}

fn metrics_auth_error(tokens: &AuthTokens, headers: &HeaderMap) -> Option<ApiError> {
    shared_secret_error(tokens.metrics.as_deref(), headers, "x-metrics-token", true)
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
}

/// Identity forwarded by the upstream gateway.
fn referrer(tokens: &AuthTokens, headers: &HeaderMap) -> Result<(UserId, ReferrerProfile), ApiError> {
    if let Some(err) = shared_secret_error(
        tokens.identity_gateway.as_deref(),
        headers,
        "x-gateway-token",
        false,
    ) {
        return Err(err);
    }
    let user_id = header_str(headers, "x-user-id").ok_or(ApiError::Unauthenticated)?;
    let profile = ReferrerProfile {
        email: header_str(headers, "x-user-email").map(str::to_string),
        ip: client_ip(headers),
    };
    Ok((user_id.to_string(), profile))
}

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

/// Basic health check endpoint; always ok if the service can respond.
pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(err) = metrics_auth_error(&service.config().tokens, &headers) {
        return err.into_response();
    }
    let body = render_prometheus_metrics(&service);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

fn render_prometheus_metrics(service: &Service) -> String {
    let http = service.http_metrics().snapshot();
    let ledger = service.ledger_metrics().snapshot();
    let journal = service.journal_metrics().snapshot();

    let mut out = String::new();

    append_histogram(&mut out, "referral_ledger_http_referrer_latency_ms", &http.referrer);
    append_histogram(&mut out, "referral_ledger_http_admin_latency_ms", &http.admin);
    append_histogram(&mut out, "referral_ledger_http_internal_latency_ms", &http.internal);
    append_counter(
        &mut out,
        "referral_ledger_http_reject_unauthorized_total",
        http.reject_unauthorized,
    );
    append_counter(
        &mut out,
        "referral_ledger_http_reject_rate_limit_total",
        http.reject_rate_limit,
    );
    append_counter(
        &mut out,
        "referral_ledger_http_reject_body_limit_total",
        http.reject_body_limit,
    );
    append_counter(
        &mut out,
        "referral_ledger_http_server_errors_total",
        http.server_errors,
    );

    append_counter(&mut out, "referral_ledger_signups_total", ledger.signups);
    append_counter(&mut out, "referral_ledger_payments_total", ledger.payments);
    append_counter(&mut out, "referral_ledger_reversals_total", ledger.reversals);
    append_counter(
        &mut out,
        "referral_ledger_holds_released_total",
        ledger.holds_released,
    );
    append_counter(
        &mut out,
        "referral_ledger_payouts_requested_total",
        ledger.payouts_requested,
    );
    append_counter(
        &mut out,
        "referral_ledger_payouts_refused_total",
        ledger.payouts_refused,
    );
    append_counter(
        &mut out,
        "referral_ledger_inconsistencies_total",
        ledger.inconsistencies,
    );

    append_gauge(
        &mut out,
        "referral_ledger_persistence_enabled",
        u8::from(service.persistence_enabled()),
    );
    append_gauge(
        &mut out,
        "referral_ledger_journal_queue_depth",
        journal.queue_depth,
    );
    append_gauge(
        &mut out,
        "referral_ledger_journal_queue_high_water",
        journal.queue_high_water,
    );
    append_counter(
        &mut out,
        "referral_ledger_journal_rows_written_total",
        journal.rows_written,
    );
    append_counter(
        &mut out,
        "referral_ledger_journal_write_errors_total",
        journal.write_errors,
    );

    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_gauge(out: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn append_histogram(out: &mut String, name: &str, snapshot: &LatencySnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (bucket, count) in snapshot.buckets_ms.iter().zip(snapshot.counts.iter()) {
        cumulative = cumulative.saturating_add(*count);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(snapshot.overflow);
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    let sum = snapshot.avg_ms * snapshot.count as f64;
    let _ = writeln!(out, "{name}_sum {sum}");
}

// Referrer routes

pub(super) async fn my_code(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Result<Json<MyCodeResponse>, ApiError> {
    let (user_id, profile) = referrer(&service.config().tokens, &headers)?;
    Ok(Json(service.engine().my_code(&user_id, &profile)?))
}

pub(super) async fn stats(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Result<Json<ReferralStats>, ApiError> {
    let (user_id, _) = referrer(&service.config().tokens, &headers)?;
    Ok(Json(service.engine().stats(&user_id).await))
}

pub(super) async fn history(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let (user_id, _) = referrer(&service.config().tokens, &headers)?;
    Ok(Json(service.engine().history(&user_id).await))
}

pub(super) async fn request_payout(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<PayoutRequestBody>, JsonRejection>,
) -> Result<Json<PayoutSummary>, ApiError> {
    let (user_id, _) = referrer(&service.config().tokens, &headers)?;
    let body = json_body(payload)?;
    let result = service
        .observe(service.engine().request_payout(&user_id, body).await);
    match result {
        Ok(payout) => {
            service.ledger_metrics().inc_payout_requested();
            Ok(Json(PayoutSummary::from(&payout)))
        }
        Err(err) => {
            if matches!(err, LedgerError::InsufficientBalance { .. }) {
                service.ledger_metrics().inc_payout_refused();
            }
            Err(err.into())
        }
    }
}

pub(super) async fn payout_history(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Result<Json<PayoutHistoryResponse>, ApiError> {
    let (user_id, _) = referrer(&service.config().tokens, &headers)?;
    Ok(Json(service.engine().payout_history(&user_id).await))
}

// Admin routes

#[derive(Debug, Default, Deserialize)]
pub(super) struct ReferralListQuery {
    status: Option<ReferralStatus>,
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PayoutListQuery {
    status: Option<PayoutStatus>,
    page: Option<usize>,
    limit: Option<usize>,
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| ApiError::invalid_body(rejection.body_text()))
}

pub(super) async fn list_referrals(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    query: Result<Query<ReferralListQuery>, QueryRejection>,
) -> Result<Json<AdminReferralList>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let query = query_params(query)?;
    let admin = service.engine().admin(&caller)?;
    let list = admin
        .list_referrals(query.status, PageRequest::new(query.page, query.limit))
        .await;
    Ok(Json(list))
}

pub(super) async fn approve_referral(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    Path(id): Path<ReferralId>,
) -> Result<Json<Referral>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let admin = service.engine().admin(&caller)?;
    Ok(Json(service.observe(admin.approve(id).await)?))
}

pub(super) async fn reject_referral(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    Path(id): Path<ReferralId>,
    body: Bytes,
) -> Result<Json<Referral>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    // The reason is optional, so an empty body is accepted.
    let body: RejectBody = if body.iter().all(u8::is_ascii_whitespace) {
        RejectBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| ApiError::invalid_body(err.to_string()))?
    };
    let admin = service.engine().admin(&caller)?;
    Ok(Json(service.observe(admin.reject(id, body.reason).await)?))
}

pub(super) async fn mark_referral_paid(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    Path(id): Path<ReferralId>,
) -> Result<Json<Referral>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let admin = service.engine().admin(&caller)?;
    Ok(Json(service.observe(admin.mark_paid(id).await)?))
}

pub(super) async fn rescan_referral(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    Path(id): Path<ReferralId>,
) -> Result<Json<Referral>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let admin = service.engine().admin(&caller)?;
    Ok(Json(service.observe(admin.rescan_fraud(id).await)?))
}

pub(super) async fn list_payouts(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    query: Result<Query<PayoutListQuery>, QueryRejection>,
) -> Result<Json<AdminPayoutList>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let query = query_params(query)?;
    let admin = service.engine().admin(&caller)?;
    let list = admin
        .list_payouts(query.status, PageRequest::new(query.page, query.limit))
        .await;
    Ok(Json(list))
}

pub(super) async fn admin_resolve_payout(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    Path(id): Path<PayoutId>,
    payload: Result<Json<PayoutResolution>, JsonRejection>,
) -> Result<Json<PayoutRequest>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let resolution = json_body(payload)?;
    let admin = service.engine().admin(&caller)?;
    Ok(Json(service.observe(admin.resolve_payout(id, resolution).await)?))
}

pub(super) async fn get_settings(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let admin = service.engine().admin(&caller)?;
    Ok(Json(SettingsResponse::from(&*admin.settings())))
}

pub(super) async fn update_settings(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let caller = admin_caller(&service.config().tokens, &headers)?;
    let update = json_body(payload)?;
    let admin = service.engine().admin(&caller)?;
    let version = admin.update_settings(&update)?;
    Ok(Json(SettingsResponse::from(&*version)))
}
