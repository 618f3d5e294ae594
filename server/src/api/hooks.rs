//! Collaborator callbacks: billing notifications, the hold sweep and disbursement outcomes.
//!
//! Every notification is idempotent on its business id, so collaborators may retry freely.

use axum::{
    extract::{rejection::JsonRejection, Path, State as AxumState},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use referral_ledger_types::{
    api::{PaymentNotification, PayoutResolution, RefundNotification, ReleasedHolds, SignupNotification},
    PayoutId, PayoutRequest, Referral,
};
use serde_json::json;
use std::sync::Arc;

use super::http::{billing_auth_error, json_body, ApiError};
use crate::Service;

fn authorize(service: &Service, headers: &HeaderMap) -> Result<(), ApiError> {
    match billing_auth_error(&service.config().tokens, headers) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Payment and refund notifications for users nobody referred answer `{"referral": null}`.
fn referral_or_null(referral: Option<Referral>) -> Response {
    match referral {
        Some(referral) => Json(referral).into_response(),
        None => Json(json!({ "referral": null })).into_response(),
    }
}

pub(super) async fn signup(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<SignupNotification>, JsonRejection>,
) -> Result<Json<Referral>, ApiError> {
    authorize(&service, &headers)?;
    let notification = json_body(payload)?;
    let referral = service.observe(service.engine().attribute_signup(notification).await)?;
    service.ledger_metrics().inc_signup();
    Ok(Json(referral))
}

pub(super) async fn payment(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<PaymentNotification>, JsonRejection>,
) -> Result<Response, ApiError> {
    authorize(&service, &headers)?;
    let notification = json_body(payload)?;
    let referral = service.observe(service.engine().record_payment(notification).await)?;
    service.ledger_metrics().inc_payment();
    Ok(referral_or_null(referral))
}

pub(super) async fn refund(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<RefundNotification>, JsonRejection>,
) -> Result<Response, ApiError> {
    authorize(&service, &headers)?;
    let notification = json_body(payload)?;
    let referral = service.observe(service.engine().record_reversal(notification).await)?;
    service.ledger_metrics().inc_reversal();
    Ok(referral_or_null(referral))
}

pub(super) async fn release_holds(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Result<Json<ReleasedHolds>, ApiError> {
    authorize(&service, &headers)?;
    let released = service.release_holds().await?;
    Ok(Json(ReleasedHolds { released }))
}

pub(super) async fn resolve_payout(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
    Path(id): Path<PayoutId>,
    payload: Result<Json<PayoutResolution>, JsonRejection>,
) -> Result<Json<PayoutRequest>, ApiError> {
    authorize(&service, &headers)?;
    let resolution = json_body(payload)?;
    let payout = service.observe(service.engine().resolve_payout(id, resolution).await)?;
    Ok(Json(payout))
}
