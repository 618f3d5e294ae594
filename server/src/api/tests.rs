//! Route tests driven through the full router with `oneshot`.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use referral_ledger_execution::mocks::{instant_settings, signup, Harness};
use referral_ledger_types::ReferralSettings;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use crate::{Api, AuthTokens, ServerConfig, Service};

const ADMIN: &str = "admin-secret";
const BILLING: &str = "billing-secret";

fn config() -> ServerConfig {
    ServerConfig {
        tokens: AuthTokens {
            admin: Some(ADMIN.to_string()),
            identity_gateway: None,
            billing_webhook: Some(BILLING.to_string()),
            metrics: None,
        },
        http_rate_limit_per_second: None,
        http_rate_limit_burst: None,
        hold_sweep_interval_secs: None,
        ..ServerConfig::default()
    }
}

fn app_with(config: ServerConfig, settings: ReferralSettings) -> (Harness, Router) {
    let harness = Harness::new(settings);
    let service = Arc::new(Service::new(harness.engine.clone(), config));
    let router = Api::new(service).router();
    (harness, router)
}

fn app(settings: ReferralSettings) -> (Harness, Router) {
    app_with(config(), settings)
}

enum Auth<'a> {
    None,
    User(&'a str),
    Admin,
    Billing,
}

fn request(method: Method, uri: &str, auth: Auth<'_>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    builder = match auth {
        Auth::None => builder,
        Auth::User(user) => builder.header("x-user-id", user),
        Auth::Admin => builder
            .header("x-admin-token", ADMIN)
            .header("x-user-id", "ops"),
        Auth::Billing => builder.header("x-billing-token", BILLING),
    };
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

async fn post_payment(app: &Router, payment_id: &str, user: &str, amount_cents: u64) -> Value {
    let (status, body) = send(
        app,
        request(
            Method::POST,
            "/internal/payments",
            Auth::Billing,
            Some(json!({ "payment_id": payment_id, "user_id": user, "amount_cents": amount_cents })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[tokio::test]
async fn test_healthz_echoes_request_id() {
    let (_, app) = app(instant_settings());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-42");

    let (status, body) = send(&app, request(Method::GET, "/healthz", Auth::None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn test_referrer_flow_over_http() {
    let (_, app) = app(ReferralSettings {
        upfront_amount_cents: 4_000,
        min_payout_cents: 5_000,
        ..instant_settings()
    });

    let (status, code) = send(
        &app,
        request(Method::GET, "/referral/my-code", Auth::User("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let referral_code = code["code"].as_str().unwrap().to_string();
    assert_eq!(
        code["link"],
        json!(format!("https://app.example.com/signup?ref={referral_code}"))
    );

    let (status, referral) = send(
        &app,
        request(
            Method::POST,
            "/internal/signups",
            Auth::Billing,
            Some(json!({ "referral_code": referral_code, "referred_user_id": "bob" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(referral["status"], "pending");
    assert_eq!(referral["referrer_id"], "alice");

    let referral = post_payment(&app, "pay-1", "bob", 10_000).await;
    assert_eq!(referral["status"], "eligible");
    assert_eq!(referral["total_commission_cents"], 4_000);

    let payout_body = json!({ "payment_method": "stripe" });
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/referral/request-payout",
            Auth::User("alice"),
            Some(payout_body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "insufficient_balance");
    assert_eq!(body["available_cents"], 4_000);
    assert_eq!(body["min_payout_cents"], 5_000);

    post_payment(&app, "pay-2", "bob", 10_000).await;
    let (status, stats) = send(
        &app,
        request(Method::GET, "/referral/stats", Auth::User("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["available_payout_cents"], 5_000);
    assert_eq!(stats["active_referrals"], 1);
    assert_eq!(stats["can_request_payout"], true);

    let (status, payout) = send(
        &app,
        request(
            Method::POST,
            "/referral/request-payout",
            Auth::User("alice"),
            Some(payout_body),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payout["amount_cents"], 5_000);
    assert_eq!(payout["status"], "pending");

    let (_, history) = send(
        &app,
        request(Method::GET, "/referral/history", Auth::User("alice"), None),
    )
    .await;
    assert_eq!(history["referrals"].as_array().unwrap().len(), 1);
    assert!(history["referrals"][0].get("fraud_flags").is_none());

    let (_, payouts) = send(
        &app,
        request(Method::GET, "/referral/payout-history", Auth::User("alice"), None),
    )
    .await;
    assert_eq!(payouts["payout_requests"][0]["id"], payout["id"]);

    let id = payout["id"].as_u64().unwrap();
    let (status, resolved) = send(
        &app,
        request(
            Method::POST,
            &format!("/internal/payouts/{id}/resolve"),
            Auth::Billing,
            Some(json!({ "status": "completed", "note": "batch 7" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "completed");
    assert_eq!(resolved["resolution_note"], "batch 7");
}

#[tokio::test]
async fn test_missing_credentials_are_unauthorized() {
    let (_, app) = app(instant_settings());

    let (status, body) = send(
        &app,
        request(Method::GET, "/referral/stats", Auth::None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = send(
        &app,
        request(Method::GET, "/admin/referrals", Auth::User("mallory"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/internal/holds/release",
            Auth::User("mallory"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        request(Method::POST, "/internal/holds/release", Auth::Billing, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_without_configured_token() {
    let (_, app) = app_with(
        ServerConfig {
            tokens: AuthTokens::default(),
            ..config()
        },
        instant_settings(),
    );
    let (status, _) = send(
        &app,
        request(Method::GET, "/admin/referral-settings", Auth::Admin, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_review_over_http() {
    let (harness, app) = app(ReferralSettings {
        hold_days: 30,
        ..instant_settings()
    });
    let code = harness.code_for("alice");
    let first = harness
        .engine
        .attribute_signup(signup(&code, "bob"))
        .await
        .unwrap();
    let second = harness
        .engine
        .attribute_signup(signup(&code, "carol"))
        .await
        .unwrap();

    let (status, list) = send(
        &app,
        request(
            Method::GET,
            "/admin/referrals?status=pending&page=1&limit=1",
            Auth::Admin,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["referrals"][0]["id"], second.id);
    assert_eq!(list["summary"]["total"], 2);
    assert_eq!(list["pagination"]["total_pages"], 2);

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/admin/referrals?status=bogus",
            Auth::Admin,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (status, approved) = send(
        &app,
        request(
            Method::POST,
            &format!("/admin/referrals/{}/approve", first.id),
            Auth::Admin,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["approved_by"], "ops");

    let (status, rejected) = send(
        &app,
        request(
            Method::POST,
            &format!("/admin/referrals/{}/reject", second.id),
            Auth::Admin,
            Some(json!({ "reason": "duplicate" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "rejected");
    assert_eq!(rejected["rejection_reason"], "duplicate");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/admin/referrals/{}/approve", second.id),
            Auth::Admin,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");

    let (status, body) = send(
        &app,
        request(Method::POST, "/admin/referrals/999/mark-paid", Auth::Admin, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["resource"], "referral");

    let (status, rescanned) = send(
        &app,
        request(
            Method::POST,
            &format!("/admin/referrals/{}/fraud-scan", first.id),
            Auth::Admin,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rescanned["id"], first.id);
}

#[tokio::test]
async fn test_settings_over_http() {
    let (_, app) = app(instant_settings());

    let (status, settings) = send(
        &app,
        request(Method::GET, "/admin/referral-settings", Auth::Admin, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["version"], 1);
    assert_eq!(settings["hold_days"], 0);

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/admin/referral-settings",
            Auth::Admin,
            Some(json!({ "monthly_percent": 150 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_settings");

    let (status, updated) = send(
        &app,
        request(
            Method::PUT,
            "/admin/referral-settings",
            Auth::Admin,
            Some(json!({ "hold_days": 14, "is_active": false })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["hold_days"], 14);
    assert_eq!(updated["is_active"], false);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/internal/signups",
            Auth::Billing,
            Some(json!({ "referral_code": "ABCDEFGH", "referred_user_id": "bob" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "program_inactive");
}

#[tokio::test]
async fn test_unreferred_payment_returns_null_referral() {
    let (_, app) = app(instant_settings());
    let body = post_payment(&app, "pay-1", "stranger", 10_000).await;
    assert_eq!(body, json!({ "referral": null }));

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/internal/refunds",
            Auth::Billing,
            Some(json!({ "payment_id": "pay-1", "user_id": "stranger", "kind": "chargeback" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "referral": null }));
}

#[tokio::test]
async fn test_malformed_and_oversized_bodies() {
    let (_, app) = app_with(
        ServerConfig {
            http_body_limit_bytes: Some(256),
            ..config()
        },
        instant_settings(),
    );

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/internal/payments")
                .header("x-billing-token", BILLING)
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/internal/payments",
            Auth::Billing,
            Some(json!({
                "payment_id": "x".repeat(1_024),
                "user_id": "bob",
                "amount_cents": 1,
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "invalid_request");

    let (status, metrics) = send(
        &app,
        request(Method::GET, "/metrics/prometheus", Auth::None, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = metrics.as_str().unwrap();
    assert!(text.contains("referral_ledger_http_reject_body_limit_total 1\n"));
    assert!(text.contains("referral_ledger_http_internal_latency_ms_count 2\n"));
}

#[tokio::test]
async fn test_metrics_token_required_when_configured() {
    let (_, app) = app_with(
        ServerConfig {
            tokens: AuthTokens {
                metrics: Some("metrics-secret".to_string()),
                ..config().tokens
            },
            ..config()
        },
        instant_settings(),
    );
    let (status, _) = send(
        &app,
        request(Method::GET, "/metrics/prometheus", Auth::None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics/prometheus")
                .header("authorization", "Bearer metrics-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
