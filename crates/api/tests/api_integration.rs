//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::Providers;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use fulfillment::webhooks::signature;
use metrics_exporter_prometheus::PrometheusHandle;
use order_store::InMemoryOrderStore;
use providers::{
    BreakerConfig, CircuitBreaker, InMemoryFulfillmentProvider, InMemoryPaymentProvider,
};
use serde_json::{Value, json};
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_test";
const FULFILLMENT_TOKEN: &str = "ff-token";
const ADMIN_TOKEN: &str = "admin-token";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    payment: InMemoryPaymentProvider,
    fulfillment: InMemoryFulfillmentProvider,
}

fn setup() -> TestApp {
    let config = Config {
        payment_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        fulfillment_webhook_token: FULFILLMENT_TOKEN.to_string(),
        admin_token: Some(ADMIN_TOKEN.to_string()),
        ..Config::default()
    };
    let payment = InMemoryPaymentProvider::new();
    let fulfillment = InMemoryFulfillmentProvider::new();
    let providers = Providers {
        payment: Arc::new(payment.clone()),
        fulfillment: Arc::new(fulfillment.clone()),
        breakers: vec![
            Arc::new(CircuitBreaker::new("payment", BreakerConfig::default())),
            Arc::new(CircuitBreaker::new("fulfillment", BreakerConfig::default())),
        ],
    };

    let state = api::create_state(InMemoryOrderStore::new(), &providers, &config);
    let app = api::create_app(
        state,
        providers.breakers,
        get_metrics_handle(),
        Duration::from_secs(5),
    );

    TestApp {
        app,
        payment,
        fulfillment,
    }
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn checkout_request(items: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/checkout")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "email": "buyer@example.com",
                "name": "Jane Doe",
                "currency": "usd",
                "items": items,
                "shipping": {
                    "name": "Jane Doe",
                    "line1": "1 Main St",
                    "line2": null,
                    "city": "Springfield",
                    "state": "IL",
                    "postal_code": "62701",
                    "country": "US"
                }
            })
            .to_string(),
        ))
        .unwrap()
}

fn poster() -> Value {
    json!([{
        "product_name": "Poster",
        "variant_name": "A2",
        "quantity": 1,
        "unit_price": 2500,
        "fulfillment_variant_id": "sv-1"
    }])
}

fn signed_payment(body: &Value, secret: &str) -> Request<Body> {
    let body = body.to_string();
    let header = signature::sign(secret, chrono::Utc::now().timestamp(), body.as_bytes());
    Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("content-type", "application/json")
        .header("Stripe-Signature", header)
        .body(Body::from(body))
        .unwrap()
}

fn fulfillment_webhook(token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/fulfillment/{token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin_get(id: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(format!("/admin/orders/{id}"));
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn completed_event(event_id: &str, order_id: &str, session_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": session_id,
            "payment_status": "paid",
            "metadata": { "order_id": order_id }
        }}
    })
}

/// Checks out one poster and returns `(order_id, session_id)`.
async fn checkout(t: &TestApp) -> (String, String) {
    let (status, json) = send(&t.app, checkout_request(poster())).await;
    assert_eq!(status, StatusCode::CREATED);
    (
        json["order_id"].as_str().unwrap().to_string(),
        json["session_id"].as_str().unwrap().to_string(),
    )
}

async fn mark_session_paid(t: &TestApp, session_id: &str) {
    let mut session = t.payment.session(session_id).await.unwrap();
    session.payment_status = "paid".to_string();
    t.payment.put_session(session).await;
}

#[tokio::test]
async fn test_health_check() {
    let t = setup();

    let (status, json) = send(
        &t.app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["breakers"]["payment"], "closed");
    assert_eq!(json["breakers"]["fulfillment"], "closed");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = setup();

    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_checkout_creates_order() {
    let t = setup();

    let (status, json) = send(&t.app, checkout_request(poster())).await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(json["checkout_url"].as_str().unwrap().starts_with("https://"));
    let order_id = json["order_id"].as_str().unwrap();

    let (status, details) = send(&t.app, admin_get(order_id, Some(ADMIN_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["order"]["status"], "awaiting_payment");
    assert_eq!(details["items"].as_array().unwrap().len(), 1);
    assert_eq!(details["failures"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_checkout_with_no_items() {
    let t = setup();

    let (status, json) = send(&t.app, checkout_request(json!([]))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("no items"));
}

#[tokio::test]
async fn test_checkout_with_overflowing_total() {
    let t = setup();
    let items = json!([{
        "product_name": "Poster",
        "variant_name": "A2",
        "quantity": 3,
        "unit_price": i64::MAX / 2,
        "fulfillment_variant_id": "sv-1"
    }]);

    let (status, json) = send(&t.app, checkout_request(items)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("overflows"));
}

#[tokio::test]
async fn test_full_order_flow() {
    let t = setup();
    let (order_id, session_id) = checkout(&t).await;
    mark_session_paid(&t, &session_id).await;

    let event = completed_event("evt_1", &order_id, &session_id);
    let (status, json) = send(&t.app, signed_payment(&event, WEBHOOK_SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "processed");

    let (_, details) = send(&t.app, admin_get(&order_id, Some(ADMIN_TOKEN))).await;
    assert_eq!(details["order"]["status"], "submitted");
    assert_eq!(details["order"]["fulfillment_order_id"], "D1");

    let shipped = json!({
        "type": "package_shipped",
        "data": {
            "order": { "id": "D1" },
            "shipment": { "tracking_number": "TRK123", "tracking_url": "https://track.test/TRK123" }
        }
    });
    let (status, json) = send(&t.app, fulfillment_webhook(FULFILLMENT_TOKEN, &shipped)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "processed");

    let (status, json) = send(&t.app, fulfillment_webhook(FULFILLMENT_TOKEN, &shipped)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "duplicate");

    let (_, details) = send(&t.app, admin_get(&order_id, Some(ADMIN_TOKEN))).await;
    assert_eq!(details["order"]["status"], "fulfilled");
    assert_eq!(details["order"]["tracking_number"], "TRK123");
    assert_eq!(t.fulfillment.submit_calls().await, 1);
}

#[tokio::test]
async fn test_duplicate_payment_webhook() {
    let t = setup();
    let (order_id, session_id) = checkout(&t).await;
    mark_session_paid(&t, &session_id).await;
    let event = completed_event("evt_1", &order_id, &session_id);

    let (_, first) = send(&t.app, signed_payment(&event, WEBHOOK_SECRET)).await;
    let (status, second) = send(&t.app, signed_payment(&event, WEBHOOK_SECRET)).await;

    assert_eq!(first["outcome"], "processed");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "duplicate");
    assert_eq!(t.fulfillment.submit_calls().await, 1);
}

#[tokio::test]
async fn test_payment_webhook_bad_signature() {
    let t = setup();
    let event = completed_event("evt_1", "00000000-0000-0000-0000-000000000000", "cs_x");

    let (status, json) = send(&t.app, signed_payment(&event, "whsec_wrong")).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_payment_webhook_malformed_payload() {
    let t = setup();
    let event = json!({ "type": "checkout.session.completed" });

    let (status, _) = send(&t.app, signed_payment(&event, WEBHOOK_SECRET)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_fulfillment_webhook_wrong_token() {
    let t = setup();

    let (status, _) = send(
        &t.app,
        fulfillment_webhook("guess", &json!({ "type": "package_shipped" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fulfillment_webhook_unknown_event() {
    let t = setup();

    let (status, json) = send(
        &t.app,
        fulfillment_webhook(FULFILLMENT_TOKEN, &json!({ "type": "stock_updated", "data": {} })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "ignored");
}

#[tokio::test]
async fn test_admin_requires_token() {
    let t = setup();
    let (order_id, _) = checkout(&t).await;

    let (missing, _) = send(&t.app, admin_get(&order_id, None)).await;
    let (wrong, _) = send(&t.app, admin_get(&order_id, Some("nope"))).await;

    assert_eq!(missing, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_unknown_order() {
    let t = setup();

    let (status, _) = send(
        &t.app,
        admin_get("00000000-0000-0000-0000-000000000000", Some(ADMIN_TOKEN)),
    )
    .await;
    let (invalid, _) = send(&t.app, admin_get("not-a-uuid", Some(ADMIN_TOKEN))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(invalid, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_resubmit_unpaid_order() {
    let t = setup();
    let (order_id, _) = checkout(&t).await;

    let (status, json) = send(
        &t.app,
        Request::builder()
            .method("POST")
            .uri(format!("/admin/orders/{order_id}/resubmit"))
            .header("Authorization", format!("Bearer {ADMIN_TOKEN}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "not_eligible");
    assert_eq!(json["status"], "awaiting_payment");
    assert_eq!(t.fulfillment.submit_calls().await, 0);
}
