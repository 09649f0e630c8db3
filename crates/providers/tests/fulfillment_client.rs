//! HTTP contract tests for the fulfillment client against a mock provider.

use std::sync::Arc;
use std::time::Duration;

use domain::{CustomerContact, Money, NewOrderItem, Order, OrderItem, ShippingAddress};
use providers::{
    BreakerConfig, CircuitBreaker, CircuitState, FulfillmentClient, FulfillmentClientConfig,
    FulfillmentProvider, ProviderError,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_order() -> (Order, Vec<OrderItem>) {
    Order::create(
        CustomerContact::new("buyer@example.com", "Jane Doe"),
        "usd",
        Some(ShippingAddress {
            name: "Jane Doe".into(),
            line1: "1 Main St".into(),
            line2: None,
            city: "Springfield".into(),
            state: Some("IL".into()),
            postal_code: "62701".into(),
            country: "US".into(),
        }),
        vec![NewOrderItem::new("Poster", "A2", 1, Money::from_minor(2500), "4711")],
    )
    .unwrap()
}

fn client(server: &MockServer, max_failures: u32, timeout: Duration) -> FulfillmentClient {
    let breaker = Arc::new(CircuitBreaker::new(
        "fulfillment",
        BreakerConfig {
            max_failures,
            ..BreakerConfig::default()
        },
    ));
    FulfillmentClient::new(
        FulfillmentClientConfig {
            base_url: server.uri(),
            api_key: "pf_key".into(),
            timeout,
        },
        breaker,
    )
    .unwrap()
}

#[tokio::test]
async fn submit_order_returns_provider_id() {
    let server = MockServer::start().await;
    let (order, items) = sample_order();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("authorization", "Bearer pf_key"))
        .and(body_partial_json(json!({
            "external_id": order.id().to_string(),
            "recipient": {"address1": "1 Main St", "country_code": "US", "zip": "62701"},
            "items": [{"sync_variant_id": "4711", "quantity": 1, "retail_price": "25.00"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "result": {"id": 98765, "status": "draft"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, 5, Duration::from_secs(5));
    let id = client.submit_order(&order, &items).await.unwrap();

    assert_eq!(id, "98765");
}

#[tokio::test]
async fn client_error_is_permanent_and_carries_message() {
    let server = MockServer::start().await;
    let (order, items) = sample_order();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": 400,
            "error": {"reason": "BadRequest", "message": "Invalid variant"}
        })))
        .mount(&server)
        .await;

    let client = client(&server, 5, Duration::from_secs(5));
    let err = client.submit_order(&order, &items).await.unwrap_err();

    assert_eq!(
        err,
        ProviderError::Http {
            status: 400,
            message: "Invalid variant".into()
        }
    );
    assert!(!err.is_retryable());
    assert_eq!(client.breaker().consecutive_failures(), 1);
}

#[tokio::test]
async fn malformed_success_body_is_a_failure() {
    let server = MockServer::start().await;
    let (order, items) = sample_order();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = client(&server, 5, Duration::from_secs(5));
    let err = client.submit_order(&order, &items).await.unwrap_err();

    assert!(matches!(err, ProviderError::Decode(_)));
    assert_eq!(client.breaker().consecutive_failures(), 1);
}

#[tokio::test]
async fn repeated_server_errors_open_the_breaker() {
    let server = MockServer::start().await;
    let (order, items) = sample_order();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = client(&server, 3, Duration::from_secs(5));
    for _ in 0..3 {
        let err = client.submit_order(&order, &items).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(client.breaker().state(), CircuitState::Open);

    // Fourth call never reaches the server; `expect(3)` verifies that on drop.
    let err = client.submit_order(&order, &items).await.unwrap_err();
    assert!(err.is_rejection());
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    let (order, items) = sample_order();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"code": 200, "result": {"id": 1}}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let client = client(&server, 5, Duration::from_millis(200));
    let err = client.submit_order(&order, &items).await.unwrap_err();

    assert_eq!(err, ProviderError::Timeout);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn confirm_order_posts_to_confirm_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/orders/98765/confirm"))
        .and(header("authorization", "Bearer pf_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "result": {"id": 98765, "status": "pending"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, 5, Duration::from_secs(5));
    client.confirm_order("98765").await.unwrap();
}

#[tokio::test]
async fn order_without_address_is_not_sent() {
    let server = MockServer::start().await;
    let (order, items) = Order::create(
        CustomerContact::new("buyer@example.com", "Jane Doe"),
        "usd",
        None,
        vec![NewOrderItem::new("Poster", "A2", 1, Money::from_minor(2500), "4711")],
    )
    .unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server, 5, Duration::from_secs(5));
    let err = client.submit_order(&order, &items).await.unwrap_err();

    assert!(matches!(err, ProviderError::InvalidRequest(_)));
    assert_eq!(client.breaker().consecutive_failures(), 0);
}
