use std::time::Duration;

use arfind_api::{
    errors::ServiceError,
    services::payments::{
        ExternalReference, MercadoPagoClient, PaymentGateway, PreferenceItem, PreferenceRequest,
    },
};
use assert_matches::assert_matches;
use serde_json::json;
use uuid::Uuid;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn client(server: &MockServer, token: Option<&str>) -> MercadoPagoClient {
    MercadoPagoClient::new(
        server.uri(),
        token.map(str::to_string),
        Duration::from_secs(5),
    )
    .expect("client")
}

#[tokio::test]
async fn fetches_payment_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/123456"))
        .and(header("authorization", "Bearer TEST-TOKEN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 123456,
            "status": "approved",
            "external_reference": "{\"idProducto\":\"x\"}",
            "transaction_amount": 17000
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payment = client(&server, Some("TEST-TOKEN"))
        .get_payment("123456")
        .await
        .unwrap();
    assert_eq!(payment.id, "123456");
    assert!(payment.is_approved());
    assert_eq!(
        payment.external_reference.as_deref(),
        Some("{\"idProducto\":\"x\"}")
    );
}

#[tokio::test]
async fn provider_errors_become_external_service_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/404404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "not found" })))
        .mount(&server)
        .await;

    let err = client(&server, Some("TEST-TOKEN"))
        .get_payment("404404")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}

#[tokio::test]
async fn missing_token_fails_without_calling_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server, None).get_payment("1").await.unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}

#[tokio::test]
async fn creates_preference_with_checkout_rules() {
    let server = MockServer::start().await;
    let product_id = Uuid::new_v4();
    let plan_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/checkout/preferences"))
        .and(header("authorization", "Bearer TEST-TOKEN"))
        .and(body_partial_json(json!({
            "auto_return": "approved",
            "back_urls": { "success": "tuapp://retorno-pago?estado=exitoso" },
            "payment_methods": { "installments": 1 },
            "notification_url": "https://api.arfind.test/api/v1/webhooks/payments"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "pref-42",
            "init_point": "https://www.mercadopago.com.ar/checkout/v1/redirect?pref_id=pref-42",
            "collector_id": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = PreferenceRequest {
        items: vec![PreferenceItem {
            title: "Tracker Mini".into(),
            description: "Mini GPS".into(),
            picture_url: None,
            quantity: 1,
            currency_id: "ARS".into(),
            unit_price: 15000.0,
        }],
        external_reference: ExternalReference {
            product_id,
            plan_id,
            user_id: "buyer".into(),
        },
        return_url: "tuapp://retorno-pago".into(),
        notification_url: Some("https://api.arfind.test/api/v1/webhooks/payments".into()),
    };

    let preference = client(&server, Some("TEST-TOKEN"))
        .create_preference(&request)
        .await
        .unwrap();
    assert_eq!(preference.id, "pref-42");
    assert!(preference.init_point.ends_with("pref_id=pref-42"));
}
