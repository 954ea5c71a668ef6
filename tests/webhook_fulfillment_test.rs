mod common;

use arfind_api::{
    entities::{device, notification, order, outbox_event, processed_payment},
    services::orders::{FulfillmentOutcome, FulfillmentRequest},
};
use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use common::{body_json, external_reference, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn approved_payment_creates_order_and_reserves_oldest_device() {
    let app = TestApp::new().await;
    app.seed_order_created_type().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    let newer = app.seed_device(product.id, "1155550002", 5).await;
    let oldest = app.seed_device(product.id, "1155550001", 30).await;

    app.gateway.script_payment(
        "tx1",
        "approved",
        Some(external_reference(product.id, plan.id, "u1")),
    );

    let response = app.deliver_webhook("tx1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "FULFILLED");

    let orders = order::Entity::find().all(&*app.state.db).await.unwrap();
    assert_eq!(orders.len(), 1);
    let created = &orders[0];
    assert_eq!(created.user_id, "u1");
    assert_eq!(created.device_id, oldest.id);
    assert_eq!(created.payment_id.as_deref(), Some("tx1"));
    assert!(!created.delivered);
    assert_eq!(
        body["outcome"]["order_id"],
        json!(created.id.to_string())
    );
    let delivery = created.delivery_date.expect("delivery date");
    assert_eq!((delivery - created.created_at).num_days(), 5);

    let reserved = device::Entity::find_by_id(oldest.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reserved.owner_id.as_deref(), Some("u1"));
    assert_eq!(reserved.plan_id, Some(plan.id));
    let untouched = device::Entity::find_by_id(newer.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(untouched.owner_id.is_none());

    assert!(processed_payment::Entity::find_by_id("tx1".to_string())
        .one(&*app.state.db)
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        outbox_event::Entity::find().count(&*app.state.db).await.unwrap(),
        1
    );

    let report = app.drain_outbox().await;
    assert_eq!(report.delivered, 1);

    let messages = notification::Entity::find()
        .filter(notification::Column::UserId.eq("u1"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].device_id, Some(oldest.id));
    assert!(messages[0].message.contains("Tracker Mini"));
    assert!(messages[0].message.contains("Basico"));
    assert!(messages[0].message.contains("1155550001"));
    assert!(!messages[0].message.contains("{{"));
}

#[tokio::test]
async fn redelivered_payment_is_a_no_op() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    app.seed_device(product.id, "1155550001", 30).await;
    app.seed_device(product.id, "1155550002", 20).await;
    app.gateway.script_payment(
        "tx1",
        "approved",
        Some(external_reference(product.id, plan.id, "u1")),
    );

    let first = body_json(app.deliver_webhook("tx1").await).await;
    assert_eq!(first["status"], "FULFILLED");

    let second = app.deliver_webhook("tx1").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await["status"], "DEDUPED");

    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 1);
    assert_eq!(
        outbox_event::Entity::find().count(&*app.state.db).await.unwrap(),
        1
    );
    let owned = device::Entity::find()
        .filter(device::Column::OwnerId.is_not_null())
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(owned, 1);
    // The marker short-circuits before the provider is asked again.
    assert_eq!(app.gateway.lookups(), 1);
}

#[tokio::test]
async fn duplicate_payment_inside_the_transaction_is_already_processed() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    app.seed_device(product.id, "1155550001", 30).await;
    app.seed_device(product.id, "1155550002", 20).await;

    // Two deliveries that both passed the pre-check race into fulfillment.
    let request = FulfillmentRequest {
        product_id: product.id,
        plan_id: plan.id,
        user_id: "u1".to_string(),
        delivery_address: None,
        payment_id: Some("tx1".to_string()),
    };
    let orders = &app.state.services.orders;
    let first = orders.fulfill(request.clone()).await.unwrap();
    assert_matches!(first, FulfillmentOutcome::Created(_));
    let second = orders.fulfill(request).await.unwrap();
    assert_eq!(second, FulfillmentOutcome::AlreadyProcessed);

    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 1);
    assert_eq!(
        outbox_event::Entity::find().count(&*app.state.db).await.unwrap(),
        1
    );
    let owned = device::Entity::find()
        .filter(device::Column::OwnerId.is_not_null())
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(owned, 1);
}

#[tokio::test]
async fn out_of_stock_leaves_no_trace_so_the_provider_can_retry() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Pro", dec!(30000)).await;
    let plan = app.seed_plan("Premium", dec!(5000), 4).await;
    app.gateway.script_payment(
        "p2",
        "approved",
        Some(external_reference(product.id, plan.id, "u2")),
    );

    let response = app.deliver_webhook("p2").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["status"], "FAILED");

    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
    assert_eq!(
        processed_payment::Entity::find().count(&*app.state.db).await.unwrap(),
        0
    );
    assert_eq!(
        outbox_event::Entity::find().count(&*app.state.db).await.unwrap(),
        0
    );

    // Stock arrives; the provider's retry now succeeds.
    app.seed_device(product.id, "1155550009", 1).await;
    let retry = body_json(app.deliver_webhook("p2").await).await;
    assert_eq!(retry["status"], "FULFILLED");
}

#[tokio::test]
async fn owned_devices_are_never_reassigned() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    let taken = app
        .seed_owned_device(product.id, plan.id, "someone-else", "1155550077")
        .await;
    app.gateway.script_payment(
        "tx9",
        "approved",
        Some(external_reference(product.id, plan.id, "u3")),
    );

    let body = body_json(app.deliver_webhook("tx9").await).await;
    assert_eq!(body["status"], "FAILED");

    let still = device::Entity::find_by_id(taken.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.owner_id.as_deref(), Some("someone-else"));
}

#[tokio::test]
async fn rejected_payment_writes_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    app.seed_device(product.id, "1155550001", 30).await;
    app.gateway.script_payment(
        "tx-r",
        "rejected",
        Some(external_reference(product.id, plan.id, "u1")),
    );

    let response = app.deliver_webhook("tx-r").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "REJECTED");
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
    assert_eq!(
        processed_payment::Entity::find().count(&*app.state.db).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn malformed_external_reference_fails() {
    let app = TestApp::new().await;
    app.gateway
        .script_payment("tx-bad", "approved", Some("{\"idProducto\":\"nope\"}".into()));

    let response = app.deliver_webhook("tx-bad").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["status"], "FAILED");
}

#[tokio::test]
async fn non_payment_topics_are_ignored() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/webhooks/payments?topic=merchant_order&id=77",
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ignored");
    assert_eq!(app.gateway.lookups(), 0);
}

#[tokio::test]
async fn payment_id_is_required() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/webhooks/payments",
            Some(json!({ "type": "payment", "data": {} })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn query_string_notifications_are_accepted() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    app.seed_device(product.id, "1155550001", 30).await;
    app.gateway.script_payment(
        "4242",
        "approved",
        Some(external_reference(product.id, plan.id, "u1")),
    );

    let response = app
        .request(
            Method::POST,
            "/api/v1/webhooks/payments?topic=payment&id=4242",
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "FULFILLED");
}

#[tokio::test]
async fn shared_secret_is_enforced_when_configured() {
    let app = TestApp::with_config(|cfg| {
        cfg.payment_webhook_secret = Some("hook-secret".to_string());
    })
    .await;
    app.gateway.script_payment("tx-s", "rejected", None);
    let body = json!({ "type": "payment", "data": { "id": "tx-s" } });

    let missing = app
        .request(Method::POST, "/api/v1/webhooks/payments", Some(body.clone()), None)
        .await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .request_with_headers(
            Method::POST,
            "/api/v1/webhooks/payments",
            Some(body.clone()),
            None,
            &[("x-webhook-key", "not-it")],
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = app
        .request_with_headers(
            Method::POST,
            "/api/v1/webhooks/payments",
            Some(body),
            None,
            &[("x-webhook-key", "hook-secret")],
        )
        .await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(body_json(ok).await["status"], "REJECTED");
}

#[tokio::test]
async fn immediate_ack_processes_in_the_background() {
    let app = TestApp::with_config(|cfg| cfg.payment_webhook_ack_immediately = true).await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    app.seed_device(product.id, "1155550001", 30).await;
    app.gateway.script_payment(
        "tx-bg",
        "approved",
        Some(external_reference(product.id, plan.id, "u1")),
    );

    let response = app.deliver_webhook("tx-bg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "accepted");

    let mut orders = 0;
    for _ in 0..50 {
        orders = order::Entity::find().count(&*app.state.db).await.unwrap();
        if orders == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(orders, 1);
}

#[tokio::test]
async fn delivery_is_recorded_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let plan = app.seed_plan("Basico", dec!(2000), 2).await;
    app.seed_device(product.id, "1155550001", 30).await;
    let admin = app.admin_token();

    let created = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "product_id": product.id,
                "plan_id": plan.id,
                "user_id": "walk-in",
                "delivery_address": "Av. Siempre Viva 742"
            })),
            Some(&admin),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let order = body_json(created).await["data"].clone();
    assert_eq!(order["delivery_address"], "Av. Siempre Viva 742");
    let id = order["id"].as_str().unwrap().to_string();

    let deliver_uri = format!("/api/v1/orders/{}/deliver", id);
    let first = app
        .request(Method::POST, &deliver_uri, None, Some(&admin))
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    let delivered = body_json(first).await["data"].clone();
    assert_eq!(delivered["delivered"], true);
    assert!(!delivered["delivered_at"].is_null());

    let second = app
        .request(Method::POST, &deliver_uri, None, Some(&admin))
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let customer = app.user_token("walk-in");
    let stranger = app.user_token("stranger");
    let order_uri = format!("/api/v1/orders/{}", id);
    assert_eq!(
        app.request(Method::GET, &order_uri, None, Some(&customer))
            .await
            .status(),
        StatusCode::OK
    );
    assert_eq!(
        app.request(Method::GET, &order_uri, None, Some(&stranger))
            .await
            .status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        app.request(Method::POST, &deliver_uri, None, Some(&stranger))
            .await
            .status(),
        StatusCode::FORBIDDEN
    );
}
