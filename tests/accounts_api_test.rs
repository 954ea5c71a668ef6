mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn notification_types_render_into_user_messages() {
    let app = TestApp::new().await;
    let admin = app.admin_token();

    let created = app
        .request(
            Method::POST,
            "/api/v1/notification-types",
            Some(json!({
                "id": "nt-low-battery",
                "kind": "bateria_baja",
                "message_template": "{{nombre}} tiene {{nivel}}% de bateria. {{nombre}} necesita carga."
            })),
            Some(&admin),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate_kind = app
        .request(
            Method::POST,
            "/api/v1/notification-types",
            Some(json!({ "id": "nt-other", "kind": "bateria_baja", "message_template": "x" })),
            Some(&admin),
        )
        .await;
    assert_eq!(duplicate_kind.status(), StatusCode::CONFLICT);

    let user = app.user_token("u1");
    let empty_inbox = app
        .request(Method::GET, "/api/v1/notifications/mine", None, Some(&user))
        .await;
    assert_eq!(empty_inbox.status(), StatusCode::NOT_FOUND);

    let sent = app
        .request(
            Method::POST,
            "/api/v1/notifications",
            Some(json!({
                "user_id": "u1",
                "notification_type_id": "nt-low-battery",
                "params": { "nombre": "Mochila", "nivel": "15" }
            })),
            Some(&admin),
        )
        .await;
    assert_eq!(sent.status(), StatusCode::CREATED);
    assert_eq!(
        body_json(sent).await["data"]["message"],
        "Mochila tiene 15% de bateria. Mochila necesita carga."
    );

    let unknown_type = app
        .request(
            Method::POST,
            "/api/v1/notifications",
            Some(json!({ "user_id": "u1", "notification_type_id": "nt-missing" })),
            Some(&admin),
        )
        .await;
    assert_eq!(unknown_type.status(), StatusCode::NOT_FOUND);

    let inbox = app
        .request(Method::GET, "/api/v1/notifications/mine", None, Some(&user))
        .await;
    assert_eq!(inbox.status(), StatusCode::OK);
    assert_eq!(body_json(inbox).await["data"].as_array().unwrap().len(), 1);

    let not_admin = app
        .request(Method::GET, "/api/v1/notification-types", None, Some(&user))
        .await;
    assert_eq!(not_admin.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn notification_type_updates_and_deletes() {
    let app = TestApp::new().await;
    let admin = app.admin_token();
    app.seed_order_created_type().await;

    let empty = app
        .request(
            Method::PUT,
            "/api/v1/notification-types/nt-pedido",
            Some(json!({})),
            Some(&admin),
        )
        .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let updated = app
        .request(
            Method::PUT,
            "/api/v1/notification-types/nt-pedido",
            Some(json!({ "message_template": "Pedido de {{producto}} confirmado" })),
            Some(&admin),
        )
        .await;
    assert_eq!(updated.status(), StatusCode::OK);
    let body = body_json(updated).await["data"].clone();
    assert_eq!(body["kind"], "pedido_creado");
    assert_eq!(body["message_template"], "Pedido de {{producto}} confirmado");

    let missing = app
        .request(
            Method::PUT,
            "/api/v1/notification-types/nt-nope",
            Some(json!({ "kind": "otro" })),
            Some(&admin),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let deleted = app
        .request(
            Method::DELETE,
            "/api/v1/notification-types/nt-pedido",
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    let again = app
        .request(
            Method::DELETE,
            "/api/v1/notification-types/nt-pedido",
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn employees_can_see_every_order() {
    let app = TestApp::new().await;
    let admin = app.admin_token();

    let created = app
        .request(
            Method::POST,
            "/api/v1/employees",
            Some(json!({ "id": "staff-1", "email": "staff@arfind.test", "name": "Staff" })),
            Some(&admin),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);

    let bad_email = app
        .request(
            Method::POST,
            "/api/v1/employees",
            Some(json!({ "id": "staff-2", "email": "not-an-email", "name": "Staff" })),
            Some(&admin),
        )
        .await;
    assert_eq!(bad_email.status(), StatusCode::BAD_REQUEST);

    let duplicate = app
        .request(
            Method::POST,
            "/api/v1/employees",
            Some(json!({ "id": "staff-1", "email": "other@arfind.test", "name": "Other" })),
            Some(&admin),
        )
        .await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let staff = app.user_token("staff-1");
    let customer = app.user_token("customer-1");
    let as_staff = app.request(Method::GET, "/api/v1/orders", None, Some(&staff)).await;
    assert_eq!(as_staff.status(), StatusCode::OK);
    let as_customer = app
        .request(Method::GET, "/api/v1/orders", None, Some(&customer))
        .await;
    assert_eq!(as_customer.status(), StatusCode::FORBIDDEN);

    // Employees are not admins unless flagged.
    let listing = app
        .request(Method::GET, "/api/v1/employees", None, Some(&staff))
        .await;
    assert_eq!(listing.status(), StatusCode::FORBIDDEN);

    let renamed = app
        .request(
            Method::PUT,
            "/api/v1/employees/staff-1",
            Some(json!({ "name": "Staff Lead" })),
            Some(&admin),
        )
        .await;
    assert_eq!(renamed.status(), StatusCode::OK);
    assert_eq!(body_json(renamed).await["data"]["name"], "Staff Lead");

    let removed = app
        .request(Method::DELETE, "/api/v1/employees/staff-1", None, Some(&admin))
        .await;
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);
    let after = app.request(Method::GET, "/api/v1/orders", None, Some(&staff)).await;
    assert_eq!(after.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn customers_manage_their_own_profile() {
    let app = TestApp::new().await;
    let user = app.user_token("u1");

    let missing = app
        .request(Method::GET, "/api/v1/customers/me", None, Some(&user))
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let created = app
        .request(
            Method::POST,
            "/api/v1/customers/me",
            Some(json!({ "first_name": "Ana", "phone": "1155550000" })),
            Some(&user),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let profile = body_json(created).await["data"].clone();
    assert_eq!(profile["id"], "u1");
    assert_eq!(profile["email"], "u1@arfind.test");

    let again = app
        .request(Method::POST, "/api/v1/customers/me", Some(json!({})), Some(&user))
        .await;
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let empty = app
        .request(Method::PUT, "/api/v1/customers/me", Some(json!({})), Some(&user))
        .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let updated = app
        .request(
            Method::PUT,
            "/api/v1/customers/me",
            Some(json!({ "last_name": "Lopez" })),
            Some(&user),
        )
        .await;
    assert_eq!(updated.status(), StatusCode::OK);
    let body = body_json(updated).await["data"].clone();
    assert_eq!(body["first_name"], "Ana");
    assert_eq!(body["last_name"], "Lopez");
}

#[tokio::test]
async fn checkout_builds_a_preference_for_stocked_products() {
    let app = TestApp::new().await;
    let product = app.seed_product("Tracker Mini", dec!(15000)).await;
    let free_plan = app.seed_plan("Gratis", dec!(0), 0).await;
    let paid_plan = app.seed_plan("Premium", dec!(2500), 4).await;
    let user = app.user_token("buyer");

    let out_of_stock = app
        .request(
            Method::POST,
            "/api/v1/checkout/preference",
            Some(json!({ "product_id": product.id, "plan_id": paid_plan.id })),
            Some(&user),
        )
        .await;
    assert_eq!(out_of_stock.status(), StatusCode::NOT_FOUND);
    assert!(app.gateway.preferences().is_empty());

    app.seed_device(product.id, "1155550001", 5).await;

    let paid = app
        .request(
            Method::POST,
            "/api/v1/checkout/preference",
            Some(json!({ "product_id": product.id, "plan_id": paid_plan.id })),
            Some(&user),
        )
        .await;
    assert_eq!(paid.status(), StatusCode::CREATED);
    assert_eq!(
        body_json(paid).await["data"]["init_point"],
        "https://pay.test/checkout?pref_id=pref-test-1"
    );

    let free = app
        .request(
            Method::POST,
            "/api/v1/checkout/preference",
            Some(json!({ "product_id": product.id, "plan_id": free_plan.id })),
            Some(&user),
        )
        .await;
    assert_eq!(free.status(), StatusCode::CREATED);

    let sent = app.gateway.preferences();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].items.len(), 2);
    assert_eq!(sent[0].external_reference.user_id, "buyer");
    assert_eq!(sent[0].external_reference.plan_id, paid_plan.id);
    assert_eq!(sent[1].items.len(), 1);

    let anonymous = app
        .request(
            Method::POST,
            "/api/v1/checkout/preference",
            Some(json!({ "product_id": product.id, "plan_id": paid_plan.id })),
            None,
        )
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_reports_database_status() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["data"]["checks"]["database"], "healthy");
}
