use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use delivery_dispatch::api::rest::router;
use delivery_dispatch::config::{Config, DispatchConfig};
use delivery_dispatch::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        http_port: 0,
        log_level: "warn".to_string(),
        event_buffer_size: 64,
        dispatch: DispatchConfig::default(),
    }
}

fn setup() -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(test_config()));
    (router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn register_driver(app: &axum::Router, lat: f64, lng: f64, rating: f64) -> Value {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/drivers",
            json!({
                "name": format!("driver-{rating}"),
                "vehicle": "motorcycle",
                "location": { "lat": lat, "lng": lng },
                "rating": rating
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn create_order(app: &axum::Router, pickup: (f64, f64), delivery: (f64, f64)) -> Value {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "pickup": { "lat": pickup.0, "lng": pickup.1 },
                "delivery": { "lat": delivery.0, "lng": delivery.1 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn assign(app: &axum::Router, order_id: &str) -> Value {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/assign"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_reports_counts() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["available_drivers"], 0);
    assert_eq!(body["assignments"], 0);
    assert_eq!(body["batches"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_assignments"));
}

#[tokio::test]
async fn register_driver_empty_name_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/drivers",
            json!({
                "name": "  ",
                "vehicle": "car",
                "location": { "lat": 24.7, "lng": 46.7 },
                "rating": 4.5
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn register_driver_bad_coordinates_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/drivers",
            json!({
                "name": "Marwan",
                "vehicle": "car",
                "location": { "lat": 95.0, "lng": 200.0 },
                "rating": 4.5
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn register_driver_rating_is_clamped() {
    let (app, _state) = setup();
    let driver = register_driver(&app, 24.7, 46.7, 9.9).await;
    assert_eq!(driver["rating"], 5.0);
    assert_eq!(driver["is_available"], true);
}

#[tokio::test]
async fn create_order_bad_coordinates_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "pickup": { "lat": -91.0, "lng": 46.7 },
                "delivery": { "lat": 24.7, "lng": 46.7 }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn assign_with_no_drivers_is_a_business_outcome() {
    let (app, state) = setup();
    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let order_id = order["id"].as_str().unwrap();

    let outcome = assign(&app, order_id).await;
    assert_eq!(outcome["outcome"], "no_drivers_available");
    assert!(state.assignments.is_empty());
}

#[tokio::test]
async fn full_delivery_flow_over_http() {
    let (app, _state) = setup();

    let driver = register_driver(&app, 24.7136, 46.6753, 4.8).await;
    let driver_id = driver["id"].as_str().unwrap().to_string();

    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    // Offer goes to the only driver.
    let outcome = assign(&app, &order_id).await;
    assert_eq!(outcome["outcome"], "assigned");
    let assignment = &outcome["assignment"];
    let assignment_id = assignment["id"].as_str().unwrap().to_string();
    assert_eq!(assignment["status"], "offered");
    assert_eq!(assignment["driver_id"], driver_id.as_str());

    // ETA is unavailable before the offer is accepted: no route yet.
    let response = app
        .clone()
        .oneshot(get_request(&format!("/assignments/{assignment_id}/eta")))
        .await
        .unwrap();
    let eta = body_json(response).await;
    assert_eq!(eta["status"], "unavailable");

    // Driver accepts; route and ETA appear.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/respond"),
            json!({ "driver_id": driver_id, "decision": "accept" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let accepted = body_json(response).await;
    assert_eq!(accepted["status"], "accepted");
    assert!(accepted["route"]["total_distance_km"].as_f64().unwrap() > 0.0);
    assert!(!accepted["eta"].is_null());

    let response = app
        .clone()
        .oneshot(get_request(&format!("/assignments/{assignment_id}/eta")))
        .await
        .unwrap();
    let eta = body_json(response).await;
    assert_eq!(eta["status"], "available");
    assert!(eta["minutes"].as_f64().unwrap() > 0.0);

    // Milestones and a location ping along the way.
    for status in ["en_route_to_pickup", "picked_up", "en_route_to_delivery"] {
        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/assignments/{assignment_id}/status"),
                json!({ "driver_id": driver_id, "status": status }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/location"),
            json!({ "location": { "lat": 24.7200, "lng": 46.6820 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let progress = body_json(response).await;
    assert!(progress["percent_complete"].as_f64().unwrap() > 0.0);

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/assignments/{assignment_id}/status"),
            json!({ "driver_id": driver_id, "status": "delivered" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let delivered = body_json(response).await;
    assert_eq!(delivered["status"], "delivered");
    assert_eq!(delivered["progress"]["percent_complete"], 100.0);

    // The delivery shows up in the KPI report.
    let response = app
        .clone()
        .oneshot(get_request("/reports/deliveries"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["total_assignments"], 1);
    assert_eq!(report["delivered"], 1);
    assert_eq!(report["per_driver"][0]["driver_id"], driver_id.as_str());
    assert_eq!(report["per_driver"][0]["completed"], 1);
}

#[tokio::test]
async fn decline_moves_the_offer_to_the_next_driver() {
    let (app, _state) = setup();

    let near = register_driver(&app, 24.7140, 46.6755, 4.0).await;
    let near_id = near["id"].as_str().unwrap().to_string();
    let far = register_driver(&app, 24.7250, 46.6850, 4.0).await;
    let far_id = far["id"].as_str().unwrap().to_string();

    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let outcome = assign(&app, order["id"].as_str().unwrap()).await;
    let assignment = &outcome["assignment"];
    let assignment_id = assignment["id"].as_str().unwrap().to_string();
    assert_eq!(assignment["driver_id"], near_id.as_str());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/respond"),
            json!({ "driver_id": near_id, "decision": "decline", "reason": "too_far" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let reoffered = body_json(response).await;
    assert_eq!(reoffered["status"], "offered");
    assert_eq!(reoffered["driver_id"], far_id.as_str());
    assert_eq!(reoffered["offers"].as_array().unwrap().len(), 2);

    // The superseded driver's late accept is rejected as stale.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/respond"),
            json!({ "driver_id": near_id, "decision": "accept" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "stale_response");
}

#[tokio::test]
async fn decline_without_reason_returns_400() {
    let (app, _state) = setup();
    let driver = register_driver(&app, 24.7136, 46.6753, 4.5).await;
    let driver_id = driver["id"].as_str().unwrap().to_string();
    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let outcome = assign(&app, order["id"].as_str().unwrap()).await;
    let assignment_id = outcome["assignment"]["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/respond"),
            json!({ "driver_id": driver_id, "decision": "decline" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn duplicate_assign_returns_conflict() {
    let (app, _state) = setup();
    register_driver(&app, 24.7136, 46.6753, 4.5).await;
    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let order_id = order["id"].as_str().unwrap();

    assign(&app, order_id).await;

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/assign"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "conflict");
}

#[tokio::test]
async fn batch_requires_at_least_two_orders() {
    let (app, _state) = setup();
    register_driver(&app, 24.7136, 46.6753, 4.5).await;
    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/orders/batch",
            json!({ "order_ids": [order["id"]] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn batch_groups_two_orders_into_one_run() {
    let (app, _state) = setup();
    let driver = register_driver(&app, 24.7136, 46.6753, 4.5).await;
    let driver_id = driver["id"].as_str().unwrap();

    let first = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let second = create_order(&app, (24.7120, 46.6750), (24.7400, 46.7000)).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/orders/batch",
            json!({ "order_ids": [first["id"], second["id"]] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["outcome"], "batched");
    assert_eq!(body["batch"]["driver_id"], driver_id);

    let assignments = body["assignments"].as_array().unwrap();
    assert_eq!(assignments.len(), 2);
    for assignment in assignments {
        assert_eq!(assignment["status"], "offered");
        assert_eq!(assignment["driver_id"], driver_id);
        assert_eq!(assignment["batch_id"], body["batch"]["id"]);
        // The shared route spans both orders' pickups and deliveries.
        assert_eq!(assignment["route"]["stops"].as_array().unwrap().len(), 4);
    }
}

#[tokio::test]
async fn optimize_route_orders_stops_and_sums_distance() {
    let (app, _state) = setup();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/routes/optimize",
            json!({
                "origin": { "lat": 0.0, "lng": 0.0 },
                "waypoints": [
                    { "lat": 0.0, "lng": 2.0 },
                    { "lat": 0.0, "lng": 1.0 }
                ]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let stops = body["ordered_stops"].as_array().unwrap();
    assert_eq!(stops.len(), 2);
    // Nearest first from the origin.
    assert_eq!(stops[0]["lng"], 1.0);
    assert_eq!(stops[1]["lng"], 2.0);
    let total = body["total_distance_km"].as_f64().unwrap();
    assert!((total - 222.4).abs() < 1.0);

    let response = app
        .oneshot(json_request(
            "POST",
            "/routes/optimize",
            json!({ "waypoints": [ { "lat": 0.0, "lng": 0.0 } ] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_is_terminal_and_idempotently_rejected() {
    let (app, _state) = setup();
    register_driver(&app, 24.7136, 46.6753, 4.5).await;
    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let outcome = assign(&app, order["id"].as_str().unwrap()).await;
    let assignment_id = outcome["assignment"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/cancel"),
            json!({ "reason": "customer cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "cancelled");

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/cancel"),
            json!({ "reason": "again" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn manual_exception_is_recorded_without_state_change() {
    let (app, _state) = setup();
    let driver = register_driver(&app, 24.7136, 46.6753, 4.5).await;
    let driver_id = driver["id"].as_str().unwrap().to_string();
    let order = create_order(&app, (24.7118, 46.6749), (24.7300, 46.6900)).await;
    let outcome = assign(&app, order["id"].as_str().unwrap()).await;
    let assignment_id = outcome["assignment"]["id"].as_str().unwrap().to_string();

    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/respond"),
            json!({ "driver_id": driver_id, "decision": "accept" }),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/assignments/{assignment_id}/exceptions"),
            json!({ "kind": "failed_handoff", "details": "customer not answering" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["exceptions"].as_array().unwrap().len(), 1);
    assert_eq!(body["exceptions"][0]["kind"], "failed_handoff");
}
