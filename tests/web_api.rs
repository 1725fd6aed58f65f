use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use printer_link::config::Config;
use printer_link::printer::Printer;
use printer_link::serial::mock::{mock_pair, spawn_simulator};
use printer_link::web::api::create_router;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn printer() -> Arc<Printer> {
    let (transport, firmware) = mock_pair();
    spawn_simulator(firmware);
    let mut config = Config::default();
    config.queue.idle_poll_ms = 10;
    config.queue.instruction_timeout_ms = 500;
    config.telemetry.interval_ms = 60_000;
    Arc::new(Printer::new(config, Box::new(transport)).unwrap())
}

async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_status_reports_ready() {
    let printer = printer();
    let app = create_router(printer.clone());
    let (status, body) = call(app, Method::GET, "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "READY");
    assert_eq!(body["details"]["busy"], false);
    assert_eq!(body["pending_instructions"], 0);
    assert_eq!(body["printer"], Value::Null);
}

#[tokio::test]
async fn test_telemetry_missing_before_first_publish() {
    let app = create_router(printer());
    let (status, body) = call(app, Method::GET, "/api/v1/telemetry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_gcode_round_trip() {
    let printer = printer();
    printer.start().unwrap();
    let app = create_router(printer.clone());

    let request = json!({
        "command": "M115",
        "expect": r"^FIRMWARE_NAME:Prusa-Firmware ?((\d+\.)*\d)",
        "front": true
    });
    let (status, body) = call(app, Method::POST, "/api/v1/gcode", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "CONFIRMED");
    assert_eq!(body["groups"][0], "3.10.0");
    printer.shutdown().await;
}

#[tokio::test]
async fn test_gcode_rejects_bad_input() {
    let app = create_router(printer());
    let (status, _) = call(
        app.clone(),
        Method::POST,
        "/api/v1/gcode",
        Some(json!({ "command": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        app,
        Method::POST,
        "/api/v1/gcode",
        Some(json!({ "command": "M105", "expect": "(" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Invalid expect pattern"));
}

#[tokio::test]
async fn test_gcode_conflicts_with_exclusive_write() {
    let printer = printer();
    let app = create_router(printer.clone());
    let _link = printer.queue().acquire_exclusive_write().await;

    let (status, _) = call(
        app.clone(),
        Method::POST,
        "/api/v1/gcode",
        Some(json!({ "command": "M105" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = call(app, Method::GET, "/api/v1/status", None).await;
    assert_eq!(body["exclusive_write"], true);
}

#[tokio::test]
async fn test_override_set_and_cleared() {
    let app = create_router(printer());
    let (status, body) = call(
        app.clone(),
        Method::PUT,
        "/api/v1/override",
        Some(json!({ "state": "ATTENTION" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ATTENTION");
    assert_eq!(body["details"]["override_state"], "ATTENTION");

    let (status, body) = call(app, Method::DELETE, "/api/v1/override", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "READY");
}

#[tokio::test]
async fn test_job_controls_without_a_print() {
    let app = create_router(printer());
    for uri in ["/api/v1/pause", "/api/v1/resume", "/api/v1/cancel"] {
        let (status, _) = call(app.clone(), Method::POST, uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT, "{}", uri);
    }

    let (status, _) = call(
        app,
        Method::POST,
        "/api/v1/job",
        Some(json!({ "path": "/nonexistent/file.gcode" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
