//! REST façade tests: CRUD, masking, optimistic versions, and the
//! NOT_FOUND / CONFLICT / FORBIDDEN status contract.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use benchpilot::api::{self, state::AppState};
use benchpilot::lifecycle::Monitor;
use benchpilot::model::now_millis;
use benchpilot::props::{PropertyStore, MASK};
use benchpilot::storage::{open_pool, Dao};
use benchpilot::workload::SimWorkload;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct Api {
    _dir: TempDir,
    router: Router,
    dao: Dao,
}

fn api() -> Api {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("records.db");
    let pool = open_pool(db.to_str().unwrap()).unwrap();
    let dao = Dao::new(pool.clone());
    let props = PropertyStore::new(pool);
    let monitor = Monitor::new(dao.clone(), props.clone(), Arc::new(SimWorkload), 1);
    let router = api::router(AppState {
        dao: dao.clone(),
        props,
        monitor,
    });
    Api {
        _dir: dir,
        router,
        dao,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let req = match body {
        Some(v) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_empty_listings_are_empty_arrays() {
    let a = api();
    let (status, body) = send(&a.router, "GET", "/api/v1/tests", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    let (status, body) = send(&a.router, "GET", "/api/v1/tests/T1/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_create_test_masks_secrets_in_the_response() {
    let a = api();
    let (status, body) = send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1", "description": "A scenario test." })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "A scenario test.");

    let props = body["properties"].as_array().unwrap();
    let pwd = props
        .iter()
        .find(|p| p["key"] == "datastore.password")
        .unwrap();
    assert_eq!(pwd["default"], MASK);
    // The stored default never appears anywhere in the payload
    assert!(!body.to_string().contains("changeme"));
}

#[tokio::test]
async fn test_unknown_resources_are_not_found() {
    let a = api();
    let (status, _) = send(&a.router, "GET", "/api/v1/tests/Fred", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    let (status, _) = send(&a.router, "GET", "/api/v1/tests/T1/runs/Fred/summary", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&a.router, "GET", "/api/v1/tests/Fred/runs/01/summary", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_property_set_is_optimistic() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;

    let (status, body) = send(
        &a.router,
        "PUT",
        "/api/v1/tests/T1/props/process.count",
        Some(json!({ "value": "500", "version": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "500");
    assert_eq!(body["version"], 1);

    // Reusing version 0 must conflict and mutate nothing
    let (status, _) = send(
        &a.router,
        "PUT",
        "/api/v1/tests/T1/props/process.count",
        Some(json!({ "value": "900", "version": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (_, body) = send(&a.router, "GET", "/api/v1/tests/T1/props/process.count", None).await;
    assert_eq!(body["value"], "500");
}

#[tokio::test]
async fn test_run_properties_default_from_test_values() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    send(
        &a.router,
        "PUT",
        "/api/v1/tests/T1/props/process.count",
        Some(json!({ "value": "500", "version": 0 })),
    )
    .await;

    let (status, body) = send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs",
        Some(json!({ "name": "01", "description": "Run 01" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["state"], "NOT_SCHEDULED");
    let props = body["properties"].as_array().unwrap();
    let count = props.iter().find(|p| p["key"] == "process.count").unwrap();
    assert_eq!(count["default"], "500");
    assert_eq!(count["version"], 0);
}

#[tokio::test]
async fn test_schedule_validates_and_checks_versions() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs",
        Some(json!({ "name": "01" })),
    )
    .await;

    // Missing scheduled time
    let (status, _) = send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs/01/schedule",
        Some(json!({ "version": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Wrong version
    let (status, _) = send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs/01/schedule",
        Some(json!({ "scheduled": now_millis() + 60_000, "version": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Correct version: schedule far in the future so the poke cannot start it
    let at = now_millis() + 60_000;
    let (status, body) = send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs/01/schedule",
        Some(json!({ "scheduled": at, "version": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduled"], at);
    assert_eq!(body["state"], "SCHEDULED");

    let (_, body) = send(&a.router, "GET", "/api/v1/tests/T1/runs/01/state", None).await;
    assert_eq!(body["state"], "SCHEDULED");
}

#[tokio::test]
async fn test_terminate_unstarted_run_conflicts() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs",
        Some(json!({ "name": "01" })),
    )
    .await;
    let (status, _) = send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs/01/terminate",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_property_set_forbidden_once_started() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs",
        Some(json!({ "name": "01" })),
    )
    .await;
    // Force the record into STARTED through the DAO, bypassing the monitor
    let rec = a.dao.get_run("T1", "01").unwrap();
    a.dao.schedule_run("T1", "01", now_millis(), 0).unwrap();
    a.dao.mark_started(rec.id, now_millis()).unwrap();

    let (status, _) = send(
        &a.router,
        "PUT",
        "/api/v1/tests/T1/runs/01/props/process.count",
        Some(json!({ "value": "9", "version": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_copy_create_duplicates_properties_with_fresh_versions() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1", "description": "original" })),
    )
    .await;
    send(
        &a.router,
        "PUT",
        "/api/v1/tests/T1/props/process.count",
        Some(json!({ "value": "500", "version": 0 })),
    )
    .await;

    let (status, body) = send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1_CP", "copy_of": "T1", "version": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "original");
    let props = body["properties"].as_array().unwrap();
    let count = props.iter().find(|p| p["key"] == "process.count").unwrap();
    assert_eq!(count["value"], "500");
    assert_eq!(count["version"], 0);
}

#[tokio::test]
async fn test_delete_run_then_not_found() {
    let a = api();
    send(
        &a.router,
        "POST",
        "/api/v1/tests",
        Some(json!({ "name": "T1" })),
    )
    .await;
    send(
        &a.router,
        "POST",
        "/api/v1/tests/T1/runs",
        Some(json!({ "name": "01" })),
    )
    .await;

    let (status, _) = send(&a.router, "DELETE", "/api/v1/tests/T1/runs/01", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&a.router, "GET", "/api/v1/tests/T1/runs/01/summary", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
