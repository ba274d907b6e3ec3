//! API route definitions: tests, runs, properties, schedule, terminate.

use crate::api::state::AppState;
use crate::error::{AppError, AppResult};
use crate::model::{RunState, RunSummary, TestRecord};
use crate::props::PropertyView;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tests", get(list_tests).post(create_test))
        .route(
            "/tests/{test}",
            get(get_test).put(update_test).delete(delete_test),
        )
        .route("/tests/{test}/props", get(list_test_props))
        .route(
            "/tests/{test}/props/{key}",
            get(get_test_prop).put(set_test_prop),
        )
        .route("/tests/{test}/runs", get(list_runs).post(create_run))
        .route(
            "/tests/{test}/runs/{run}",
            get(get_run).put(update_run).delete(delete_run),
        )
        .route("/tests/{test}/runs/{run}/summary", get(run_summary))
        .route("/tests/{test}/runs/{run}/state", get(run_state))
        .route("/tests/{test}/runs/{run}/schedule", post(schedule_run))
        .route("/tests/{test}/runs/{run}/terminate", post(terminate_run))
        .route("/tests/{test}/runs/{run}/props", get(list_run_props))
        .route(
            "/tests/{test}/runs/{run}/props/{key}",
            get(get_run_prop).put(set_run_prop),
        )
}

#[derive(Deserialize)]
struct Paging {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_count")]
    count: i64,
    state: Option<String>,
}

fn default_count() -> i64 {
    50
}

#[derive(Deserialize)]
struct TestDetails {
    name: String,
    description: Option<String>,
    copy_of: Option<String>,
    version: Option<i64>,
}

#[derive(Deserialize)]
struct TestUpdate {
    name: String,
    description: Option<String>,
    version: i64,
}

#[derive(Deserialize)]
struct RunDetails {
    name: String,
    description: Option<String>,
    copy_of: Option<String>,
    version: Option<i64>,
}

#[derive(Deserialize)]
struct RunUpdate {
    name: String,
    description: Option<String>,
    version: i64,
}

#[derive(Deserialize)]
struct ScheduleDetails {
    scheduled: Option<i64>,
    version: i64,
}

#[derive(Deserialize)]
struct PropSet {
    value: String,
    version: i64,
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ----- tests --------------------------------------------------------------

async fn list_tests(
    State(state): State<AppState>,
    Query(paging): Query<Paging>,
) -> AppResult<Json<Vec<TestRecord>>> {
    Ok(Json(state.dao.list_tests(paging.skip, paging.count)?))
}

async fn create_test(
    State(state): State<AppState>,
    Json(details): Json<TestDetails>,
) -> AppResult<Json<Value>> {
    let test = state.dao.create_test(
        &details.name,
        details.description.as_deref(),
        details.copy_of.as_deref(),
        details.version,
    )?;
    let props = state.props.list(&test.name, None)?;
    Ok(Json(test_with_props(test, props)))
}

async fn get_test(
    State(state): State<AppState>,
    Path(test): Path<String>,
) -> AppResult<Json<Value>> {
    let rec = state.dao.get_test(&test)?;
    let props = state.props.list(&test, None)?;
    Ok(Json(test_with_props(rec, props)))
}

async fn update_test(
    State(state): State<AppState>,
    Path(test): Path<String>,
    Json(update): Json<TestUpdate>,
) -> AppResult<Json<TestRecord>> {
    Ok(Json(state.dao.update_test(
        &test,
        &update.name,
        update.description.as_deref(),
        update.version,
    )?))
}

async fn delete_test(
    State(state): State<AppState>,
    Path(test): Path<String>,
) -> AppResult<Json<Value>> {
    state.dao.delete_test(&test)?;
    Ok(Json(json!({ "deleted": test })))
}

fn test_with_props(test: TestRecord, props: Vec<PropertyView>) -> Value {
    json!({
        "name": test.name,
        "version": test.version,
        "description": test.description,
        "created_at": test.created_at,
        "properties": props,
    })
}

// ----- runs ---------------------------------------------------------------

async fn list_runs(
    State(state): State<AppState>,
    Path(test): Path<String>,
    Query(paging): Query<Paging>,
) -> AppResult<Json<Vec<RunSummary>>> {
    let filter = match paging.state.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<RunState>()
                .map_err(AppError::Validation)?,
        ),
        None => None,
    };
    let runs = state.dao.list_runs(&test, paging.skip, paging.count, filter)?;
    Ok(Json(runs.iter().map(|r| r.summary()).collect()))
}

async fn create_run(
    State(state): State<AppState>,
    Path(test): Path<String>,
    Json(details): Json<RunDetails>,
) -> AppResult<Json<Value>> {
    let run = state.dao.create_run(
        &test,
        &details.name,
        details.description.as_deref(),
        details.copy_of.as_deref(),
        details.version,
    )?;
    let props = state.props.list(&test, Some(&run.name))?;
    Ok(Json(json!({
        "summary": run.summary(),
        "properties": props,
    })))
}

async fn get_run(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let rec = state.dao.get_run(&test, &run)?;
    let props = state.props.list(&test, Some(&run))?;
    Ok(Json(json!({
        "summary": rec.summary(),
        "properties": props,
    })))
}

async fn update_run(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
    Json(update): Json<RunUpdate>,
) -> AppResult<Json<RunSummary>> {
    let rec = state.dao.update_run(
        &test,
        &run,
        &update.name,
        update.description.as_deref(),
        update.version,
    )?;
    Ok(Json(rec.summary()))
}

async fn delete_run(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    state.dao.delete_run(&test, &run)?;
    Ok(Json(json!({ "deleted": format!("{test}.{run}") })))
}

async fn run_summary(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
) -> AppResult<Json<RunSummary>> {
    Ok(Json(state.dao.get_run(&test, &run)?.summary()))
}

async fn run_state(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let rec = state.dao.get_run(&test, &run)?;
    Ok(Json(json!({ "state": rec.state().to_string() })))
}

async fn schedule_run(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
    Json(details): Json<ScheduleDetails>,
) -> AppResult<Json<RunSummary>> {
    let scheduled = details
        .scheduled
        .ok_or_else(|| AppError::Validation("'scheduled' is required".into()))?;
    let rec = state
        .dao
        .schedule_run(&test, &run, scheduled, details.version)?;
    // React immediately if the run is already due
    state.monitor.force_poke().await?;
    Ok(Json(rec.summary()))
}

async fn terminate_run(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
) -> AppResult<Json<RunSummary>> {
    let rec = state.monitor.terminate(&test, &run).await?;
    Ok(Json(rec.summary()))
}

// ----- properties ---------------------------------------------------------

async fn list_test_props(
    State(state): State<AppState>,
    Path(test): Path<String>,
) -> AppResult<Json<Vec<PropertyView>>> {
    Ok(Json(state.props.list(&test, None)?))
}

async fn get_test_prop(
    State(state): State<AppState>,
    Path((test, key)): Path<(String, String)>,
) -> AppResult<Json<PropertyView>> {
    Ok(Json(state.props.get(&test, None, &key)?))
}

async fn set_test_prop(
    State(state): State<AppState>,
    Path((test, key)): Path<(String, String)>,
    Json(body): Json<PropSet>,
) -> AppResult<Json<PropertyView>> {
    Ok(Json(state.props.set(&test, None, &key, &body.value, body.version)?))
}

async fn list_run_props(
    State(state): State<AppState>,
    Path((test, run)): Path<(String, String)>,
) -> AppResult<Json<Vec<PropertyView>>> {
    Ok(Json(state.props.list(&test, Some(&run))?))
}

async fn get_run_prop(
    State(state): State<AppState>,
    Path((test, run, key)): Path<(String, String, String)>,
) -> AppResult<Json<PropertyView>> {
    Ok(Json(state.props.get(&test, Some(&run), &key)?))
}

async fn set_run_prop(
    State(state): State<AppState>,
    Path((test, run, key)): Path<(String, String, String)>,
    Json(body): Json<PropSet>,
) -> AppResult<Json<PropertyView>> {
    Ok(Json(
        state
            .props
            .set(&test, Some(&run), &key, &body.value, body.version)?,
    ))
}
