//! HTTP surface over the control plane.
//!
//! Thin translation layer: each handler parses the request, calls one
//! control-plane or supervisor operation, and maps the outcome onto a
//! JSON payload. Failures always carry `success=false`, a human-readable
//! `error`, and a machine-matchable `error_code`; triggers answer `202`
//! before the execution finishes.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use cadence_control::{ControlPlane, TriggerError};
use cadence_state::{ProcessStatus, RunTrigger};
use cadence_supervisor::{ExecutionRequest, KillSignal, SupervisorError};
use cadence_task::{
    AgentModeConfig, LlmModeConfig, LoggingSpec, TaskDefinition, TaskMode, TaskRecord,
};


const DEFAULT_LIST_LIMIT: usize = 50;
const DEFAULT_LOG_PAGE_LIMIT: usize = 100;

pub fn build_gateway_router(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/api/tasks", get(handle_task_list).post(handle_task_create))
        .route(
            "/api/tasks/{id}",
            get(handle_task_get)
                .put(handle_task_update)
                .delete(handle_task_delete),
        )
        .route("/api/tasks/{id}/pause", post(handle_task_pause))
        .route("/api/tasks/{id}/resume", post(handle_task_resume))
        .route("/api/tasks/{id}/run", post(handle_task_run))
        .route("/api/tasks/{id}/status", get(handle_task_status))
        .route("/api/scheduler/sync", post(handle_scheduler_sync))
        .route("/api/scheduler/status", get(handle_scheduler_status))
        .route("/api/process/start", post(handle_process_start))
        .route("/api/process/list", get(handle_process_list))
        .route("/api/process/poll/{id}", get(handle_process_poll))
        .route("/api/process/log/{id}", get(handle_process_log))
        .route("/api/process/write/{id}", post(handle_process_write))
        .route("/api/process/submit/{id}", post(handle_process_submit))
        .route("/api/process/kill/{id}", post(handle_process_kill))
        .route("/api/runs", get(handle_run_list))
        .route("/api/runs/{id}", get(handle_run_get))
        .route("/api/runs/{id}/events", get(handle_run_events_deprecated))
        .with_state(control)
}

/// Serves the API until ctrl-c.
pub async fn run_gateway_server(bind_address: &str, control: Arc<ControlPlane>) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind gateway listener on {bind_address}"))?;
    let addr = listener
        .local_addr()
        .context("failed to resolve gateway listener address")?;
    info!(%addr, "gateway listening");
    let app = build_gateway_router(control);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server exited unexpectedly")
}

fn error_body(error: &str, error_code: &str) -> Value {
    json!({"success": false, "error": error, "error_code": error_code})
}

fn error_response(status: StatusCode, error: &str, error_code: &str) -> Response {
    (status, Json(error_body(error, error_code))).into_response()
}

fn internal_error(error: impl std::fmt::Display) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &error.to_string(),
        "internal_error",
    )
}

fn trigger_error_response(error: &TriggerError) -> Response {
    let status = match error {
        TriggerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        TriggerError::TaskInvalid { .. } | TriggerError::TaskDisabled(_) => StatusCode::BAD_REQUEST,
        TriggerError::AlreadyRunning { .. } => StatusCode::BAD_REQUEST,
        TriggerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string(), error.error_code())
}

fn supervisor_error_response(error: &SupervisorError) -> Response {
    let status = match error {
        SupervisorError::ProcessNotFound(_) => StatusCode::NOT_FOUND,
        SupervisorError::ProcessNotWritable { .. } => StatusCode::BAD_REQUEST,
        SupervisorError::SignalFailed { .. } | SupervisorError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, &error.to_string(), error.error_code())
}

fn task_view(record: &TaskRecord) -> Value {
    json!({
        "task": record.definition,
        "valid": record.is_valid(),
        "diagnostics": record.diagnostics,
    })
}

async fn handle_task_list(State(control): State<Arc<ControlPlane>>) -> Response {
    match control.list_tasks() {
        Ok(records) => {
            let tasks: Vec<Value> = records.iter().map(task_view).collect();
            (
                StatusCode::OK,
                Json(json!({"success": true, "count": tasks.len(), "tasks": tasks})),
            )
                .into_response()
        }
        Err(error) => internal_error(error),
    }
}

async fn handle_task_create(
    State(control): State<Arc<ControlPlane>>,
    Json(payload): Json<Value>,
) -> Response {
    save_definition(&control, payload, None)
}

async fn handle_task_update(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    match control.get_task(&task_id) {
        Ok(Some(_)) => save_definition(&control, payload, Some(&task_id)),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &format!("task '{task_id}' was not found"),
            "task_not_found",
        ),
        Err(error) => internal_error(error),
    }
}

/// Shared create/update path. An update pins the definition's id to the
/// path segment so a body cannot rename a task in place.
fn save_definition(control: &ControlPlane, payload: Value, pin_id: Option<&str>) -> Response {
    let mut definition: TaskDefinition = match serde_json::from_value(payload) {
        Ok(definition) => definition,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("malformed task definition: {error}"),
                "task_invalid",
            );
        }
    };
    if let Some(id) = pin_id {
        definition.metadata.id = id.to_string();
    }
    let record = TaskRecord::from_definition(definition);
    if !record.is_valid() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "task definition failed validation",
                "error_code": "task_invalid",
                "diagnostics": record.diagnostics,
            })),
        )
            .into_response();
    }
    match control.save_task(&record.definition) {
        Ok(saved) => (
            StatusCode::OK,
            Json(json!({"success": true, "task": saved.definition})),
        )
            .into_response(),
        Err(error) => internal_error(error),
    }
}

async fn handle_task_get(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
) -> Response {
    match control.get_task(&task_id) {
        Ok(Some(record)) => {
            let mut body = json!({"success": true});
            if let (Some(map), Value::Object(view)) = (body.as_object_mut(), task_view(&record)) {
                map.extend(view);
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &format!("task '{task_id}' was not found"),
            "task_not_found",
        ),
        Err(error) => internal_error(error),
    }
}

async fn handle_task_delete(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
) -> Response {
    match control.delete_task(&task_id) {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"success": true, "deleted": task_id})),
        )
            .into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            &format!("task '{task_id}' was not found"),
            "task_not_found",
        ),
        Err(error) => internal_error(error),
    }
}

async fn handle_task_pause(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
) -> Response {
    match control.pause_task(&task_id) {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({"success": true, "task": record.definition})),
        )
            .into_response(),
        Err(error) => trigger_error_response(&error),
    }
}

async fn handle_task_resume(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
) -> Response {
    match control.resume_task(&task_id) {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({"success": true, "task": record.definition})),
        )
            .into_response(),
        Err(error) => trigger_error_response(&error),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunRequestBody {
    #[serde(default)]
    trigger: Option<String>,
}

async fn handle_task_run(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
    body: Option<Json<RunRequestBody>>,
) -> Response {
    let requested = body.and_then(|Json(body)| body.trigger);
    let trigger = match requested.as_deref() {
        None => RunTrigger::Api,
        Some(raw) => match RunTrigger::parse(raw) {
            Some(trigger) => trigger,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unknown trigger '{raw}'"),
                    "task_invalid",
                );
            }
        },
    };
    match control.run_task(&task_id, trigger) {
        Ok(started) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "run_id": started.run_id,
                "process_id": started.process_id,
                "status": started.status,
            })),
        )
            .into_response(),
        // A denied trigger never has a run id to report.
        Err(error @ TriggerError::AlreadyRunning { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "run_id": Value::Null,
                "error": error.to_string(),
                "error_code": error.error_code(),
            })),
        )
            .into_response(),
        Err(error) => trigger_error_response(&error),
    }
}

async fn handle_task_status(
    State(control): State<Arc<ControlPlane>>,
    Path(task_id): Path<String>,
) -> Response {
    match control.task_status(&task_id) {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({"success": true, "status": report})),
        )
            .into_response(),
        Err(error) => trigger_error_response(&error),
    }
}

async fn handle_scheduler_sync(State(control): State<Arc<ControlPlane>>) -> Response {
    match control.sync() {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({"success": true, "report": report})),
        )
            .into_response(),
        Err(error) => internal_error(error),
    }
}

async fn handle_scheduler_status(State(control): State<Arc<ControlPlane>>) -> Response {
    match control.scheduler_status() {
        Ok(status) => (StatusCode::OK, Json(json!(status))).into_response(),
        Err(error) => internal_error(error),
    }
}

/// Ad-hoc spawn payload. When `task_id` is set the stored definition
/// drives the execution; otherwise the inline fields do.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartProcessBody {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    mode: Option<TaskMode>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    logging: LoggingSpec,
    #[serde(default)]
    agent: AgentModeConfig,
    #[serde(default)]
    llm: LlmModeConfig,
    #[serde(default)]
    output_path: Option<String>,
}

async fn handle_process_start(
    State(control): State<Arc<ControlPlane>>,
    Json(body): Json<StartProcessBody>,
) -> Response {
    if let Some(task_id) = &body.task_id {
        return match control.run_task(task_id, RunTrigger::Api) {
            Ok(started) => (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "process_id": started.process_id,
                    "run_id": started.run_id,
                })),
            )
                .into_response(),
            Err(error) => trigger_error_response(&error),
        };
    }

    if body.prompt.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "prompt is required for an ad-hoc process",
            "task_invalid",
        );
    }
    let request = ExecutionRequest {
        task_id: None,
        run_id: None,
        mode: body.mode.unwrap_or_default(),
        prompt: body.prompt,
        working_directory: control
            .paths()
            .resolve_relative(body.working_directory.as_deref().unwrap_or(".")),
        timeout_seconds: body.timeout_seconds.unwrap_or(600),
        logging: body.logging,
        agent: body.agent,
        llm: body.llm,
        output_path: body
            .output_path
            .map(|path| control.paths().resolve_relative(&path)),
        events: None,
    };
    match control.supervisor().spawn(request) {
        Ok(spawned) => (
            StatusCode::OK,
            Json(json!({"success": true, "process_id": spawned.process_id, "run_id": Value::Null})),
        )
            .into_response(),
        Err(error) => internal_error(error),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProcessListQuery {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_process_list(
    State(control): State<Arc<ControlPlane>>,
    Query(query): Query<ProcessListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match ProcessStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unknown process status '{raw}'"),
                    "task_invalid",
                );
            }
        },
    };
    let rows = control.state().list_processes(
        query.task_id.as_deref(),
        query.run_id.as_deref(),
        status,
        query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    );
    (
        StatusCode::OK,
        Json(json!({"success": true, "count": rows.len(), "processes": rows})),
    )
        .into_response()
}

async fn handle_process_poll(
    State(control): State<Arc<ControlPlane>>,
    Path(process_id): Path<String>,
) -> Response {
    match control.supervisor().poll(&process_id) {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({"success": true, "process": record})),
        )
            .into_response(),
        Err(error) => supervisor_error_response(&error),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_process_log(
    State(control): State<Arc<ControlPlane>>,
    Path(process_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    match control.supervisor().read_log(
        &process_id,
        query.offset.unwrap_or(0),
        query.limit.unwrap_or(DEFAULT_LOG_PAGE_LIMIT),
    ) {
        Ok(page) => {
            let mut body = json!({"success": true});
            if let (Some(map), Ok(Value::Object(page))) =
                (body.as_object_mut(), serde_json::to_value(&page))
            {
                map.extend(page);
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(error) => supervisor_error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
struct StdinBody {
    data: String,
}

async fn handle_process_write(
    State(control): State<Arc<ControlPlane>>,
    Path(process_id): Path<String>,
    Json(body): Json<StdinBody>,
) -> Response {
    forward_stdin(&control, &process_id, &body.data, false)
}

async fn handle_process_submit(
    State(control): State<Arc<ControlPlane>>,
    Path(process_id): Path<String>,
    Json(body): Json<StdinBody>,
) -> Response {
    forward_stdin(&control, &process_id, &body.data, true)
}

fn forward_stdin(control: &ControlPlane, process_id: &str, data: &str, submit: bool) -> Response {
    match control.supervisor().write_stdin(process_id, data, submit) {
        Ok(bytes) => (
            StatusCode::OK,
            Json(json!({"success": true, "bytes": bytes})),
        )
            .into_response(),
        Err(error) => supervisor_error_response(&error),
    }
}

#[derive(Debug, Default, Deserialize)]
struct KillBody {
    #[serde(default)]
    signal: Option<String>,
}

async fn handle_process_kill(
    State(control): State<Arc<ControlPlane>>,
    Path(process_id): Path<String>,
    body: Option<Json<KillBody>>,
) -> Response {
    let requested = body.and_then(|Json(body)| body.signal);
    let signal = match requested.as_deref() {
        None => KillSignal::Term,
        Some(raw) => match KillSignal::parse(raw) {
            Some(signal) => signal,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unknown signal '{raw}'"),
                    "task_invalid",
                );
            }
        },
    };
    match control.supervisor().kill(&process_id, signal) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"success": true, "signal": signal.as_str()})),
        )
            .into_response(),
        Err(error) => supervisor_error_response(&error),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunListQuery {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_run_list(
    State(control): State<Arc<ControlPlane>>,
    Query(query): Query<RunListQuery>,
) -> Response {
    let runs = control.state().list_runs(
        query.task_id.as_deref(),
        query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    );
    (
        StatusCode::OK,
        Json(json!({"success": true, "count": runs.len(), "runs": runs})),
    )
        .into_response()
}

async fn handle_run_get(
    State(control): State<Arc<ControlPlane>>,
    Path(run_id): Path<String>,
) -> Response {
    match control.state().get_run(&run_id) {
        Some(run) => (StatusCode::OK, Json(json!({"success": true, "run": run}))).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            &format!("run '{run_id}' was not found"),
            "run_not_found",
        ),
    }
}

async fn handle_run_events_deprecated() -> Response {
    (
        StatusCode::GONE,
        Json(json!({
            "error": "deprecated endpoint",
            "message": "run event streams have been sunset; read the process log instead",
        })),
    )
        .into_response()
}
