//! Defines the Axum API routes and handlers.

use crate::printer::{Printer, PrinterError};
use crate::serial::{Instruction, InstructionState, Priority, QueueError, Submission};
use crate::state::StateEvent;
use crate::web::models::{
    GcodeCommandRequest, GcodeCommandResponse, OverrideRequest, PrintRequest, PrinterStatusResponse,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

pub type AppState = Arc<Printer>;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/telemetry", get(get_telemetry))
        .route("/api/v1/gcode", post(execute_gcode))
        .route("/api/v1/attention/clear", post(clear_attention))
        .route("/api/v1/override", put(set_override).delete(clear_override))
        .route("/api/v1/job", post(start_job))
        .route("/api/v1/job/clear", post(clear_job))
        .route("/api/v1/pause", post(pause_handler))
        .route("/api/v1/resume", post(resume_handler))
        .route("/api/v1/cancel", post(cancel_handler))
        .with_state(state)
}

fn status(printer: &Printer) -> PrinterStatusResponse {
    let details = printer.state().snapshot();
    PrinterStatusResponse {
        state: details.reported_state,
        details,
        printer: printer.info(),
        pending_instructions: printer.queue().pending_len(),
        exclusive_write: printer.queue().is_exclusive(),
    }
}

/// Handler to get the current state of the printer.
async fn get_status(State(printer): State<AppState>) -> Response {
    (StatusCode::OK, Json(status(&printer))).into_response()
}

/// Handler returning the last published telemetry snapshot.
async fn get_telemetry(State(printer): State<AppState>) -> Response {
    match printer.telemetry().last() {
        Some(telemetry) => (StatusCode::OK, Json(telemetry)).into_response(),
        None => json_error("No telemetry published yet", StatusCode::NOT_FOUND),
    }
}

/// Handler to execute a single G-code command and wait for its reply.
async fn execute_gcode(
    State(printer): State<AppState>,
    Json(payload): Json<GcodeCommandRequest>,
) -> Response {
    let command = payload.command.trim();
    if command.is_empty() || command.contains('\n') {
        return json_error("Command must be a single non-empty line", StatusCode::BAD_REQUEST);
    }
    let matcher = match payload.expect.as_deref().map(Regex::new).transpose() {
        Ok(matcher) => matcher,
        Err(e) => return json_error(&format!("Invalid expect pattern: {}", e), StatusCode::BAD_REQUEST),
    };
    let priority = if payload.front { Priority::Front } else { Priority::Normal };
    let instruction = Instruction::new(command, matcher, priority);

    // Queue wait plus the instruction's own deadline.
    let wait = printer.config().queue.instruction_timeout() * 2;
    let state = match printer.queue().enqueue_and_wait(&instruction, Some(wait)).await {
        Ok(Submission::Accepted(state)) => state,
        Ok(Submission::WriteIgnored) => {
            return json_error("Serial is held exclusively, command ignored", StatusCode::CONFLICT);
        }
        Err(QueueError::Closed) => {
            return json_error("Printer link is shutting down", StatusCode::SERVICE_UNAVAILABLE);
        }
        Err(e) => return json_error(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    let status = match state {
        InstructionState::Confirmed => StatusCode::OK,
        InstructionState::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        InstructionState::Failed | InstructionState::Pending | InstructionState::Sent => {
            StatusCode::GATEWAY_TIMEOUT
        }
    };
    let response = GcodeCommandResponse {
        id: instruction.id(),
        state,
        output: instruction.output(),
        groups: instruction
            .matched()
            .map(|found| found.groups().to_vec())
            .unwrap_or_default(),
    };
    (status, Json(response)).into_response()
}

/// Acknowledge an attention condition.
async fn clear_attention(State(printer): State<AppState>) -> Response {
    printer.state().handle(StateEvent::AttentionCleared);
    (StatusCode::OK, Json(status(&printer))).into_response()
}

async fn set_override(
    State(printer): State<AppState>,
    Json(payload): Json<OverrideRequest>,
) -> Response {
    printer.state().set_override(payload.state);
    (StatusCode::OK, Json(status(&printer))).into_response()
}

async fn clear_override(State(printer): State<AppState>) -> Response {
    printer.state().clear_override();
    (StatusCode::OK, Json(status(&printer))).into_response()
}

fn print_error(e: PrinterError) -> Response {
    let status = match &e {
        PrinterError::NoPrint | PrinterError::PrintInProgress | PrinterError::Print(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(&e.to_string(), status)
}

/// Start printing a G-code file stored on the host.
async fn start_job(State(printer): State<AppState>, Json(payload): Json<PrintRequest>) -> Response {
    match printer.start_print(Path::new(&payload.path)).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(status(&printer))).into_response(),
        Err(PrinterError::Print(e)) => json_error(&e.to_string(), StatusCode::BAD_REQUEST),
        Err(e) => print_error(e),
    }
}

/// Acknowledge a finished job.
async fn clear_job(State(printer): State<AppState>) -> Response {
    printer.clear_job();
    (StatusCode::OK, Json(status(&printer))).into_response()
}

/// Pause the current print job.
async fn pause_handler(State(printer): State<AppState>) -> Response {
    match printer.pause_print().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "result": "ok" }))).into_response(),
        Err(e) => print_error(e),
    }
}

/// Resume the currently paused job.
async fn resume_handler(State(printer): State<AppState>) -> Response {
    match printer.resume_print().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "result": "ok" }))).into_response(),
        Err(e) => print_error(e),
    }
}

/// Stop the current print job.
async fn cancel_handler(State(printer): State<AppState>) -> Response {
    match printer.stop_print().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "result": "ok" }))).into_response(),
        Err(e) => print_error(e),
    }
}
