//! Ingestion endpoints.
//!
//! Three routes accept notifications:
//!
//! - `POST /1/messages.json`: pushover compatible body, token in the body
//! - `POST /_internal/submit/{token}`: pushover body, reduced-trust path;
//!   enable flags are ignored and the message is marked `via_submit`
//! - `POST /{token}`: application-format route; the application's custom
//!   format maps the body, or the body is read as pushover when the
//!   application uses that format
//!
//! Every route ends the same way: identity overwrite, validation, enqueue.

use std::fmt::Write as _;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;

use crate::error::{ApiError, AppError, Envelope};
use crate::format::extract;
use crate::message::{is_printable_ascii, Message};
use crate::metrics::IngressMetrics;
use crate::queue::Task;
use crate::repository::Stat;
use crate::server::{request_id, AppState};
use crate::tenant::{AppFormat, REPOSITORY_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Pushover,
    Submit,
    Application,
}

impl Route {
    fn as_str(&self) -> &'static str {
        match self {
            Route::Pushover => "pushover",
            Route::Submit => "submit",
            Route::Application => "application",
        }
    }
}

struct Ingest<'a> {
    route: Route,
    path_token: Option<String>,
    headers: &'a HeaderMap,
    query: Option<String>,
    body: &'a Bytes,
}

/// POST /1/messages.json
pub async fn pushover_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Envelope>, ApiError> {
    let ingest = Ingest {
        route: Route::Pushover,
        path_token: None,
        headers: &headers,
        query,
        body: &body,
    };
    respond(&state, ingest).await
}

/// POST /_internal/submit/{token}
pub async fn submit_message(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Envelope>, ApiError> {
    let ingest = Ingest {
        route: Route::Submit,
        path_token: Some(token),
        headers: &headers,
        query,
        body: &body,
    };
    respond(&state, ingest).await
}

/// POST /{token}
pub async fn application_message(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Envelope>, ApiError> {
    let ingest = Ingest {
        route: Route::Application,
        path_token: Some(token),
        headers: &headers,
        query,
        body: &body,
    };
    respond(&state, ingest).await
}

async fn respond(state: &AppState, ingest: Ingest<'_>) -> Result<Json<Envelope>, ApiError> {
    let request = request_id(ingest.headers);
    let route = ingest.route;

    match process(state, ingest).await {
        Ok(()) => {
            IngressMetrics::record(route.as_str(), "accepted");
            Ok(Json(Envelope::accepted(request)))
        }
        Err(e) => {
            IngressMetrics::record(route.as_str(), "rejected");
            Err(e.for_request(request))
        }
    }
}

#[tracing::instrument(
    name = "ingress.process",
    skip(state, ingest),
    fields(route = ingest.route.as_str())
)]
async fn process(state: &AppState, ingest: Ingest<'_>) -> Result<(), AppError> {
    let via_submit = ingest.route == Route::Submit;

    // pushover style routes need the body before the token is known
    let pushover_body = match ingest.route {
        Route::Pushover | Route::Submit => Some(parse_pushover(ingest.body)?),
        Route::Application => None,
    };

    let token = match (&ingest.path_token, &pushover_body) {
        (Some(token), _) => token.clone(),
        (None, Some(message)) => message.token.clone(),
        (None, None) => String::new(),
    };
    if !is_printable_ascii(&token) {
        return Err(AppError::BadRequest("invalid application token".to_string()));
    }

    let (user, application) = state.resolver.resolve_by_token(&token, via_submit).await?;
    tracing::debug!(user = %user.key, application = %application.name, "Tenant resolved");

    let (mut message, pretty) = match pushover_body {
        Some(message) => {
            let pretty = serde_json::to_string_pretty(&message).unwrap_or_default();
            (message, pretty)
        }
        None if application.format == AppFormat::Pushover => {
            let message = parse_pushover(ingest.body)?;
            let pretty = serde_json::to_string_pretty(&message).unwrap_or_default();
            (message, pretty)
        }
        None => {
            let body: Value = serde_json::from_slice(ingest.body)
                .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;
            let pretty = serde_json::to_string_pretty(&body).unwrap_or_default();
            let (message, found) = extract(&application.custom_format, &body);
            tracing::debug!(found = found.len(), "Custom format extracted");
            (message, pretty)
        }
    };

    save_input(state, &token, &input_dump(ingest.headers, ingest.query.as_deref(), &pretty)).await;

    message.assign_identity(&token, &user.key);
    message.validate()?;
    message.set_via_submit(via_submit);

    let payload =
        serde_json::to_string(&message).map_err(|e| AppError::Internal(e.to_string()))?;
    state.queue.enqueue(Task::message(payload)).await?;
    IngressMetrics::record_enqueued();

    increment_processed(state, &token).await;
    Ok(())
}

fn parse_pushover(body: &Bytes) -> Result<Message, AppError> {
    let mut message: Message = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid message body: {}", e)))?;
    message.clear_internal();
    Ok(message)
}

/// Headers, query and pretty printed body, for the latest-input capture.
fn input_dump(headers: &HeaderMap, query: Option<&str>, body: &str) -> String {
    let mut dump = String::new();

    dump.push_str("--- HEADERS ---\n");
    for (name, value) in headers {
        let _ = writeln!(dump, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    dump.push('\n');

    dump.push_str("--- QUERIES ---\n");
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let _ = writeln!(dump, "{}: {}", key, value);
    }
    dump.push('\n');

    dump.push_str("--- BODY ---\n");
    dump.push_str(body);
    dump
}

async fn save_input(state: &AppState, token: &str, dump: &str) {
    match tokio::time::timeout(REPOSITORY_TIMEOUT, state.repository.save_input(token, dump)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Application input not saved"),
        Err(_) => tracing::warn!("Application input not saved: timed out"),
    }
}

async fn increment_processed(state: &AppState, token: &str) {
    let increment = state.repository.increment_stat(token, Stat::Processed);
    match tokio::time::timeout(REPOSITORY_TIMEOUT, increment).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(stat = %Stat::Processed, error = %e, "Application stat not increased"),
        Err(_) => tracing::warn!(stat = %Stat::Processed, "Application stat not increased: timed out"),
    }
}
