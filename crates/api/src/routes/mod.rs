use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::{
    Json, Router,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::stream::{self, BoxStream, StreamExt};
use kindling_domain::cancellation::CancellationChecker;
use kindling_domain::coordinator::{
    ActiveRequestPointer, RequestCoordinator, StoredResponse, WaitResult,
};
use kindling_domain::fingerprint::RequestIdentity;
use kindling_domain::ports::automation::{
    AutomationAction, AutomationError, AutomationOutput, LibraryEvent,
};
use kindling_domain::ports::kv::KvStore;
use kindling_domain::streaming::StreamingCoordinator;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};
use validator::Validate;

use crate::observability::{self, CoordinationOutcome, StreamRole};
use crate::{error::ApiError, middleware as app_middleware, state::AppState, validation};

pub const REQUEST_NUMBER_HEADER: &str = "x-request-number";
const BOOKS_STREAM_PATH: &str = "/books-stream";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const SCAN_EVENT_BUFFER: usize = 32;

type Params = BTreeMap<String, String>;
type EventStream = BoxStream<'static, Result<Event, Infallible>>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/open-book", get(open_book))
        .route("/open-random-book", get(open_random_book))
        .route("/close-book", post(close_book))
        .route("/navigate", get(navigate))
        .route("/state", get(reader_state))
        .route("/books", get(books))
        .route(BOOKS_STREAM_PATH, get(books_stream))
        .route("/auth", get(auth))
        .route("/screenshot", get(screenshot))
        .route("/shutdown", post(shutdown))
        .route("/cancel", post(cancel))
        .route("/active-request", get(active_request))
        .route_layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer(state.config.http_timeout()))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match state.coordination.store().ping().await {
        Ok(()) => "ok",
        Err(err) => {
            warn!(error = %err, "store ping failed");
            "unavailable"
        }
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        store,
    })
}

async fn metrics() -> Response {
    let body = observability::render_metrics().unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize, Validate)]
struct OpenBookQuery {
    #[validate(length(min = 1, max = 512))]
    title: Option<String>,
    #[validate(length(min = 1, max = 64))]
    asin: Option<String>,
}

async fn open_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OpenBookQuery>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    validation::validate(&query)?;
    if query.title.is_none() && query.asin.is_none() {
        return Err(ApiError::Validation("title or asin is required".into()));
    }
    run(&state, &headers, AutomationAction::OpenBook, params).await
}

async fn open_random_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::OpenRandomBook, params).await
}

async fn close_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::CloseBook, params).await
}

#[derive(Debug, Deserialize, Validate)]
struct NavigateQuery {
    #[validate(length(min = 1, max = 32))]
    action: Option<String>,
    #[validate(range(min = -50, max = 50))]
    steps: Option<i32>,
}

async fn navigate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NavigateQuery>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    validation::validate(&query)?;
    run(&state, &headers, AutomationAction::Navigate, params).await
}

async fn reader_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::State, params).await
}

async fn books(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::Books, params).await
}

async fn auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::Auth, params).await
}

async fn screenshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::Screenshot, params).await
}

async fn shutdown(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    run(&state, &headers, AutomationAction::Shutdown, params).await
}

/// Runs one automation call, coordinated against the user's other calls
/// when the caller is identified.
async fn run(
    state: &AppState,
    headers: &HeaderMap,
    action: AutomationAction,
    mut params: Params,
) -> Result<Response, ApiError> {
    let Some(user) = validation::caller(headers, &mut params)? else {
        let output = state
            .automation
            .perform("", action, &params, CancellationChecker::never())
            .await?;
        return Ok(json_response(output.status_code, output.body, None));
    };

    let identity = RequestIdentity::new(user.clone(), action.path(), action.method())
        .with_params(params.clone());
    // Detached from the HTTP future: a dropped client or the request timeout
    // must not skip the verdict that releases the user's slot.
    let state = state.clone();
    let task = tokio::spawn(async move {
        let mut coordinator = state.coordination.request(identity);
        coordinate(&state, &mut coordinator, &user, action, &params).await
    });
    task.await.unwrap_or_else(|err| {
        error!(path = action.path(), error = %err, "coordinated request task failed");
        Err(ApiError::Coordination)
    })
}

async fn coordinate(
    state: &AppState,
    coordinator: &mut RequestCoordinator,
    user: &str,
    action: AutomationAction,
    params: &Params,
) -> Result<Response, ApiError> {
    let path = action.path();
    if coordinator.claim_request().await {
        return execute_claimed(state, coordinator, user, action, params).await;
    }
    if coordinator.is_duplicate_in_progress().await {
        return replay_or_execute(state, coordinator, user, action, params).await;
    }

    info!(user = %user, path, "waiting for higher priority request");
    match coordinator.wait_for_higher_priority_completion().await {
        WaitResult::Ready => {
            observability::register_coordination_outcome(path, CoordinationOutcome::PriorityReady);
            if coordinator.claim_request().await {
                return execute_claimed(state, coordinator, user, action, params).await;
            }
            if coordinator.is_duplicate_in_progress().await {
                return replay_or_execute(state, coordinator, user, action, params).await;
            }
            execute_standalone(state, coordinator, user, action, params).await
        }
        WaitResult::Cancelled => {
            observability::register_coordination_outcome(
                path,
                CoordinationOutcome::PriorityCancelled,
            );
            coordinator.release_request_number().await;
            Err(ApiError::Cancelled)
        }
        WaitResult::Timeout => {
            observability::register_coordination_outcome(path, CoordinationOutcome::PriorityTimeout);
            coordinator.release_request_number().await;
            Err(ApiError::Timeout)
        }
        WaitResult::Error => {
            observability::register_coordination_outcome(path, CoordinationOutcome::PriorityError);
            coordinator.release_request_number().await;
            Err(ApiError::Coordination)
        }
    }
}

async fn execute_claimed(
    state: &AppState,
    coordinator: &mut RequestCoordinator,
    user: &str,
    action: AutomationAction,
    params: &Params,
) -> Result<Response, ApiError> {
    let request_number = visible_request_number(coordinator).await;
    let checker = checker_for(state, user, coordinator.request_key());
    match state.automation.perform(user, action, params, checker).await {
        Ok(output) => {
            observability::register_coordination_outcome(
                action.path(),
                CoordinationOutcome::Executed,
            );
            coordinator
                .store_response(output.body.clone(), output.status_code)
                .await;
            Ok(output_response(output, request_number))
        }
        Err(AutomationError::Retryable(message)) => {
            warn!(user = %user, path = action.path(), error = %message, "automation session lost");
            coordinator.abandon().await;
            Err(ApiError::Retryable(message))
        }
        Err(err) => {
            warn!(user = %user, path = action.path(), error = %err, "automation failed");
            coordinator.mark_error().await;
            Err(err.into())
        }
    }
}

async fn replay_or_execute(
    state: &AppState,
    coordinator: &mut RequestCoordinator,
    user: &str,
    action: AutomationAction,
    params: &Params,
) -> Result<Response, ApiError> {
    let request_number = coordinator.request_number();
    match coordinator.wait_for_deduplicated_response().await {
        Some(StoredResponse { body, status_code }) => {
            observability::register_coordination_outcome(
                action.path(),
                CoordinationOutcome::Deduplicated,
            );
            let shown = request_number.filter(|_| coordinator.multiple_requests_detected());
            Ok(json_response(status_code, body, shown))
        }
        None => {
            observability::register_coordination_outcome(
                action.path(),
                CoordinationOutcome::DedupFallback,
            );
            warn!(user = %user, path = action.path(), "no deduplicated response; executing standalone");
            execute_standalone(state, coordinator, user, action, params).await
        }
    }
}

/// Executes without publishing a result; the execution record belongs to
/// another caller.
async fn execute_standalone(
    state: &AppState,
    coordinator: &mut RequestCoordinator,
    user: &str,
    action: AutomationAction,
    params: &Params,
) -> Result<Response, ApiError> {
    let checker = checker_for(state, user, coordinator.request_key());
    let result = state.automation.perform(user, action, params, checker).await;
    coordinator.release_request_number().await;
    let output = result?;
    Ok(output_response(output, None))
}

async fn visible_request_number(coordinator: &RequestCoordinator) -> Option<u64> {
    let number = coordinator.request_number()?;
    if coordinator.multiple_requests_detected() || coordinator.has_multiple_requests().await {
        Some(number)
    } else {
        None
    }
}

fn checker_for(state: &AppState, user: &str, request_key: &str) -> CancellationChecker {
    state.coordination.cancellation().checker_for(
        user,
        request_key,
        state.config.cancellation_check_interval,
    )
}

fn output_response(output: AutomationOutput, request_number: Option<u64>) -> Response {
    json_response(output.status_code, output.body, request_number)
}

fn json_response(status_code: u16, body: Value, request_number: Option<u64>) -> Response {
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(body)).into_response();
    if let Some(number) = request_number {
        response
            .headers_mut()
            .insert(REQUEST_NUMBER_HEADER, HeaderValue::from(number));
    }
    response
}

#[derive(Debug, Deserialize, Validate)]
struct BooksStreamQuery {
    #[validate(length(max = 256))]
    search: Option<String>,
}

/// Library scan as server-sent events. The first caller produces; callers
/// arriving while the scan runs replay what was emitted and follow the tail.
async fn books_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<BooksStreamQuery>,
    Query(mut params): Query<Params>,
) -> Result<Response, ApiError> {
    validation::validate(&query)?;
    let events = match validation::caller(&headers, &mut params)? {
        None => produce(state, None, String::new(), params),
        Some(user) => {
            let identity = RequestIdentity::new(user.clone(), BOOKS_STREAM_PATH, "GET")
                .with_params(params.clone());
            let mut streaming = state.coordination.streaming(identity);
            if streaming.start_streaming().await {
                observability::register_stream_role(StreamRole::Producer);
                produce(state, Some(streaming), user, params)
            } else {
                observability::register_stream_role(StreamRole::Joiner);
                info!(user = %user, "joining running library scan");
                join(streaming).await
            }
        }
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response())
}

fn produce(
    state: AppState,
    streaming: Option<StreamingCoordinator>,
    user: String,
    params: Params,
) -> EventStream {
    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(connection_event()));

    tokio::spawn(async move {
        let (sink, mut scanned) = mpsc::channel::<LibraryEvent>(SCAN_EVENT_BUFFER);
        let checker = match &streaming {
            Some(streaming) => checker_for(&state, &user, streaming.request_key()),
            None => CancellationChecker::never(),
        };
        let scan = state.automation.scan_library(&user, &params, sink, checker);
        // A disconnected client does not stop the scan; joiners still replay it.
        let forward = async {
            while let Some(event) = scanned.recv().await {
                if let Some(streaming) = &streaming {
                    streaming.accumulate_data(&event).await;
                }
                let _ = tx.send(Ok(to_sse(&event)));
            }
        };
        let (result, ()) = tokio::join!(scan, forward);

        if let Err(err) = result {
            warn!(user = %user, error = %err, "library scan failed");
            let event = scan_failure_event(&err);
            if let Some(streaming) = &streaming {
                streaming.accumulate_data(&event).await;
            }
            let _ = tx.send(Ok(to_sse(&event)));
        }
        if let Some(mut streaming) = streaming {
            streaming.end_streaming().await;
        }
    });

    UnboundedReceiverStream::new(rx).boxed()
}

async fn join(streaming: StreamingCoordinator) -> EventStream {
    let (replayed, next_index) = streaming.accumulated_snapshot::<LibraryEvent>().await;
    let tail = streaming.follow_stream::<LibraryEvent>(next_index);
    let events = stream::iter(replayed)
        .chain(tail)
        .map(|event| to_sse(&event));
    stream::once(async { connection_event() })
        .chain(events)
        .map(Ok::<_, Infallible>)
        .boxed()
}

fn connection_event() -> Event {
    Event::default()
        .event("connection")
        .data(json!({ "status": "connected" }).to_string())
}

fn to_sse(event: &LibraryEvent) -> Event {
    Event::default()
        .event(event.event.as_str())
        .data(event.data.to_string())
}

fn scan_failure_event(err: &AutomationError) -> LibraryEvent {
    match err {
        AutomationError::Cancelled => {
            LibraryEvent::new("cancelled", json!({ "message": err.to_string() }))
        }
        AutomationError::Retryable(_) => LibraryEvent::new(
            "error",
            json!({ "error": err.to_string(), "type": "session_lost" }),
        ),
        AutomationError::Unavailable(_) => LibraryEvent::new(
            "error",
            json!({ "error": err.to_string(), "type": "emulator_unavailable" }),
        ),
        AutomationError::Failed(_) => LibraryEvent::new(
            "error",
            json!({ "error": err.to_string(), "type": "general_error" }),
        ),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct CancelQuery {
    #[validate(length(min = 1, max = 256))]
    request_key: Option<String>,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
    request_key: Option<String>,
}

async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CancelQuery>,
    Query(mut params): Query<Params>,
) -> Result<Json<CancelResponse>, ApiError> {
    validation::validate(&query)?;
    let user = validation::require_caller(&headers, &mut params)?;
    let cancellation = state.coordination.cancellation();

    // Only the caller's own active request can be targeted.
    let active = cancellation
        .active_request_info(&user)
        .await
        .map(|pointer| pointer.request_key);
    let target = match (query.request_key, active) {
        (Some(requested), Some(active)) if requested == active => Some(active),
        (Some(requested), _) => {
            warn!(user = %user, request_key = %requested, "cancel target is not the caller's active request");
            return Ok(Json(CancelResponse {
                cancelled: false,
                request_key: Some(requested),
            }));
        }
        (None, active) => active,
    };
    let cancelled = match &target {
        Some(request_key) => {
            cancellation
                .mark_cancelled(&user, Some(request_key.as_str()))
                .await
        }
        None => false,
    };
    info!(user = %user, cancelled, "cancel requested");
    Ok(Json(CancelResponse {
        cancelled,
        request_key: target,
    }))
}

#[derive(Serialize)]
struct ActiveRequestResponse {
    user: String,
    active_request: Option<ActiveRequestPointer>,
}

async fn active_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut params): Query<Params>,
) -> Result<Json<ActiveRequestResponse>, ApiError> {
    let user = validation::require_caller(&headers, &mut params)?;
    let active_request = state
        .coordination
        .cancellation()
        .active_request_info(&user)
        .await;
    Ok(Json(ActiveRequestResponse {
        user,
        active_request,
    }))
}
