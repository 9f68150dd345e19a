//! HTTP gateway over the run manager, built on axum.
//!
//! JSON endpoints to start, inspect, cancel and resume runs, plus a
//! server-sent event stream of progress events per run.

use crate::config::GatewayConfig;
use crate::error::RunError;
use crate::events::ProgressEvent;
use crate::runs::{RunManager, RunRequest, RunStatus};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared handler state.
pub type SharedRuns = Arc<RunManager>;

/// A [`RunError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(RunError);

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RunError::NotFound { .. } => StatusCode::NOT_FOUND,
            RunError::AlreadyFinished { .. } | RunError::StillActive { .. } => {
                StatusCode::CONFLICT
            }
            RunError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            RunError::TaskAborted { .. } | RunError::Draft(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the gateway router.
pub fn router(runs: SharedRuns) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", post(start_handler).get(list_handler))
        .route("/runs/{id}", get(state_handler))
        .route("/runs/{id}/status", get(status_handler))
        .route("/runs/{id}/cancel", post(cancel_handler))
        .route("/runs/{id}/resume", post(resume_handler))
        .route("/runs/{id}/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(runs)
}

async fn health_handler(State(runs): State<SharedRuns>) -> impl IntoResponse {
    let providers = runs.orchestrator().coordinator().health_snapshot();
    let active = runs
        .list_runs()
        .await
        .iter()
        .filter(|r| r.status == RunStatus::Running)
        .count();
    Json(serde_json::json!({
        "status": "ok",
        "active_runs": active,
        "providers": providers,
        "timestamp": Utc::now(),
    }))
}

async fn start_handler(
    State(runs): State<SharedRuns>,
    Json(request): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = runs.start_run(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id })),
    ))
}

async fn list_handler(State(runs): State<SharedRuns>) -> impl IntoResponse {
    Json(runs.list_runs().await)
}

async fn state_handler(
    State(runs): State<SharedRuns>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(runs.get_run_state(id).await?))
}

async fn status_handler(
    State(runs): State<SharedRuns>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = runs.run_status(id).await?;
    Ok(Json(serde_json::json!({ "run_id": id, "status": status })))
}

async fn cancel_handler(
    State(runs): State<SharedRuns>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    runs.cancel_run(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id, "cancelling": true })),
    ))
}

async fn resume_handler(
    State(runs): State<SharedRuns>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    runs.resume_run(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id, "status": RunStatus::Running })),
    ))
}

fn sse_event(event: &ProgressEvent) -> Option<Result<Event, Infallible>> {
    Event::default()
        .event(event.status.to_string())
        .json_data(event)
        .ok()
        .map(Ok)
}

fn lagged_event(skipped: u64) -> Result<Event, Infallible> {
    Ok(Event::default().event("lagged").data(skipped.to_string()))
}

/// An item of a followed run.
#[derive(Debug, Clone, PartialEq)]
enum Followed {
    Event(ProgressEvent),
    /// The receiver fell behind and this many events were dropped.
    Lagged(u64),
}

struct Follow {
    rx: BroadcastStream<ProgressEvent>,
    finished: BoxFuture<'static, ()>,
    run_done: bool,
    ended: bool,
}

/// Live events of `run_id`. Ends after its terminal event, or once
/// `finished` resolves and the events already received are drained.
fn follow_run(
    rx: broadcast::Receiver<ProgressEvent>,
    run_id: Uuid,
    finished: BoxFuture<'static, ()>,
) -> impl Stream<Item = Followed> + Send + 'static {
    let state = Follow {
        rx: BroadcastStream::new(rx),
        finished,
        run_done: false,
        ended: false,
    };
    stream::unfold(state, move |mut follow| async move {
        loop {
            if follow.ended {
                return None;
            }
            let received = if follow.run_done {
                match follow.rx.next().now_or_never() {
                    Some(Some(Ok(event))) => Ok(event),
                    Some(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => Err(skipped),
                    Some(None) | None => return None,
                }
            } else {
                tokio::select! {
                    biased;
                    received = follow.rx.next() => match received {
                        Some(Ok(event)) => Ok(event),
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => Err(skipped),
                        None => return None,
                    },
                    () = &mut follow.finished => {
                        follow.run_done = true;
                        continue;
                    }
                }
            };
            match received {
                Ok(event) if event.run_id == run_id => {
                    follow.ended = event.is_terminal();
                    return Some((Followed::Event(event), follow));
                }
                Ok(_) => {}
                Err(skipped) => return Some((Followed::Lagged(skipped), follow)),
            }
        }
    })
}

/// Replays the run's events, then follows live ones until the run stops.
async fn events_handler(
    State(runs): State<SharedRuns>,
    Path(id): Path<Uuid>,
) -> Result<Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>>, ApiError> {
    // Subscribe before the status check: a run that is still running then
    // publishes its remaining events to this receiver.
    let live = runs.events().subscribe();
    let status = runs.run_status(id).await?;
    let replay: Vec<_> = runs
        .events()
        .replay(id)
        .iter()
        .filter_map(sse_event)
        .collect();

    let stream = if status == RunStatus::Running {
        let manager = runs.clone();
        let finished: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = manager.wait(id).await;
        });
        let live = follow_run(live, id, finished).filter_map(|item| {
            future::ready(match item {
                Followed::Event(event) => sse_event(&event),
                Followed::Lagged(skipped) => Some(lagged_event(skipped)),
            })
        });
        stream::iter(replay).chain(live).boxed()
    } else {
        stream::iter(replay).boxed()
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Serve the gateway until `shutdown` is cancelled.
pub async fn serve(
    runs: SharedRuns,
    config: &GatewayConfig,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = router(runs);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use crate::drafts::DraftStore;
    use crate::orchestrator::Orchestrator;
    use crate::providers::SearchHit;
    use crate::providers::mock::{ScriptedLlm, ScriptedSearch, ScriptedTranslate, scripted_coordinator};
    use crate::events::{EventBus, StageStatus};
    use crate::stages::StageKind;
    use axum::body::Body;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn manager(dir: &TempDir) -> SharedRuns {
        slow_manager(dir, Duration::ZERO)
    }

    fn slow_manager(dir: &TempDir, llm_delay: Duration) -> SharedRuns {
        let llm = ScriptedLlm::new("llm", |prompt, _| {
            Ok(if prompt.contains("Plan at most") {
                r#"[{"title":"Solar","search_query":"solar","priority":1}]"#.to_string()
            } else {
                "Solar output rose [1].".to_string()
            })
        })
        .with_delay(llm_delay);
        let coordinator = scripted_coordinator(
            Arc::new(llm),
            Arc::new(ScriptedSearch::with_hits(
                "search",
                vec![SearchHit::new("https://a.example", "A", "solar rose")],
            )),
            Arc::new(ScriptedTranslate::echo("tr")),
        )
        .unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(coordinator),
            DraftStore::new(dir.path().join("drafts")),
        );
        let options = RunOptions {
            review_enabled: false,
            summary_enabled: false,
            output_dir: dir.path().join("reports"),
            ..RunOptions::default()
        };
        Arc::new(RunManager::new(Arc::new(orchestrator), options))
    }

    async fn send(app: Router, req: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = TempDir::new().unwrap();
        let (status, json) = send(router(manager(&dir)), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_runs"], 0);
        assert_eq!(json["providers"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_and_inspect_run() {
        let dir = TempDir::new().unwrap();
        let runs = manager(&dir);
        let app = router(runs.clone());

        let (status, json) = send(
            app.clone(),
            post_json("/runs", serde_json::json!({ "query": "solar power" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id: Uuid = serde_json::from_value(json["run_id"].clone()).unwrap();

        let outcome = runs.wait(id).await.unwrap();
        assert_eq!(outcome.terminal, crate::orchestrator::RunTerminal::Completed);

        let (status, json) = send(app.clone(), get(&format!("/runs/{id}/status"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "completed");

        let (_, json) = send(app.clone(), get(&format!("/runs/{id}"))).await;
        assert_eq!(json["query"], "solar power");
        assert!(json["final_report"].as_str().unwrap().contains("## Solar"));

        let (_, json) = send(app.clone(), get("/runs")).await;
        assert_eq!(json.as_array().unwrap().len(), 1);

        let (status, _) = send(app, post_json(&format!("/runs/{id}/cancel"), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let dir = TempDir::new().unwrap();
        let app = router(manager(&dir));
        let (status, json) = send(app, get(&format!("/runs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_empty_query_is_400() {
        let dir = TempDir::new().unwrap();
        let app = router(manager(&dir));
        let (status, _) = send(app, post_json("/runs", serde_json::json!({ "query": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_path_like_target_language_is_400() {
        let dir = TempDir::new().unwrap();
        let app = router(manager(&dir));
        let (status, json) = send(
            app,
            post_json(
                "/runs",
                serde_json::json!({ "query": "solar", "target_language": "/../../escaped" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("language tag"));
    }

    #[tokio::test]
    async fn test_events_replay_for_finished_run() {
        let dir = TempDir::new().unwrap();
        let runs = manager(&dir);
        let id = runs.start_run(RunRequest::new("solar")).await.unwrap();
        runs.wait(id).await.unwrap();

        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(
            router(runs),
            get(&format!("/runs/{id}/events")),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: running"));
        assert!(text.contains("\"stage\":\"publisher\""));
    }

    #[tokio::test]
    async fn test_events_stream_of_running_run_ends() {
        let dir = TempDir::new().unwrap();
        let runs = slow_manager(&dir, Duration::from_millis(50));
        let id = runs.start_run(RunRequest::new("solar")).await.unwrap();
        assert_eq!(runs.run_status(id).await.unwrap(), RunStatus::Running);

        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(
            router(runs.clone()),
            get(&format!("/runs/{id}/events")),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = tokio::time::timeout(
            Duration::from_secs(10),
            axum::body::to_bytes(resp.into_body(), 1_000_000),
        )
        .await
        .expect("event stream never ended")
        .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: completed"));
        let last = text
            .lines()
            .filter(|l| l.starts_with("data:"))
            .last()
            .unwrap();
        assert!(last.contains("\"stage\":\"publisher\""));
        assert!(last.contains("\"status\":\"completed\""));
        assert_eq!(runs.run_status(id).await.unwrap(), RunStatus::Completed);
    }

    fn event(run_id: Uuid, stage: StageKind, status: StageStatus) -> ProgressEvent {
        ProgressEvent::new(run_id, stage, status)
    }

    #[tokio::test]
    async fn test_follow_reports_lag_and_stops_at_terminal_event() {
        let bus = EventBus::new(2);
        let rx = bus.subscribe();
        let run = Uuid::new_v4();
        for stage in [StageKind::Planner, StageKind::Researcher, StageKind::Writer] {
            bus.emit(run, stage, StageStatus::Completed);
        }
        bus.emit(run, StageKind::Publisher, StageStatus::Completed);
        bus.emit(run, StageKind::Publisher, StageStatus::Pending);

        let items: Vec<Followed> = follow_run(rx, run, Box::pin(future::pending::<()>()))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Followed::Lagged(3));
        match &items[1] {
            Followed::Event(e) => {
                assert_eq!(e.stage, StageKind::Publisher);
                assert!(e.is_terminal());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_follow_drains_then_ends_when_run_finishes_quietly() {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        let (run, other) = (Uuid::new_v4(), Uuid::new_v4());
        bus.emit(other, StageKind::Planner, StageStatus::Running);
        bus.emit(run, StageKind::Writer, StageStatus::Running);

        let items: Vec<Followed> = follow_run(rx, run, Box::pin(future::ready(())))
            .collect()
            .await;
        assert_eq!(
            items,
            vec![Followed::Event(bus.replay(run)[0].clone())]
        );
    }
}
