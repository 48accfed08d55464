use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use sourcing_agent::Orchestrator;
use sourcing_agent::audit::DebugRecord;
use sourcing_agent::orchestrator::{DispatchError, ServiceStatus};
use sourcing_agent::types::RunEvent;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

/// How many ports past the configured one to try before giving up.
const PORT_FALLBACKS: u16 = 9;

type Reply = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Deserialize)]
struct RunParams {
    record_id: Option<String>,
}

fn event_name(event: &RunEvent) -> &'static str {
    match event {
        RunEvent::Started { .. } => "started",
        RunEvent::StateChanged { .. } => "state_changed",
        RunEvent::Turn { .. } => "turn",
        RunEvent::SessionRecycled { .. } => "session_recycled",
        RunEvent::Finished { .. } => "finished",
    }
}

fn to_sse_event(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event_name(event)).data(data)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/run-automation", post(run_handler))
        .route("/debug/status", get(status_handler))
        .route("/debug/runs", get(runs_handler))
        .route("/debug/runs/{run_id}", get(run_record_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .with_state(Arc::new(state))
}

/// Bind the configured port, falling back to the next few if it is taken,
/// and serve until the process exits.
pub async fn serve(orchestrator: Arc<Orchestrator>, port: u16) -> Result<()> {
    let app = router(AppState { orchestrator });

    let mut listener = None;
    for p in port..=port.saturating_add(PORT_FALLBACKS) {
        match tokio::net::TcpListener::bind(("0.0.0.0", p)).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(err) => warn!(port = p, error = %err, "port unavailable"),
        }
    }
    let listener = listener.with_context(|| {
        format!(
            "could not bind any port {port}-{}",
            port.saturating_add(PORT_FALLBACKS)
        )
    })?;

    info!(addr = %listener.local_addr()?, "HTTP surface listening");
    axum::serve(listener, app).await.context("HTTP server stopped")?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.orchestrator.status();
    Json(json!({
        "service": "sourcing-agent",
        "status": status.status,
        "runs_finished": status.runs_finished,
    }))
}

async fn dashboard_handler() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

fn busy(holder: &str) -> Reply {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "a run is already in progress", "active": holder })),
    )
}

/// Accept a run request and execute it in the background. Without a record id
/// every pending record is processed. The run slot is claimed before the
/// response, so a second request gets 409 rather than a parallel run.
async fn run_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Reply, Reply> {
    let orchestrator = state.orchestrator.clone();
    let label = params.record_id.as_deref().unwrap_or("batch");
    let slot = match orchestrator.try_claim(label) {
        Ok(slot) => slot,
        Err(DispatchError::Busy(holder)) => return Err(busy(&holder)),
        Err(err) => return Err(internal(err)),
    };

    let Some(record_id) = params.record_id else {
        info!("batch run requested");
        tokio::spawn(async move {
            match orchestrator.process_pending_in(&slot).await {
                Ok(summary) => info!(
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "batch finished"
                ),
                Err(err) => error!(error = %err, "batch could not start"),
            }
        });
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "mode": "batch" })),
        ));
    };

    let task = match orchestrator.fetch_task(&record_id).await {
        Ok(task) => task,
        Err(DispatchError::NotFound(id)) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("record {id} not found") })),
            ));
        }
        Err(err) => {
            error!(record_id = %record_id, error = %err, "record fetch failed");
            return Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            ));
        }
    };

    info!(record_id = %record_id, correlation_id = %task.correlation_id, "run requested");
    let correlation_id = task.correlation_id.clone();
    tokio::spawn(async move {
        let report = orchestrator.execute_in(&slot, task).await;
        info!(
            run_id = %report.run_id,
            final_state = %report.final_state,
            "requested run finished"
        );
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "record_id": record_id,
            "correlation_id": correlation_id,
        })),
    ))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<ServiceStatus> {
    Json(state.orchestrator.status())
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Reply> {
    let runs = state
        .orchestrator
        .audit()
        .list_runs()
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "runs": runs })))
}

async fn run_record_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<DebugRecord>, Reply> {
    match state.orchestrator.audit().record(&run_id).await.map_err(internal)? {
        Some(record) => Ok(Json(record)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no audit record for run {run_id}") })),
        )),
    }
}

fn internal(err: impl std::fmt::Display) -> Reply {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.orchestrator.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(to_sse_event(&event))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const DASHBOARD_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Sourcing Agent</title>
<style>
  body { margin: 0; background: #0a0a0f; color: #e0e0e0; font: 14px/1.5 system-ui, sans-serif; }
  header { display: flex; align-items: center; gap: 10px; padding: 16px 24px; border-bottom: 1px solid #1a1a2e; }
  h1 { margin: 0; font-size: 18px; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  .dot.busy { background: #f59e0b; }
  .main { max-width: 860px; margin: 0 auto; padding: 16px 24px; }
  #log { height: 70vh; overflow-y: auto; }
  .entry { margin-bottom: 6px; padding: 8px 12px; background: #111118; border-left: 3px solid #3b82f6; }
  .entry.turn { font-family: monospace; border-left-color: #6366f1; }
  .entry.recycle { border-left-color: #f59e0b; }
  .entry.error { border-left-color: #ef4444; color: #fca5a5; }
  .entry.done { border-left-color: #22c55e; color: #86efac; }
  .input-area { display: flex; gap: 8px; margin-top: 12px; }
  #record { flex: 1; padding: 10px; background: #111118; border: 1px solid #222; color: #fff; }
  button { padding: 10px 20px; background: #6366f1; color: #fff; border: none; cursor: pointer; }
  button:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Sourcing Agent</h1>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="input-area">
      <input type="text" id="record" placeholder="Record id (leave empty to process all pending)" autofocus />
      <button id="run" onclick="run()">Run</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const record = document.getElementById('record');
  const runBtn = document.getElementById('run');
  const dot = document.getElementById('status-dot');
  const esc = s => String(s).replace(/</g, '&lt;');

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  function setBusy(b) {
    runBtn.disabled = b;
    dot.className = b ? 'dot busy' : 'dot';
  }

  async function run() {
    const id = record.value.trim();
    const url = id ? '/run-automation?record_id=' + encodeURIComponent(id) : '/run-automation';
    const res = await fetch(url, { method: 'POST' });
    const body = await res.json();
    if (!res.ok) { addEntry('error', esc(body.error)); return; }
    setBusy(true);
  }

  const es = new EventSource('/events');
  es.addEventListener('started', e => {
    const d = JSON.parse(e.data);
    setBusy(true);
    addEntry('', '<strong>Run ' + esc(d.run_id) + '</strong> started for ' + esc(d.subject_id));
  });
  es.addEventListener('state_changed', e => {
    const d = JSON.parse(e.data);
    addEntry('', '<strong>' + esc(d.state) + '</strong> ' + esc(d.evidence));
  });
  es.addEventListener('turn', e => {
    const d = JSON.parse(e.data);
    addEntry('turn', 'Turn ' + d.number + ': ' + esc(d.description));
  });
  es.addEventListener('session_recycled', e => {
    const d = JSON.parse(e.data);
    addEntry('recycle', 'Browser relaunched (generation ' + d.generation + '): ' + esc(d.reason));
  });
  es.addEventListener('finished', e => {
    const d = JSON.parse(e.data);
    const o = d.outcome;
    if (o.result === 'success') addEntry('done', '<strong>Done:</strong> ' + esc(o.summary));
    else if (o.result === 'failed') addEntry('error', '<strong>' + esc(o.reason) + ':</strong> ' + esc(o.detail));
    else addEntry('error', '<strong>Timed out</strong> after ' + esc(o.last_state));
    setBusy(false);
  });
</script>
</body>
</html>"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_the_serialized_tag() {
        let events = [
            RunEvent::Started {
                run_id: "r".into(),
                subject_id: "rec1".into(),
            },
            RunEvent::Turn {
                run_id: "r".into(),
                number: 3,
                description: "click".into(),
            },
            RunEvent::SessionRecycled {
                run_id: "r".into(),
                generation: 2,
                reason: "scheduled".into(),
            },
        ];
        for event in &events {
            let value = serde_json::to_value(event).unwrap();
            assert_eq!(value["event"], event_name(event));
        }
    }
}
