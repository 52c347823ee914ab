//! HTTP control plane for the agent.
//!
//! Exposes agent state, the message stream, git diff/show, command
//! intake, and a host-based proxy onto ports the agent's processes open.

pub mod proxy;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use mend_agent::CodingAgent;
use mend_core::{AgentMessage, CumulativeUsage, MendError, Port, Result};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub agent: Arc<dyn CodingAgent>,
}

pub type SharedState = Arc<AppState>;

/// Build the router for the given agent.
pub fn router(agent: Arc<dyn CodingAgent>) -> Router {
    let state = Arc::new(AppState { agent });
    Router::new()
        .route("/state", get(get_state))
        .route("/messages", get(get_messages))
        .route("/stream", get(stream_messages))
        .route("/git/rawdiff", get(git_rawdiff))
        .route("/git/show", get(git_show))
        .route("/message", post(post_message))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            proxy::port_proxy_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(agent: Arc<dyn CodingAgent>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(MendError::Io)?;
    serve_on(listener, agent).await
}

/// Serve on an already-bound listener (lets the caller learn the port).
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    agent: Arc<dyn CodingAgent>,
) -> Result<()> {
    let app = router(agent);
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "control plane listening");
    axum::serve(listener, app).await.map_err(MendError::Io)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: String,
    pub message_count: usize,
    pub total_usage: CumulativeUsage,
    pub open_ports: Vec<Port>,
    pub outstanding_tool_calls: Vec<String>,
    pub session_id: String,
    pub initial_commit: String,
    pub branch_prefix: String,
    pub working_dir: PathBuf,
    pub hostname: String,
    pub os: String,
}

/// GET /state - agent metadata and live counters
async fn get_state(State(app): State<SharedState>) -> Json<StateResponse> {
    let agent = &app.agent;
    Json(StateResponse {
        state: agent.current_state().to_string(),
        message_count: agent.message_count(),
        total_usage: agent.total_usage(),
        open_ports: agent.open_ports(),
        outstanding_tool_calls: agent.outstanding_tool_calls(),
        session_id: agent.session_id(),
        initial_commit: agent.initial_commit(),
        branch_prefix: agent.branch_prefix(),
        working_dir: agent.working_dir(),
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        os: std::env::consts::OS.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    start: usize,
    end: Option<usize>,
}

/// GET /messages?start=&end= - half-open range read
async fn get_messages(
    State(app): State<SharedState>,
    Query(query): Query<MessagesQuery>,
) -> Json<Vec<AgentMessage>> {
    let end = query.end.unwrap_or_else(|| app.agent.message_count());
    Json(app.agent.messages(query.start, end))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    from: usize,
}

/// GET /stream?from= - server-sent events over the message fan-out
async fn stream_messages(
    State(app): State<SharedState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let mut iter = app.agent.new_iterator(query.from);
    let stream = async_stream::stream! {
        while let Some(msg) = iter.next().await {
            if msg.hide_output {
                continue;
            }
            if let Ok(json) = serde_json::to_string(&msg) {
                yield Ok(Event::default().event("message").data(json));
            }
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

#[derive(Debug, Deserialize)]
struct RawDiffQuery {
    commit: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

/// GET /git/rawdiff?commit=… or ?from=&to=…
async fn git_rawdiff(
    State(app): State<SharedState>,
    Query(query): Query<RawDiffQuery>,
) -> std::result::Result<String, (StatusCode, String)> {
    let args: Vec<String> = match (&query.commit, &query.from, &query.to) {
        (Some(commit), _, _) => vec![
            "diff".to_string(),
            format!("{commit}^"),
            commit.clone(),
        ],
        (None, Some(from), Some(to)) => vec!["diff".to_string(), from.clone(), to.clone()],
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "missing required parameters: commit, or from and to".to_string(),
            ))
        }
    };
    run_git(&app.agent.working_dir(), &args).await
}

#[derive(Debug, Deserialize)]
struct ShowQuery {
    hash: Option<String>,
}

/// GET /git/show?hash=…
async fn git_show(
    State(app): State<SharedState>,
    Query(query): Query<ShowQuery>,
) -> std::result::Result<String, (StatusCode, String)> {
    let Some(hash) = query.hash else {
        return Err((StatusCode::BAD_REQUEST, "missing required parameter: hash".to_string()));
    };
    run_git(&app.agent.working_dir(), &["show".to_string(), hash]).await
}

async fn run_git(
    dir: &PathBuf,
    args: &[String],
) -> std::result::Result<String, (StatusCode, String)> {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("git failed to run: {e}")))?;
    if !out.status.success() {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            String::from_utf8_lossy(&out.stderr).to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

#[derive(Debug, Deserialize)]
struct UserMessageBody {
    message: String,
}

/// POST /message - forward user input to the agent control loop
async fn post_message(
    State(app): State<SharedState>,
    Json(body): Json<UserMessageBody>,
) -> StatusCode {
    app.agent.user_message(body.message);
    StatusCode::ACCEPTED
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use mend_agent::{MessageIterator, MessageLog, StateIterator, StateLog};
    use mend_core::{AgentState, Budget, MessageKind};
    use std::sync::Mutex;

    /// Minimal scriptable agent for server tests.
    pub struct MockAgent {
        pub log: Arc<MessageLog>,
        pub state_log: Arc<StateLog>,
        pub ports: Vec<Port>,
        pub received: Mutex<Vec<String>>,
        pub working_dir: PathBuf,
    }

    impl MockAgent {
        pub fn new(working_dir: impl Into<PathBuf>) -> Self {
            Self {
                log: MessageLog::new(),
                state_log: StateLog::new(),
                ports: vec![
                    Port { proto: "tcp".into(), port: 22, pid: 1234, process: "sshd".into() },
                    Port { proto: "tcp".into(), port: 80, pid: 5678, process: "nginx".into() },
                    Port { proto: "tcp".into(), port: 8080, pid: 9012, process: "test-server".into() },
                ],
                received: Mutex::new(Vec::new()),
                working_dir: working_dir.into(),
            }
        }

        pub fn add_message(&self, content: &str) {
            self.log
                .append(AgentMessage::new(MessageKind::System, content));
        }
    }

    impl CodingAgent for MockAgent {
        fn messages(&self, start: usize, end: usize) -> Vec<AgentMessage> {
            self.log.messages(start, end)
        }
        fn message_count(&self) -> usize {
            self.log.len()
        }
        fn new_iterator(&self, start_idx: usize) -> MessageIterator {
            self.log.iter(start_idx)
        }
        fn new_state_iterator(&self) -> StateIterator {
            self.state_log.iter()
        }
        fn current_state(&self) -> AgentState {
            self.state_log.current()
        }
        fn user_message(&self, text: String) {
            self.received.lock().unwrap().push(text);
        }
        fn cancel_turn(&self, _cause: String) {}
        fn cancel_tool_use(&self, _id: &str, _cause: &str) -> Result<()> {
            Ok(())
        }
        fn total_usage(&self) -> CumulativeUsage {
            CumulativeUsage::default()
        }
        fn original_budget(&self) -> Budget {
            Budget::default()
        }
        fn working_dir(&self) -> PathBuf {
            self.working_dir.clone()
        }
        fn session_id(&self) -> String {
            "test-session".to_string()
        }
        fn initial_commit(&self) -> String {
            "abc123".to_string()
        }
        fn branch_prefix(&self) -> String {
            "mend/".to_string()
        }
        fn open_ports(&self) -> Vec<Port> {
            self.ports.clone()
        }
        fn outstanding_tool_calls(&self) -> Vec<String> {
            Vec::new()
        }
        fn compact_conversation(&self) -> usize {
            0
        }
    }
}
