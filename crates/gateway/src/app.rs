//! HTTP surface: call creation, liveness and the per-call WebSocket.
//!
//! - `POST /chats`: build a [`CallRequest`], run the pre-call hook, answer
//!   with the WebSocket URL for the session
//! - `GET  /status`: liveness
//! - `GET  /ws`: one call per connection, driven by the [`CallHandler`]

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::FutureExt;
use parley_config::AppConfig;
use parley_core::{AgentConfig, CallRequest, PreCallResult};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::system::{AgentSystem, SystemSettings};
use crate::transport::websocket;

pub const WS_ROUTE: &str = "/ws";

const SERVICE_NAME: &str = "parley";
const CALL_FAILED_MESSAGE: &str = "System has encountered an error, please try again later.";

/// Configures the nodes of one call, starts the system and waits for the
/// call to end. Cleanup is done by the caller.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle_call(
        &self,
        system: &mut AgentSystem,
        request: CallRequest,
    ) -> parley_core::Result<()>;
}

/// Runs before a session is handed out. `Ok(None)` rejects the call.
#[async_trait]
pub trait PreCallHandler: Send + Sync + 'static {
    async fn pre_call(&self, request: &CallRequest) -> parley_core::Result<Option<PreCallResult>>;
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub call_handler: Arc<dyn CallHandler>,
    pub pre_call: Option<Arc<dyn PreCallHandler>>,
}

impl AppState {
    pub fn new(config: AppConfig, call_handler: Arc<dyn CallHandler>) -> Self {
        Self {
            config: Arc::new(config),
            call_handler,
            pre_call: None,
        }
    }

    pub fn with_pre_call(mut self, pre_call: Arc<dyn PreCallHandler>) -> Self {
        self.pre_call = Some(pre_call);
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/chats", post(create_chat_handler))
        .route("/status", get(status_handler))
        .route(WS_ROUTE, get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and serve until the process exits.
pub async fn start(state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = state.config.server.bind_addr();
    let app = build_router(state);

    info!(addr = %addr, "parley listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn str_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

/// Build a [`CallRequest`] from a `/chats` body. Missing fields become
/// `"unknown"`; `agent_call_id` falls back to `call_id`.
pub fn call_request_from_body(body: &Value) -> CallRequest {
    let call_id = str_field(body, "call_id").unwrap_or("unknown");
    let mut request = CallRequest::new(call_id);

    if let Some(from) = str_field(body, "from").or_else(|| str_field(body, "from_")) {
        request.from = from.to_string();
    }
    if let Some(to) = str_field(body, "to") {
        request.to = to.to_string();
    }
    if let Some(agent_call_id) = str_field(body, "agent_call_id") {
        request.agent_call_id = agent_call_id.to_string();
    }
    if let Some(agent) = body.get("agent") {
        request.agent = serde_json::from_value(agent.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring malformed agent block");
            AgentConfig::default()
        });
    }
    if let Some(Value::Object(metadata)) = body.get("metadata") {
        request.metadata = metadata.clone();
    }
    request
}

/// Query string carrying a [`CallRequest`] to the WebSocket endpoint.
pub fn call_request_query(request: &CallRequest) -> String {
    let agent = serde_json::to_string(&request.agent).unwrap_or_else(|_| "{}".into());
    let metadata = Value::Object(request.metadata.clone()).to_string();
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("call_id", &request.call_id)
        .append_pair("from", &request.from)
        .append_pair("to", &request.to)
        .append_pair("agent", &agent)
        .append_pair("agent_call_id", &request.agent_call_id)
        .append_pair("metadata", &metadata)
        .finish()
}

/// Rebuild a [`CallRequest`] from the WebSocket query string. Invalid
/// `agent` or `metadata` JSON is logged and replaced by empty values.
pub fn call_request_from_query(params: &HashMap<String, String>) -> CallRequest {
    let get = |key: &str| params.get(key).map(String::as_str);
    let mut request = CallRequest::new(get("call_id").unwrap_or("unknown"));

    if let Some(from) = get("from") {
        request.from = from.to_string();
    }
    if let Some(to) = get("to") {
        request.to = to.to_string();
    }
    if let Some(agent_call_id) = get("agent_call_id") {
        request.agent_call_id = agent_call_id.to_string();
    }
    if let Some(raw) = get("agent") {
        match serde_json::from_str::<AgentConfig>(raw) {
            Ok(agent) => request.agent = agent,
            Err(e) => error!(agent = %raw, error = %e, "Invalid agent JSON"),
        }
    }
    if let Some(raw) = get("metadata") {
        match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(metadata) => request.metadata = metadata,
            Err(e) => warn!(metadata = %raw, error = %e, "Invalid metadata JSON"),
        }
    }
    request
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

/// `POST /chats`: create a call session.
async fn create_chat_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let mut request = call_request_from_body(&body);

    let mut config = None;
    if let Some(pre_call) = &state.pre_call {
        match pre_call.pre_call(&request).await {
            Ok(Some(result)) => {
                request.metadata.extend(result.metadata);
                config = result.config;
            }
            Ok(None) => {
                info!(call_id = %request.call_id, "Call rejected by pre-call handler");
                return detail(StatusCode::FORBIDDEN, "Call rejected");
            }
            Err(e) => {
                error!(call_id = %request.call_id, error = %e, "Error in pre-call handler");
                return detail(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server error in call processing",
                );
            }
        }
    }

    let mut response = Map::new();
    response.insert(
        "websocket_url".into(),
        json!(format!("{WS_ROUTE}?{}", call_request_query(&request))),
    );
    if let Some(config) = config.filter(is_present) {
        response.insert("config".into(), config);
    }
    info!(call_id = %request.call_id, "Chat session created");
    Json(Value::Object(response)).into_response()
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

/// `GET /status`: liveness.
async fn status_handler() -> Json<Value> {
    info!("Status check");
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    }))
}

/// `GET /ws`: run one call over the upgraded socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request = call_request_from_query(&params);
    ws.on_upgrade(move |socket| async move {
        info!(call_id = %request.call_id, "Client connected");
        let (source, sink) = websocket::split(socket);
        let system = AgentSystem::new(
            source,
            sink,
            SystemSettings::from(state.config.as_ref()),
            request.call_id.clone(),
        );
        run_call(system, state.call_handler.as_ref(), request).await;
    })
}

/// Drive one call to completion. A failing or panicking handler gets an
/// error message and `end_call` sent to the peer; cleanup always runs.
pub async fn run_call(mut system: AgentSystem, handler: &dyn CallHandler, request: CallRequest) {
    let call_id = request.call_id.clone();
    let outcome = AssertUnwindSafe(handler.handle_call(&mut system, request))
        .catch_unwind()
        .await;
    let failed = match outcome {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(call_id = %call_id, error = %e, "Call handler failed");
            true
        }
        Err(_) => {
            error!(call_id = %call_id, "Call handler panicked");
            true
        }
    };
    if failed {
        system.harness().send_error(CALL_FAILED_MESSAGE).await;
        system.harness().end_call().await;
    }
    system.cleanup().await;
    info!(call_id = %call_id, "Call finished");
}
