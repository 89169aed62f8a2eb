//! Server core and WebSocket RPC surface
//!
//! The [`Server`] owns the live sessions (keyed by UUID) and the module
//! registry, and dispatches module invocations. Modules and handlers program
//! against the [`BgpmondServer`] trait so they can be driven by a scripted
//! implementation in tests.
//!
//! The RPC surface is a JSON-envelope WebSocket API:
//!
//! - `protocol` — request/response envelopes and error codes
//! - `handler` — the `WsMethod` trait and handler context
//! - `router` — registry-based method routing
//! - `handlers` — the method implementations
//!
//! The connection loop enforces a maximum message size, a periodic ping
//! keepalive, and an idle timeout.

pub mod handler;
pub mod handlers;
pub mod protocol;
pub mod router;

pub use handler::{WsContext, WsError, WsMethod, WsResult};
pub use protocol::{ErrorCode, ErrorData, RequestEnvelope, ResponseEnvelope, ResponseType};
pub use router::{Dispatcher, Router};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock as StdRwLock, Weak};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router as AxumRouter,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::BgpmondConfig;
use crate::db::{ReadFilter, ReadStream, Session, WriteKind, WriteStream};
use crate::error::{Error, Result};
use crate::modules::{ModuleCtx, ModuleHandler, ModuleInfo, ModuleKind};
use crate::util::OptMap;

// =============================================================================
// Server core
// =============================================================================

/// The surface modules and RPC handlers program against
#[async_trait]
pub trait BgpmondServer: Send + Sync + 'static {
    /// Open a session from a named configuration entry under the given ID.
    async fn open_session(&self, session_type: &str, id: &str, workers: usize) -> Result<String>;

    /// Close a session, aborting every stream it owns.
    async fn close_session(&self, id: &str) -> Result<()>;

    /// Open a read stream on a session.
    async fn open_read_stream(&self, session_id: &str, filter: ReadFilter) -> Result<ReadStream>;

    /// Open a write stream on a session.
    async fn open_write_stream(&self, session_id: &str, kind: WriteKind) -> Result<WriteStream>;

    /// Describe the registered modules.
    fn list_modules(&self) -> Vec<ModuleInfo>;

    /// Run a module under the given instance ID. Tasks run to completion and
    /// report their outcome; daemons are spawned and tracked.
    async fn run_module(&self, type_name: &str, id: &str, args: OptMap) -> Result<()>;

    /// Shut down: cancel running daemons and close every session.
    async fn close(&self);
}

struct RunningModule {
    type_name: String,
    cancel: CancellationToken,
}

/// Registry of live sessions and modules
pub struct Server {
    config: BgpmondConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    modules: StdRwLock<HashMap<String, ModuleHandler>>,
    running: Arc<Mutex<HashMap<String, RunningModule>>>,
    cancel: CancellationToken,
    self_ref: Weak<Server>,
}

impl Server {
    pub fn new(config: BgpmondConfig) -> Arc<Server> {
        Arc::new_cyclic(|weak| Server {
            config,
            sessions: RwLock::new(HashMap::new()),
            modules: StdRwLock::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            self_ref: weak.clone(),
        })
    }

    /// Add a module handler to the registry.
    pub fn register_module(&self, handler: ModuleHandler) {
        let type_name = handler.info.type_name.clone();
        self.modules.write().unwrap().insert(type_name, handler);
    }

    async fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("session {}", id)))
    }
}

#[async_trait]
impl BgpmondServer for Server {
    async fn open_session(&self, session_type: &str, id: &str, workers: usize) -> Result<String> {
        if self.sessions.read().await.contains_key(id) {
            return Err(Error::already_exists(format!("session {}", id)));
        }

        let conf = self.config.session(session_type)?;
        let session = Session::new(conf, &self.config.nodes, id, workers).await?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            drop(sessions);
            session.close().await;
            return Err(Error::already_exists(format!("session {}", id)));
        }
        sessions.insert(id.to_string(), Arc::new(session));
        info!(session = id, session_type, "opened session");
        Ok(id.to_string())
    }

    async fn close_session(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("session {}", id)))?;
        session.close().await;
        info!(session = id, "closed session");
        Ok(())
    }

    async fn open_read_stream(&self, session_id: &str, filter: ReadFilter) -> Result<ReadStream> {
        self.session(session_id).await?.open_read_stream(filter).await
    }

    async fn open_write_stream(&self, session_id: &str, kind: WriteKind) -> Result<WriteStream> {
        self.session(session_id).await?.open_write_stream(kind).await
    }

    fn list_modules(&self) -> Vec<ModuleInfo> {
        self.modules
            .read()
            .unwrap()
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    async fn run_module(&self, type_name: &str, id: &str, args: OptMap) -> Result<()> {
        let handler = self
            .modules
            .read()
            .unwrap()
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("module type {}", type_name)))?;

        let server: Arc<dyn BgpmondServer> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::programmer("server dropped while running a module"))?;

        let cancel = self.cancel.child_token();
        {
            let mut running = self.running.lock().unwrap();
            if running.contains_key(id) {
                return Err(Error::already_exists(format!("module ID {}", id)));
            }
            running.insert(
                id.to_string(),
                RunningModule {
                    type_name: type_name.to_string(),
                    cancel: cancel.clone(),
                },
            );
        }

        let finish: Arc<dyn Fn() + Send + Sync> = {
            let running = Arc::clone(&self.running);
            let id = id.to_string();
            Arc::new(move || {
                running.lock().unwrap().remove(&id);
            })
        };
        let ctx = ModuleCtx {
            cancel,
            finish: finish.clone(),
        };

        let module = (handler.maker)(server);
        info!(module = type_name, id, "running module");

        match handler.info.kind {
            ModuleKind::Task => {
                let res = module.run(args, ctx).await;
                finish();
                res
            }
            ModuleKind::Daemon => {
                let type_name = type_name.to_string();
                tokio::spawn(async move {
                    if let Err(err) = module.run(args, ctx).await {
                        error!(module = %type_name, %err, "daemon exited with error");
                    }
                    finish();
                });
                Ok(())
            }
        }
    }

    async fn close(&self) {
        info!("shutting down server");
        self.cancel.cancel();

        let sessions: Vec<(String, Arc<Session>)> =
            self.sessions.write().await.drain().collect();
        for (_, session) in sessions {
            session.close().await;
        }

        let leftover: Vec<String> = {
            let mut running = self.running.lock().unwrap();
            running.values().for_each(|m| m.cancel.cancel());
            running.drain().map(|(_, m)| m.type_name).collect()
        };
        if !leftover.is_empty() {
            warn!(?leftover, "modules still registered at shutdown");
        }
    }
}

// =============================================================================
// Server configuration
// =============================================================================

/// RPC surface configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: String,

    /// Port to listen on
    pub port: u16,

    /// Maximum message size in bytes
    pub max_message_size: usize,

    /// Connection idle timeout in seconds
    pub connection_timeout_secs: u64,

    /// Ping interval in seconds
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 6060,
            max_message_size: 1024 * 1024,
            connection_timeout_secs: 300,
            ping_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Get the full bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Router creation
// =============================================================================

/// Create a router with every method registered
pub fn create_router() -> Router {
    use handlers::*;

    let mut router = Router::new();
    router.register::<SessionOpenHandler>();
    router.register::<SessionCloseHandler>();
    router.register::<ModuleListHandler>();
    router.register::<ModuleRunHandler>();
    router
}

// =============================================================================
// Axum wiring
// =============================================================================

/// Shared state for the WebSocket endpoint
#[derive(Clone)]
struct ServerState {
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
}

fn create_axum_router(state: ServerState) -> AxumRouter {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    AxumRouter::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection
async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();

    info!("websocket connection established");

    let max_message_size = state.config.max_message_size;
    let ping_interval = Duration::from_secs(state.config.ping_interval_secs.max(1));
    let idle_timeout = Duration::from_secs(state.config.connection_timeout_secs.max(1));

    let mut last_activity = Instant::now();
    let mut ping = tokio::time::interval(ping_interval);
    ping.reset();

    loop {
        tokio::select! {
            maybe_msg = receiver.next() => {
                let Some(Ok(msg)) = maybe_msg else {
                    break;
                };
                last_activity = Instant::now();

                match msg {
                    Message::Text(text) => {
                        if text.len() > max_message_size {
                            let resp = ResponseEnvelope::error(
                                uuid::Uuid::new_v4().to_string(),
                                ErrorData::invalid_request("message too large"),
                            );
                            if send_response(&mut sender, &resp).await.is_err() {
                                break;
                            }
                            continue;
                        }

                        let resp = state.dispatcher.dispatch(&text).await;
                        if send_response(&mut sender, &resp).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    info!("closing idle websocket connection");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("websocket connection closed");
}

async fn send_response(
    sender: &mut (impl SinkExt<Message> + Unpin),
    resp: &ResponseEnvelope,
) -> std::result::Result<(), ()> {
    let text = match serde_json::to_string(resp) {
        Ok(text) => text,
        Err(err) => {
            error!(%err, "failed to serialize response");
            return Err(());
        }
    };
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

/// Serve the RPC surface until shutdown. Ctrl-c closes every session and
/// cancels every daemon before returning.
pub async fn start_server(server: Arc<Server>, config: ServerConfig) -> anyhow::Result<()> {
    let router = create_router();
    let dispatcher = Dispatcher::new(
        router,
        WsContext {
            server: Arc::clone(&server),
        },
    );
    let state = ServerState {
        dispatcher: Arc::new(dispatcher),
        config: Arc::new(config.clone()),
    };

    let app = create_axum_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!(address = %config.bind_address(), "bgpmond listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(server))
        .await?;
    Ok(())
}

async fn shutdown_signal(server: Arc<Server>) {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install ctrl-c handler");
        return;
    }
    server.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_router_registers_methods() {
        let router = create_router();
        for method in ["session.open", "session.close", "module.list", "module.run"] {
            assert!(router.has_method(method), "missing method {}", method);
        }
        assert!(!router.has_method("no.such.method"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let server = Server::new(BgpmondConfig::default());
        let dispatcher = Dispatcher::new(create_router(), WsContext { server });

        let resp = dispatcher
            .dispatch(r#"{"id": "r1", "method": "no.such.method"}"#)
            .await;
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.response_type, ResponseType::Error);
    }

    #[tokio::test]
    async fn test_dispatch_malformed_request() {
        let server = Server::new(BgpmondConfig::default());
        let dispatcher = Dispatcher::new(create_router(), WsContext { server });

        let resp = dispatcher.dispatch("{not json").await;
        assert_eq!(resp.response_type, ResponseType::Error);
    }

    #[tokio::test]
    async fn test_module_registry() {
        let server = Server::new(BgpmondConfig::default());
        crate::modules::register_all(&server);

        let mut types: Vec<String> = server
            .list_modules()
            .into_iter()
            .map(|m| m.type_name)
            .collect();
        types.sort();
        assert_eq!(types, vec!["hijack".to_string(), "periodic".to_string()]);
    }

    #[tokio::test]
    async fn test_run_unknown_module() {
        let server = Server::new(BgpmondConfig::default());
        let res = server
            .run_module("missing", "id-1", Default::default())
            .await;
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let server = Server::new(BgpmondConfig::default());
        assert!(matches!(
            server.close_session("nope").await,
            Err(Error::NotFound(_))
        ));
    }
}
