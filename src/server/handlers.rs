//! Method handler implementations
//!
//! - `session.open` — open a configured session, returning its ID
//! - `session.close` — close a session and every stream it owns
//! - `module.list` — describe the registered modules
//! - `module.run` — run a module with an option-string of arguments

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::handler::{WsContext, WsError, WsMethod, WsResult};
use crate::server::BgpmondServer;
use crate::util::parse_opt_string;

// =============================================================================
// session.open
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionOpenParams {
    /// Name of a session definition from the daemon's configuration
    pub name: String,

    /// Client-chosen session ID; generated when absent
    #[serde(default)]
    pub session_id: Option<String>,

    /// Worker-pool size; zero or absent uses the configured default
    #[serde(default)]
    pub workers: Option<usize>,
}

pub struct SessionOpenHandler;

#[async_trait]
impl WsMethod for SessionOpenHandler {
    const METHOD: &'static str = "session.open";
    type Params = SessionOpenParams;

    async fn handle(ctx: Arc<WsContext>, params: Self::Params) -> WsResult<Value> {
        let id = params
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let workers = params.workers.unwrap_or(0);

        let id = ctx.server.open_session(&params.name, &id, workers).await?;
        Ok(json!({ "session_id": id }))
    }
}

// =============================================================================
// session.close
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionCloseParams {
    pub session_id: String,
}

pub struct SessionCloseHandler;

#[async_trait]
impl WsMethod for SessionCloseHandler {
    const METHOD: &'static str = "session.close";
    type Params = SessionCloseParams;

    async fn handle(ctx: Arc<WsContext>, params: Self::Params) -> WsResult<Value> {
        ctx.server.close_session(&params.session_id).await?;
        Ok(json!({ "session_id": params.session_id, "closed": true }))
    }
}

// =============================================================================
// module.list
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ModuleListParams {}

pub struct ModuleListHandler;

#[async_trait]
impl WsMethod for ModuleListHandler {
    const METHOD: &'static str = "module.list";
    type Params = ModuleListParams;

    async fn handle(ctx: Arc<WsContext>, _params: Self::Params) -> WsResult<Value> {
        let mut modules = ctx.server.list_modules();
        modules.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        Ok(json!({ "modules": modules }))
    }
}

// =============================================================================
// module.run
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ModuleRunParams {
    /// Registered module type to run
    pub module_type: String,

    /// Option string (`-key value ...`) passed to the module
    #[serde(default)]
    pub args: String,
}

pub struct ModuleRunHandler;

#[async_trait]
impl WsMethod for ModuleRunHandler {
    const METHOD: &'static str = "module.run";
    type Params = ModuleRunParams;

    async fn handle(ctx: Arc<WsContext>, params: Self::Params) -> WsResult<Value> {
        let args = parse_opt_string(&params.args).map_err(|e| WsError::invalid_params(e.to_string()))?;
        let id = format!("{}-{}", params.module_type, uuid::Uuid::new_v4());

        ctx.server
            .run_module(&params.module_type, &id, args)
            .await?;
        Ok(json!({ "id": id }))
    }
}
