//! Module runtime
//!
//! Modules are user-invokable units hosted by the server. A **task** runs to
//! completion when invoked; a **daemon** keeps running until the server's
//! cancel signal fires or it self-terminates through its finish callback.
//! Both shapes program against the [`BgpmondServer`] trait, which is what
//! lets tests drive them with a scripted server.

mod hijack;
mod periodic;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::server::{BgpmondServer, Server};
use crate::util::OptMap;

/// How a module runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// One-shot: runs to completion inside `run_module`
    Task,
    /// Long-running: spawned, stopped by cancel or its finish callback
    Daemon,
}

/// Descriptive entry in the module registry
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: ModuleKind,
    pub description: String,
    /// Human-readable option schema shown by `module list`
    pub opts: String,
}

/// Callback a daemon invokes when it self-terminates
pub type FinishFunc = Arc<dyn Fn() + Send + Sync>;

/// Runtime context handed to a running module
#[derive(Clone)]
pub struct ModuleCtx {
    /// Fires when the server shuts down
    pub cancel: CancellationToken,
    /// Deregisters this module instance
    pub finish: FinishFunc,
}

/// A runnable module instance
#[async_trait]
pub trait Module: Send {
    async fn run(self: Box<Self>, args: OptMap, ctx: ModuleCtx) -> Result<()>;
}

/// Factory producing a module instance bound to a server handle
pub type ModuleMaker = Arc<dyn Fn(Arc<dyn BgpmondServer>) -> Box<dyn Module> + Send + Sync>;

/// Registry entry: description plus factory
#[derive(Clone)]
pub struct ModuleHandler {
    pub info: ModuleInfo,
    pub maker: ModuleMaker,
}

/// Register every built-in module with the server.
pub fn register_all(server: &Server) {
    server.register_module(periodic::handler());
    server.register_module(hijack::handler());
}
