//! Handler trait and context for WebSocket methods

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::server::protocol::{ErrorCode, ErrorData};
use crate::server::Server;

/// Shared resources available to every method handler
#[derive(Clone)]
pub struct WsContext {
    pub server: Arc<Server>,
}

/// Result type for WebSocket handlers
pub type WsResult<T> = Result<T, WsError>;

/// Error type for WebSocket handlers
#[derive(Debug, Clone)]
pub struct WsError {
    pub code: ErrorCode,
    pub message: String,
}

impl WsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn to_error_data(&self) -> ErrorData {
        ErrorData::new(self.code, self.message.clone())
    }
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for WsError {}

impl From<Error> for WsError {
    fn from(err: Error) -> Self {
        let data = ErrorData::from(&err);
        Self::new(data.code, data.message)
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}

/// Trait implemented by each WebSocket method
#[async_trait]
pub trait WsMethod: Send + Sync + 'static {
    /// Fully qualified method name, e.g. "session.open"
    const METHOD: &'static str;

    /// Parameter type for this method
    type Params: DeserializeOwned + Send;

    /// Execute the method and produce the result payload
    async fn handle(ctx: Arc<WsContext>, params: Self::Params) -> WsResult<Value>;
}

/// Type-erased handler function
pub type DynHandler = Box<
    dyn Fn(Arc<WsContext>, Value) -> futures::future::BoxFuture<'static, WsResult<Value>>
        + Send
        + Sync,
>;

/// Create a type-erased handler from a WsMethod implementation
pub fn make_handler<M: WsMethod>() -> DynHandler {
    Box::new(move |ctx, params| {
        Box::pin(async move {
            // Absent params deserialize as an empty object.
            let params = if params.is_null() {
                Value::Object(Default::default())
            } else {
                params
            };
            let params: M::Params = serde_json::from_value(params)?;
            M::handle(ctx, params).await
        })
    })
}
