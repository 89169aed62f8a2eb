//! Registry-based method routing

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::server::handler::{make_handler, DynHandler, WsContext, WsMethod};
use crate::server::protocol::{ErrorData, RequestEnvelope, ResponseEnvelope};

/// Router mapping method names to handlers
#[derive(Default)]
pub struct Router {
    handlers: HashMap<&'static str, DynHandler>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            handlers: HashMap::new(),
        }
    }

    /// Register a method handler
    pub fn register<M: WsMethod>(&mut self) -> &mut Self {
        self.handlers.insert(M::METHOD, make_handler::<M>());
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    fn get_handler(&self, method: &str) -> Option<&DynHandler> {
        self.handlers.get(method)
    }
}

/// Dispatcher combining the router with the shared handler context
pub struct Dispatcher {
    router: Router,
    context: Arc<WsContext>,
}

impl Dispatcher {
    pub fn new(router: Router, context: WsContext) -> Dispatcher {
        Dispatcher {
            router,
            context: Arc::new(context),
        }
    }

    /// Parse one request message, run its handler, and produce the terminal
    /// response envelope.
    pub async fn dispatch(&self, message: &str) -> ResponseEnvelope {
        let envelope: RequestEnvelope = match serde_json::from_str(message) {
            Ok(env) => env,
            Err(err) => {
                let id = uuid::Uuid::new_v4().to_string();
                return ResponseEnvelope::error(
                    id,
                    ErrorData::invalid_request(format!("failed to parse request: {}", err)),
                );
            }
        };

        let id = envelope
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(id = %id, method = %envelope.method, "dispatching request");

        let Some(handler) = self.router.get_handler(&envelope.method) else {
            return ResponseEnvelope::error(id, ErrorData::unknown_method(&envelope.method));
        };

        match handler(Arc::clone(&self.context), envelope.params).await {
            Ok(data) => ResponseEnvelope::result(id, data),
            Err(err) => ResponseEnvelope::error(id, err.to_error_data()),
        }
    }
}
