//! CLI subcommands and the WebSocket call helper

pub mod close;
pub mod module;
pub mod open;

use bgpmond::server::{ErrorData, ResponseEnvelope, ResponseType};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Where the bgpmond lives. Flags win over `BGPMOND_HOST`/`BGPMOND_PORT`,
/// which win over the defaults.
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn resolve(host: Option<String>, port: Option<u16>) -> Endpoint {
        let host = host
            .or_else(|| std::env::var("BGPMOND_HOST").ok())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = port
            .or_else(|| std::env::var("BGPMOND_PORT").ok().and_then(|p| p.parse().ok()))
            .unwrap_or(6060);
        Endpoint { host, port }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// A failed call, split by who is at fault for the exit code.
pub enum CallError {
    Client(String),
    Server(ErrorData),
}

/// Print the error and return the matching exit code.
pub fn report(err: CallError) -> i32 {
    match err {
        CallError::Client(msg) => {
            eprintln!("ERROR: {}", msg);
            1
        }
        CallError::Server(data) => {
            eprintln!("ERROR ({:?}): {}", data.code, data.message);
            2
        }
    }
}

/// Issue one method call and wait for its terminal response.
pub fn call(endpoint: &Endpoint, method: &str, params: Value) -> Result<Value, CallError> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CallError::Client(format!("failed to start runtime: {}", e)))?;
    rt.block_on(call_async(endpoint, method, params))
}

async fn call_async(endpoint: &Endpoint, method: &str, params: Value) -> Result<Value, CallError> {
    let url = endpoint.ws_url();
    let (mut ws, _) = connect_async(&url)
        .await
        .map_err(|e| CallError::Client(format!("failed to connect to {}: {}", url, e)))?;

    let id = uuid::Uuid::new_v4().to_string();
    let request = json!({ "id": id, "method": method, "params": params });
    ws.send(Message::Text(request.to_string()))
        .await
        .map_err(|e| CallError::Client(format!("failed to send request: {}", e)))?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| CallError::Client(format!("connection error: {}", e)))?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            // Pings and pongs are not responses.
            _ => continue,
        };

        let resp: ResponseEnvelope = serde_json::from_str(&text)
            .map_err(|e| CallError::Client(format!("malformed response: {}", e)))?;
        if resp.id != id {
            continue;
        }

        return match resp.response_type {
            ResponseType::Result => Ok(resp.data),
            ResponseType::Error => {
                let data: ErrorData = serde_json::from_value(resp.data)
                    .map_err(|e| CallError::Client(format!("malformed error response: {}", e)))?;
                Err(CallError::Server(data))
            }
        };
    }

    Err(CallError::Client(
        "connection closed without a response".to_string(),
    ))
}
