use clap::Args;
use serde_json::json;

use super::{call, report, Endpoint};

/// Arguments for the Open command
#[derive(Args)]
pub struct OpenArgs {
    /// Name of the configured session type to open
    pub session_type: String,

    /// ID for the new session, generated when not given
    #[clap(long)]
    pub session_id: Option<String>,

    /// Worker pool size for the session; 0 uses the server default
    #[clap(long, default_value_t = 0)]
    pub workers: usize,
}

pub fn run(endpoint: &Endpoint, args: OpenArgs) -> i32 {
    let id = args
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    println!(
        "Trying to open a session named: {} with ID: {}",
        args.session_type, id
    );

    let params = json!({
        "name": args.session_type,
        "session_id": id,
        "workers": args.workers,
    });
    match call(endpoint, "session.open", params) {
        Ok(data) => {
            println!(
                "Opened session: {}",
                data["session_id"].as_str().unwrap_or_default()
            );
            0
        }
        Err(err) => report(err),
    }
}
