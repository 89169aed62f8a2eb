use clap::Args;
use serde_json::json;

use super::{call, report, Endpoint};

/// Arguments for the Close command
#[derive(Args)]
pub struct CloseArgs {
    /// ID of the session to close
    pub session_id: String,
}

pub fn run(endpoint: &Endpoint, args: CloseArgs) -> i32 {
    match call(
        endpoint,
        "session.close",
        json!({ "session_id": args.session_id }),
    ) {
        Ok(_) => {
            println!("Closed session: {}", args.session_id);
            0
        }
        Err(err) => report(err),
    }
}
