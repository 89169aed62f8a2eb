use clap::{Args, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{call, report, CallError, Endpoint};

#[derive(Subcommand)]
pub enum ModuleCommands {
    /// List the modules the bgpmond offers.
    List,

    /// Run a module against an open session.
    Run(RunArgs),
}

/// Arguments for `module run`
#[derive(Args)]
pub struct RunArgs {
    /// Registered module type to run
    pub module_type: String,

    /// ID of the session the module should use
    pub session_id: String,

    /// Module options as -key value pairs
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Tabled)]
struct ModuleRow {
    #[serde(rename = "type")]
    #[tabled(rename = "type")]
    type_name: String,
    kind: String,
    description: String,
    #[tabled(skip)]
    opts: String,
}

pub fn run(endpoint: &Endpoint, commands: ModuleCommands) -> i32 {
    match commands {
        ModuleCommands::List => list(endpoint),
        ModuleCommands::Run(args) => run_module(endpoint, args),
    }
}

fn list(endpoint: &Endpoint) -> i32 {
    let data = match call(endpoint, "module.list", json!({})) {
        Ok(data) => data,
        Err(err) => return report(err),
    };

    let modules: Vec<ModuleRow> = match serde_json::from_value(data["modules"].clone()) {
        Ok(modules) => modules,
        Err(err) => {
            return report(CallError::Client(format!("malformed module list: {}", err)))
        }
    };

    println!("{}", Table::new(&modules).with(Style::sharp()));
    for module in &modules {
        if !module.opts.is_empty() {
            println!("\n{} options:\n{}", module.type_name, module.opts);
        }
    }
    0
}

fn run_module(endpoint: &Endpoint, args: RunArgs) -> i32 {
    // The session always travels as an option so modules share one surface.
    let mut opts = format!("-session {}", args.session_id);
    if !args.args.is_empty() {
        opts.push(' ');
        opts.push_str(&args.args.join(" "));
    }

    let params = json!({ "module_type": args.module_type, "args": opts });
    match call(endpoint, "module.run", params) {
        Ok(data) => {
            println!("Ran module: {}", data["id"].as_str().unwrap_or_default());
            0
        }
        Err(err) => report(err),
    }
}
