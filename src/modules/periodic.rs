//! Periodic module
//!
//! A daemon that runs another module on a fixed interval until cancelled.
//! Five consecutive failed invocations make it give up and self-terminate
//! through its finish callback; any success resets the counter.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant};
use tracing::{error, info};

use crate::error::Result;
use crate::modules::{Module, ModuleCtx, ModuleHandler, ModuleInfo, ModuleKind};
use crate::server::BgpmondServer;
use crate::util::{check_for_keys, parse_opt_string, OptMap};

/// Consecutive failures tolerated before the daemon stops itself
const MAX_FAILURES: u32 = 5;

pub fn handler() -> ModuleHandler {
    ModuleHandler {
        info: ModuleInfo {
            type_name: "periodic".to_string(),
            kind: ModuleKind::Daemon,
            description: "Run another module repeatedly".to_string(),
            opts: "duration: how often to run the module, e.g. 30s or 5m\n\
                   module: the type of the module to run\n\
                   args: an option string (-key value ...) passed to that module"
                .to_string(),
        },
        maker: Arc::new(|server| Box::new(PeriodicModule { server })),
    }
}

struct PeriodicModule {
    server: Arc<dyn BgpmondServer>,
}

#[async_trait]
impl Module for PeriodicModule {
    async fn run(self: Box<Self>, args: OptMap, ctx: ModuleCtx) -> Result<()> {
        if !check_for_keys(&args, &["duration", "module", "args"]) {
            error!("expected option keys: duration, module, args. got {:?}", args);
            (ctx.finish)();
            return Ok(());
        }

        let duration = match humantime::parse_duration(&args["duration"]) {
            Ok(d) => d,
            Err(err) => {
                error!(%err, "error parsing duration: {}", args["duration"]);
                (ctx.finish)();
                return Ok(());
            }
        };
        let target = args["module"].clone();
        let sub_args = match parse_opt_string(&args["args"]) {
            Ok(map) => map,
            Err(err) => {
                error!(%err, "error parsing argument string: {}", args["args"]);
                (ctx.finish)();
                return Ok(());
            }
        };

        let mut tick = interval_at(Instant::now() + duration, duration);
        let mut run_count: u64 = 0;
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    info!("stopping periodic");
                    return Ok(());
                }
                _ = tick.tick() => {
                    let id = format!("periodic-{}{}", target, run_count);
                    match self.server.run_module(&target, &id, sub_args.clone()).await {
                        Ok(()) => failures = 0,
                        Err(err) => {
                            error!(module = %target, %err, "error running module");
                            failures += 1;
                        }
                    }

                    if failures >= MAX_FAILURES {
                        error!(module = %target, "failed to run module {} times, stopping", MAX_FAILURES);
                        (ctx.finish)();
                        return Ok(());
                    }
                    run_count += 1;
                }
            }
        }
    }
}
