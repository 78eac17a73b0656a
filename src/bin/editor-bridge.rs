//! Standalone bridge host: a headless editor stand-in for client development.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use editor_bridge::auth::{ensure_token_file, mask_secret};
use editor_bridge::logging::init_logging;
use editor_bridge::{
    Bridge, BridgeConfig, Collaborators, CommandExecutor, ContextProvider, Credentials, FileStore,
};

const TICK_INTERVAL: Duration = Duration::from_millis(16);
const SIMULATED_COMPILE: Duration = Duration::from_secs(2);

struct DemoExecutor {
    compile_requests: mpsc::UnboundedSender<()>,
}

impl CommandExecutor for DemoExecutor {
    fn execute(&self, tool_name: &str, payload: &Map<String, Value>) -> anyhow::Result<Value> {
        match tool_name {
            "ping" => Ok(json!("pong")),
            "echo" => Ok(Value::Object(payload.clone())),
            "time" => Ok(json!({ "unixMs": chrono::Utc::now().timestamp_millis() })),
            "recompile" => {
                self.compile_requests
                    .send(())
                    .map_err(|_| anyhow::anyhow!("host loop has stopped"))?;
                Ok(json!({ "queued": true }))
            }
            other => anyhow::bail!("unknown tool: {other}"),
        }
    }

    fn is_reload_triggering(&self, tool_name: &str, _payload: &Map<String, Value>) -> bool {
        tool_name == "recompile"
    }
}

struct DemoContext {
    started: Instant,
}

impl ContextProvider for DemoContext {
    fn snapshot(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("host".into(), json!("editor-bridge"));
        map.insert("uptimeSeconds".into(), json!(self.started.elapsed().as_secs()));
        map
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::load();
    let _log_guard = init_logging(&config.log_dir())?;

    let mut credentials = config.credentials();
    if !credentials.is_configured() {
        if let Some(path) = config.token_file.as_deref() {
            let token = ensure_token_file(path)
                .with_context(|| format!("create bridge token at {}", path.display()))?;
            tracing::info!(path = %path.display(), token = %mask_secret(&token), "generated bridge token");
            credentials = Credentials::from_token(token);
        }
    }

    let (compile_tx, mut compile_rx) = mpsc::unbounded_channel();
    let store = FileStore::new(config.store_dir());
    tracing::debug!(dir = %store.dir().display(), "durable bridge state");
    let mut bridge = Bridge::new(
        config,
        credentials,
        Collaborators {
            executor: Arc::new(DemoExecutor {
                compile_requests: compile_tx,
            }),
            context: Arc::new(DemoContext {
                started: Instant::now(),
            }),
            store: Arc::new(store),
        },
    );
    bridge.on_process_resumed();
    if let Some(addr) = bridge.local_addr() {
        tracing::info!(%addr, mount = %bridge.config().mount_path, "editor bridge ready");
    }

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut compile_done_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down editor bridge");
                break;
            }
            Some(()) = compile_rx.recv() => {
                if compile_done_at.is_none() {
                    bridge.on_compilation_started();
                    compile_done_at = Some(Instant::now() + SIMULATED_COMPILE);
                }
            }
            _ = ticker.tick() => {
                if compile_done_at.is_some_and(|at| Instant::now() >= at) {
                    compile_done_at = None;
                    bridge.on_compilation_finished(true, Vec::new());
                }
                bridge.tick().await;
            }
        }
    }

    bridge.disconnect();
    // Let the close frame go out before the runtime shuts down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
