//! Seams to the embedding editor. The bridge only ever calls these from the tick.

use serde_json::{Map, Value};

/// Executes named commands against the editor.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, tool_name: &str, payload: &Map<String, Value>) -> anyhow::Result<Value>;

    /// Whether running this command will itself recompile scripts and wipe
    /// in-process state, so its result has to be delivered after the reload.
    fn is_reload_triggering(&self, _tool_name: &str, _payload: &Map<String, Value>) -> bool {
        false
    }
}

/// Collects the editor context pushed to the client in `context:update`.
pub trait ContextProvider: Send + Sync {
    fn snapshot(&self) -> Map<String, Value>;
}

/// Context provider for hosts that have nothing to report.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyContext;

impl ContextProvider for EmptyContext {
    fn snapshot(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Host identity announced in `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub version: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            name: "editor".to_string(),
            version: "unknown".to_string(),
        }
    }
}
