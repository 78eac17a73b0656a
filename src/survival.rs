//! Compilation survival: bridging a session across a full in-process wipe.
//!
//! Script recompilation ends with the host discarding every in-memory value,
//! this struct included. Whatever the bridge still owes the client at that
//! point (a reconnect, a compilation result, the result of the command that
//! triggered the compile) is written to the [`DurableStore`] first and
//! reconstructed from it when the process resumes.
//!
//! ```text
//! Idle --compile started--> Compiling --before reload--> ReloadPending
//!   ^                                                        |
//!   |                                                     (wipe)
//!   +------------process resumed------------ AwaitingReconnect
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{CommandRequest, CompilationResult, Diagnostic};
use crate::sender::DurableReceipt;
use crate::store::{get_json, set_json, DurableStore};

pub mod keys {
    pub const RECONNECT_MARKER: &str = "bridge.reconnect_marker";
    pub const COMPILE_STARTED_AT: &str = "bridge.compile_started_at";
    pub const COMPILATION_RESULT: &str = "bridge.compilation_result";
    pub const PENDING_COMMAND: &str = "bridge.pending_command";
}

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How long a reload-triggering command may wait for its compile to start
/// before the executor's own result is delivered instead.
pub const PENDING_COMMAND_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurvivalState {
    Idle,
    Compiling,
    ReloadPending,
    AwaitingReconnect,
}

/// A command whose execution wipes the process; its result is owed after the reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    pub command_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub created_at_ms: i64,
    #[serde(default)]
    pub provisional_result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCompilation {
    pub finished_at_ms: i64,
    pub result: CompilationResult,
}

pub struct CompilationSurvival {
    store: Arc<dyn DurableStore>,
    state: SurvivalState,
    restart_notice_armed: bool,
    compile_started: Option<Instant>,
    last_progress: Option<Instant>,
}

impl CompilationSurvival {
    /// Rebuilds the machine from durable storage alone.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        let marker = read_flag(store.as_ref(), keys::RECONNECT_MARKER);
        Self {
            store,
            state: if marker {
                SurvivalState::AwaitingReconnect
            } else {
                SurvivalState::Idle
            },
            restart_notice_armed: false,
            compile_started: None,
            last_progress: None,
        }
    }

    pub fn state(&self) -> SurvivalState {
        self.state
    }

    /// Engages only when a client is connected or the listener is active.
    pub fn on_compilation_started(&mut self, bridge_active: bool, now_ms: i64, now: Instant) -> bool {
        if !bridge_active {
            tracing::debug!("compilation started with bridge inactive; not tracking");
            return false;
        }
        self.write(|s| s.set_bool(keys::RECONNECT_MARKER, true), "reconnect marker");
        self.write(
            |s| s.set_string(keys::COMPILE_STARTED_AT, &now_ms.to_string()),
            "compile start time",
        );
        self.state = SurvivalState::Compiling;
        self.compile_started = Some(now);
        self.last_progress = Some(now);
        true
    }

    /// Persists the result of every compile, whether or not a reload follows.
    pub fn on_compilation_finished(
        &mut self,
        success: bool,
        diagnostics: Vec<Diagnostic>,
        now_ms: i64,
    ) -> StoredCompilation {
        let started_ms = self
            .store
            .get_string(keys::COMPILE_STARTED_AT)
            .ok()
            .flatten()
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        let elapsed_seconds = started_ms
            .map(|start| (now_ms - start).max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        let stored = StoredCompilation {
            finished_at_ms: now_ms,
            result: CompilationResult {
                success,
                diagnostics,
                elapsed_seconds,
            },
        };
        self.write(
            |s| set_json(s, keys::COMPILATION_RESULT, &stored),
            "compilation result",
        );
        self.write(|s| s.delete_key(keys::COMPILE_STARTED_AT), "compile start time");

        if self.state == SurvivalState::Compiling {
            self.state = SurvivalState::Idle;
        }
        self.compile_started = None;
        self.last_progress = None;
        stored
    }

    pub fn on_before_reload(&mut self, bridge_active: bool) {
        if bridge_active {
            self.write(|s| s.set_bool(keys::RECONNECT_MARKER, true), "reconnect marker");
        }
        self.state = SurvivalState::ReloadPending;
    }

    /// Returns whether the bridge should reconnect on its own.
    pub fn on_process_resumed(&mut self) -> bool {
        let marker = read_flag(self.store.as_ref(), keys::RECONNECT_MARKER);
        self.state = SurvivalState::Idle;
        if !marker {
            return false;
        }
        self.write(|s| s.delete_key(keys::RECONNECT_MARKER), "reconnect marker");
        self.restart_notice_armed = true;
        true
    }

    /// One-shot: true exactly once after a resume that found the marker.
    pub fn take_restart_notice(&mut self) -> bool {
        std::mem::take(&mut self.restart_notice_armed)
    }

    /// Elapsed seconds if a progress notice is due.
    pub fn progress_due(&mut self, now: Instant) -> Option<f64> {
        if self.state != SurvivalState::Compiling {
            return None;
        }
        let started = self.compile_started?;
        let last = self.last_progress.unwrap_or(started);
        if now.saturating_duration_since(last) < PROGRESS_INTERVAL {
            return None;
        }
        self.last_progress = Some(now);
        Some(now.saturating_duration_since(started).as_secs_f64())
    }

    pub fn compilation_result(&self) -> Option<StoredCompilation> {
        self.read(keys::COMPILATION_RESULT)
    }

    pub fn pending_command(&self) -> Option<PendingCommand> {
        self.read(keys::PENDING_COMMAND)
    }

    /// Only one command can wait on a reload. Returns the record this one
    /// replaces, which the caller still has to answer.
    pub fn record_pending_command(&self, cmd: &CommandRequest, now_ms: i64) -> Option<PendingCommand> {
        let displaced = self
            .pending_command()
            .filter(|old| old.command_id != cmd.command_id);
        let pending = PendingCommand {
            command_id: cmd.command_id.clone(),
            tool_name: cmd.tool_name.clone(),
            payload: cmd.payload.clone(),
            created_at_ms: now_ms,
            provisional_result: None,
        };
        self.write(
            |s| set_json(s, keys::PENDING_COMMAND, &pending),
            "pending command",
        );
        displaced
    }

    pub fn set_provisional_result(&self, command_id: &str, result: Value) {
        let Some(mut pending) = self.pending_command() else {
            return;
        };
        if pending.command_id != command_id {
            return;
        }
        pending.provisional_result = Some(result);
        self.write(
            |s| set_json(s, keys::PENDING_COMMAND, &pending),
            "pending command",
        );
    }

    pub fn clear_pending_command(&self) {
        self.write(|s| s.delete_key(keys::PENDING_COMMAND), "pending command");
    }

    /// Whether the record a receipt refers to is still waiting for delivery.
    pub fn is_outstanding(&self, receipt: &DurableReceipt) -> bool {
        match receipt {
            DurableReceipt::CompilationResult { finished_at_ms } => self
                .compilation_result()
                .is_some_and(|c| c.finished_at_ms == *finished_at_ms),
            DurableReceipt::PendingCommand { command_id } => self
                .pending_command()
                .is_some_and(|p| p.command_id == *command_id),
        }
    }

    /// Deletes the record once its envelope has been written.
    pub fn acknowledge(&self, receipt: &DurableReceipt) {
        if !self.is_outstanding(receipt) {
            return;
        }
        match receipt {
            DurableReceipt::CompilationResult { .. } => self.write(
                |s| s.delete_key(keys::COMPILATION_RESULT),
                "compilation result",
            ),
            DurableReceipt::PendingCommand { .. } => self.clear_pending_command(),
        }
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match get_json(self.store.as_ref(), key) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding unreadable bridge record");
                let _ = self.store.delete_key(key);
                None
            }
        }
    }

    fn write<F>(&self, op: F, what: &str)
    where
        F: FnOnce(&dyn DurableStore) -> Result<(), crate::error::StoreError>,
    {
        if let Err(err) = op(self.store.as_ref()) {
            tracing::warn!(record = what, error = %err, "failed to update bridge survival record");
        }
    }
}

fn read_flag(store: &dyn DurableStore, key: &str) -> bool {
    store.get_bool(key).unwrap_or_else(|err| {
        tracing::warn!(key, error = %err, "failed to read bridge survival flag");
        false
    })
}
