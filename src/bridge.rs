//! The bridge facade the host owns and ticks.
//!
//! All protocol state lives in [`Bridge`] and is only mutated through
//! `&mut self`: lifecycle hooks called by the host, and [`Bridge::tick`].
//! Socket tasks feed it through the inbound channel and the dispatcher.

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::auth::Credentials;
use crate::config::BridgeConfig;
use crate::dispatch::{self, ActionQueue, MainThreadDispatcher};
use crate::envelope::{parse_inbound, ClientInfo, CommandRequest, Diagnostic, Inbound, Outbound};
use crate::heartbeat::HeartbeatMonitor;
use crate::host::{CommandExecutor, ContextProvider};
use crate::registry::{
    AcceptContext, CloseReason, ConnectionRegistry, ConnectionState, InboundFrame, WsStream,
};
use crate::sender::{
    write_text, DurableReceipt, PendingSend, RetryQueue, RETRIES_PER_TICK, RETRY_SPACING,
    SEND_TIMEOUT,
};
use crate::store::DurableStore;
use crate::survival::{CompilationSurvival, SurvivalState, PENDING_COMMAND_GRACE};

pub const RESTART_REASON: &str = "domain_reload";
const PROGRESS_STATUS: &str = "compiling";

/// Host-side collaborators handed to [`Bridge::new`].
pub struct Collaborators {
    pub executor: Arc<dyn CommandExecutor>,
    pub context: Arc<dyn ContextProvider>,
    pub store: Arc<dyn DurableStore>,
}

pub struct Bridge {
    config: BridgeConfig,
    credentials: Arc<Credentials>,
    executor: Arc<dyn CommandExecutor>,
    context: Arc<dyn ContextProvider>,
    registry: ConnectionRegistry,
    survival: CompilationSurvival,
    heartbeat: HeartbeatMonitor,
    outbox: VecDeque<PendingSend>,
    retry: RetryQueue,
    dispatcher: MainThreadDispatcher,
    actions: ActionQueue,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    greeting_pending: bool,
    context_dirty: bool,
    context_forced: bool,
    last_context_push: Option<Instant>,
    deferred_since: Option<Instant>,
}

impl Bridge {
    /// Builds an idle bridge. Survival state is reconstructed from the store,
    /// so this is also the constructor used after a reload.
    pub fn new(config: BridgeConfig, credentials: Credentials, collaborators: Collaborators) -> Self {
        let (dispatcher, actions) = dispatch::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let survival = CompilationSurvival::new(collaborators.store);
        tracing::debug!(
            survival = ?survival.state(),
            credentials = %credentials.describe_source(),
            "bridge created"
        );
        Self {
            config,
            credentials: Arc::new(credentials),
            executor: collaborators.executor,
            context: collaborators.context,
            registry: ConnectionRegistry::new(),
            survival,
            heartbeat: HeartbeatMonitor::new(Instant::now()),
            outbox: VecDeque::new(),
            retry: RetryQueue::default(),
            dispatcher,
            actions,
            inbound_tx,
            inbound_rx,
            greeting_pending: false,
            context_dirty: false,
            context_forced: false,
            last_context_push: None,
            deferred_since: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.registry.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.registry.session_id()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.registry.local_addr()
    }

    /// Remote address of the live client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.registry.peer_addr()
    }

    pub fn client_info(&self) -> Option<&ClientInfo> {
        self.registry.client_info()
    }

    pub fn survival_state(&self) -> SurvivalState {
        self.survival.state()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.registry.subscribe()
    }

    pub fn dispatcher(&self) -> MainThreadDispatcher {
        self.dispatcher.clone()
    }

    pub fn mark_context_dirty(&mut self) {
        self.context_dirty = true;
    }

    /// Starts listening. Idempotent; a bind failure is logged and leaves the
    /// bridge `Disconnected`.
    pub fn connect(&mut self) {
        if self.registry.is_listening() {
            tracing::debug!("bridge connect ignored; already listening");
            return;
        }
        let ctx = AcceptContext {
            mount_path: self.config.mount_path.clone(),
            credentials: self.credentials.clone(),
            dispatcher: self.dispatcher.clone(),
        };
        if let Err(err) = self.registry.start(&self.config.listen_addr(), ctx) {
            tracing::error!(error = %format!("{err:#}"), "failed to start bridge listener");
        }
    }

    /// Stops listening and closes the live socket. Idempotent.
    pub fn disconnect(&mut self) {
        if !self.registry.is_listening() && !self.registry.is_connected() {
            return;
        }
        self.registry.stop(CloseReason::Shutdown);
        self.after_connection_lost();
    }

    /// Queues an envelope for the live connection; dropped when there is none.
    pub fn send(&mut self, envelope: Outbound) {
        self.queue(envelope, None, Instant::now());
    }

    pub fn on_compilation_started(&mut self) {
        let active = self.registry.is_listening() || self.registry.is_connected();
        if !self
            .survival
            .on_compilation_started(active, now_ms(), Instant::now())
        {
            return;
        }
        // A compile has begun, so a deferred command will be answered by its result.
        self.deferred_since = None;
        tracing::info!("compilation started");
        self.send(Outbound::CompilationStarted {
            timestamp: now_ms(),
        });
    }

    pub fn on_compilation_finished(&mut self, success: bool, diagnostics: Vec<Diagnostic>) {
        let stored = self
            .survival
            .on_compilation_finished(success, diagnostics, now_ms());
        tracing::info!(
            success,
            errors = stored.result.error_count(),
            elapsed_seconds = stored.result.elapsed_seconds,
            "compilation finished"
        );
        if self.registry.is_connected() {
            self.queue_durable_records(Instant::now());
        }
    }

    /// Called right before the host wipes in-process state.
    pub fn on_before_reload(&mut self) {
        let active = self.registry.is_listening() || self.registry.is_connected();
        self.survival.on_before_reload(active);
        tracing::info!(bridge_active = active, "bridge preparing for reload");
        self.registry.stop(CloseReason::Reloading);
        self.outbox.clear();
        self.retry.clear();
        self.greeting_pending = false;
    }

    /// Called once the host is running again, on a freshly built bridge.
    pub fn on_process_resumed(&mut self) {
        if self.survival.on_process_resumed() {
            tracing::info!("reconnect marker found; restoring bridge");
            self.connect();
        } else if self.config.auto_connect {
            self.connect();
        }
    }

    pub async fn tick(&mut self) {
        self.tick_at(Instant::now()).await;
    }

    /// One pump iteration against an explicit clock.
    pub async fn tick_at(&mut self, now: Instant) {
        self.run_actions();

        if self.greeting_pending && self.registry.is_connected() {
            self.send_greeting(now);
        }

        self.drain_inbound(now);
        self.check_deferred_command(now);
        self.flush(now).await;

        if self.registry.is_connected() {
            if self.heartbeat.heartbeat_due(now) {
                self.queue(Outbound::Heartbeat { timestamp: now_ms() }, None, now);
                self.heartbeat.record_sent(now);
            }

            if self.heartbeat.is_expired(now) {
                tracing::warn!(
                    silence_ms = self.heartbeat.silence(now).as_millis() as u64,
                    "bridge client went silent; closing"
                );
                self.registry.drop_live(CloseReason::HeartbeatTimeout);
                self.after_connection_lost();
            }
        }

        self.maybe_push_context(now);

        if let Some(elapsed_seconds) = self.survival.progress_due(now) {
            self.queue(
                Outbound::CompilationProgress {
                    timestamp: now_ms(),
                    elapsed_seconds,
                    status: PROGRESS_STATUS.to_string(),
                },
                None,
                now,
            );
        }

        self.flush_outbox().await;
    }

    pub(crate) fn adopt_socket(&mut self, ws: WsStream, peer: SocketAddr) {
        if !self.registry.is_listening() {
            tracing::debug!(%peer, "discarding handshake that finished after stop");
            return;
        }
        let id = self.registry.adopt(
            ws,
            peer,
            self.inbound_tx.clone(),
            self.dispatcher.clone(),
        );
        tracing::info!(%peer, connection_id = id, "bridge client connected");
        self.heartbeat.reset(Instant::now());
        self.greeting_pending = true;
    }

    pub(crate) fn handle_socket_closed(&mut self, connection_id: u64, reason: CloseReason) {
        if self.registry.live_id() != Some(connection_id) {
            tracing::debug!(connection_id, "close from a replaced connection");
            return;
        }
        self.registry.drop_live(reason);
        self.after_connection_lost();
    }

    /// Unsent envelopes wait in the retry queue for the next client.
    fn after_connection_lost(&mut self) {
        self.greeting_pending = false;
        if self.outbox.is_empty() {
            return;
        }
        tracing::info!(parked = self.outbox.len(), "connection lost; parking queued envelopes");
        for entry in self.outbox.drain(..) {
            self.retry.park(entry);
        }
    }

    fn run_actions(&mut self) {
        for action in self.actions.drain() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| action(self))) {
                tracing::error!(panic = %panic_message(panic.as_ref()), "bridge action panicked");
            }
        }
    }

    fn send_greeting(&mut self, now: Instant) {
        self.greeting_pending = false;
        let Some(session_id) = self.registry.session_id().map(str::to_owned) else {
            return;
        };
        let hello = Outbound::Hello {
            session_id: session_id.clone(),
            host_name: self.config.host_info.name.clone(),
            host_version: self.config.host_info.version.clone(),
            bridge_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
        };
        self.queue(hello, None, now);

        if self.survival.take_restart_notice() {
            self.queue(
                Outbound::BridgeRestarted {
                    timestamp: now_ms(),
                    reason: RESTART_REASON.to_string(),
                    session_id,
                },
                None,
                now,
            );
        }

        self.queue_durable_records(now);
        self.context_forced = true;
        self.maybe_push_context(now);
    }

    /// Queues the stored compilation result and, with it, the answer to the
    /// command that triggered the compile. Records go away once written.
    fn queue_durable_records(&mut self, now: Instant) {
        let Some(stored) = self.survival.compilation_result() else {
            return;
        };
        self.queue(
            Outbound::CompilationComplete {
                timestamp: now_ms(),
                result: stored.result.clone(),
            },
            Some(DurableReceipt::CompilationResult {
                finished_at_ms: stored.finished_at_ms,
            }),
            now,
        );

        let Some(pending) = self.survival.pending_command() else {
            return;
        };
        self.deferred_since = None;
        let result = &stored.result;
        let error_message = (!result.success).then(|| {
            format!(
                "compilation failed with {} error(s)",
                result.error_count()
            )
        });
        tracing::info!(
            command_id = %pending.command_id,
            tool = %pending.tool_name,
            ok = result.success,
            "answering command that triggered the compile"
        );
        self.queue(
            Outbound::CommandResult {
                command_id: pending.command_id.clone(),
                ok: result.success,
                result: serde_json::to_value(result).unwrap_or(Value::Null),
                error_message,
            },
            Some(DurableReceipt::PendingCommand {
                command_id: pending.command_id,
            }),
            now,
        );
    }

    fn drain_inbound(&mut self, now: Instant) {
        while let Ok(frame) = self.inbound_rx.try_recv() {
            if self.registry.live_id() != Some(frame.connection_id) {
                continue;
            }
            self.heartbeat.record_inbound(frame.received_at);
            let Some(text) = frame.text else {
                continue;
            };
            match parse_inbound(&text) {
                Ok(Inbound::Heartbeat) => {}
                Ok(Inbound::ServerInfo(info)) => {
                    tracing::info!(
                        client = info.client_name.as_deref().unwrap_or("unknown"),
                        server = info.server_name.as_deref().unwrap_or("unknown"),
                        version = info.server_version.as_deref().unwrap_or("unknown"),
                        "bridge client identified"
                    );
                    self.registry.set_client_info(info);
                }
                Ok(Inbound::Command(cmd)) => self.execute_command(cmd, now),
                Err(err) => {
                    tracing::debug!(error = %err, "ignoring inbound frame");
                }
            }
        }
    }

    fn execute_command(&mut self, cmd: CommandRequest, now: Instant) {
        let executor = self.executor.clone();
        let reload_triggering = catch_unwind(AssertUnwindSafe(|| {
            executor.is_reload_triggering(&cmd.tool_name, &cmd.payload)
        }))
        .unwrap_or(false);

        if reload_triggering {
            if let Some(old) = self.survival.record_pending_command(&cmd, now_ms()) {
                tracing::warn!(
                    command_id = %old.command_id,
                    superseded_by = %cmd.command_id,
                    "reload-triggering command superseded before its compile"
                );
                self.queue(
                    Outbound::command_failed(
                        &old.command_id,
                        format!("superseded by command {}", cmd.command_id),
                    ),
                    None,
                    now,
                );
            }
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| {
            executor.execute(&cmd.tool_name, &cmd.payload)
        })) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(format!("command panicked: {}", panic_message(panic.as_ref()))),
        };

        match (reload_triggering, outcome) {
            (true, Ok(value)) => {
                tracing::info!(
                    command_id = %cmd.command_id,
                    tool = %cmd.tool_name,
                    "deferring result until compilation completes"
                );
                self.survival.set_provisional_result(&cmd.command_id, value);
                self.deferred_since = Some(now);
            }
            (reload, Err(message)) => {
                tracing::warn!(
                    command_id = %cmd.command_id,
                    tool = %cmd.tool_name,
                    error = %message,
                    "bridge command failed"
                );
                if reload {
                    self.survival.clear_pending_command();
                }
                self.queue(Outbound::command_failed(&cmd.command_id, message), None, now);
            }
            (false, Ok(value)) => {
                tracing::debug!(command_id = %cmd.command_id, tool = %cmd.tool_name, "bridge command ok");
                self.queue(Outbound::command_ok(&cmd.command_id, value), None, now);
            }
        }
    }

    fn maybe_push_context(&mut self, now: Instant) {
        if !self.registry.is_connected() {
            return;
        }
        let interval_elapsed = self
            .last_context_push
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.context_push_interval);
        if !self.context_forced && !(self.context_dirty && interval_elapsed) {
            return;
        }

        let context = self.context.clone();
        let payload = match catch_unwind(AssertUnwindSafe(|| context.snapshot())) {
            Ok(payload) => payload,
            Err(panic) => {
                tracing::error!(panic = %panic_message(panic.as_ref()), "context provider panicked");
                return;
            }
        };
        self.context_forced = false;
        self.context_dirty = false;
        self.last_context_push = Some(now);
        self.queue(
            Outbound::ContextUpdate {
                timestamp: now_ms(),
                payload,
            },
            None,
            now,
        );
    }

    /// Delivers the executor's own result for a reload-triggering command
    /// whose compile never started.
    fn check_deferred_command(&mut self, now: Instant) {
        let Some(since) = self.deferred_since else {
            return;
        };
        if !self.registry.is_connected()
            || self.survival.state() != SurvivalState::Idle
            || now.saturating_duration_since(since) < PENDING_COMMAND_GRACE
        {
            return;
        }
        self.deferred_since = None;
        if self.survival.compilation_result().is_some() {
            return;
        }
        let Some(pending) = self.survival.pending_command() else {
            return;
        };
        tracing::info!(
            command_id = %pending.command_id,
            "no compilation followed; delivering provisional result"
        );
        self.queue(
            Outbound::command_ok(
                &pending.command_id,
                pending.provisional_result.unwrap_or(Value::Null),
            ),
            Some(DurableReceipt::PendingCommand {
                command_id: pending.command_id,
            }),
            now,
        );
    }

    fn queue(&mut self, envelope: Outbound, receipt: Option<DurableReceipt>, now: Instant) {
        if !self.registry.is_connected() {
            tracing::debug!(kind = envelope.kind(), "dropping envelope; no client connected");
            return;
        }
        let entry = PendingSend::new(envelope, now);
        self.outbox.push_back(match receipt {
            Some(receipt) => entry.with_receipt(receipt),
            None => entry,
        });
    }

    async fn flush(&mut self, now: Instant) {
        self.flush_outbox().await;
        if !self.registry.is_connected() {
            return;
        }
        let batch = self.retry.take_batch(now, RETRIES_PER_TICK);
        for (i, entry) in batch.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(RETRY_SPACING).await;
            }
            self.transmit(entry).await;
        }
    }

    async fn flush_outbox(&mut self) {
        while let Some(entry) = self.outbox.pop_front() {
            self.transmit(entry).await;
        }
    }

    async fn transmit(&mut self, entry: PendingSend) {
        if let Some(receipt) = &entry.receipt {
            if !self.survival.is_outstanding(receipt) {
                tracing::debug!(kind = entry.envelope.kind(), "record already delivered; skipping");
                return;
            }
        }
        let Some(sink) = self.registry.live_sink() else {
            self.retry.park(entry);
            return;
        };
        let text = match serde_json::to_string(&entry.envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(kind = entry.envelope.kind(), error = %err, "failed to encode envelope");
                return;
            }
        };

        match write_text(&sink, text, SEND_TIMEOUT).await {
            Ok(()) => {
                if let Some(receipt) = &entry.receipt {
                    self.survival.acknowledge(receipt);
                }
            }
            Err(err) => {
                tracing::warn!(
                    kind = entry.envelope.kind(),
                    retries = entry.retries,
                    error = %err,
                    "bridge write failed"
                );
                let fatal = err.is_fatal();
                self.retry.record_failure(entry);
                if fatal {
                    self.registry.drop_live(CloseReason::Transport(err.to_string()));
                    self.after_connection_lost();
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
