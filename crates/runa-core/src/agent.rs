// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use runa_config::AgentConfig;
use runa_events::{
    AgentEvent, Bookmark, Breakpoint, Channel, DoneReason, ErrorPhase, ErrorSeverity, EventBus,
    RuntimeState, Subscription,
};
use runa_model::{
    ContentBlock, Message, ModelProvider, ModelRequest, Role, StopReason, ToolSchema, Usage,
};
use runa_store::{AgentInfo, AgentTimeline, Snapshot, Store, TodoItem, TodoSnapshot};
use runa_tools::{
    ApprovalDecision, PermissionPolicy, Sandbox, Tool, ToolCallRecord, ToolRegistry,
};

use crate::context::ContextManager;
use crate::error::CoreError;
use crate::hooks::Hooks;
use crate::permission::{PermissionManager, SharedRecords};
use crate::queue::{MessageQueue, QueuedMessage, ReminderOptions, SendOptions};
use crate::repair;
use crate::runner::RecoveryState;
use crate::scheduler::{Scheduler, TriggerKind};
use crate::skills::SkillsManager;
use crate::state::StateCell;
use crate::streamer;
use crate::todos::TodoManager;

const CRASH_SEAL_NOTE: &str = "Sealed during crash recovery";

/// External collaborators an agent is built from.
#[derive(Clone)]
pub struct AgentDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ToolRegistry>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub hooks: Arc<dyn Hooks>,
}

impl AgentDeps {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn Store>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            provider,
            store,
            registry,
            sandbox: None,
            hooks: Arc::new(crate::hooks::NoopHooks),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// How stored state is reconciled on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    /// Seal every non-terminal tool call and synthesize its error result.
    Crash,
    /// Reload state as-is.
    Manual,
}

impl ResumeStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            ResumeStrategy::Crash => "crash",
            ResumeStrategy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStopReason {
    EndTurn,
    MaxIterations,
    AwaitingApproval,
    Cancelled,
    Error,
}

/// Outcome of one `run` call.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub response: Option<String>,
    pub stop_reason: RunStopReason,
    pub token_usage: Usage,
    pub pending_approval_ids: Vec<String>,
}

pub(crate) struct ProcState {
    pub run_id: Option<Uuid>,
    pub queued: bool,
    pub heartbeat: Instant,
    pub handle: Option<JoinHandle<()>>,
}

/// Shared state behind the public [`Agent`] handle.
pub(crate) struct AgentInner {
    pub id: String,
    pub config: AgentConfig,
    pub provider: Arc<dyn ModelProvider>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ToolRegistry>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub hooks: Arc<dyn Hooks>,
    /// Enabled tool set, resolved from the registry at construction.
    pub tools: HashMap<String, Arc<dyn Tool>>,
    pub bus: Arc<EventBus>,
    pub state: StateCell,
    pub queue: MessageQueue,
    pub messages: Mutex<Vec<Message>>,
    pub records: SharedRecords,
    pub permissions: PermissionManager,
    pub context: ContextManager,
    pub scheduler: Scheduler,
    pub skills: SkillsManager,
    pub todos: TodoManager,
    pub proc: Mutex<ProcState>,
    pub interrupt_requested: AtomicBool,
    pub interrupt_notify: Notify,
    pub idle_notify: Notify,
    pub iteration_count: AtomicU32,
    pub step_count: AtomicU64,
    pub recovery: Mutex<RecoveryState>,
    pub tool_semaphore: Semaphore,
    pub usage: Mutex<Usage>,
    pub run_error: Mutex<Option<String>>,
    pub lineage: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub template_id: Option<String>,
}

/// A per-conversation runtime instance with its own state, event bus, and
/// sandbox.  Cheap to clone; all clones share the same agent.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl Agent {
    // ── Construction ──────────────────────────────────────────────────────────

    /// Create a fresh agent and persist its meta immediately.
    pub async fn create(
        agent_id: impl Into<String>,
        config: AgentConfig,
        deps: AgentDeps,
    ) -> Result<Agent, CoreError> {
        Self::create_inner(agent_id.into(), config, deps, Vec::new(), None).await
    }

    pub(crate) async fn create_inner(
        agent_id: String,
        config: AgentConfig,
        deps: AgentDeps,
        lineage: Vec<String>,
        template_id: Option<String>,
    ) -> Result<Agent, CoreError> {
        config.validate()?;
        let inner = Arc::new(Self::build(agent_id, config, deps, lineage, template_id, None));

        // Skill discovery is lightweight; auto-activation enqueues the full
        // body as a reminder for the first model call.
        inner.skills.discover().await;
        for name in inner.skills.auto_activate_names() {
            Agent {
                inner: inner.clone(),
            }
            .activate_skill(&name, "auto")
            .await
            .unwrap_or_else(|e| warn!(skill = %name, error = %e, "auto-activation failed"));
        }

        inner.persist_meta().await.map_err(storage_or_config)?;
        Ok(Agent { inner })
    }

    /// Reload an agent from its persisted state.
    pub async fn resume(
        agent_id: &str,
        deps: AgentDeps,
        strategy: ResumeStrategy,
    ) -> Result<Agent, CoreError> {
        let info = deps
            .store
            .load_info(agent_id)
            .await?
            .ok_or_else(|| CoreError::Configuration(format!("no stored agent '{agent_id}'")))?;
        let config: AgentConfig = info.read_object("config").ok_or_else(|| {
            CoreError::Configuration(format!("corrupted meta for '{agent_id}': missing config"))
        })?;
        config.validate()?;

        let messages = deps.store.load_messages(agent_id).await?;
        let records = deps.store.load_tool_calls(agent_id).await?;
        let todos = deps.store.load_todos(agent_id).await?;

        let inner = Arc::new(Self::build(
            agent_id.to_string(),
            config,
            deps,
            info.lineage.clone(),
            info.template_id.clone(),
            info.last_bookmark,
        ));
        *inner.messages.lock().await = messages;
        *inner.records.lock().await = records;
        if let Some(todos) = todos {
            inner.todos.restore(todos).await;
        }
        inner.state.restore_breakpoint(info.breakpoint).await;
        if let Some(pending) = info.read_object::<Vec<QueuedMessage>>("pending_messages") {
            inner.queue.restore(pending).await;
        }

        inner.skills.discover().await;
        if let Some(activated) = info.read_object::<Vec<String>>("activated_skills") {
            inner.skills.restore_activated(activated).await;
        }

        // A pause that survived a restart has no pending approval to resolve
        // — fall back to Ready instead of waiting forever.
        if info.breakpoint == Breakpoint::AwaitingApproval {
            inner
                .bus
                .emit(AgentEvent::AgentRecovered {
                    reason: "stale_awaiting_approval".into(),
                })
                .await;
            inner.state.set_breakpoint(Breakpoint::Ready).await;
        }

        let sealed = if strategy == ResumeStrategy::Crash {
            let sealed = {
                let mut messages = inner.messages.lock().await;
                let mut records = inner.records.lock().await;
                let mut sealed =
                    repair::seal_dangling_tool_uses(&mut messages, &mut records, CRASH_SEAL_NOTE);
                for record in records.iter_mut().filter(|r| !r.is_terminal()) {
                    if record.seal(CRASH_SEAL_NOTE).is_some() {
                        sealed.push(record.clone());
                    }
                }
                sealed
            };
            if !sealed.is_empty() {
                inner.persist_messages().await.map_err(storage_or_config)?;
                inner.persist_records().await.map_err(storage_or_config)?;
            }
            // Recovery is complete; the next step starts from a clean
            // checkpoint.
            inner.state.set_breakpoint(Breakpoint::Ready).await;
            sealed
        } else {
            Vec::new()
        };

        inner
            .bus
            .emit(AgentEvent::AgentResumed {
                strategy: strategy.as_str().into(),
                sealed: repair::seal_payloads(&sealed),
            })
            .await;

        inner.persist_meta().await.map_err(storage_or_config)?;
        Ok(Agent { inner })
    }

    fn build(
        agent_id: String,
        config: AgentConfig,
        deps: AgentDeps,
        lineage: Vec<String>,
        template_id: Option<String>,
        bookmark_seed: Option<Bookmark>,
    ) -> AgentInner {
        let sink = Arc::new(AgentTimeline::new(deps.store.clone(), agent_id.clone()));
        let bus = Arc::new(EventBus::with_seed(sink, bookmark_seed));
        let records: SharedRecords = Arc::new(Mutex::new(Vec::new()));
        let permissions = PermissionManager::new(
            PermissionPolicy::new(config.permissions.clone()),
            bus.clone(),
            records.clone(),
        );

        let mut tools = HashMap::new();
        for id in deps.registry.resolve(&config.tools) {
            if let Some(tool) = deps.registry.create(&id, None) {
                tools.insert(id, tool);
            }
        }

        AgentInner {
            state: StateCell::new(bus.clone()),
            scheduler: Scheduler::new(bus.clone()),
            context: ContextManager::new(config.context.clone()),
            skills: SkillsManager::new(config.skills.clone()),
            todos: TodoManager::new(),
            queue: MessageQueue::new(),
            messages: Mutex::new(Vec::new()),
            records,
            permissions,
            tools,
            tool_semaphore: Semaphore::new(config.limits.max_tool_concurrency),
            proc: Mutex::new(ProcState {
                run_id: None,
                queued: false,
                heartbeat: Instant::now(),
                handle: None,
            }),
            interrupt_requested: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
            idle_notify: Notify::new(),
            iteration_count: AtomicU32::new(0),
            step_count: AtomicU64::new(0),
            recovery: Mutex::new(RecoveryState::default()),
            usage: Mutex::new(Usage::default()),
            run_error: Mutex::new(None),
            id: agent_id,
            provider: deps.provider,
            store: deps.store,
            registry: deps.registry,
            sandbox: deps.sandbox,
            hooks: deps.hooks,
            bus,
            lineage,
            created_at: Utc::now(),
            template_id,
            config,
        }
    }

    // ── Inputs ────────────────────────────────────────────────────────────────

    /// Non-blocking enqueue of a user or reminder input; returns the
    /// generated message id.
    pub async fn send(&self, text: impl Into<String>, opts: SendOptions) -> String {
        self.inner.send(text.into(), opts).await
    }

    /// Run until the loop completes, pauses for approval, or fails.
    pub async fn run(&self, input: &str) -> Result<RunResult, CoreError> {
        *self.inner.run_error.lock().await = None;
        if !input.is_empty() {
            self.inner.send(input.to_string(), SendOptions::default()).await;
        }
        self.inner.ensure_processing().await;
        self.inner.wait_idle().await;
        Ok(self.inner.run_result().await)
    }

    /// Like [`run`](Self::run) but abortable: when `cancel` resolves (or its
    /// sender is dropped), in-flight work is interrupted and the run reports
    /// `Cancelled`.  State remains resumable.
    pub async fn run_with_cancel(
        &self,
        input: &str,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<RunResult, CoreError> {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                self.interrupt(Some("Cancelled by caller")).await?;
                let mut result = self.inner.run_result().await;
                result.stop_reason = RunStopReason::Cancelled;
                result.success = false;
                Ok(result)
            }
            result = self.run(input) => result,
        }
    }

    /// Drive exactly one step.  Errors if a processing task is active.
    pub async fn step(&self) -> Result<bool, CoreError> {
        {
            let proc = self.inner.proc.lock().await;
            if proc.run_id.is_some() {
                return Err(CoreError::InvalidState {
                    current: RuntimeState::Working,
                    expected: RuntimeState::Ready,
                });
            }
        }
        self.inner.state.set_state(RuntimeState::Working).await;
        let result = self.inner.step_once().await;
        if self.inner.state.state().await == RuntimeState::Working {
            self.inner.state.set_state(RuntimeState::Ready).await;
        }
        result.map_err(step_error)
    }

    /// Idempotent, debounced start of the singleton processing task.
    pub async fn ensure_processing(&self) {
        self.inner.ensure_processing().await;
    }

    // ── Approvals ─────────────────────────────────────────────────────────────

    pub async fn approve(&self, call_id: &str) -> Result<(), CoreError> {
        self.inner
            .permissions
            .resolve(call_id, ApprovalDecision::Allow, "api", None)
            .await
    }

    pub async fn deny(&self, call_id: &str, note: Option<String>) -> Result<(), CoreError> {
        self.inner
            .permissions
            .resolve(call_id, ApprovalDecision::Deny, "api", note)
            .await
    }

    /// In-process decision surface for embedded UIs.
    pub async fn respond(
        &self,
        call_id: &str,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<(), CoreError> {
        self.inner
            .permissions
            .resolve(call_id, decision, "callback", note)
            .await
    }

    pub async fn pending_approval_ids(&self) -> Vec<String> {
        self.inner.permissions.pending_ids().await
    }

    // ── Interrupt / dispose ───────────────────────────────────────────────────

    /// Best-effort stop: cancels processing and active tools, seals dangling
    /// work, persists, and returns the agent to `Ready`.
    pub async fn interrupt(&self, note: Option<&str>) -> Result<(), CoreError> {
        self.inner.interrupt(note).await
    }

    /// Cancel the processing loop and timers and persist final meta.  The
    /// sandbox is released with the agent's last reference.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }

    // ── Events ────────────────────────────────────────────────────────────────

    pub async fn subscribe(
        &self,
        channels: &[Channel],
        since: Option<Bookmark>,
        kinds: Option<HashSet<String>>,
    ) -> Subscription {
        self.inner.bus.subscribe(channels, since, kinds).await
    }

    pub async fn failed_event_count(&self) -> usize {
        self.inner.bus.failed_event_count().await
    }

    pub async fn flush_failed_events(&self) -> usize {
        self.inner.bus.flush_failed().await
    }

    pub async fn last_bookmark(&self) -> Option<Bookmark> {
        self.inner.bus.last_bookmark().await
    }

    // ── Snapshots & forking ───────────────────────────────────────────────────

    /// Persist a safe-fork-point snapshot of the current history.
    pub async fn snapshot(&self) -> Result<Snapshot, CoreError> {
        let messages = self.inner.messages.lock().await.clone();
        let sfp = ContextManager::find_sfp(&messages).unwrap_or(0);
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "stepCount".into(),
            self.inner.step_count.load(Ordering::SeqCst).into(),
        );
        let prefix = if messages.is_empty() {
            Vec::new()
        } else {
            messages[..=sfp.min(messages.len() - 1)].to_vec()
        };
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            messages: prefix,
            last_sfp_index: sfp,
            last_bookmark: self.inner.bus.last_bookmark().await,
            created_at: Utc::now(),
            metadata,
        };
        self.inner.store.save_snapshot(&self.inner.id, &snapshot).await?;
        Ok(snapshot)
    }

    /// Start a child agent from a fresh snapshot of this agent's history.
    /// The child inherits config and deps; dangling tool uses in the copied
    /// prefix are sealed so the child history is coherent.
    pub async fn fork(&self, child_id: impl Into<String>) -> Result<Agent, CoreError> {
        let snapshot = self.snapshot().await?;
        let deps = AgentDeps {
            provider: self.inner.provider.clone(),
            store: self.inner.store.clone(),
            registry: self.inner.registry.clone(),
            sandbox: self.inner.sandbox.clone(),
            hooks: self.inner.hooks.clone(),
        };
        let mut lineage = self.inner.lineage.clone();
        lineage.push(self.inner.id.clone());
        let child = Self::create_inner(
            child_id.into(),
            self.inner.config.clone(),
            deps,
            lineage,
            self.inner.template_id.clone(),
        )
        .await?;

        {
            let mut messages = child.inner.messages.lock().await;
            let mut records = child.inner.records.lock().await;
            *messages = snapshot.messages;
            repair::seal_dangling_tool_uses(&mut messages, &mut records, "Sealed on fork");
        }
        child
            .inner
            .persist_messages()
            .await
            .map_err(storage_or_config)?;
        child
            .inner
            .persist_records()
            .await
            .map_err(storage_or_config)?;
        child.inner.persist_meta().await.map_err(storage_or_config)?;
        Ok(child)
    }

    // ── Skills / scheduler / todos ────────────────────────────────────────────

    /// Load a discovered skill's body and inject it as a reminder.
    pub async fn activate_skill(&self, name: &str, activated_by: &str) -> Result<(), CoreError> {
        let skill = self
            .inner
            .skills
            .activate(name)
            .await
            .ok_or_else(|| CoreError::Configuration(format!("unknown skill '{name}'")))?;
        let block = SkillsManager::activation_block(&skill);
        self.inner
            .queue
            .enqueue(
                block,
                SendOptions::reminder(ReminderOptions {
                    skip_standard_ending: false,
                    category: Some("skill".into()),
                }),
            )
            .await;
        self.inner
            .bus
            .emit(AgentEvent::SkillActivated {
                skill: name.to_string(),
                activated_by: activated_by.to_string(),
            })
            .await;
        self.inner.persist_meta().await.map_err(storage_or_config)?;
        Ok(())
    }

    pub async fn schedule(&self, kind: TriggerKind) -> Result<String, CoreError> {
        self.inner.scheduler.schedule(kind).await
    }

    /// Replace the todo list (single-in-progress invariant enforced) and
    /// persist it.
    pub async fn set_todos(&self, todos: Vec<TodoItem>) -> Result<TodoSnapshot, CoreError> {
        let snapshot = self.inner.todos.set(todos).await?;
        self.inner.store.save_todos(&self.inner.id, &snapshot).await?;
        Ok(snapshot)
    }

    pub async fn todos(&self) -> TodoSnapshot {
        self.inner.todos.get().await
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn lineage(&self) -> &[String] {
        &self.inner.lineage
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> RuntimeState {
        self.inner.state.state().await
    }

    pub async fn breakpoint(&self) -> Breakpoint {
        self.inner.state.breakpoint().await
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.messages.lock().await.clone()
    }

    pub async fn tool_call_records(&self) -> Vec<ToolCallRecord> {
        self.inner.records.lock().await.clone()
    }
}

impl AgentInner {
    // ── Queue & persistence ───────────────────────────────────────────────────

    pub(crate) async fn send(&self, text: String, opts: SendOptions) -> String {
        let is_user = opts.kind == crate::queue::MessageKind::User;
        let id = self.queue.enqueue(text, opts).await;
        if is_user {
            // New user guidance resets the model's opportunity: recovery
            // streaks and the iteration counter start over.
            self.recovery.lock().await.reset();
            self.iteration_count.store(0, Ordering::SeqCst);
        }
        if let Err(e) = self.persist_meta().await {
            warn!(error = %e, "failed to persist pending queue");
        }
        id
    }

    pub(crate) async fn persist_messages(&self) -> anyhow::Result<()> {
        let messages = self.messages.lock().await.clone();
        self.store.save_messages(&self.id, &messages).await?;
        Ok(())
    }

    pub(crate) async fn persist_records(&self) -> anyhow::Result<()> {
        let records = self.records.lock().await.clone();
        self.store.save_tool_calls(&self.id, &records).await?;
        Ok(())
    }

    pub(crate) async fn persist_meta(&self) -> anyhow::Result<()> {
        let messages = self.messages.lock().await;
        let mut info = AgentInfo::new(self.id.clone());
        info.template_id = self.template_id.clone();
        info.created_at = self.created_at;
        info.lineage = self.lineage.clone();
        info.message_count = messages.len();
        info.last_sfp_index = ContextManager::find_sfp(&messages);
        drop(messages);
        info.last_bookmark = self.bus.last_bookmark().await;
        info.breakpoint = self.state.breakpoint().await;
        info.metadata.insert(
            "config".into(),
            serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null),
        );
        info.metadata.insert(
            "activated_skills".into(),
            serde_json::to_value(self.skills.activated().await).unwrap_or_default(),
        );
        info.metadata.insert(
            "pending_messages".into(),
            serde_json::to_value(self.queue.pending().await).unwrap_or_default(),
        );
        info.metadata.insert(
            "step_count".into(),
            self.step_count.load(Ordering::SeqCst).into(),
        );
        self.store.save_info(&info).await?;
        Ok(())
    }

    pub(crate) async fn notify_messages_changed(&self) {
        let messages = self.messages.lock().await.clone();
        self.hooks.messages_changed(&messages).await;
    }

    async fn flush_queue(&self) -> anyhow::Result<()> {
        let drained = self.queue.drain().await;
        if drained.is_empty() {
            return Ok(());
        }
        {
            let mut messages = self.messages.lock().await;
            for queued in &drained {
                messages.push(Message::user(queued.rendered()));
            }
        }
        self.persist_messages().await?;
        self.notify_messages_changed().await;
        Ok(())
    }

    // ── Processing-loop singleton ─────────────────────────────────────────────

    pub(crate) async fn touch_heartbeat(&self) {
        self.proc.lock().await.heartbeat = Instant::now();
    }

    pub(crate) fn ensure_processing<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.ensure_processing_inner())
    }

    async fn ensure_processing_inner(self: &Arc<Self>) {
        let mut proc = self.proc.lock().await;
        if let Some(run_id) = proc.run_id {
            let timeout = Duration::from_secs(self.config.limits.processing_timeout_secs);
            let stale = proc.heartbeat.elapsed() > timeout;
            let breakpoint = self.state.breakpoint().await;
            let blocking = matches!(
                breakpoint,
                Breakpoint::AwaitingApproval | Breakpoint::ToolExecuting
            );
            if !stale || blocking {
                proc.queued = true;
                return;
            }
            // The task stopped heartbeating without a legitimate suspension
            // point: replace it.
            warn!(agent_id = %self.id, %run_id, "processing heartbeat stale; restarting task");
            self.bus
                .emit(AgentEvent::Error {
                    severity: ErrorSeverity::Warn,
                    phase: ErrorPhase::System,
                    message: "processing task heartbeat stale; restarting".into(),
                })
                .await;
            if let Some(handle) = proc.handle.take() {
                handle.abort();
            }
            proc.run_id = None;
        }

        if self.state.state().await != RuntimeState::Ready {
            proc.queued = true;
            return;
        }

        let run_id = Uuid::new_v4();
        proc.run_id = Some(run_id);
        proc.heartbeat = Instant::now();
        self.interrupt_requested.store(false, Ordering::SeqCst);
        let inner = self.clone();
        proc.handle = Some(tokio::spawn(async move {
            inner.processing_task(run_id).await;
        }));
    }

    async fn processing_task(self: Arc<Self>, run_id: Uuid) {
        debug!(agent_id = %self.id, %run_id, "processing task started");
        self.state.set_state(RuntimeState::Working).await;

        loop {
            match self.step_once().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    *self.run_error.lock().await = Some(e.to_string());
                    self.bus
                        .emit(AgentEvent::Error {
                            severity: ErrorSeverity::Error,
                            phase: ErrorPhase::Model,
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }

        // Only the current task may clear its own refs: a stale task that was
        // replaced must not disturb its successor.
        let queued = {
            let mut proc = self.proc.lock().await;
            if proc.run_id != Some(run_id) {
                return;
            }
            proc.run_id = None;
            proc.handle = None;
            std::mem::take(&mut proc.queued)
        };

        self.state.set_breakpoint(Breakpoint::Ready).await;
        if self.state.state().await == RuntimeState::Working {
            self.state.set_state(RuntimeState::Ready).await;
        }
        if let Err(e) = self.persist_meta().await {
            warn!(error = %e, "failed to persist meta at task end");
        }
        self.idle_notify.notify_waiters();

        // An ensure_processing call racing this teardown (run id already
        // cleared, state not yet Ready) parks itself as queued; pick that up
        // here so the request is not stranded.
        let queued = queued || {
            let mut proc = self.proc.lock().await;
            if proc.run_id.is_none() {
                std::mem::take(&mut proc.queued)
            } else {
                false
            }
        };
        if queued {
            self.ensure_processing().await;
        }
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            {
                let proc = self.proc.lock().await;
                let idle = proc.run_id.is_none() && !proc.queued;
                drop(proc);
                if idle || self.state.state().await == RuntimeState::Paused {
                    break;
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn run_result(&self) -> RunResult {
        let error = self.run_error.lock().await.clone();
        let state = self.state.state().await;
        let pending = self.permissions.pending_ids().await;
        let usage = *self.usage.lock().await;
        let response = {
            let messages = self.messages.lock().await;
            messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant && !m.text().is_empty())
                .map(|m| m.text())
        };
        let stop_reason = if error.is_some() {
            RunStopReason::Error
        } else if state == RuntimeState::Paused || !pending.is_empty() {
            RunStopReason::AwaitingApproval
        } else if self.interrupt_requested.load(Ordering::SeqCst) {
            RunStopReason::Cancelled
        } else if self.iteration_count.load(Ordering::SeqCst) >= self.config.limits.max_iterations {
            RunStopReason::MaxIterations
        } else {
            RunStopReason::EndTurn
        };
        RunResult {
            success: error.is_none(),
            response,
            stop_reason,
            token_usage: usage,
            pending_approval_ids: pending,
        }
    }

    // ── Step algorithm ────────────────────────────────────────────────────────

    async fn step_once(self: &Arc<Self>) -> anyhow::Result<bool> {
        let step_started = Instant::now();
        self.touch_heartbeat().await;

        // 1. Interrupt check.
        if self.interrupt_requested.load(Ordering::SeqCst) {
            return Ok(false);
        }

        // 2. Flush queued inputs into the message log.
        self.flush_queue().await?;

        // 3. Iteration cap.
        if self.iteration_count.load(Ordering::SeqCst) >= self.config.limits.max_iterations {
            let reason = if self.permissions.has_pending().await {
                DoneReason::Interrupted
            } else {
                DoneReason::Completed
            };
            let step = self.step_count.load(Ordering::SeqCst);
            self.bus.emit(AgentEvent::Done { step, reason }).await;
            let step = self.step_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.scheduler.notify_step(step).await;
            self.iteration_count.fetch_add(1, Ordering::SeqCst);
            self.bus
                .emit(AgentEvent::StepComplete {
                    step,
                    duration_ms: step_started.elapsed().as_millis() as u64,
                })
                .await;
            self.persist_meta().await?;
            return Ok(false);
        }

        // 4. Defensive repair.
        self.repair_context().await?;

        // 5. Context compression under token pressure.
        self.maybe_compress().await?;

        // 6. Pre-model.
        self.state.set_breakpoint(Breakpoint::PreModel).await;
        let mut request = self.build_request().await;
        self.hooks.pre_model(&mut request).await;

        // 7. Stream the model response.
        self.state.set_breakpoint(Breakpoint::StreamingModel).await;
        let stream = self.provider.stream(request).await?;
        let turn = streamer::consume(stream, &self.bus, self.config.expose_thinking).await?;
        {
            let mut usage = self.usage.lock().await;
            usage.input_tokens += turn.usage.input_tokens;
            usage.output_tokens += turn.usage.output_tokens;
        }

        // 8. Append the assistant message.
        let tool_uses: Vec<(String, String, serde_json::Value)> = turn
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();
        if !turn.blocks.is_empty() {
            let message = Message::assistant_blocks(turn.blocks);
            self.messages.lock().await.push(message.clone());
            self.hooks.post_model(&message).await;
            self.notify_messages_changed().await;
            self.persist_messages().await?;
        }

        if !tool_uses.is_empty() {
            // 9. Tool batch → one user message with every result.
            self.state.set_breakpoint(Breakpoint::ToolPending).await;
            let batch = self.run_tool_batch(&tool_uses).await?;
            if !batch.blocks.is_empty() {
                self.messages
                    .lock()
                    .await
                    .push(Message::user_blocks(batch.blocks));
                self.persist_messages().await?;
                self.notify_messages_changed().await;
            }
            self.state.set_breakpoint(Breakpoint::PostTool).await;
            self.iteration_count.fetch_add(1, Ordering::SeqCst);
            self.bus
                .emit(AgentEvent::StepComplete {
                    step: self.step_count.load(Ordering::SeqCst),
                    duration_ms: step_started.elapsed().as_millis() as u64,
                })
                .await;
            self.persist_meta().await?;
            return Ok(!batch.interrupted);
        }

        // 10. No tool uses: the step is done.
        self.state.set_breakpoint(Breakpoint::Ready).await;
        let step = self.step_count.load(Ordering::SeqCst);
        self.bus
            .emit(AgentEvent::Done {
                step,
                reason: DoneReason::Completed,
            })
            .await;
        let step = self.step_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.scheduler.notify_step(step).await;
        self.iteration_count.fetch_add(1, Ordering::SeqCst);
        self.bus
            .emit(AgentEvent::StepComplete {
                step,
                duration_ms: step_started.elapsed().as_millis() as u64,
            })
            .await;
        self.persist_meta().await?;

        // Providers occasionally report ToolUse with no tool blocks; trust
        // the stop reason and take another step.
        Ok(turn.stop_reason == StopReason::ToolUse)
    }

    async fn build_request(&self) -> ModelRequest {
        let messages = self.messages.lock().await.clone();
        let (allowlist, suppress) = {
            let mut recovery = self.recovery.lock().await;
            (
                recovery.allowlist_tool.take(),
                std::mem::take(&mut recovery.suppress_tools),
            )
        };

        let tools: Vec<ToolSchema> = if suppress {
            Vec::new()
        } else {
            let mut names: Vec<&String> = self.tools.keys().collect();
            names.sort();
            names
                .into_iter()
                .filter(|n| allowlist.as_ref().map(|a| a == *n).unwrap_or(true))
                .filter_map(|n| self.tools.get(n))
                .map(|t| ToolSchema {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    input_schema: t.input_schema(),
                })
                .collect()
        };

        let system_prompt = {
            let mut sections: Vec<String> = Vec::new();
            if let Some(p) = self.config.system_prompt.clone() {
                sections.push(p);
            }
            if let Some(block) = self.skills.prompt_block().await {
                sections.push(block);
            }
            // Tools may contribute usage notes beyond their schema.
            let ctx = runa_tools::ToolContext {
                agent_id: self.id.clone(),
                sandbox: self.sandbox.clone(),
            };
            for schema in &tools {
                if let Some(tool) = self.tools.get(&schema.name) {
                    if let Some(note) = tool.prompt(&ctx).await {
                        sections.push(note);
                    }
                }
            }
            if sections.is_empty() {
                None
            } else {
                Some(sections.join("\n\n"))
            }
        };

        ModelRequest {
            model: self.config.model.clone(),
            messages,
            system_prompt,
            tools,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            enable_thinking: self.config.enable_thinking,
            thinking_budget: self.config.thinking_budget,
        }
    }

    async fn repair_context(&self) -> anyhow::Result<()> {
        let (sealed, converted) = {
            let mut messages = self.messages.lock().await;
            let mut records = self.records.lock().await;
            let sealed = repair::seal_dangling_tool_uses(
                &mut messages,
                &mut records,
                "Auto-sealed before model call",
            );
            let converted = repair::sanitize_orphan_tool_results(&mut messages);
            (sealed, converted)
        };
        if converted > 0 {
            self.bus
                .emit(AgentEvent::ContextRepair {
                    reason: "orphan_tool_result".into(),
                    converted,
                })
                .await;
        }
        if !sealed.is_empty() || converted > 0 {
            self.persist_messages().await?;
            self.persist_records().await?;
            self.notify_messages_changed().await;
        }
        Ok(())
    }

    async fn maybe_compress(self: &Arc<Self>) -> anyhow::Result<()> {
        let should = {
            let messages = self.messages.lock().await;
            self.context.should_compress(&messages)
        };
        if !should {
            return Ok(());
        }

        self.bus
            .emit(AgentEvent::ContextCompression {
                phase: "start".into(),
                summary: None,
                ratio: None,
            })
            .await;

        let snapshot = self.messages.lock().await.clone();
        let compressed = self
            .context
            .compress(&snapshot, &self.provider, &self.config.model)
            .await;

        match compressed {
            Some(result) => {
                let summary_text = result.summary.text();
                {
                    let mut messages = self.messages.lock().await;
                    let mut rebuilt = Vec::with_capacity(result.retained.len() + 1);
                    rebuilt.push(result.summary);
                    rebuilt.extend(result.retained);
                    *messages = rebuilt;
                }
                self.bus
                    .emit(AgentEvent::ContextCompression {
                        phase: "end".into(),
                        summary: Some(summary_text),
                        ratio: Some(result.ratio),
                    })
                    .await;
                self.persist_messages().await?;
                self.notify_messages_changed().await;
                // Compression can reorder tool pairings; repair again.
                self.repair_context().await?;
            }
            None => {
                self.bus
                    .emit(AgentEvent::ContextCompression {
                        phase: "end".into(),
                        summary: None,
                        ratio: None,
                    })
                    .await;
            }
        }
        Ok(())
    }

    // ── Interrupt / dispose ───────────────────────────────────────────────────

    pub(crate) async fn interrupt(&self, note: Option<&str>) -> Result<(), CoreError> {
        self.interrupt_requested.store(true, Ordering::SeqCst);
        self.interrupt_notify.notify_waiters();
        self.permissions.clear_pending().await;

        {
            let mut proc = self.proc.lock().await;
            if let Some(handle) = proc.handle.take() {
                handle.abort();
            }
            proc.run_id = None;
            proc.queued = false;
        }

        let note = note.unwrap_or("Interrupted by caller");
        {
            let mut messages = self.messages.lock().await;
            let mut records = self.records.lock().await;
            repair::seal_dangling_tool_uses(&mut messages, &mut records, note);
            for record in records.iter_mut().filter(|r| !r.is_terminal()) {
                record.seal(note);
            }
        }
        self.persist_messages().await.map_err(storage_or_config)?;
        self.persist_records().await.map_err(storage_or_config)?;

        self.state.set_breakpoint(Breakpoint::Ready).await;
        self.state.set_state(RuntimeState::Ready).await;
        self.persist_meta().await.map_err(storage_or_config)?;
        self.idle_notify.notify_waiters();
        Ok(())
    }

    pub(crate) async fn dispose(&self) {
        {
            let mut proc = self.proc.lock().await;
            if let Some(handle) = proc.handle.take() {
                handle.abort();
            }
            proc.run_id = None;
            proc.queued = false;
        }
        self.interrupt_notify.notify_waiters();
        self.permissions.clear_pending().await;
        self.scheduler.dispose().await;
        if let Err(e) = self.persist_meta().await {
            warn!(error = %e, "failed to persist meta on dispose");
        }
        self.idle_notify.notify_waiters();
    }
}

/// Map a step-level failure to the typed error surface: storage failures
/// keep their kind, everything else is a provider failure.
fn step_error(e: anyhow::Error) -> CoreError {
    match e.downcast::<runa_store::StorageError>() {
        Ok(storage) => CoreError::Storage(storage),
        Err(e) => CoreError::Provider {
            provider: "model".into(),
            status_code: None,
            message: e.to_string(),
        },
    }
}

fn storage_or_config(e: anyhow::Error) -> CoreError {
    match e.downcast::<runa_store::StorageError>() {
        Ok(storage) => CoreError::Storage(storage),
        Err(e) => CoreError::Configuration(e.to_string()),
    }
}
