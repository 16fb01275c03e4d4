// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use runa_events::{AgentEvent, EventBus};

/// What fires a scheduled task.
#[derive(Debug, Clone)]
pub enum TriggerKind {
    /// Every N completed steps.
    Steps(u64),
    /// Once, after a duration.
    Time(Duration),
    /// Cron expression (seconds-resolution, `cron` crate syntax).
    Cron(String),
}

impl TriggerKind {
    fn kind_str(&self) -> &'static str {
        match self {
            TriggerKind::Steps(_) => "steps",
            TriggerKind::Time(_) => "time",
            TriggerKind::Cron(_) => "cron",
        }
    }

    fn spec_str(&self) -> String {
        match self {
            TriggerKind::Steps(n) => format!("steps:{n}"),
            TriggerKind::Time(d) => humantime::format_duration(*d).to_string(),
            TriggerKind::Cron(spec) => spec.clone(),
        }
    }
}

struct StepTrigger {
    task_id: String,
    every: u64,
    spec: String,
}

/// Per-agent trigger scheduler.  Fired triggers surface as monitor
/// `scheduler_triggered` events; the hosting application decides what a
/// trigger means.  Owned by one agent and disposed with it.
pub struct Scheduler {
    bus: Arc<EventBus>,
    step_triggers: Mutex<Vec<StepTrigger>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            step_triggers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a trigger; returns its task id.
    pub async fn schedule(&self, kind: TriggerKind) -> Result<String, crate::CoreError> {
        let task_id = Uuid::new_v4().to_string();
        let spec = kind.spec_str();
        match kind {
            TriggerKind::Steps(every) => {
                if every == 0 {
                    return Err(crate::CoreError::Configuration(
                        "steps trigger interval must be at least 1".into(),
                    ));
                }
                self.step_triggers.lock().await.push(StepTrigger {
                    task_id: task_id.clone(),
                    every,
                    spec,
                });
            }
            TriggerKind::Time(duration) => {
                let bus = self.bus.clone();
                let id = task_id.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    fire(&bus, &id, &spec, "time").await;
                });
                self.handles.lock().await.push(handle);
            }
            TriggerKind::Cron(expr) => {
                let schedule = cron::Schedule::from_str(&expr).map_err(|e| {
                    crate::CoreError::Configuration(format!("invalid cron spec '{expr}': {e}"))
                })?;
                let bus = self.bus.clone();
                let id = task_id.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        let Some(next) = schedule.upcoming(Utc).next() else {
                            break;
                        };
                        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await;
                        fire(&bus, &id, &spec, "cron").await;
                    }
                });
                self.handles.lock().await.push(handle);
            }
        }
        Ok(task_id)
    }

    /// Called by the processing loop on every completed step.
    pub async fn notify_step(&self, step: u64) {
        let fired: Vec<(String, String)> = {
            let triggers = self.step_triggers.lock().await;
            triggers
                .iter()
                .filter(|t| step > 0 && step % t.every == 0)
                .map(|t| (t.task_id.clone(), t.spec.clone()))
                .collect()
        };
        for (task_id, spec) in fired {
            fire(&self.bus, &task_id, &spec, "steps").await;
        }
    }

    /// Abort timer tasks.  Called from agent disposal.
    pub async fn dispose(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        self.step_triggers.lock().await.clear();
    }
}

async fn fire(bus: &EventBus, task_id: &str, spec: &str, kind: &str) {
    bus.emit(AgentEvent::SchedulerTriggered {
        task_id: task_id.to_string(),
        spec: spec.to_string(),
        kind: kind.to_string(),
        triggered_at: Utc::now().timestamp_millis(),
    })
    .await;
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Timer tasks hold only a bus Arc; abort on drop keeps them from
        // outliving the agent.
        if let Ok(mut handles) = self.handles.try_lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        } else {
            warn!("scheduler dropped while lock held; timers abort on runtime shutdown");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
