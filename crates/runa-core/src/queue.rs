// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    User,
    Reminder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderOptions {
    /// Leave off the standard "do not respond directly" ending.
    #[serde(default)]
    pub skip_standard_ending: bool,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub kind: MessageKind,
    pub reminder: Option<ReminderOptions>,
}

impl SendOptions {
    pub fn reminder(opts: ReminderOptions) -> Self {
        Self {
            kind: MessageKind::Reminder,
            reminder: Some(opts),
        }
    }
}

const REMINDER_ENDING: &str =
    "This is an automated reminder. Do not respond to it directly; \
     take it into account in your next reply to the user.";

/// One buffered input awaiting the next flush into the message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default)]
    pub reminder: Option<ReminderOptions>,
}

impl QueuedMessage {
    /// The text as it enters the message log.  Reminders are wrapped in the
    /// standard system-reminder envelope.
    pub fn rendered(&self) -> String {
        match self.kind {
            MessageKind::User => self.text.clone(),
            MessageKind::Reminder => {
                let opts = self.reminder.clone().unwrap_or_default();
                let open = match &opts.category {
                    Some(category) => format!("<system-reminder category=\"{category}\">"),
                    None => "<system-reminder>".to_string(),
                };
                if opts.skip_standard_ending {
                    format!("{open}\n{}\n</system-reminder>", self.text)
                } else {
                    format!("{open}\n{}\n{REMINDER_ENDING}\n</system-reminder>", self.text)
                }
            }
        }
    }
}

/// Non-blocking buffer between callers and the processing loop.
#[derive(Default)]
pub(crate) struct MessageQueue {
    items: Mutex<VecDeque<QueuedMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an input; returns the generated message id.
    pub async fn enqueue(&self, text: impl Into<String>, opts: SendOptions) -> String {
        let id = Uuid::new_v4().to_string();
        self.items.lock().await.push_back(QueuedMessage {
            id: id.clone(),
            kind: opts.kind,
            text: text.into(),
            reminder: opts.reminder,
        });
        id
    }

    /// Remove and return everything buffered, in arrival order.
    pub async fn drain(&self) -> Vec<QueuedMessage> {
        self.items.lock().await.drain(..).collect()
    }

    /// Copy of the buffered items, for durable persistence.
    pub async fn pending(&self) -> Vec<QueuedMessage> {
        self.items.lock().await.iter().cloned().collect()
    }

    /// Re-seed the buffer on resume.
    pub async fn restore(&self, items: Vec<QueuedMessage>) {
        let mut queue = self.items.lock().await;
        queue.clear();
        queue.extend(items);
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
