use chrono::{DateTime, Utc};
use mediaplan::{DeliveryMode, Plan, PlanBook};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::cancel::JobCancel;
use crate::errors::LifecycleError;

pub type ChatId = i64;
pub type UserId = i64;

/// Address of a chat message; used only to reply to, edit or delete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

/// What the choice store keeps for a URL until the user picks a mode.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub url: String,
    pub title: String,
    pub owner: UserId,
    pub source: MessageRef,
    pub plans: PlanBook,
    /// Choice message text, restored when admission is refused.
    pub offer_text: String,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub request_id: String,
    pub url: String,
    pub title: String,
    pub mode: DeliveryMode,
    pub plan: Plan,
    pub owner: UserId,
    pub source: MessageRef,
    pub status: MessageRef,
    pub cancel: JobCancel,
    pub admitted_at: DateTime<Utc>,
}

/// Registry entry for a queued or running job, looked up by the cancel button.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub owner: UserId,
    pub status: MessageRef,
    pub title: String,
    pub cancel: JobCancel,
}

pub fn new_job_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    MetadataFetched,
    PlansReady,
    AwaitingChoice,
    Queued,
    Downloading,
    Transcoding,
    Uploading,
    Delivered,
    Refused,
    Expired,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Delivered | JobState::Refused | JobState::Expired | JobState::Cancelled | JobState::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Downloading | JobState::Transcoding | JobState::Uploading)
    }

    /// Forward edges only; no state is ever re-entered.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Created, MetadataFetched | Failed) => true,
            (MetadataFetched, PlansReady | Refused | Failed) => true,
            (PlansReady, AwaitingChoice | Failed) => true,
            (AwaitingChoice, Queued | Expired) => true,
            (Queued, Downloading | Cancelled | Failed) => true,
            (Downloading, Transcoding | Uploading | Cancelled | Failed) => true,
            (Transcoding, Uploading | Cancelled | Failed) => true,
            (Uploading, Delivered | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

/// State of one request/job instance, logged on every step.
#[derive(Debug)]
pub struct Lifecycle {
    key: String,
    state: JobState,
}

impl Lifecycle {
    pub fn new(key: impl Into<String>) -> Self {
        Self::resume(key, JobState::Created)
    }

    pub fn resume(key: impl Into<String>, state: JobState) -> Self {
        Self { key: key.into(), state }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn rekey(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), LifecycleError> {
        if !self.state.can_advance_to(next) {
            return Err(LifecycleError::InvalidTransition { from: self.state, to: next });
        }
        info!(key = %self.key, from = ?self.state, to = ?next, active = next.is_active(), "lifecycle");
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: UserId,
    pub username: Option<String>,
}

/// Inbound chat events the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text {
        message: MessageRef,
        from: Sender,
        private: bool,
        chat_title: Option<String>,
        text: String,
    },
    Callback {
        id: String,
        from: Sender,
        message: Option<MessageRef>,
        data: String,
    },
}

/// Button payloads. Kept well under the transport's 64 byte limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Choose { mode: DeliveryMode, request_id: String },
    Cancel { job_id: String },
}

impl Callback {
    pub fn encode(&self) -> String {
        match self {
            Callback::Choose { mode, request_id } => format!("dl|{}|{request_id}", mode.tag()),
            Callback::Cancel { job_id } => format!("cnl|{job_id}"),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let parts: Vec<&str> = data.split('|').collect();
        match parts.as_slice() {
            ["dl", mode, id] if !id.is_empty() => Some(Callback::Choose {
                mode: DeliveryMode::from_tag(mode)?,
                request_id: id.to_string(),
            }),
            ["cnl", id] if !id.is_empty() => Some(Callback::Cancel { job_id: id.to_string() }),
            _ => None,
        }
    }
}
