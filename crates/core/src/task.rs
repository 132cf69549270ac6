//! Task record, lifecycle state machine and submission key.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::id::TaskId;

/// Discriminator selecting the handler that processes a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    /// Recognize a payment screenshot.
    PaymentOcr,
    /// Recognize an invoice document.
    InvoiceOcr,
    /// Any other kind registered by the embedding application.
    Custom(String),
}

impl TaskType {
    pub const PAYMENT_OCR: &'static str = "payment_ocr";
    pub const INVOICE_OCR: &'static str = "invoice_ocr";

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentOcr => Self::PAYMENT_OCR,
            Self::InvoiceOcr => Self::INVOICE_OCR,
            Self::Custom(kind) => kind,
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.as_str() {
            Self::PAYMENT_OCR => Self::PaymentOcr,
            Self::INVOICE_OCR => Self::InvoiceOcr,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl AsRef<str> for TaskType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// queued ──► processing ──► succeeded
///   │            │   └────► failed      (handler error or reaper timeout)
///   └──► canceled ◄┘
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Queued,
        Self::Processing,
        Self::Succeeded,
        Self::Failed,
        Self::Canceled,
    ];

    /// Statuses that count as "in flight" for de-duplication.
    pub const ACTIVE: [TaskStatus; 2] = [Self::Queued, Self::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Queued, Self::Canceled)
                | (Self::Processing, Self::Succeeded)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Canceled)
        )
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskError::invalid_input(format!("unknown task status: {s}")))
    }
}

/// Identity of a logical piece of work.
///
/// At most one task per key may be `queued` or `processing` at any time.
/// A key without a fingerprint matches in-flight tasks regardless of their
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub task_type: TaskType,
    pub owner_id: String,
    pub target_id: String,
    pub fingerprint: Option<String>,
}

impl DedupKey {
    /// Whether `task` is the same logical work as this key describes.
    pub fn matches(&self, task: &Task) -> bool {
        task.task_type == self.task_type
            && task.owner_id == self.owner_id
            && task.target_id == self.target_id
            && self
                .fingerprint
                .as_ref()
                .is_none_or(|fp| task.content_fingerprint.as_ref() == Some(fp))
    }

    /// Exact key equality, treating a missing fingerprint as its own value.
    ///
    /// This is the uniqueness the store enforces among in-flight tasks.
    pub fn is_exact(&self, task: &Task) -> bool {
        task.task_type == self.task_type
            && task.owner_id == self.owner_id
            && task.target_id == self.target_id
            && task.content_fingerprint == self.fingerprint
    }
}

/// A validated submission, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub task_type: TaskType,
    pub owner_id: String,
    pub created_by: String,
    pub target_id: String,
    pub fingerprint: Option<String>,
}

impl NewTask {
    /// Trim and validate raw submission fields.
    ///
    /// A blank fingerprint is treated as absent.
    pub fn parse(
        task_type: &str,
        owner_id: &str,
        created_by: &str,
        target_id: &str,
        fingerprint: Option<&str>,
    ) -> Result<Self, TaskError> {
        let task_type = required("type", task_type)?;
        let owner_id = required("owner_id", owner_id)?;
        let created_by = required("created_by", created_by)?;
        let target_id = required("target_id", target_id)?;
        let fingerprint = fingerprint
            .map(str::trim)
            .filter(|fp| !fp.is_empty())
            .map(str::to_string);

        Ok(Self {
            task_type: TaskType::from(task_type),
            owner_id,
            created_by,
            target_id,
            fingerprint,
        })
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            task_type: self.task_type.clone(),
            owner_id: self.owner_id.clone(),
            target_id: self.target_id.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

fn required(field: &str, value: &str) -> Result<String, TaskError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TaskError::invalid_input(format!("missing {field}")));
    }
    Ok(value.to_string())
}

/// The unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub target_id: String,
    pub content_fingerprint: Option<String>,
    pub status: TaskStatus,
    pub created_by: String,
    /// Set only when `status == Succeeded`.
    pub result: Option<serde_json::Value>,
    /// Set only when `status == Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh `queued` task from a validated submission.
    pub fn queued(new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            owner_id: new.owner_id,
            task_type: new.task_type,
            target_id: new.target_id,
            content_fingerprint: new.fingerprint,
            status: TaskStatus::Queued,
            created_by: new.created_by,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            task_type: self.task_type.clone(),
            owner_id: self.owner_id.clone(),
            target_id: self.target_id.clone(),
            fingerprint: self.content_fingerprint.clone(),
        }
    }

    /// Whether `result`/`error` agree with `status`.
    pub fn outcome_consistent(&self) -> bool {
        match self.status {
            TaskStatus::Succeeded => self.result.is_some() && self.error.is_none(),
            TaskStatus::Failed => self.result.is_none() && self.error.is_some(),
            _ => self.result.is_none() && self.error.is_none(),
        }
    }
}
