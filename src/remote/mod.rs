//! Transport seam between the sync engine and the remote task service.
//!
//! `PlannerApi` is the narrow, typed view of the Graph-style Planner API the
//! engine depends on. `GraphClient` implements it over HTTP; tests use the
//! in-memory fake.

pub mod graph;
pub mod wire;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::{DeltaCursor, Person};

pub use graph::GraphClient;
pub use wire::{
    DeltaRecord, RemoteBucket, RemotePlan, RemotePlanDetails, RemoteTask, RemoteTaskDetails,
    TaskBoardFormat,
};

/// HTTP statuses the service uses to reject a write made against a stale
/// version token.
pub fn is_stale_status(status: u16) -> bool {
    status == 409 || status == 412
}

/// Result of a write against the remote service.
///
/// Transport failures are reported as `Err` by the caller; this type covers
/// every answer the service itself can give, plus `Skipped` for writes that
/// were never sent because sync is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    Applied(T),
    Stale { status: u16 },
    Rejected { status: u16, message: String },
    Skipped,
}

impl<T> WriteOutcome<T> {
    /// Classify a non-success HTTP answer.
    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        if is_stale_status(status) {
            WriteOutcome::Stale { status }
        } else {
            WriteOutcome::Rejected {
                status,
                message: message.into(),
            }
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, WriteOutcome::Stale { .. })
    }

    pub fn applied(self) -> Option<T> {
        match self {
            WriteOutcome::Applied(value) => Some(value),
            _ => None,
        }
    }

    /// The applied value, or the non-applied outcome retyped for the caller
    /// to return as-is.
    pub fn into_applied<U>(self) -> std::result::Result<T, WriteOutcome<U>> {
        match self {
            WriteOutcome::Applied(value) => Ok(value),
            WriteOutcome::Stale { status } => Err(WriteOutcome::Stale { status }),
            WriteOutcome::Rejected { status, message } => {
                Err(WriteOutcome::Rejected { status, message })
            }
            WriteOutcome::Skipped => Err(WriteOutcome::Skipped),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            WriteOutcome::Stale { status } | WriteOutcome::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WriteOutcome<U> {
        match self {
            WriteOutcome::Applied(value) => WriteOutcome::Applied(f(value)),
            WriteOutcome::Stale { status } => WriteOutcome::Stale { status },
            WriteOutcome::Rejected { status, message } => {
                WriteOutcome::Rejected { status, message }
            }
            WriteOutcome::Skipped => WriteOutcome::Skipped,
        }
    }
}

/// Fields for creating a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCreate {
    pub plan_id: String,
    pub bucket_id: String,
    pub title: String,
    pub assignees: BTreeSet<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub percent_complete: Option<u8>,
}

/// Fields for a task PATCH. `None` fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub add_assignees: BTreeSet<String>,
    pub remove_assignees: BTreeSet<String>,
    /// `Some(None)` clears the due date.
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub percent_complete: Option<u8>,
}

/// One poll of the delta feed.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaFetch {
    /// Raw change records and the link to poll next.
    Page {
        records: Vec<Value>,
        cursor: DeltaCursor,
    },
    /// The service no longer recognizes the cursor.
    Expired,
}

/// Typed operations of the remote Planner service.
///
/// Writes that carry an `etag` send it as `If-Match`; the service answers
/// 409/412 when it is stale, surfaced as `WriteOutcome::Stale`. Writes that
/// return `Option<String>` yield the new version token when the service
/// reports one.
#[async_trait]
pub trait PlannerApi: Send + Sync {
    async fn me(&self) -> Result<Person>;
    async fn get_user(&self, user_id: &str) -> Result<Option<Person>>;

    async fn get_plan(&self, plan_id: &str) -> Result<Option<RemotePlan>>;
    async fn get_plan_details(&self, plan_id: &str) -> Result<Option<RemotePlanDetails>>;
    async fn update_plan_sharing(
        &self,
        plan_id: &str,
        user_ids: &[String],
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>>;
    async fn create_group(&self, owner_id: &str, name: &str) -> Result<WriteOutcome<String>>;
    async fn create_plan(&self, group_id: &str, title: &str) -> Result<WriteOutcome<RemotePlan>>;

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<Person>>;
    async fn get_group_owners(&self, group_id: &str) -> Result<Vec<Person>>;
    async fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<WriteOutcome<()>>;

    async fn list_buckets(&self, plan_id: &str) -> Result<Vec<RemoteBucket>>;
    async fn get_bucket(&self, bucket_id: &str) -> Result<Option<RemoteBucket>>;
    async fn create_bucket(&self, plan_id: &str, name: &str) -> Result<WriteOutcome<RemoteBucket>>;
    async fn update_bucket(
        &self,
        bucket_id: &str,
        name: &str,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>>;
    async fn delete_bucket(&self, bucket_id: &str, etag: &str) -> Result<WriteOutcome<()>>;

    async fn list_plan_tasks(&self, plan_id: &str) -> Result<Vec<RemoteTask>>;
    async fn list_bucket_tasks(&self, bucket_id: &str) -> Result<Vec<RemoteTask>>;
    async fn get_task(&self, task_id: &str) -> Result<Option<RemoteTask>>;
    async fn get_task_details(&self, task_id: &str) -> Result<Option<RemoteTaskDetails>>;
    async fn create_task(&self, task: &TaskCreate) -> Result<WriteOutcome<RemoteTask>>;
    async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>>;
    async fn update_task_details(
        &self,
        task_id: &str,
        description: &str,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>>;
    async fn delete_task(&self, task_id: &str, etag: &str) -> Result<WriteOutcome<()>>;
    async fn get_task_board_format(&self, task_id: &str) -> Result<Option<TaskBoardFormat>>;
    async fn update_task_board_format(
        &self,
        task_id: &str,
        order_hint: &str,
        etag: &str,
    ) -> Result<WriteOutcome<()>>;

    /// Open a new delta subscription and return its first cursor.
    async fn subscribe_delta(&self) -> Result<Option<DeltaCursor>>;
    async fn fetch_delta(&self, cursor: &DeltaCursor) -> Result<DeltaFetch>;
}
