//! Serde records for the Planner JSON payloads the engine reads.
//!
//! Only the fields the engine uses are declared; everything else in a
//! payload is dropped on decode.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;

use crate::model::{double_option, Board, Bucket, Person, Task};

pub const TASK_TYPE: &str = "#microsoft.graph.plannerTask";
pub const TASK_DETAILS_TYPE: &str = "#microsoft.graph.plannerTaskDetails";
pub const BUCKET_TYPE: &str = "#microsoft.graph.plannerBucket";

/// `percentComplete` value the service uses for a finished task.
pub const COMPLETE: u8 = 100;

/// Assignment map as sent by the service: user id → assignment, where a
/// `null` assignment means the user was unassigned.
pub type Assignments = BTreeMap<String, Option<IgnoredAny>>;

pub(crate) fn assigned_ids(assignments: &Assignments) -> BTreeSet<String> {
    assignments
        .iter()
        .filter(|(_, a)| a.is_some())
        .map(|(id, _)| id.clone())
        .collect()
}

// ── Entities ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub id: String,
    pub plan_id: String,
    pub bucket_id: String,
    pub title: Option<String>,
    pub order_hint: Option<String>,
    pub percent_complete: Option<u8>,
    pub due_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignments: Assignments,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
}

impl RemoteTask {
    pub fn assignee_ids(&self) -> BTreeSet<String> {
        assigned_ids(&self.assignments)
    }

    /// Convert to the local model. Details (description) are filled in
    /// separately.
    pub fn into_task(self) -> Task {
        let assignees = self.assignee_ids();
        Task {
            id: self.id,
            board_id: self.plan_id,
            bucket_id: self.bucket_id,
            name: self.title.unwrap_or_default(),
            assignees,
            due_date: self.due_date_time,
            completed: self.percent_complete == Some(COMPLETE),
            description: None,
            order_hint: self.order_hint,
            etag: self.etag,
            details_etag: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTaskDetails {
    pub id: String,
    pub description: Option<String>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBucket {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub plan_id: String,
    pub order_hint: Option<String>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
}

impl From<RemoteBucket> for Bucket {
    fn from(b: RemoteBucket) -> Self {
        Bucket {
            id: b.id,
            board_id: b.plan_id,
            name: b.name,
            order_hint: b.order_hint,
            etag: b.etag,
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlan {
    pub id: String,
    pub title: Option<String>,
    /// Id of the owning group.
    pub owner: Option<String>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
}

impl From<RemotePlan> for Board {
    fn from(p: RemotePlan) -> Self {
        Board {
            id: p.id,
            name: p.title,
            owner: p.owner,
            etag: p.etag,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlanDetails {
    #[serde(default)]
    pub shared_with: BTreeMap<String, bool>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
}

impl RemotePlanDetails {
    pub fn shared_ids(&self) -> BTreeSet<String> {
        self.shared_with
            .iter()
            .filter(|(_, shared)| **shared)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBoardFormat {
    pub order_hint: Option<String>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub id: String,
    pub display_name: Option<String>,
    pub user_principal_name: Option<String>,
}

impl From<RemoteUser> for Person {
    fn from(u: RemoteUser) -> Self {
        Person {
            id: u.id,
            display_name: u.display_name,
            principal_name: u.user_principal_name,
        }
    }
}

/// One page of a collection or delta response.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

// ── Delta records ──────────────────────────────────────────────────

/// Tombstone the delta feed attaches to deleted entities.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Removed {
    pub reason: Option<String>,
}

/// A change record from the delta feed, keyed by its `@odata.type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "@odata.type")]
pub enum DeltaRecord {
    #[serde(rename = "#microsoft.graph.plannerTask")]
    Task(TaskDelta),
    #[serde(rename = "#microsoft.graph.plannerTaskDetails")]
    TaskDetails(TaskDetailsDelta),
    #[serde(rename = "#microsoft.graph.plannerBucket")]
    Bucket(BucketDelta),
    #[serde(other)]
    Unknown,
}

/// Task fields present in a delta record. Absent fields did not change.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDelta {
    pub id: String,
    pub title: Option<String>,
    pub plan_id: Option<String>,
    pub bucket_id: Option<String>,
    pub order_hint: Option<String>,
    pub percent_complete: Option<u8>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date_time: Option<Option<DateTime<Utc>>>,
    pub assignments: Option<Assignments>,
    pub created_date_time: Option<DateTime<Utc>>,
    pub created_by: Option<IgnoredAny>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
    #[serde(rename = "@removed")]
    pub removed: Option<Removed>,
}

impl TaskDelta {
    /// Creation records carry the creation stamp and author.
    pub fn is_creation(&self) -> bool {
        self.created_date_time.is_some() && self.created_by.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDetailsDelta {
    pub id: String,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
    #[serde(rename = "@removed")]
    pub removed: Option<Removed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketDelta {
    pub id: String,
    pub name: Option<String>,
    pub plan_id: Option<String>,
    pub order_hint: Option<String>,
    #[serde(rename = "@odata.etag")]
    pub etag: Option<String>,
    #[serde(rename = "@removed")]
    pub removed: Option<Removed>,
}

/// Decode raw delta values one by one. Records that fail to decode, or
/// whose type the engine does not track, are dropped without affecting the
/// rest of the batch.
pub fn decode_records(values: Vec<Value>) -> Vec<DeltaRecord> {
    let total = values.len();
    let records: Vec<DeltaRecord> = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<DeltaRecord>(value) {
            Ok(DeltaRecord::Unknown) => None,
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Skipping malformed delta record: {e}");
                None
            }
        })
        .collect();
    if records.len() < total {
        log::debug!("Kept {} of {} delta records", records.len(), total);
    }
    records
}
