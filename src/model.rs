use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Longest title the remote service accepts.
const MAX_TITLE_CHARS: usize = 255;

/// A board (a Planner plan). One board owns many buckets and tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: Option<String>,
    /// Id of the group that owns the board.
    pub owner: Option<String>,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub shared_with: BTreeSet<String>,
    pub etag: Option<String>,
    pub details_etag: Option<String>,
}

impl Board {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// A column of a board. `tasks` lists task ids in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub board_id: String,
    pub name: Option<String>,
    pub order_hint: Option<String>,
    pub etag: Option<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
}

impl Bucket {
    pub fn new(
        id: impl Into<String>,
        board_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            board_id: board_id.into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Placeholder for a bucket we have only seen referenced by a task.
    pub fn shell(id: impl Into<String>, board_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            board_id: board_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub board_id: String,
    pub bucket_id: String,
    pub name: String,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    pub description: Option<String>,
    pub order_hint: Option<String>,
    pub etag: Option<String>,
    pub details_etag: Option<String>,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            id: self.id.clone(),
            board_id: self.board_id.clone(),
            bucket_id: self.bucket_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub display_name: Option<String>,
    pub principal_name: Option<String>,
}

/// Opaque continuation link for the remote delta feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaCursor {
    pub token: String,
}

impl DeltaCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersAndOwners {
    pub members: Option<Vec<Person>>,
    pub owners: Option<Vec<Person>>,
}

// ── Change records ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKey {
    pub id: String,
    pub board_id: String,
    pub bucket_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketKey {
    pub id: String,
    pub board_id: String,
}

/// Full view of an entity touched by a delta batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", content = "entity", rename_all = "snake_case")]
pub enum ChangeRecord {
    TaskInserted(Task),
    TaskUpdated(Task),
    TaskDeleted(TaskKey),
    BucketInserted(Bucket),
    BucketUpdated(Bucket),
    BucketDeleted(BucketKey),
}

impl ChangeRecord {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeRecord::TaskInserted(_) | ChangeRecord::BucketInserted(_) => ChangeKind::Inserted,
            ChangeRecord::TaskUpdated(_) | ChangeRecord::BucketUpdated(_) => ChangeKind::Updated,
            ChangeRecord::TaskDeleted(_) | ChangeRecord::BucketDeleted(_) => ChangeKind::Deleted,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeRecord::TaskInserted(t) | ChangeRecord::TaskUpdated(t) => &t.id,
            ChangeRecord::TaskDeleted(k) => &k.id,
            ChangeRecord::BucketInserted(b) | ChangeRecord::BucketUpdated(b) => &b.id,
            ChangeRecord::BucketDeleted(k) => &k.id,
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(
            self,
            ChangeRecord::TaskInserted(_)
                | ChangeRecord::TaskUpdated(_)
                | ChangeRecord::TaskDeleted(_)
        )
    }
}

/// Changed-field view of a task: identifying keys plus only the fields that
/// differ from the cached copy.
///
/// `board_id` and `bucket_id` always hold the current values. When either
/// moved, the old value is reported in `previous_board_id` /
/// `previous_bucket_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialTask {
    pub kind: ChangeKind,
    pub id: String,
    pub board_id: String,
    pub bucket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignees: Option<BTreeSet<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_board_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_bucket_id: Option<String>,
}

impl PartialTask {
    /// A record carrying nothing but the identifying keys.
    pub fn keys(kind: ChangeKind, task: &Task) -> Self {
        Self {
            kind,
            id: task.id.clone(),
            board_id: task.board_id.clone(),
            bucket_id: task.bucket_id.clone(),
            name: None,
            assignees: None,
            due_date: None,
            completed: None,
            description: None,
            order_hint: None,
            previous_board_id: None,
            previous_bucket_id: None,
        }
    }

    /// A record carrying every field of `task`, used for inserts.
    pub fn full(kind: ChangeKind, task: &Task) -> Self {
        Self {
            name: Some(task.name.clone()),
            assignees: Some(task.assignees.clone()),
            due_date: Some(task.due_date),
            completed: Some(task.completed),
            description: Some(task.description.clone()),
            order_hint: task.order_hint.clone(),
            ..Self::keys(kind, task)
        }
    }

    pub fn has_changes(&self) -> bool {
        self.name.is_some()
            || self.assignees.is_some()
            || self.due_date.is_some()
            || self.completed.is_some()
            || self.description.is_some()
            || self.order_hint.is_some()
            || self.previous_board_id.is_some()
            || self.previous_bucket_id.is_some()
    }

    /// Union `other`'s fields into `self`. `self.kind` is kept; keys and
    /// fields present on `other` win.
    pub fn absorb(&mut self, other: PartialTask) {
        self.board_id = other.board_id;
        self.bucket_id = other.bucket_id;
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.assignees.is_some() {
            self.assignees = other.assignees;
        }
        if other.due_date.is_some() {
            self.due_date = other.due_date;
        }
        if other.completed.is_some() {
            self.completed = other.completed;
        }
        if other.description.is_some() {
            self.description = other.description;
        }
        if other.order_hint.is_some() {
            self.order_hint = other.order_hint;
        }
        if other.previous_board_id.is_some() {
            self.previous_board_id = other.previous_board_id;
        }
        if other.previous_bucket_id.is_some() {
            self.previous_bucket_id = other.previous_bucket_id;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBucket {
    pub kind: ChangeKind,
    pub id: String,
    pub board_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum PartialRecord {
    Task(PartialTask),
    Bucket(PartialBucket),
}

impl PartialRecord {
    pub fn kind(&self) -> ChangeKind {
        match self {
            PartialRecord::Task(t) => t.kind,
            PartialRecord::Bucket(b) => b.kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            PartialRecord::Task(t) => &t.id,
            PartialRecord::Bucket(b) => &b.id,
        }
    }
}

/// Output of one reconciled delta poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaBatch {
    pub merged: Vec<ChangeRecord>,
    pub changed_fields: Vec<PartialRecord>,
}

impl DeltaBatch {
    /// Number of entity changes, used to pace polling.
    pub fn change_count(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty() && self.changed_fields.is_empty()
    }
}

// ── Write requests ─────────────────────────────────────────────────

/// A task the consumer wants created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub board_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    pub description: Option<String>,
    pub order_hint: Option<String>,
}

impl NewTask {
    /// True when there is nothing worth creating.
    pub fn is_blank(&self) -> bool {
        self.assignees.is_empty()
            && self.name.as_deref().map_or(true, |n| n.trim().is_empty())
            && self.description.as_deref().map_or(true, str::is_empty)
            && !self.completed
            && self.due_date.is_none()
    }
}

/// Partial update of a task. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: String,
    pub name: Option<String>,
    pub assignees: Option<BTreeSet<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub completed: Option<bool>,
    pub description: Option<String>,
}

impl TaskUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Copy the requested fields onto a cached task.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(assignees) = &self.assignees {
            task.assignees = assignees.clone();
        }
        if let Some(due) = self.due_date {
            task.due_date = due;
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
        if let Some(description) = &self.description {
            task.description = Some(description.clone());
        }
    }
}

/// Normalize a task or bucket title the way the remote service expects:
/// trimmed, never empty, at most 255 characters.
pub fn clean_title(title: Option<&str>) -> String {
    match title.map(str::trim) {
        None | Some("") => "untitled".to_string(),
        Some(t) => t.chars().take(MAX_TITLE_CHARS).collect(),
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}
