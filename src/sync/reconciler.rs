//! Applies a batch of delta records to the local store and reports what
//! changed.

use std::collections::{BTreeSet, HashMap};

use crate::model::{
    Bucket, BucketKey, ChangeKind, ChangeRecord, DeltaBatch, PartialBucket, PartialRecord,
    PartialTask, Task,
};
use crate::remote::wire::{
    assigned_ids, Assignments, BucketDelta, DeltaRecord, TaskDelta, TaskDetailsDelta, COMPLETE,
};
use crate::storage::LocalStore;

/// Result of comparing an incoming assignment map with cached assignees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssigneeDiff {
    /// Users the record unassigns (`null` entries).
    pub removed: BTreeSet<String>,
    /// Users the record assigns.
    pub added: BTreeSet<String>,
    /// Assignees after applying the record.
    pub assignees: BTreeSet<String>,
    pub changed: bool,
}

pub fn diff_assignments(cached: &BTreeSet<String>, incoming: &Assignments) -> AssigneeDiff {
    let added = assigned_ids(incoming);
    let removed: BTreeSet<String> = incoming
        .iter()
        .filter(|(_, a)| a.is_none())
        .map(|(id, _)| id.clone())
        .collect();
    let changed =
        removed.iter().any(|id| cached.contains(id)) || added.iter().any(|id| !cached.contains(id));
    let assignees = cached
        .difference(&removed)
        .cloned()
        .chain(added.iter().cloned())
        .collect();
    AssigneeDiff {
        removed,
        added,
        assignees,
        changed,
    }
}

/// Collects the changes of one batch, keyed by entity id.
#[derive(Default)]
struct Changes {
    merged: Vec<ChangeRecord>,
    tasks: Vec<PartialTask>,
    buckets: Vec<PartialBucket>,
}

impl Changes {
    fn task_changed(&mut self, partial: PartialTask, task: &Task) {
        let kind = match self.tasks.iter_mut().find(|p| p.id == partial.id) {
            Some(existing) if existing.kind != ChangeKind::Deleted => {
                existing.absorb(partial);
                existing.kind
            }
            Some(existing) => {
                *existing = partial;
                existing.kind
            }
            None => {
                let kind = partial.kind;
                self.tasks.push(partial);
                kind
            }
        };
        let record = match kind {
            ChangeKind::Inserted => ChangeRecord::TaskInserted(task.clone()),
            _ => ChangeRecord::TaskUpdated(task.clone()),
        };
        self.put_merged(record);
    }

    fn task_deleted(&mut self, task: &Task) {
        self.tasks.retain(|p| p.id != task.id);
        self.tasks.push(PartialTask::keys(ChangeKind::Deleted, task));
        self.put_merged(ChangeRecord::TaskDeleted(task.key()));
    }

    fn bucket_changed(&mut self, partial: PartialBucket, bucket: &Bucket) {
        let kind = match self.buckets.iter_mut().find(|p| p.id == partial.id) {
            Some(existing) if existing.kind == ChangeKind::Inserted => {
                existing.name = partial.name;
                ChangeKind::Inserted
            }
            Some(existing) => {
                *existing = partial;
                existing.kind
            }
            None => {
                let kind = partial.kind;
                self.buckets.push(partial);
                kind
            }
        };
        let record = match kind {
            ChangeKind::Inserted => ChangeRecord::BucketInserted(bucket.clone()),
            _ => ChangeRecord::BucketUpdated(bucket.clone()),
        };
        self.put_merged(record);
    }

    fn bucket_deleted(&mut self, bucket: &Bucket) {
        self.buckets.retain(|p| p.id != bucket.id);
        self.buckets.push(PartialBucket {
            kind: ChangeKind::Deleted,
            id: bucket.id.clone(),
            board_id: bucket.board_id.clone(),
            name: None,
        });
        self.put_merged(ChangeRecord::BucketDeleted(BucketKey {
            id: bucket.id.clone(),
            board_id: bucket.board_id.clone(),
        }));
    }

    /// Drop a queued rename that a later record in the batch reverted.
    fn withdraw_bucket_update(&mut self, id: &str) {
        let before = self.buckets.len();
        self.buckets
            .retain(|p| !(p.id == id && p.kind == ChangeKind::Updated));
        if self.buckets.len() < before {
            self.merged
                .retain(|r| !matches!(r, ChangeRecord::BucketUpdated(b) if b.id == id));
        }
    }

    /// Replace the entity record for the same id, or append.
    fn put_merged(&mut self, record: ChangeRecord) {
        let slot = self
            .merged
            .iter_mut()
            .find(|r| r.is_task() == record.is_task() && r.id() == record.id());
        match slot {
            Some(existing) => *existing = record,
            None => self.merged.push(record),
        }
    }

    fn into_batch(self) -> DeltaBatch {
        let changed_fields = self
            .tasks
            .into_iter()
            .map(PartialRecord::Task)
            .chain(self.buckets.into_iter().map(PartialRecord::Bucket))
            .collect();
        DeltaBatch {
            merged: self.merged,
            changed_fields,
        }
    }
}

/// Reconciles delta records for one board against the local store.
///
/// Records are applied in arrival order, so a batch that creates and then
/// edits a task reports a single insertion carrying the final fields.
/// Applying the same batch twice reports nothing the second time.
#[derive(Debug, Clone)]
pub struct DeltaReconciler {
    board_id: String,
}

impl DeltaReconciler {
    pub fn new(board_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn apply(&self, store: &mut LocalStore, records: Vec<DeltaRecord>) -> DeltaBatch {
        let mut tasks = Vec::new();
        let mut details = Vec::new();
        let mut buckets = Vec::new();
        for record in records {
            match record {
                DeltaRecord::Task(t) => tasks.push(t),
                DeltaRecord::TaskDetails(d) => details.push(d),
                DeltaRecord::Bucket(b) => buckets.push(b),
                DeltaRecord::Unknown => {}
            }
        }

        // Bucket names as they were before this batch.
        let prior_names: HashMap<String, Option<String>> = store
            .buckets()
            .into_iter()
            .map(|b| (b.id.clone(), b.name.clone()))
            .collect();

        let mut changes = Changes::default();
        for delta in tasks {
            self.apply_task(store, delta, &mut changes);
        }
        for delta in details {
            self.apply_details(store, delta, &mut changes);
        }
        for delta in buckets {
            self.apply_bucket(store, delta, &prior_names, &mut changes);
        }

        let batch = changes.into_batch();
        if !batch.is_empty() {
            log::debug!(
                "Delta for board {}: {} entity changes, {} changed-field records",
                self.board_id,
                batch.merged.len(),
                batch.changed_fields.len()
            );
        }
        batch
    }

    fn is_new_task(&self, delta: &TaskDelta) -> bool {
        delta.is_creation() && delta.plan_id.as_deref() == Some(self.board_id.as_str())
    }

    fn apply_task(&self, store: &mut LocalStore, delta: TaskDelta, changes: &mut Changes) {
        if delta.removed.is_some() {
            match store.delete_task(&delta.id) {
                Some(task) => changes.task_deleted(&task),
                None => log::debug!("Ignoring removal of uncached task {}", delta.id),
            }
            return;
        }

        let Some(cached) = store.task(&delta.id).cloned() else {
            if !self.is_new_task(&delta) {
                log::debug!("Ignoring delta for uncached task {}", delta.id);
                return;
            }
            match task_from_creation(delta) {
                Some(task) => {
                    store.upsert_task(task.clone());
                    changes.task_changed(PartialTask::full(ChangeKind::Inserted, &task), &task);
                }
                None => log::debug!("Skipping creation record without plan or bucket"),
            }
            return;
        };

        if self.is_new_task(&delta) {
            log::debug!("Task {} already cached, skipping creation record", delta.id);
            return;
        }

        let (next, partial) = diff_task(&cached, &delta);
        store.upsert_task(next.clone());
        if partial.has_changes() {
            changes.task_changed(partial, &next);
        }
    }

    fn apply_details(
        &self,
        store: &mut LocalStore,
        delta: TaskDetailsDelta,
        changes: &mut Changes,
    ) {
        if delta.removed.is_some() {
            return;
        }
        let Some(cached) = store.task(&delta.id).cloned() else {
            log::debug!("Ignoring details for uncached task {}", delta.id);
            return;
        };

        let mut next = cached.clone();
        if delta.etag.is_some() {
            next.details_etag = delta.etag;
        }
        let mut partial = None;
        if let Some(description) = delta.description {
            let description = description.filter(|d| !d.is_empty());
            if description != cached.description {
                next.description = description.clone();
                partial = Some(PartialTask {
                    description: Some(description),
                    ..PartialTask::keys(ChangeKind::Updated, &cached)
                });
            }
        }
        store.upsert_task(next.clone());
        if let Some(partial) = partial {
            changes.task_changed(partial, &next);
        }
    }

    fn apply_bucket(
        &self,
        store: &mut LocalStore,
        delta: BucketDelta,
        prior_names: &HashMap<String, Option<String>>,
        changes: &mut Changes,
    ) {
        if delta.removed.is_some() {
            match store.remove_bucket(&delta.id) {
                Some(bucket) => changes.bucket_deleted(&bucket),
                None => log::debug!("Ignoring removal of uncached bucket {}", delta.id),
            }
            return;
        }

        let Some(cached) = store.bucket(&delta.id).cloned() else {
            if delta.plan_id.as_deref() != Some(self.board_id.as_str()) {
                log::debug!("Ignoring delta for bucket {} outside board", delta.id);
                return;
            }
            let bucket = Bucket {
                id: delta.id,
                board_id: self.board_id.clone(),
                name: delta.name,
                order_hint: delta.order_hint,
                etag: delta.etag,
                tasks: Vec::new(),
            };
            store.upsert_bucket(bucket.clone());
            let partial = PartialBucket {
                kind: ChangeKind::Inserted,
                id: bucket.id.clone(),
                board_id: bucket.board_id.clone(),
                name: bucket.name.clone(),
            };
            changes.bucket_changed(partial, &bucket);
            return;
        };

        // Version token and order hint are refreshed without reporting.
        store.upsert_bucket(Bucket {
            order_hint: delta.order_hint,
            etag: delta.etag,
            ..Bucket::shell(&cached.id, "")
        });

        let prior = prior_names.get(&cached.id).and_then(|n| n.as_deref());
        match delta.name {
            // Back to the name the batch started with: nothing to report.
            Some(name) if prior == Some(name.as_str()) => {
                if cached.name.as_deref() != Some(name.as_str()) {
                    store.upsert_bucket(Bucket {
                        name: Some(name),
                        ..Bucket::shell(&cached.id, "")
                    });
                }
                changes.withdraw_bucket_update(&cached.id);
            }
            Some(name) if cached.name.as_deref() != Some(name.as_str()) => {
                // A shell only seen through its tasks is new to the consumer.
                let kind = if cached.name.is_none() {
                    ChangeKind::Inserted
                } else {
                    ChangeKind::Updated
                };
                store.upsert_bucket(Bucket {
                    name: Some(name.clone()),
                    ..Bucket::shell(&cached.id, "")
                });
                let Some(bucket) = store.bucket(&cached.id).cloned() else {
                    return;
                };
                let partial = PartialBucket {
                    kind,
                    id: bucket.id.clone(),
                    board_id: bucket.board_id.clone(),
                    name: Some(name),
                };
                changes.bucket_changed(partial, &bucket);
            }
            Some(_) | None => {}
        }
    }
}

fn task_from_creation(delta: TaskDelta) -> Option<Task> {
    Some(Task {
        assignees: delta
            .assignments
            .as_ref()
            .map(assigned_ids)
            .unwrap_or_default(),
        id: delta.id,
        board_id: delta.plan_id?,
        bucket_id: delta.bucket_id?,
        name: delta.title.unwrap_or_default(),
        due_date: delta.due_date_time.flatten(),
        completed: delta.percent_complete == Some(COMPLETE),
        description: None,
        order_hint: delta.order_hint,
        etag: delta.etag,
        details_etag: None,
    })
}

/// Compare an update record with the cached task. Returns the task with the
/// record applied and a partial listing the fields that differ.
fn diff_task(cached: &Task, delta: &TaskDelta) -> (Task, PartialTask) {
    let mut next = cached.clone();
    let mut partial = PartialTask::keys(ChangeKind::Updated, cached);

    if let Some(assignments) = &delta.assignments {
        let diff = diff_assignments(&cached.assignees, assignments);
        if diff.changed {
            partial.assignees = Some(diff.assignees.clone());
            next.assignees = diff.assignees;
        }
    }
    if let Some(title) = &delta.title {
        if *title != cached.name {
            partial.name = Some(title.clone());
            next.name = title.clone();
        }
    }
    if let Some(due) = delta.due_date_time {
        if due != cached.due_date {
            partial.due_date = Some(due);
            next.due_date = due;
        }
    }
    if let Some(percent) = delta.percent_complete {
        let completed = percent == COMPLETE;
        if completed != cached.completed {
            partial.completed = Some(completed);
            next.completed = completed;
        }
    }
    if let Some(plan_id) = &delta.plan_id {
        if *plan_id != cached.board_id {
            partial.previous_board_id = Some(cached.board_id.clone());
            partial.board_id = plan_id.clone();
            next.board_id = plan_id.clone();
        }
    }
    if let Some(bucket_id) = &delta.bucket_id {
        if *bucket_id != cached.bucket_id {
            partial.previous_bucket_id = Some(cached.bucket_id.clone());
            partial.bucket_id = bucket_id.clone();
            next.bucket_id = bucket_id.clone();
        }
    }

    if delta.etag.is_some() {
        next.etag = delta.etag.clone();
    }
    if delta.order_hint.is_some() {
        next.order_hint = delta.order_hint.clone();
    }
    (next, partial)
}
