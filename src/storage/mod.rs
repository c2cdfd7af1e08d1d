pub mod directory;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{Board, Bucket, DeltaCursor, Person, Task};

pub use directory::BoardDirectory;

/// LocalStore shared between the poll loop and consumer-issued writes.
/// Never hold the guard across an `.await`.
pub type SharedStore = Arc<Mutex<LocalStore>>;

/// In-memory mirror of one remote board.
///
/// Bucket → task membership is only ever changed by `upsert_task`,
/// `delete_task` and `remove_bucket`, so a task id appears in exactly one
/// bucket list: the one named by its `bucket_id`.
#[derive(Debug, Default)]
pub struct LocalStore {
    board: Option<Board>,
    bucket_order: Vec<String>,
    buckets: HashMap<String, Bucket>,
    tasks: HashMap<String, Task>,
    people: HashMap<String, Person>,
    cursor: Option<DeltaCursor>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    // ── Board ──────────────────────────────────────────────────────

    pub fn board(&self) -> Option<&Board> {
        self.board.as_ref()
    }

    pub fn board_mut(&mut self) -> Option<&mut Board> {
        self.board.as_mut()
    }

    pub fn set_board(&mut self, board: Board) {
        self.board = Some(board);
    }

    /// Drop everything cached for the previous board. The people cache is
    /// kept since it is not board-scoped.
    pub fn reset_for_board(&mut self, board: Board) {
        let people = std::mem::take(&mut self.people);
        *self = Self {
            board: Some(board),
            people,
            ..Self::default()
        };
    }

    // ── Buckets ────────────────────────────────────────────────────

    pub fn bucket(&self, id: &str) -> Option<&Bucket> {
        self.buckets.get(id)
    }

    /// Buckets in board order.
    pub fn buckets(&self) -> Vec<&Bucket> {
        self.bucket_order
            .iter()
            .filter_map(|id| self.buckets.get(id))
            .collect()
    }

    /// Insert or refresh bucket metadata. Task membership is left untouched.
    pub fn upsert_bucket(&mut self, bucket: Bucket) {
        match self.buckets.get_mut(&bucket.id) {
            Some(existing) => {
                if !bucket.board_id.is_empty() {
                    existing.board_id = bucket.board_id;
                }
                if bucket.name.is_some() {
                    existing.name = bucket.name;
                }
                if bucket.order_hint.is_some() {
                    existing.order_hint = bucket.order_hint;
                }
                if bucket.etag.is_some() {
                    existing.etag = bucket.etag;
                }
            }
            None => {
                self.bucket_order.push(bucket.id.clone());
                let bucket = Bucket {
                    tasks: Vec::new(),
                    ..bucket
                };
                self.buckets.insert(bucket.id.clone(), bucket);
            }
        }
    }

    /// Remove a bucket together with the tasks it holds.
    pub fn remove_bucket(&mut self, id: &str) -> Option<Bucket> {
        let bucket = self.buckets.remove(id)?;
        for task_id in &bucket.tasks {
            self.tasks.remove(task_id);
        }
        self.bucket_order.retain(|b| b != id);
        Some(bucket)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains_task(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// All cached tasks, bucket by bucket in board order.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.buckets()
            .into_iter()
            .flat_map(|bucket| bucket.tasks.iter())
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn tasks_in_bucket(&self, bucket_id: &str) -> Vec<&Task> {
        self.buckets
            .get(bucket_id)
            .map(|bucket| {
                bucket
                    .tasks
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or replace a task.
    ///
    /// An unknown bucket gets an empty shell so deltas that arrive before
    /// their bucket still land somewhere. A task whose bucket changed is
    /// taken out of the old bucket's list first.
    pub fn upsert_task(&mut self, task: Task) {
        if let Some(previous) = self.tasks.get(&task.id) {
            if previous.bucket_id != task.bucket_id {
                if let Some(old) = self.buckets.get_mut(&previous.bucket_id) {
                    old.tasks.retain(|id| id != &task.id);
                }
            }
        }

        if !self.buckets.contains_key(&task.bucket_id) {
            log::debug!(
                "Bucket {} unknown for task {}, creating shell",
                task.bucket_id,
                task.id
            );
            self.upsert_bucket(Bucket::shell(&task.bucket_id, &task.board_id));
        }

        if let Some(bucket) = self.buckets.get_mut(&task.bucket_id) {
            if !bucket.tasks.iter().any(|id| id == &task.id) {
                bucket.tasks.push(task.id.clone());
            }
        }
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn delete_task(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        if let Some(bucket) = self.buckets.get_mut(&task.bucket_id) {
            bucket.tasks.retain(|t| t != id);
        }
        Some(task)
    }

    /// After a full fetch of the whole board, forget tasks the remote no
    /// longer has.
    pub fn retain_tasks(&mut self, keep: &HashSet<String>) -> usize {
        let stale: Vec<String> = self
            .tasks
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.delete_task(id);
        }
        stale.len()
    }

    // ── People ─────────────────────────────────────────────────────

    pub fn person(&self, id: &str) -> Option<&Person> {
        self.people.get(id)
    }

    pub fn insert_person(&mut self, person: Person) {
        self.people.insert(person.id.clone(), person);
    }

    // ── Delta cursor ───────────────────────────────────────────────

    pub fn cursor(&self) -> Option<&DeltaCursor> {
        self.cursor.as_ref()
    }

    pub fn set_cursor(&mut self, cursor: DeltaCursor) {
        self.cursor = Some(cursor);
    }

    pub fn clear_cursor(&mut self) -> Option<DeltaCursor> {
        self.cursor.take()
    }

    /// Check the bucket membership invariant. Used by tests.
    pub fn membership_consistent(&self) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        for bucket in self.buckets.values() {
            for id in &bucket.tasks {
                match self.tasks.get(id) {
                    Some(task) if task.bucket_id == bucket.id => {
                        if !seen.insert(id.as_str()) {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
        }
        seen.len() == self.tasks.len()
    }
}
