//! The remote adapter: every operation the sync bridge and its consumer can
//! perform against the task service, backed by the local store.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::model::{
    clean_title, Board, Bucket, DeltaBatch, MembersAndOwners, NewTask, Person, Task, TaskUpdate,
};
use crate::remote::wire::{self, COMPLETE};
use crate::remote::{DeltaFetch, PlannerApi, TaskCreate, TaskPatch, WriteOutcome};
use crate::storage::{BoardDirectory, LocalStore, SharedStore};
use crate::sync::reconciler::DeltaReconciler;
use crate::sync::retry::ConflictRetryPolicy;

/// Result of one delta poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaPoll {
    /// The batch was applied to the store and the cursor advanced.
    Changes(DeltaBatch),
    /// There was no usable cursor: the feed was just opened, the board was
    /// reloaded, or the server dropped it. A fresh cursor is already stored;
    /// the caller should refetch everything to catch what was missed.
    ResyncRequired,
    /// Sync is turned off.
    Disabled,
}

/// Operations of a remote task service as seen by the sync bridge.
///
/// When sync is disabled, writes return `WriteOutcome::Skipped` and reads
/// return empty results. Neither is an error.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    fn sync_enabled(&self) -> bool;
    fn set_sync_enabled(&self, enabled: bool);

    /// Resolve and cache the signed-in user.
    async fn authenticate(&self) -> Result<Option<Person>>;

    async fn get_all_tasks(&self, board_id: &str, bucket_id: Option<&str>) -> Result<Vec<Task>>;
    async fn get_all_buckets(&self, board_id: &str) -> Result<Vec<Bucket>>;
    async fn get_board(&self, board_id: &str) -> Result<Option<Board>>;
    async fn create_board(&self, name: &str) -> Result<WriteOutcome<Board>>;

    async fn create_bucket(&self, board_id: &str, name: &str) -> Result<WriteOutcome<Bucket>>;
    async fn rename_bucket(&self, bucket_id: &str, name: &str) -> Result<WriteOutcome<Bucket>>;
    async fn delete_bucket(&self, bucket_id: &str) -> Result<WriteOutcome<()>>;

    async fn add_task(&self, task: &NewTask, bucket_id: &str) -> Result<WriteOutcome<Task>>;
    async fn update_task(&self, update: &TaskUpdate) -> Result<WriteOutcome<Task>>;
    async fn delete_task(&self, task_id: &str) -> Result<WriteOutcome<()>>;

    async fn get_delta(&self, board_id: &str) -> Result<DeltaPoll>;

    async fn get_user_from_id(&self, user_id: &str) -> Result<Option<Person>>;
    async fn get_member_and_owners_of_board(&self, board_id: &str) -> Result<MembersAndOwners>;
    async fn add_member_to_board(&self, board_id: &str, user_id: &str) -> Result<WriteOutcome<()>>;

    fn local_store(&self) -> SharedStore;
}

/// `RemoteAdapter` for the Planner service over any `PlannerApi` transport.
pub struct Planner<A> {
    api: A,
    store: SharedStore,
    directory: Mutex<BoardDirectory>,
    me: Mutex<Option<Person>>,
    sync_enabled: AtomicBool,
}

impl<A: PlannerApi> Planner<A> {
    /// A planner with sync enabled.
    pub fn new(api: A) -> Self {
        Self {
            api,
            store: LocalStore::shared(),
            directory: Mutex::new(BoardDirectory::new()),
            me: Mutex::new(None),
            sync_enabled: AtomicBool::new(true),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    async fn current_user(&self) -> Result<Person> {
        if let Some(me) = self.me.lock().clone() {
            return Ok(me);
        }
        let me = self.api.me().await?;
        self.store.lock().insert_person(me.clone());
        *self.me.lock() = Some(me.clone());
        Ok(me)
    }

    // ── Board initialization ───────────────────────────────────────

    /// Load the board into the store unless it is already the current one.
    async fn ensure_board(&self, board_id: &str) -> Result<()> {
        let loaded = self
            .store
            .lock()
            .board()
            .is_some_and(|b| b.id == board_id);
        if loaded {
            return Ok(());
        }
        self.load_board(board_id).await
    }

    async fn load_board(&self, board_id: &str) -> Result<()> {
        log::info!("Loading board {board_id}");
        let plan = self
            .api
            .get_plan(board_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("board {board_id}")))?;
        let mut board = Board::from(plan);
        if let Some(details) = self.api.get_plan_details(board_id).await? {
            board.shared_with = details.shared_ids();
            board.details_etag = details.etag;
        }

        self.directory.lock().focus(board_id);
        if let Some(group_id) = board.owner.clone() {
            self.directory.lock().set_group_id(board_id, group_id.clone());
            match self.api.get_group_members(&group_id).await {
                Ok(members) => {
                    board.members = members.iter().map(|p| p.id.clone()).collect();
                    self.directory.lock().set_members(board_id, members);
                }
                Err(e) => log::warn!("Could not load members of group {group_id}: {e}"),
            }
        }

        let buckets = self.api.list_buckets(board_id).await?;
        {
            let mut store = self.store.lock();
            store.reset_for_board(board);
            for bucket in buckets {
                store.upsert_bucket(bucket.into());
            }
        }

        match self.share_with_current_user(board_id).await {
            Ok(outcome) if !outcome.is_applied() => {
                log::warn!("Could not share board {board_id} with current user: {outcome:?}")
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not share board {board_id} with current user: {e}"),
        }
        Ok(())
    }

    async fn share_with_current_user(
        &self,
        board_id: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let me = self.current_user().await?;
        let shared = self
            .store
            .lock()
            .board()
            .is_some_and(|b| b.shared_with.contains(&me.id));
        if shared {
            return Ok(WriteOutcome::Applied(None));
        }

        let api = &self.api;
        let store = &self.store;
        let users = vec![me.id.clone()];
        let users = &users;
        let outcome = ConflictRetryPolicy::SHARING
            .run(
                "share board",
                move || {
                    let etag = store
                        .lock()
                        .board()
                        .and_then(|b| b.details_etag.clone())
                        .unwrap_or_default();
                    async move { api.update_plan_sharing(board_id, users, &etag).await }
                },
                move || self.refresh_plan_details(board_id),
            )
            .await?;

        if let WriteOutcome::Applied(etag) = &outcome {
            if let Some(board) = self.store.lock().board_mut() {
                board.shared_with.insert(me.id.clone());
                if etag.is_some() {
                    board.details_etag = etag.clone();
                }
            }
        }
        Ok(outcome)
    }

    async fn refresh_plan_details(&self, board_id: &str) -> Result<()> {
        let details = self
            .api
            .get_plan_details(board_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("details of board {board_id}")))?;
        if let Some(board) = self.store.lock().board_mut() {
            if board.id == board_id {
                board.shared_with = details.shared_ids();
                board.details_etag = details.etag;
            }
        }
        Ok(())
    }

    async fn group_of(&self, board_id: &str) -> Result<Option<String>> {
        if let Some(group) = self.directory.lock().group_id(board_id) {
            return Ok(Some(group.to_string()));
        }
        let Some(plan) = self.api.get_plan(board_id).await? else {
            return Ok(None);
        };
        if let Some(group) = &plan.owner {
            self.directory.lock().set_group_id(board_id, group.clone());
        }
        Ok(plan.owner)
    }

    /// Add assignees that are not yet members to the board's group.
    /// Failures are logged; the task write goes ahead regardless.
    async fn ensure_members(&self, board_id: &str, assignees: &BTreeSet<String>) -> Result<()> {
        let missing: Vec<String> = {
            let store = self.store.lock();
            let members = store
                .board()
                .filter(|b| b.id == board_id)
                .map(|b| b.members.clone())
                .unwrap_or_default();
            assignees.difference(&members).cloned().collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let Some(group_id) = self.group_of(board_id).await? else {
            return Ok(());
        };

        for user_id in missing {
            match self.api.add_group_member(&group_id, &user_id).await {
                Ok(WriteOutcome::Applied(())) => {
                    log::info!("Added {user_id} to group {group_id}");
                }
                Ok(outcome) => log::debug!("Adding {user_id} to group {group_id}: {outcome:?}"),
                Err(e) => {
                    log::warn!("Could not add {user_id} to group {group_id}: {e}");
                    continue;
                }
            }
            if let Some(board) = self.store.lock().board_mut() {
                board.members.insert(user_id);
            }
        }
        Ok(())
    }

    // ── Refresh helpers ────────────────────────────────────────────

    /// Refetch a task and store it, keeping the cached details.
    async fn refresh_task(&self, task_id: &str) -> Result<()> {
        let remote = self
            .api
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        let mut task = remote.into_task();
        let mut store = self.store.lock();
        if let Some(cached) = store.task(task_id) {
            task.description = cached.description.clone();
            task.details_etag = cached.details_etag.clone();
        }
        store.upsert_task(task);
        Ok(())
    }

    async fn refresh_task_details(&self, task_id: &str) -> Result<()> {
        let details = self
            .api
            .get_task_details(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("details of task {task_id}")))?;
        let mut store = self.store.lock();
        if let Some(mut task) = store.task(task_id).cloned() {
            task.description = details.description.filter(|d| !d.is_empty());
            task.details_etag = details.etag;
            store.upsert_task(task);
        }
        Ok(())
    }

    async fn refresh_bucket(&self, bucket_id: &str) -> Result<()> {
        let bucket = self
            .api
            .get_bucket(bucket_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("bucket {bucket_id}")))?;
        self.store.lock().upsert_bucket(bucket.into());
        Ok(())
    }

    /// Attach description and details etag. A failed lookup leaves the task
    /// without them.
    async fn with_details(&self, mut task: Task) -> Task {
        match self.api.get_task_details(&task.id).await {
            Ok(Some(details)) => {
                task.description = details.description.filter(|d| !d.is_empty());
                task.details_etag = details.etag;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Could not load details of task {}: {e}", task.id),
        }
        task
    }

    fn task_etag(&self, task_id: &str) -> String {
        self.store
            .lock()
            .task(task_id)
            .and_then(|t| t.etag.clone())
            .unwrap_or_default()
    }

    fn details_etag(&self, task_id: &str) -> String {
        self.store
            .lock()
            .task(task_id)
            .and_then(|t| t.details_etag.clone())
            .unwrap_or_default()
    }

    fn bucket_etag(&self, bucket_id: &str) -> String {
        self.store
            .lock()
            .bucket(bucket_id)
            .and_then(|b| b.etag.clone())
            .unwrap_or_default()
    }

    /// Write a description under the conflict policy.
    async fn write_description(
        &self,
        task_id: &str,
        description: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        if self.details_etag(task_id).is_empty() {
            self.refresh_task_details(task_id).await?;
        }
        let api = &self.api;
        ConflictRetryPolicy::WRITE
            .run(
                "update task details",
                move || {
                    let etag = self.details_etag(task_id);
                    async move { api.update_task_details(task_id, description, &etag).await }
                },
                move || self.refresh_task_details(task_id),
            )
            .await
    }
}

#[async_trait]
impl<A: PlannerApi> RemoteAdapter for Planner<A> {
    fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    fn set_sync_enabled(&self, enabled: bool) {
        let was = self.sync_enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            log::info!("Sync {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    async fn authenticate(&self) -> Result<Option<Person>> {
        if !self.sync_enabled() {
            return Ok(None);
        }
        self.current_user().await.map(Some)
    }

    async fn get_all_tasks(&self, board_id: &str, bucket_id: Option<&str>) -> Result<Vec<Task>> {
        if !self.sync_enabled() || board_id.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_board(board_id).await?;

        let remote = match bucket_id {
            Some(bucket_id) => self.api.list_bucket_tasks(bucket_id).await?,
            None => self.api.list_plan_tasks(board_id).await?,
        };
        let mut fetched = Vec::with_capacity(remote.len());
        for task in remote {
            fetched.push(self.with_details(task.into_task()).await);
        }

        let mut store = self.store.lock();
        let ids: HashSet<String> = fetched.iter().map(|t| t.id.clone()).collect();
        for task in fetched {
            store.upsert_task(task);
        }
        match bucket_id {
            Some(bucket_id) => Ok(store.tasks_in_bucket(bucket_id).into_iter().cloned().collect()),
            None => {
                let dropped = store.retain_tasks(&ids);
                if dropped > 0 {
                    log::debug!("Dropped {dropped} tasks no longer on board {board_id}");
                }
                Ok(store.all_tasks())
            }
        }
    }

    async fn get_all_buckets(&self, board_id: &str) -> Result<Vec<Bucket>> {
        if !self.sync_enabled() {
            return Ok(Vec::new());
        }
        let buckets: Vec<Bucket> = self
            .api
            .list_buckets(board_id)
            .await?
            .into_iter()
            .map(Bucket::from)
            .collect();
        let mut store = self.store.lock();
        if store.board().is_some_and(|b| b.id == board_id) {
            for bucket in &buckets {
                store.upsert_bucket(bucket.clone());
            }
        }
        Ok(buckets)
    }

    async fn get_board(&self, board_id: &str) -> Result<Option<Board>> {
        if !self.sync_enabled() {
            return Ok(None);
        }
        Ok(self.api.get_plan(board_id).await?.map(Board::from))
    }

    async fn create_board(&self, name: &str) -> Result<WriteOutcome<Board>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        let name = clean_title(Some(name));
        let me = self.current_user().await?;
        let group_id = match self.api.create_group(&me.id, &name).await?.into_applied() {
            Ok(id) => id,
            Err(outcome) => return Ok(outcome),
        };
        let plan = match self.api.create_plan(&group_id, &name).await?.into_applied() {
            Ok(plan) => plan,
            Err(outcome) => return Ok(outcome),
        };

        let mut board = Board::from(plan);
        board.owner.get_or_insert_with(|| group_id.clone());
        board.members.insert(me.id.clone());
        self.directory.lock().set_group_id(&board.id, group_id);
        self.store.lock().reset_for_board(board.clone());
        log::info!("Created board {} ({name})", board.id);
        Ok(WriteOutcome::Applied(board))
    }

    async fn create_bucket(&self, board_id: &str, name: &str) -> Result<WriteOutcome<Bucket>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        let name = clean_title(Some(name));
        let outcome = self.api.create_bucket(board_id, &name).await?;
        let bucket = match outcome.into_applied() {
            Ok(remote) => Bucket::from(remote),
            Err(outcome) => return Ok(outcome),
        };
        let mut store = self.store.lock();
        if store.board().is_some_and(|b| b.id == board_id) {
            store.upsert_bucket(bucket.clone());
        }
        Ok(WriteOutcome::Applied(bucket))
    }

    async fn rename_bucket(&self, bucket_id: &str, name: &str) -> Result<WriteOutcome<Bucket>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        if self.store.lock().bucket(bucket_id).is_none() {
            self.refresh_bucket(bucket_id).await?;
        }
        let name = clean_title(Some(name));
        let api = &self.api;
        let label = format!("rename bucket {bucket_id}");
        let outcome = ConflictRetryPolicy::WRITE
            .run(
                &label,
                || {
                    let etag = self.bucket_etag(bucket_id);
                    let name = &name;
                    async move { api.update_bucket(bucket_id, name, &etag).await }
                },
                move || self.refresh_bucket(bucket_id),
            )
            .await?;
        let etag = match outcome.into_applied() {
            Ok(etag) => etag,
            Err(outcome) => return Ok(outcome),
        };

        let mut store = self.store.lock();
        store.upsert_bucket(Bucket {
            name: Some(name),
            etag,
            ..Bucket::shell(bucket_id, "")
        });
        let bucket = store
            .bucket(bucket_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("bucket {bucket_id}")))?;
        Ok(WriteOutcome::Applied(bucket))
    }

    async fn delete_bucket(&self, bucket_id: &str) -> Result<WriteOutcome<()>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        if self.store.lock().bucket(bucket_id).is_none() {
            self.refresh_bucket(bucket_id).await?;
        }
        let api = &self.api;
        let outcome = ConflictRetryPolicy::WRITE
            .run(
                "delete bucket",
                move || {
                    let etag = self.bucket_etag(bucket_id);
                    async move { api.delete_bucket(bucket_id, &etag).await }
                },
                move || self.refresh_bucket(bucket_id),
            )
            .await?;
        if outcome.is_applied() {
            self.store.lock().remove_bucket(bucket_id);
        }
        Ok(outcome)
    }

    async fn add_task(&self, task: &NewTask, bucket_id: &str) -> Result<WriteOutcome<Task>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        if task.is_blank() {
            return Err(Error::InvalidTask("all fields are empty".into()));
        }
        self.ensure_board(&task.board_id).await?;
        self.ensure_members(&task.board_id, &task.assignees).await?;

        let create = TaskCreate {
            plan_id: task.board_id.clone(),
            bucket_id: bucket_id.to_string(),
            title: clean_title(task.name.as_deref()),
            assignees: task.assignees.clone(),
            due_date: task.due_date,
            percent_complete: task.completed.then_some(COMPLETE),
        };
        let created = match self.api.create_task(&create).await?.into_applied() {
            Ok(remote) => remote.into_task(),
            Err(outcome) => return Ok(outcome),
        };
        let task_id = created.id.clone();
        log::debug!("Created task {task_id} in bucket {bucket_id}");

        if let Some(order_hint) = &task.order_hint {
            match self.api.get_task_board_format(&task_id).await {
                Ok(Some(format)) => {
                    let etag = format.etag.unwrap_or_default();
                    if let Err(e) = self
                        .api
                        .update_task_board_format(&task_id, order_hint, &etag)
                        .await
                    {
                        log::warn!("Could not order task {task_id}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Could not load board format of task {task_id}: {e}"),
            }
        }

        let created = self.with_details(created).await;
        self.store.lock().upsert_task(created);

        if let Some(description) = task.description.as_deref().filter(|d| !d.is_empty()) {
            let outcome = self.write_description(&task_id, description).await?;
            match outcome {
                WriteOutcome::Applied(etag) => {
                    let mut store = self.store.lock();
                    if let Some(mut cached) = store.task(&task_id).cloned() {
                        cached.description = Some(description.to_string());
                        if etag.is_some() {
                            cached.details_etag = etag;
                        }
                        store.upsert_task(cached);
                    }
                }
                other => log::warn!("Description of task {task_id} not saved: {other:?}"),
            }
        }

        self.store
            .lock()
            .task(&task_id)
            .cloned()
            .map(WriteOutcome::Applied)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))
    }

    async fn update_task(&self, update: &TaskUpdate) -> Result<WriteOutcome<Task>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        let task_id = update.id.as_str();
        let mut update = update.clone();
        update.name = update.name.map(|n| clean_title(Some(&n)));

        self.refresh_task(task_id).await?;
        let cached = self
            .store
            .lock()
            .task(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        let mut patch = TaskPatch::default();
        if let Some(name) = &update.name {
            if *name != cached.name {
                patch.title = Some(name.clone());
            }
        }
        if let Some(assignees) = &update.assignees {
            patch.remove_assignees = cached.assignees.difference(assignees).cloned().collect();
            patch.add_assignees = assignees.difference(&cached.assignees).cloned().collect();
            self.ensure_members(&cached.board_id, &patch.add_assignees)
                .await?;
        }
        if let Some(due) = update.due_date {
            if due != cached.due_date {
                patch.due_date = Some(due);
            }
        }
        if let Some(completed) = update.completed {
            if completed != cached.completed {
                patch.percent_complete = Some(if completed { COMPLETE } else { 0 });
            }
        }

        if patch != TaskPatch::default() {
            let api = &self.api;
            let patch = &patch;
            let outcome = ConflictRetryPolicy::WRITE
                .run(
                    "update task",
                    move || {
                        let etag = self.task_etag(task_id);
                        async move { api.update_task(task_id, patch, &etag).await }
                    },
                    move || self.refresh_task(task_id),
                )
                .await?;
            let new_etag = match outcome.into_applied() {
                Ok(etag) => etag,
                Err(outcome) => return Ok(outcome),
            };
            // The patch is on the server now, whatever happens to the
            // description below.
            let mut store = self.store.lock();
            let mut task = store.task(task_id).cloned().unwrap_or_else(|| cached.clone());
            TaskUpdate {
                description: None,
                ..update.clone()
            }
            .apply_to(&mut task);
            if new_etag.is_some() {
                task.etag = new_etag;
            }
            store.upsert_task(task);
        }

        let mut new_details_etag = None;
        if let Some(description) = &update.description {
            if cached.description.as_deref().unwrap_or_default() != description {
                match self.write_description(task_id, description).await?.into_applied() {
                    Ok(etag) => new_details_etag = etag,
                    Err(outcome) => return Ok(outcome),
                }
            }
        }

        let mut store = self.store.lock();
        let mut task = store.task(task_id).cloned().unwrap_or(cached);
        update.apply_to(&mut task);
        if new_details_etag.is_some() {
            task.details_etag = new_details_etag;
        }
        store.upsert_task(task.clone());
        Ok(WriteOutcome::Applied(task))
    }

    async fn delete_task(&self, task_id: &str) -> Result<WriteOutcome<()>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        if !self.store.lock().contains_task(task_id) {
            self.refresh_task(task_id).await?;
        }
        let api = &self.api;
        let outcome = ConflictRetryPolicy::WRITE
            .run(
                "delete task",
                move || {
                    let etag = self.task_etag(task_id);
                    async move { api.delete_task(task_id, &etag).await }
                },
                move || self.refresh_task(task_id),
            )
            .await?;
        if outcome.is_applied() {
            self.store.lock().delete_task(task_id);
        }
        Ok(outcome)
    }

    async fn get_delta(&self, board_id: &str) -> Result<DeltaPoll> {
        if !self.sync_enabled() {
            return Ok(DeltaPoll::Disabled);
        }
        self.ensure_board(board_id).await?;

        let cursor = self.store.lock().cursor().cloned();
        // No cursor means the feed was never opened for this board or the
        // board was reloaded. Changes before the subscription are only
        // visible through a full fetch.
        let Some(cursor) = cursor else {
            if let Some(cursor) = self.api.subscribe_delta().await? {
                log::debug!("Subscribed to delta feed for board {board_id}");
                self.store.lock().set_cursor(cursor);
            }
            return Ok(DeltaPoll::ResyncRequired);
        };

        match self.api.fetch_delta(&cursor).await? {
            DeltaFetch::Expired => {
                log::warn!("Delta cursor for board {board_id} expired, resubscribing");
                self.store.lock().clear_cursor();
                if let Some(cursor) = self.api.subscribe_delta().await? {
                    self.store.lock().set_cursor(cursor);
                }
                Ok(DeltaPoll::ResyncRequired)
            }
            DeltaFetch::Page { records, cursor } => {
                let records = wire::decode_records(records);
                let reconciler = DeltaReconciler::new(board_id);
                let mut store = self.store.lock();
                let batch = reconciler.apply(&mut store, records);
                store.set_cursor(cursor);
                Ok(DeltaPoll::Changes(batch))
            }
        }
    }

    async fn get_user_from_id(&self, user_id: &str) -> Result<Option<Person>> {
        if let Some(person) = self.store.lock().person(user_id).cloned() {
            return Ok(Some(person));
        }
        if !self.sync_enabled() {
            return Ok(None);
        }
        let person = self.api.get_user(user_id).await?;
        if let Some(person) = &person {
            self.store.lock().insert_person(person.clone());
        }
        Ok(person)
    }

    async fn get_member_and_owners_of_board(&self, board_id: &str) -> Result<MembersAndOwners> {
        if !self.sync_enabled() {
            return Ok(MembersAndOwners::default());
        }
        let Some(group_id) = self.group_of(board_id).await? else {
            return Ok(MembersAndOwners::default());
        };

        let cached_members = self.directory.lock().members(board_id).map(<[Person]>::to_vec);
        let members = match cached_members {
            Some(members) => members,
            None => {
                let members = self.api.get_group_members(&group_id).await?;
                self.directory.lock().set_members(board_id, members.clone());
                members
            }
        };
        let cached_owners = self.directory.lock().owners(board_id).map(<[Person]>::to_vec);
        let owners = match cached_owners {
            Some(owners) => owners,
            None => {
                let owners = self.api.get_group_owners(&group_id).await?;
                self.directory.lock().set_owners(board_id, owners.clone());
                owners
            }
        };
        Ok(MembersAndOwners {
            members: Some(members),
            owners: Some(owners),
        })
    }

    async fn add_member_to_board(&self, board_id: &str, user_id: &str) -> Result<WriteOutcome<()>> {
        if !self.sync_enabled() {
            return Ok(WriteOutcome::Skipped);
        }
        let group_id = self
            .group_of(board_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group of board {board_id}")))?;
        let outcome = self.api.add_group_member(&group_id, user_id).await?;
        if outcome.is_applied() {
            let person = self
                .get_user_from_id(user_id)
                .await?
                .unwrap_or_else(|| Person {
                    id: user_id.to_string(),
                    ..Default::default()
                });
            {
                let mut directory = self.directory.lock();
                if let Some(mut members) = directory.members(board_id).map(<[Person]>::to_vec) {
                    members.push(person);
                    directory.set_members(board_id, members);
                }
            }
            if let Some(board) = self.store.lock().board_mut() {
                if board.id == board_id {
                    board.members.insert(user_id.to_string());
                }
            }
        }
        Ok(outcome)
    }

    fn local_store(&self) -> SharedStore {
        self.store.clone()
    }
}
