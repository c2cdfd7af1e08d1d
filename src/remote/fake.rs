//! In-memory Planner service for tests.
//!
//! Every write bumps the entity's etag and is checked against the caller's
//! `If-Match` value, so stale writes behave like the real service. Tests can
//! also force conflicts, transport failures and cursor expiry.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::IgnoredAny;
use serde_json::Value;

use super::wire::{
    RemoteBucket, RemotePlan, RemotePlanDetails, RemoteTask, RemoteTaskDetails, TaskBoardFormat,
    COMPLETE,
};
use super::{DeltaFetch, PlannerApi, TaskCreate, TaskPatch, WriteOutcome};
use crate::error::{Error, Result};
use crate::model::{DeltaCursor, Person};

pub const ME: &str = "me-id";

#[derive(Default)]
struct State {
    users: HashMap<String, Person>,
    plans: HashMap<String, RemotePlan>,
    plan_details: HashMap<String, RemotePlanDetails>,
    members: HashMap<String, Vec<Person>>,
    owners: HashMap<String, Vec<Person>>,
    buckets: BTreeMap<String, RemoteBucket>,
    tasks: BTreeMap<String, RemoteTask>,
    details: HashMap<String, RemoteTaskDetails>,
    formats: HashMap<String, TaskBoardFormat>,
    version: u64,
    next_id: u64,
    delta_queue: VecDeque<Value>,
    delta_seq: u64,
    expire_cursor: bool,
    stale_writes: u32,
    stale_details_writes: u32,
    failing_reads: u32,
    calls: Vec<String>,
}

impl State {
    fn etag(&mut self) -> String {
        self.version += 1;
        format!("W/\"{}\"", self.version)
    }

    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Record a write and decide whether it is rejected as stale.
    fn stale(&mut self, op: &str, current: Option<&str>, etag: &str) -> bool {
        self.calls.push(op.to_string());
        if self.stale_writes > 0 {
            self.stale_writes -= 1;
            return true;
        }
        current.is_some_and(|c| c != etag)
    }

    fn read(&mut self) -> Result<()> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(Error::Api {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        Ok(())
    }
}

pub struct FakePlanner {
    state: Mutex<State>,
}

impl FakePlanner {
    pub fn new() -> Self {
        let fake = Self {
            state: Mutex::new(State::default()),
        };
        fake.add_user(ME, "Me");
        fake
    }

    pub fn add_user(&self, id: &str, name: &str) {
        self.state.lock().users.insert(
            id.into(),
            Person {
                id: id.into(),
                display_name: Some(name.into()),
                principal_name: Some(format!("{id}@example.test")),
            },
        );
    }

    /// A plan owned by `group_id`, with the current user as the group owner.
    pub fn add_plan(&self, plan_id: &str, group_id: &str, title: &str) {
        let mut s = self.state.lock();
        let etag = s.etag();
        s.plans.insert(
            plan_id.into(),
            RemotePlan {
                id: plan_id.into(),
                title: Some(title.into()),
                owner: Some(group_id.into()),
                etag: Some(etag),
            },
        );
        let details_etag = s.etag();
        s.plan_details.insert(
            plan_id.into(),
            RemotePlanDetails {
                shared_with: BTreeMap::new(),
                etag: Some(details_etag),
            },
        );
        let me = s.users.get(ME).cloned().unwrap_or_default();
        s.owners.insert(group_id.into(), vec![me.clone()]);
        s.members.insert(group_id.into(), vec![me]);
    }

    pub fn add_bucket(&self, plan_id: &str, bucket_id: &str, name: &str) {
        let mut s = self.state.lock();
        let etag = s.etag();
        s.buckets.insert(
            bucket_id.into(),
            RemoteBucket {
                id: bucket_id.into(),
                name: Some(name.into()),
                plan_id: plan_id.into(),
                order_hint: None,
                etag: Some(etag),
            },
        );
    }

    pub fn add_task(&self, plan_id: &str, bucket_id: &str, task_id: &str, title: &str) {
        let mut s = self.state.lock();
        let etag = s.etag();
        s.tasks.insert(
            task_id.into(),
            RemoteTask {
                id: task_id.into(),
                plan_id: plan_id.into(),
                bucket_id: bucket_id.into(),
                title: Some(title.into()),
                order_hint: None,
                percent_complete: Some(0),
                due_date_time: None,
                assignments: BTreeMap::new(),
                etag: Some(etag),
            },
        );
        let details_etag = s.etag();
        s.details.insert(
            task_id.into(),
            RemoteTaskDetails {
                id: task_id.into(),
                description: None,
                etag: Some(details_etag),
            },
        );
    }

    /// Simulate a concurrent edit by someone else.
    pub fn touch_task(&self, task_id: &str) {
        let mut s = self.state.lock();
        let etag = s.etag();
        if let Some(task) = s.tasks.get_mut(task_id) {
            task.etag = Some(etag);
        }
    }

    pub fn push_delta(&self, records: impl IntoIterator<Item = Value>) {
        self.state.lock().delta_queue.extend(records);
    }

    pub fn expire_cursor(&self) {
        self.state.lock().expire_cursor = true;
    }

    /// Answer the next `n` writes with 412 regardless of etag.
    pub fn inject_stale(&self, n: u32) {
        self.state.lock().stale_writes = n;
    }

    /// Answer the next `n` description writes with 412.
    pub fn inject_stale_details(&self, n: u32) {
        self.state.lock().stale_details_writes = n;
    }

    /// Fail the next `n` task listings and delta polls with a 503.
    pub fn fail_reads(&self, n: u32) {
        self.state.lock().failing_reads = n;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == op).count()
    }

    pub fn task(&self, task_id: &str) -> Option<RemoteTask> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    pub fn bucket(&self, bucket_id: &str) -> Option<RemoteBucket> {
        self.state.lock().buckets.get(bucket_id).cloned()
    }

    pub fn description(&self, task_id: &str) -> Option<String> {
        self.state
            .lock()
            .details
            .get(task_id)
            .and_then(|d| d.description.clone())
    }

    pub fn shared_with(&self, plan_id: &str) -> Vec<String> {
        self.state
            .lock()
            .plan_details
            .get(plan_id)
            .map(|d| d.shared_ids().into_iter().collect())
            .unwrap_or_default()
    }

    pub fn member_ids(&self, group_id: &str) -> Vec<String> {
        self.state
            .lock()
            .members
            .get(group_id)
            .map(|m| m.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlannerApi for FakePlanner {
    async fn me(&self) -> Result<Person> {
        self.state
            .lock()
            .users
            .get(ME)
            .cloned()
            .ok_or_else(|| Error::NotFound(ME.into()))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<Person>> {
        let mut s = self.state.lock();
        s.calls.push("get_user".into());
        Ok(s.users.get(user_id).cloned())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<RemotePlan>> {
        Ok(self.state.lock().plans.get(plan_id).cloned())
    }

    async fn get_plan_details(&self, plan_id: &str) -> Result<Option<RemotePlanDetails>> {
        Ok(self.state.lock().plan_details.get(plan_id).cloned())
    }

    async fn update_plan_sharing(
        &self,
        plan_id: &str,
        user_ids: &[String],
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let mut s = self.state.lock();
        let current = s.plan_details.get(plan_id).and_then(|d| d.etag.clone());
        if s.stale("update_plan_sharing", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        let next = s.etag();
        let Some(details) = s.plan_details.get_mut(plan_id) else {
            return Ok(WriteOutcome::failure(404, "plan not found"));
        };
        for id in user_ids {
            details.shared_with.insert(id.clone(), true);
        }
        details.etag = Some(next.clone());
        Ok(WriteOutcome::Applied(Some(next)))
    }

    async fn create_group(&self, owner_id: &str, _name: &str) -> Result<WriteOutcome<String>> {
        let mut s = self.state.lock();
        s.calls.push("create_group".into());
        let id = s.id("group");
        let owner = s.users.get(owner_id).cloned().unwrap_or_default();
        s.owners.insert(id.clone(), vec![owner.clone()]);
        s.members.insert(id.clone(), vec![owner]);
        Ok(WriteOutcome::Applied(id))
    }

    async fn create_plan(&self, group_id: &str, title: &str) -> Result<WriteOutcome<RemotePlan>> {
        let id = {
            let mut s = self.state.lock();
            s.calls.push("create_plan".into());
            s.id("plan")
        };
        self.add_plan(&id, group_id, title);
        Ok(WriteOutcome::Applied(
            self.state
                .lock()
                .plans
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::NotFound(id.clone()))?,
        ))
    }

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<Person>> {
        Ok(self.state.lock().members.get(group_id).cloned().unwrap_or_default())
    }

    async fn get_group_owners(&self, group_id: &str) -> Result<Vec<Person>> {
        Ok(self.state.lock().owners.get(group_id).cloned().unwrap_or_default())
    }

    async fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<WriteOutcome<()>> {
        let mut s = self.state.lock();
        s.calls.push("add_group_member".into());
        let person = s.users.get(user_id).cloned().unwrap_or(Person {
            id: user_id.into(),
            ..Default::default()
        });
        let members = s.members.entry(group_id.into()).or_default();
        if members.iter().any(|p| p.id == user_id) {
            return Ok(WriteOutcome::failure(400, "member already exists"));
        }
        members.push(person);
        Ok(WriteOutcome::Applied(()))
    }

    async fn list_buckets(&self, plan_id: &str) -> Result<Vec<RemoteBucket>> {
        Ok(self
            .state
            .lock()
            .buckets
            .values()
            .filter(|b| b.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn get_bucket(&self, bucket_id: &str) -> Result<Option<RemoteBucket>> {
        let mut s = self.state.lock();
        s.calls.push("get_bucket".into());
        Ok(s.buckets.get(bucket_id).cloned())
    }

    async fn create_bucket(&self, plan_id: &str, name: &str) -> Result<WriteOutcome<RemoteBucket>> {
        let id = {
            let mut s = self.state.lock();
            s.calls.push("create_bucket".into());
            s.id("bucket")
        };
        self.add_bucket(plan_id, &id, name);
        Ok(WriteOutcome::Applied(
            self.bucket(&id).ok_or_else(|| Error::NotFound(id.clone()))?,
        ))
    }

    async fn update_bucket(
        &self,
        bucket_id: &str,
        name: &str,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let mut s = self.state.lock();
        let current = s.buckets.get(bucket_id).and_then(|b| b.etag.clone());
        if s.stale("update_bucket", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        let next = s.etag();
        let Some(bucket) = s.buckets.get_mut(bucket_id) else {
            return Ok(WriteOutcome::failure(404, "bucket not found"));
        };
        bucket.name = Some(name.into());
        bucket.etag = Some(next.clone());
        Ok(WriteOutcome::Applied(Some(next)))
    }

    async fn delete_bucket(&self, bucket_id: &str, etag: &str) -> Result<WriteOutcome<()>> {
        let mut s = self.state.lock();
        let current = s.buckets.get(bucket_id).and_then(|b| b.etag.clone());
        if s.stale("delete_bucket", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        if s.buckets.remove(bucket_id).is_none() {
            return Ok(WriteOutcome::failure(404, "bucket not found"));
        }
        s.tasks.retain(|_, t| t.bucket_id != bucket_id);
        Ok(WriteOutcome::Applied(()))
    }

    async fn list_plan_tasks(&self, plan_id: &str) -> Result<Vec<RemoteTask>> {
        let mut s = self.state.lock();
        s.calls.push("list_plan_tasks".into());
        s.read()?;
        Ok(s.tasks.values().filter(|t| t.plan_id == plan_id).cloned().collect())
    }

    async fn list_bucket_tasks(&self, bucket_id: &str) -> Result<Vec<RemoteTask>> {
        let mut s = self.state.lock();
        s.read()?;
        Ok(s.tasks
            .values()
            .filter(|t| t.bucket_id == bucket_id)
            .cloned()
            .collect())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<RemoteTask>> {
        let mut s = self.state.lock();
        s.calls.push("get_task".into());
        Ok(s.tasks.get(task_id).cloned())
    }

    async fn get_task_details(&self, task_id: &str) -> Result<Option<RemoteTaskDetails>> {
        Ok(self.state.lock().details.get(task_id).cloned())
    }

    async fn create_task(&self, task: &TaskCreate) -> Result<WriteOutcome<RemoteTask>> {
        let id = {
            let mut s = self.state.lock();
            s.calls.push("create_task".into());
            s.id("task")
        };
        self.add_task(&task.plan_id, &task.bucket_id, &id, &task.title);
        let mut s = self.state.lock();
        let Some(created) = s.tasks.get_mut(&id) else {
            return Err(Error::NotFound(id));
        };
        created.assignments = task
            .assignees
            .iter()
            .map(|a| (a.clone(), Some(IgnoredAny)))
            .collect();
        created.due_date_time = task.due_date;
        created.percent_complete = task.percent_complete.or(Some(0));
        Ok(WriteOutcome::Applied(created.clone()))
    }

    async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let mut s = self.state.lock();
        let current = s.tasks.get(task_id).and_then(|t| t.etag.clone());
        if s.stale("update_task", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        let next = s.etag();
        let Some(task) = s.tasks.get_mut(task_id) else {
            return Ok(WriteOutcome::failure(404, "task not found"));
        };
        if let Some(title) = &patch.title {
            task.title = Some(title.clone());
        }
        for id in &patch.remove_assignees {
            task.assignments.remove(id);
        }
        for id in &patch.add_assignees {
            task.assignments.insert(id.clone(), Some(IgnoredAny));
        }
        if let Some(due) = patch.due_date {
            task.due_date_time = due;
        }
        if let Some(percent) = patch.percent_complete {
            task.percent_complete = Some(percent.min(COMPLETE));
        }
        task.etag = Some(next.clone());
        Ok(WriteOutcome::Applied(Some(next)))
    }

    async fn update_task_details(
        &self,
        task_id: &str,
        description: &str,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let mut s = self.state.lock();
        if s.stale_details_writes > 0 {
            s.stale_details_writes -= 1;
            s.calls.push("update_task_details".into());
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        let current = s.details.get(task_id).and_then(|d| d.etag.clone());
        if s.stale("update_task_details", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        let next = s.etag();
        let Some(details) = s.details.get_mut(task_id) else {
            return Ok(WriteOutcome::failure(404, "task not found"));
        };
        details.description = Some(description.into());
        details.etag = Some(next.clone());
        Ok(WriteOutcome::Applied(Some(next)))
    }

    async fn delete_task(&self, task_id: &str, etag: &str) -> Result<WriteOutcome<()>> {
        let mut s = self.state.lock();
        let current = s.tasks.get(task_id).and_then(|t| t.etag.clone());
        if s.stale("delete_task", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        if s.tasks.remove(task_id).is_none() {
            return Ok(WriteOutcome::failure(404, "task not found"));
        }
        s.details.remove(task_id);
        Ok(WriteOutcome::Applied(()))
    }

    async fn get_task_board_format(&self, task_id: &str) -> Result<Option<TaskBoardFormat>> {
        let mut s = self.state.lock();
        if !s.tasks.contains_key(task_id) {
            return Ok(None);
        }
        let etag = s.etag();
        Ok(Some(
            s.formats
                .entry(task_id.into())
                .or_insert(TaskBoardFormat {
                    order_hint: None,
                    etag: Some(etag),
                })
                .clone(),
        ))
    }

    async fn update_task_board_format(
        &self,
        task_id: &str,
        order_hint: &str,
        etag: &str,
    ) -> Result<WriteOutcome<()>> {
        let mut s = self.state.lock();
        let current = s.formats.get(task_id).and_then(|f| f.etag.clone());
        if s.stale("update_task_board_format", current.as_deref(), etag) {
            return Ok(WriteOutcome::Stale { status: 412 });
        }
        let next = s.etag();
        s.formats.insert(
            task_id.into(),
            TaskBoardFormat {
                order_hint: Some(order_hint.into()),
                etag: Some(next),
            },
        );
        Ok(WriteOutcome::Applied(()))
    }

    async fn subscribe_delta(&self) -> Result<Option<DeltaCursor>> {
        let mut s = self.state.lock();
        s.calls.push("subscribe_delta".into());
        s.delta_queue.clear();
        s.delta_seq += 1;
        Ok(Some(DeltaCursor::new(format!("delta-{}", s.delta_seq))))
    }

    async fn fetch_delta(&self, _cursor: &DeltaCursor) -> Result<DeltaFetch> {
        let mut s = self.state.lock();
        s.calls.push("fetch_delta".into());
        s.read()?;
        if std::mem::take(&mut s.expire_cursor) {
            return Ok(DeltaFetch::Expired);
        }
        s.delta_seq += 1;
        Ok(DeltaFetch::Page {
            records: s.delta_queue.drain(..).collect(),
            cursor: DeltaCursor::new(format!("delta-{}", s.delta_seq)),
        })
    }
}
