//! The poll loop that keeps a consumer in step with a remote board.
//!
//! A `Bridge` owns at most one spawned loop. The loop does a full fetch up
//! front, then either refetches everything every `base_delay` or polls the
//! delta feed at the pace set by the `Scheduler`, handing results to the
//! consumer's callbacks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::Error;
use crate::model::{PartialRecord, Task};
use crate::planner::{DeltaPoll, RemoteAdapter};
use crate::storage::SharedStore;
use crate::sync::scheduler::Scheduler;

/// Receives the full task list after every full sync.
pub type MergeCallback = Arc<dyn Fn(Vec<Task>) + Send + Sync>;
/// Receives changed-field records from a delta poll that saw any.
pub type DeltaCallback = Arc<dyn Fn(Vec<PartialRecord>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    Full,
    Delta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Stopped,
    /// Initial full fetch, including its retries.
    Syncing,
    Polling(PollMode),
}

/// State shared with the loop. `generation` changes on every start and stop
/// so a superseded loop cannot overwrite the state of its successor.
#[derive(Debug)]
struct StateCell {
    generation: u64,
    state: SyncState,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Bridge<R: ?Sized = dyn RemoteAdapter> {
    adapter: Arc<R>,
    config: SyncConfig,
    state: Arc<Mutex<StateCell>>,
    running: Mutex<Option<Running>>,
}

impl<R: RemoteAdapter + ?Sized + 'static> Bridge<R> {
    pub fn new(adapter: Arc<R>, config: SyncConfig) -> Self {
        Self {
            adapter,
            config,
            state: Arc::new(Mutex::new(StateCell {
                generation: 0,
                state: SyncState::Stopped,
            })),
            running: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &Arc<R> {
        &self.adapter
    }

    pub fn local_store(&self) -> SharedStore {
        self.adapter.local_store()
    }

    /// Turn sync back on at the adapter after a `stop_sync`.
    pub fn allow_sync(&self) {
        self.adapter.set_sync_enabled(true);
    }

    pub fn state(&self) -> SyncState {
        self.state.lock().state
    }

    /// Whether a loop task is alive. It may still be winding down after a
    /// stop signal.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Start syncing `board_id`, replacing any loop already running.
    ///
    /// With `on_delta_change` the loop polls the delta feed after the initial
    /// fetch; without it, it refetches all tasks every `base_delay`. Does
    /// nothing when sync is disabled at the adapter. Must be called from
    /// within a Tokio runtime.
    pub fn start_sync(
        &self,
        board_id: &str,
        on_merge: MergeCallback,
        on_delta_change: Option<DeltaCallback>,
    ) {
        if !self.adapter.sync_enabled() {
            log::debug!("Sync disabled, not starting sync of board {board_id}");
            return;
        }
        self.halt();

        let generation = {
            let mut cell = self.state.lock();
            cell.generation += 1;
            cell.state = SyncState::Syncing;
            cell.generation
        };
        let (stop, stop_rx) = watch::channel(false);
        let sync_loop = SyncLoop {
            adapter: Arc::clone(&self.adapter),
            board_id: board_id.to_string(),
            on_merge,
            on_delta_change,
            scheduler: Scheduler::from_config(&self.config),
            state: Arc::clone(&self.state),
            generation,
            stop: stop_rx,
        };
        log::info!("Starting sync of board {board_id}");
        let handle = tokio::spawn(sync_loop.run());
        *self.running.lock() = Some(Running { stop, handle });
    }

    /// Stop the loop and disable sync at the adapter. Safe to call when
    /// nothing is running.
    ///
    /// A pending sleep is woken at once. Remote calls already in flight run
    /// to completion, but their results never reach the callbacks.
    pub fn stop_sync(&self) {
        if self.halt() {
            log::info!("Sync stopped");
        }
        {
            let mut cell = self.state.lock();
            cell.generation += 1;
            cell.state = SyncState::Stopped;
        }
        self.adapter.set_sync_enabled(false);
    }

    /// Signal the running loop, if any. Returns whether there was one.
    fn halt(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                // Send fails only when the loop has already exited.
                let _ = running.stop.send(true);
                true
            }
            None => false,
        }
    }
}

impl<R: ?Sized> Drop for Bridge<R> {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.stop.send(true);
        }
    }
}

struct SyncLoop<R: ?Sized> {
    adapter: Arc<R>,
    board_id: String,
    on_merge: MergeCallback,
    on_delta_change: Option<DeltaCallback>,
    scheduler: Scheduler,
    state: Arc<Mutex<StateCell>>,
    generation: u64,
    stop: watch::Receiver<bool>,
}

impl<R: RemoteAdapter + ?Sized> SyncLoop<R> {
    async fn run(mut self) {
        if !self.initial_sync().await {
            return;
        }

        let mode = if self.on_delta_change.is_some() {
            PollMode::Delta
        } else {
            PollMode::Full
        };
        self.set_state(SyncState::Polling(mode));
        log::info!("Polling board {} ({mode:?})", self.board_id);

        let mut delay = self.scheduler.base_delay();
        while self.sleep(delay).await {
            if !self.adapter.sync_enabled() {
                log::info!("Sync disabled, leaving poll loop for board {}", self.board_id);
                self.set_state(SyncState::Stopped);
                return;
            }
            delay = match mode {
                PollMode::Full => self.full_cycle().await,
                PollMode::Delta => self.delta_cycle().await,
            };
        }
    }

    /// Fetch everything until it works. Returns false if stopped or
    /// disabled first.
    async fn initial_sync(&mut self) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            if !self.adapter.sync_enabled() {
                log::info!("Sync disabled, abandoning initial sync of board {}", self.board_id);
                self.set_state(SyncState::Stopped);
                return false;
            }
            if self.on_delta_change.is_some() {
                self.open_delta_feed().await;
            }
            match self.adapter.get_all_tasks(&self.board_id, None).await {
                Ok(tasks) => {
                    if self.stopped() {
                        return false;
                    }
                    log::info!("Initial sync of board {}: {} tasks", self.board_id, tasks.len());
                    (self.on_merge)(tasks);
                    return true;
                }
                Err(e) => {
                    let delay = self.scheduler.base_delay();
                    log::warn!(
                        "Initial sync of board {} failed, retrying in {delay:?}: {e}",
                        self.board_id
                    );
                    if !self.sleep(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Open the delta feed ahead of a full fetch, so that nothing changed
    /// between the fetch and the first poll is missed. Whatever the poll
    /// returns is covered by the fetch that follows.
    async fn open_delta_feed(&self) {
        if let Err(e) = self.adapter.get_delta(&self.board_id).await {
            // The first poll finds no cursor and asks for a full resync.
            log::debug!("Could not open delta feed for board {}: {e}", self.board_id);
        }
    }

    async fn full_cycle(&mut self) -> Duration {
        self.merge_all().await;
        self.scheduler.base_delay()
    }

    async fn delta_cycle(&mut self) -> Duration {
        match self.adapter.get_delta(&self.board_id).await {
            Ok(DeltaPoll::Changes(batch)) => {
                let delay = self.scheduler.next_delay(batch.change_count());
                if !batch.changed_fields.is_empty() && !self.stopped() {
                    log::debug!(
                        "Board {}: {} changed records",
                        self.board_id,
                        batch.changed_fields.len()
                    );
                    if let Some(on_delta_change) = &self.on_delta_change {
                        on_delta_change(batch.changed_fields);
                    }
                }
                delay
            }
            Ok(DeltaPoll::ResyncRequired) => {
                log::warn!("Delta cursor lost for board {}, running full sync", self.board_id);
                self.scheduler.reset();
                self.merge_all().await;
                self.scheduler.base_delay()
            }
            Ok(DeltaPoll::Disabled) => self.scheduler.base_delay(),
            Err(e) => {
                log_failure("Delta sync", &self.board_id, &e);
                self.scheduler.base_delay()
            }
        }
    }

    async fn merge_all(&mut self) {
        match self.adapter.get_all_tasks(&self.board_id, None).await {
            Ok(tasks) if !self.stopped() => (self.on_merge)(tasks),
            Ok(_) => {}
            Err(e) => log_failure("Full sync", &self.board_id, &e),
        }
    }

    /// Sleep for `delay`. Returns false if stopped before or during it.
    async fn sleep(&mut self, delay: Duration) -> bool {
        if self.stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.stopped(),
            // Err means the bridge is gone, which also ends the loop.
            _ = self.stop.changed() => false,
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn set_state(&self, state: SyncState) {
        let mut cell = self.state.lock();
        if cell.generation == self.generation {
            cell.state = state;
        }
    }
}

/// Log a failed cycle, at warn level when the next one may well succeed.
fn log_failure(what: &str, board_id: &str, e: &Error) {
    if e.is_transient() {
        log::warn!("{what} of board {board_id} failed, retrying next cycle: {e}");
    } else {
        log::error!("{what} of board {board_id} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangeKind;
    use crate::planner::Planner;
    use crate::remote::fake::FakePlanner;
    use serde_json::json;

    const PLAN: &str = "plan-1";

    struct Harness {
        planner: Arc<Planner<FakePlanner>>,
        bridge: Bridge<Planner<FakePlanner>>,
        merges: Arc<Mutex<Vec<Vec<Task>>>>,
        deltas: Arc<Mutex<Vec<Vec<PartialRecord>>>>,
    }

    impl Harness {
        fn new() -> Self {
            let fake = FakePlanner::new();
            fake.add_plan(PLAN, "group-1", "Roadmap");
            fake.add_bucket(PLAN, "todo", "To do");
            fake.add_bucket(PLAN, "done", "Done");
            let planner = Arc::new(Planner::new(fake));
            let bridge = Bridge::new(Arc::clone(&planner), SyncConfig::default());
            Self {
                planner,
                bridge,
                merges: Arc::default(),
                deltas: Arc::default(),
            }
        }

        fn fake(&self) -> &FakePlanner {
            self.planner.api()
        }

        fn start(&self, with_delta: bool) {
            let merges = Arc::clone(&self.merges);
            let deltas = Arc::clone(&self.deltas);
            let on_delta: Option<DeltaCallback> = if with_delta {
                Some(Arc::new(move |records: Vec<PartialRecord>| deltas.lock().push(records)))
            } else {
                None
            };
            self.bridge.start_sync(
                PLAN,
                Arc::new(move |tasks: Vec<Task>| merges.lock().push(tasks)),
                on_delta,
            );
        }

        fn merge_count(&self) -> usize {
            self.merges.lock().len()
        }
    }

    async fn advance(secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    fn created_task(id: &str, bucket: &str) -> serde_json::Value {
        json!({
            "@odata.type": "#microsoft.graph.plannerTask",
            "id": id,
            "planId": PLAN,
            "bucketId": bucket,
            "title": "Remote task",
            "createdDateTime": "2026-05-01T10:00:00Z",
            "createdBy": {"user": {"id": "u9"}}
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_merges_new_tasks_into_buckets() {
        let h = Harness::new();
        h.fake().add_task(PLAN, "todo", "t1", "First");
        h.fake().add_task(PLAN, "done", "t2", "Second");

        h.start(true);
        advance(0.1).await;

        assert_eq!(h.merge_count(), 1);
        assert_eq!(h.merges.lock()[0].len(), 2);
        let store = h.bridge.local_store();
        let store = store.lock();
        assert_eq!(store.task_count(), 2);
        assert_eq!(store.tasks_in_bucket("todo")[0].id, "t1");
        assert_eq!(store.tasks_in_bucket("done")[0].id, "t2");
        assert!(store.membership_consistent());
        drop(store);
        assert_eq!(h.bridge.state(), SyncState::Polling(PollMode::Delta));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_changes_reach_callback() {
        let h = Harness::new();
        h.start(true);
        advance(6.0).await;
        assert_eq!(h.fake().calls("subscribe_delta"), 1);
        assert_eq!(h.fake().calls("fetch_delta"), 1);
        assert!(h.deltas.lock().is_empty());

        h.fake().push_delta([created_task("t7", "todo"), created_task("t8", "done")]);
        advance(5.0).await;

        let deltas = h.deltas.lock();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].len(), 2);
        assert_eq!(h.bridge.local_store().lock().task_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_right_after_initial_fetch_is_delivered() {
        let h = Harness::new();
        h.start(true);
        advance(0.1).await;
        assert_eq!(h.merge_count(), 1);

        h.fake().add_task(PLAN, "todo", "t7", "Remote task");
        h.fake().push_delta([created_task("t7", "todo")]);
        advance(6.0).await;

        assert!(h.bridge.local_store().lock().contains_task("t7"));
        let deltas = h.deltas.lock();
        assert_eq!(deltas.len(), 1);
        assert!(matches!(
            &deltas[0][0],
            PartialRecord::Task(t) if t.id == "t7" && t.kind == ChangeKind::Inserted
        ));
        assert_eq!(h.merge_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_polls_do_not_invoke_callback() {
        let h = Harness::new();
        h.start(true);
        advance(30.0).await;
        assert!(h.fake().calls("fetch_delta") >= 3);
        assert!(h.deltas.lock().is_empty());
        assert_eq!(h.merge_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_retries_after_base_delay() {
        let h = Harness::new();
        h.fake().fail_reads(1);
        h.start(true);

        advance(1.0).await;
        assert_eq!(h.merge_count(), 0);
        assert_eq!(h.bridge.state(), SyncState::Syncing);

        advance(5.0).await;
        assert_eq!(h.merge_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_retry_gives_up_once_disabled() {
        let h = Harness::new();
        h.fake().fail_reads(1);
        h.start(false);
        advance(1.0).await;
        assert_eq!(h.fake().calls("list_plan_tasks"), 1);

        h.planner.set_sync_enabled(false);
        advance(10.0).await;
        assert_eq!(h.fake().calls("list_plan_tasks"), 1);
        assert_eq!(h.merge_count(), 0);
        assert_eq!(h.bridge.state(), SyncState::Stopped);
        assert!(!h.bridge.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_loop_alive() {
        let h = Harness::new();
        h.start(true);
        advance(6.0).await;

        h.fake().fail_reads(1);
        advance(5.0).await;
        assert_eq!(h.fake().calls("fetch_delta"), 2);

        h.fake().push_delta([created_task("t7", "todo")]);
        advance(5.0).await;
        assert_eq!(h.fake().calls("fetch_delta"), 3);
        assert_eq!(h.deltas.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_cursor_triggers_full_merge() {
        let h = Harness::new();
        h.fake().add_task(PLAN, "todo", "t1", "First");
        h.start(true);
        advance(6.0).await;
        assert_eq!(h.merge_count(), 1);

        h.fake().expire_cursor();
        advance(5.0).await;
        assert_eq!(h.merge_count(), 2);
        assert_eq!(h.merges.lock()[1].len(), 1);
        assert_eq!(h.fake().calls("subscribe_delta"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_polling_without_delta_callback() {
        let h = Harness::new();
        h.start(false);
        advance(11.0).await;
        assert_eq!(h.merge_count(), 3);
        assert_eq!(h.bridge.state(), SyncState::Polling(PollMode::Full));
        assert_eq!(h.fake().calls("fetch_delta"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sync_silences_callbacks() {
        let h = Harness::new();
        h.start(true);
        advance(6.0).await;
        let polls = h.fake().calls("fetch_delta");

        h.bridge.stop_sync();
        h.bridge.stop_sync();
        assert_eq!(h.bridge.state(), SyncState::Stopped);
        assert!(!h.planner.sync_enabled());
        advance(0.1).await;
        assert!(!h.bridge.is_running());

        h.fake().push_delta([created_task("t7", "todo")]);
        advance(60.0).await;
        assert!(h.deltas.lock().is_empty());
        assert_eq!(h.fake().calls("fetch_delta"), polls);
        assert_eq!(h.merge_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_noop_when_disabled() {
        let h = Harness::new();
        h.planner.set_sync_enabled(false);
        h.start(true);
        advance(10.0).await;
        assert_eq!(h.merge_count(), 0);
        assert_eq!(h.bridge.state(), SyncState::Stopped);

        h.bridge.allow_sync();
        h.start(true);
        advance(0.1).await;
        assert_eq!(h.merge_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_loop() {
        let h = Harness::new();
        h.start(false);
        advance(0.1).await;
        h.start(false);
        advance(0.1).await;
        assert_eq!(h.merge_count(), 2);

        // One loop left: one merge per base delay.
        advance(5.0).await;
        assert_eq!(h.merge_count(), 3);
    }
}
