pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod url;

use std::sync::Arc;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{
    Board, Bucket, ChangeKind, ChangeRecord, DeltaBatch, MembersAndOwners, NewTask, PartialRecord,
    Person, Task, TaskUpdate,
};
pub use planner::{DeltaPoll, Planner, RemoteAdapter};
pub use remote::{GraphClient, PlannerApi, WriteOutcome};
pub use storage::{LocalStore, SharedStore};
pub use sync::{Bridge, ConflictRetryPolicy, DeltaCallback, MergeCallback, Scheduler, SyncState};
pub use url::{parse_planner_url, resolve_board_id, PlannerUrlInfo};

/// Main entry point: a Planner adapter over Graph plus the bridge that
/// drives it.
pub struct PlannerSync {
    config: Config,
    planner: Arc<Planner<GraphClient>>,
    bridge: Bridge<Planner<GraphClient>>,
}

impl PlannerSync {
    pub fn new(config: Config, client: GraphClient) -> Self {
        let planner = Arc::new(Planner::new(client));
        let bridge = Bridge::new(Arc::clone(&planner), config.sync.clone());
        Self {
            config,
            planner,
            bridge,
        }
    }

    /// Build with the access token from the environment.
    pub fn from_env(config: Config) -> Result<Self> {
        let client = GraphClient::from_env(&config.graph)?;
        Ok(Self::new(config, client))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn planner(&self) -> &Planner<GraphClient> {
        &self.planner
    }

    pub fn bridge(&self) -> &Bridge<Planner<GraphClient>> {
        &self.bridge
    }

    pub async fn board(&self, identifier: &str) -> Result<Board> {
        let board_id = url::resolve_board_id(identifier)?;
        self.planner
            .get_board(&board_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("board {board_id}")))
    }

    pub async fn tasks(&self, identifier: &str, bucket_id: Option<&str>) -> Result<Vec<Task>> {
        let board_id = url::resolve_board_id(identifier)?;
        self.planner.get_all_tasks(&board_id, bucket_id).await
    }

    pub async fn buckets(&self, identifier: &str) -> Result<Vec<Bucket>> {
        let board_id = url::resolve_board_id(identifier)?;
        self.planner.get_all_buckets(&board_id).await
    }

    pub async fn members(&self, identifier: &str) -> Result<MembersAndOwners> {
        let board_id = url::resolve_board_id(identifier)?;
        self.planner.get_member_and_owners_of_board(&board_id).await
    }

    /// Start the bridge on a board. Returns the resolved board id.
    pub async fn watch(
        &self,
        identifier: &str,
        on_merge: MergeCallback,
        on_delta_change: Option<DeltaCallback>,
    ) -> Result<String> {
        let board_id = url::resolve_board_id(identifier)?;
        if let Some(me) = self.planner.authenticate().await? {
            log::info!(
                "Signed in as {}",
                me.display_name.as_deref().unwrap_or(&me.id)
            );
        }
        self.bridge.start_sync(&board_id, on_merge, on_delta_change);
        Ok(board_id)
    }

    pub fn stop(&self) {
        self.bridge.stop_sync();
    }
}
