//! Single-node admission controller: every 5 seconds, promote the oldest
//! `queued` run to `running` if capacity allows, structurally parallel to
//! the teacher's periodic batch-dispatch loop in `orchestrator.rs` (dispatch
//! without awaiting completion, let the next tick observe the raised count).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::executor::{self, DriverConfig};
use crate::store::{RunStatus, Store};

const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct Queue {
    store: Arc<Store>,
    driver: DriverConfig,
    artifact_root: PathBuf,
    max_concurrent_runs: usize,
    ticking: Mutex<()>,
}

impl Queue {
    pub fn new(
        store: Arc<Store>,
        driver: DriverConfig,
        artifact_root: PathBuf,
        max_concurrent_runs: usize,
    ) -> Self {
        Self { store, driver, artifact_root, max_concurrent_runs, ticking: Mutex::new(()) }
    }

    /// Runs the queue loop forever. Intended to be `tokio::spawn`-ed once.
    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            self.clone().tick().await;
        }
    }

    /// One admission decision. A reentrancy guard prevents overlapping
    /// ticks if a previous tick's dispatch hasn't returned yet (it never
    /// awaits execution, but the guard protects against a slow DB call).
    async fn tick(self: Arc<Self>) {
        let Ok(_guard) = self.ticking.try_lock() else {
            return;
        };

        let running = match self.store.count_runs_by_status(RunStatus::Running).await {
            Ok(n) => n as usize,
            Err(e) => {
                error!(error = %e, "queue: failed to count running runs");
                return;
            }
        };
        if running >= self.max_concurrent_runs {
            return;
        }

        let next = match self.store.oldest_queued_run().await {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "queue: failed to fetch oldest queued run");
                return;
            }
        };

        let Some(run) = next else { return };
        info!(run_id = %run.id, "queue: dispatching run");

        let store = self.store.clone();
        let driver = self.driver.clone();
        let artifact_root = self.artifact_root.clone();
        tokio::spawn(async move {
            if let Err(e) = executor::run_queued(&store, &driver, &artifact_root, run.id).await {
                warn!(run_id = %run.id, error = %e, "queue: run execution errored");
            }
        });
    }
}
