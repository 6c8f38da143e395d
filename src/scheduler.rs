//! Periodic tick over enabled schedules: materializes due selectors into
//! new runs, suppressing overlap with a still-active prior firing.
//!
//! Same periodic-tick-over-enabled-items shape as the queue, kept as a
//! separate worker because its cadence (30s) and side effects (selector
//! resolution, `lastTriggeredAt` bookkeeping) differ.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::store::{RunStatus, Schedule, Selector, Store, StoreError, TriggerType};
use crate::store::runs::NewRunTest;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler: tick failed");
            }
        }
    }

    async fn tick(&self) -> Result<(), StoreError> {
        let schedules = self.store.list_schedules(true).await?;
        let now = Utc::now();
        for schedule in schedules {
            if let Err(e) = self.evaluate_one(&schedule, now).await {
                warn!(schedule_id = %schedule.id, error = %e, "scheduler: error evaluating schedule");
            }
        }
        Ok(())
    }

    async fn evaluate_one(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(cron_schedule) = parse_cron(&schedule.cron) else {
            error!(schedule_id = %schedule.id, cron = %schedule.cron, "scheduler: invalid cron expression");
            return Ok(());
        };

        let reference = schedule.last_triggered_at.unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH);
        let Some(next_fire) = cron_schedule.after(&reference).next() else {
            return Ok(());
        };
        if next_fire > now {
            return Ok(());
        }

        if self.has_active_run(schedule.id).await? {
            return Ok(());
        }

        let test_keys = self.resolve_selector(&schedule.selector).await?;
        let tests = test_keys
            .into_iter()
            .map(|def| NewRunTest { test_id: def.0, test_key: def.1 })
            .collect::<Vec<_>>();

        let metadata = serde_json::json!({ "selector": schedule.selector, "scheduleId": schedule.id });
        let run_overrides: HashMap<String, Value> =
            schedule.default_run_overrides.clone().unwrap_or_default();

        self.store
            .create_run(
                &schedule.environment,
                TriggerType::Schedule,
                Some(schedule.id),
                None,
                &run_overrides,
                &metadata,
                &tests,
            )
            .await?;

        self.store.mark_schedule_triggered(schedule.id).await?;
        Ok(())
    }

    async fn has_active_run(&self, schedule_id: Uuid) -> Result<bool, StoreError> {
        for status in [RunStatus::Queued, RunStatus::Running] {
            let runs = self.store.list_runs(Some(status), None, 1000, 0).await?;
            if runs.iter().any(|r| r.schedule_id == Some(schedule_id)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn resolve_selector(&self, selector: &Selector) -> Result<Vec<(Uuid, String)>, StoreError> {
        let definitions = match selector {
            Selector::Folder { folder_prefix } => self.store.list_tests(Some(folder_prefix), &[]).await?,
            Selector::Tags { tags } => self.store.list_tests(None, tags).await?,
            Selector::Explicit { test_keys } => {
                let mut out = Vec::new();
                for key in test_keys {
                    match self.store.get_test_by_key(key).await? {
                        Some(def) if def.active => out.push(def),
                        _ => warn!(test_key = %key, "resolve_selector: dropping unknown or inactive test key"),
                    }
                }
                out
            }
        };
        Ok(definitions.into_iter().map(|d| (d.id, d.test_key)).collect())
    }
}

fn parse_cron(expr: &str) -> Option<CronSchedule> {
    let normalized = normalize_cron(expr);
    CronSchedule::from_str(&normalized).ok()
}

/// The `cron` crate requires a 7-field expression (seconds, years optional
/// as `*`); normalize the spec's accepted 5- or 6-field UTC expressions by
/// prepending `0` seconds to a bare 5-field expression.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 { format!("0 {expr}") } else { expr.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn due_schedule_creates_run_and_advances_trigger() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_test_definition(
                "a.one",
                "a",
                "a/a.spec.js",
                &crate::store::TestMeta { friendly_name: "A".into(), ..Default::default() },
                &crate::store::ConstantSet::default(),
            )
            .await
            .unwrap();
        let schedule = store
            .create_schedule(
                "Every minute",
                "* * * * *",
                "SIT1",
                &Selector::Explicit { test_keys: vec!["a.one".into()] },
                None,
                "qa@x",
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone());
        scheduler.tick().await.unwrap();

        let runs = store.list_runs(None, None, 10, 0).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].schedule_id, Some(schedule.id));

        let updated = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert!(updated.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn overlap_suppression_skips_while_prior_run_active() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let schedule = store
            .create_schedule(
                "Every minute",
                "* * * * *",
                "SIT1",
                &Selector::Explicit { test_keys: vec![] },
                None,
                "qa@x",
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone());
        scheduler.tick().await.unwrap();
        let first_trigger = store.get_schedule(schedule.id).await.unwrap().unwrap().last_triggered_at;

        scheduler.tick().await.unwrap();
        let runs = store.list_runs(None, None, 10, 0).await.unwrap();
        assert_eq!(runs.len(), 1, "second tick must not create a new run while the first is still queued");
        assert_eq!(store.get_schedule(schedule.id).await.unwrap().unwrap().last_triggered_at, first_trigger);
    }

    #[tokio::test]
    async fn invalid_cron_is_logged_and_does_not_disable_schedule() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .create_schedule(
                "Broken",
                "not a cron",
                "SIT1",
                &Selector::Explicit { test_keys: vec![] },
                None,
                "qa@x",
            )
            .await
            .unwrap();
        let scheduler = Scheduler::new(store.clone());
        scheduler.tick().await.unwrap();
        assert!(store.list_runs(None, None, 10, 0).await.unwrap().is_empty());
        assert!(store.list_schedules(true).await.unwrap()[0].enabled);
    }
}
