//! Typed CRUD over recurring run templates (`schedules`).

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use std::collections::HashMap;
use uuid::Uuid;

use super::{Schedule, Selector, Store, StoreError, StoreResult};

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
    let id: String = row.get("id")?;
    let selector_json: String = row.get("selector")?;
    let overrides_json: Option<String> = row.get("default_run_overrides")?;
    let last_triggered_at: Option<String> = row.get("last_triggered_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Schedule {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get("name")?,
        cron: row.get("cron")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        environment: row.get("environment")?,
        last_triggered_at: last_triggered_at.and_then(|s| s.parse().ok()),
        selector: serde_json::from_str::<Selector>(&selector_json)
            .unwrap_or(Selector::Explicit { test_keys: vec![] }),
        default_run_overrides: overrides_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_by_email: row.get("created_by_email")?,
        updated_by_email: row.get("updated_by_email")?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_schedule(
        &self,
        name: &str,
        cron: &str,
        environment: &str,
        selector: &Selector,
        default_run_overrides: Option<&HashMap<String, serde_json::Value>>,
        created_by_email: &str,
    ) -> StoreResult<Schedule> {
        let conn = self.lock().await;
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO schedules
                (id, name, cron, enabled, environment, last_triggered_at, selector,
                 default_run_overrides, created_by_email, updated_by_email, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, NULL, ?5, ?6, ?7, ?7, ?8, ?8)",
            params![
                id.to_string(),
                name,
                cron,
                environment,
                serde_json::to_string(selector)?,
                default_run_overrides.map(serde_json::to_string).transpose()?,
                created_by_email,
                now,
            ],
        )?;
        conn.query_row(
            "SELECT * FROM schedules WHERE id = ?1",
            params![id.to_string()],
            row_to_schedule,
        )
        .map_err(StoreError::from)
    }

    pub async fn get_schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM schedules WHERE id = ?1",
            params![id.to_string()],
            row_to_schedule,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// All schedules, optionally filtered to `enabled = 1` only.
    pub async fn list_schedules(&self, enabled_only: bool) -> StoreResult<Vec<Schedule>> {
        let conn = self.lock().await;
        let sql = if enabled_only {
            "SELECT * FROM schedules WHERE enabled = 1 ORDER BY name ASC"
        } else {
            "SELECT * FROM schedules ORDER BY name ASC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_schedule)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_schedule(
        &self,
        id: Uuid,
        name: &str,
        cron: &str,
        enabled: bool,
        environment: &str,
        selector: &Selector,
        default_run_overrides: Option<&HashMap<String, serde_json::Value>>,
        updated_by_email: &str,
    ) -> StoreResult<Schedule> {
        let conn = self.lock().await;
        let affected = conn.execute(
            "UPDATE schedules
             SET name = ?1, cron = ?2, enabled = ?3, environment = ?4, selector = ?5,
                 default_run_overrides = ?6, updated_by_email = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                name,
                cron,
                enabled as i64,
                environment,
                serde_json::to_string(selector)?,
                default_run_overrides.map(serde_json::to_string).transpose()?,
                updated_by_email,
                Utc::now().to_rfc3339(),
                id.to_string(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        conn.query_row(
            "SELECT * FROM schedules WHERE id = ?1",
            params![id.to_string()],
            row_to_schedule,
        )
        .map_err(StoreError::from)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.lock().await;
        let affected =
            conn.execute("DELETE FROM schedules WHERE id = ?1", params![id.to_string()])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Stamps `last_triggered_at` on the schedule that just fired a run.
    pub async fn mark_schedule_triggered(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE schedules SET last_triggered_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let selector = Selector::Folder { folder_prefix: "auth".to_string() };
        let created = store
            .create_schedule("Nightly auth", "0 2 * * *", "SIT1", &selector, None, "qa@x")
            .await
            .unwrap();
        let fetched = store.get_schedule(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Nightly auth");
        assert!(fetched.enabled);
        assert!(fetched.last_triggered_at.is_none());
    }

    #[tokio::test]
    async fn list_enabled_only_excludes_disabled() {
        let store = Store::open_in_memory().unwrap();
        let selector = Selector::Tags { tags: vec!["smoke".to_string()] };
        let created = store
            .create_schedule("Smoke", "*/30 * * * *", "SIT1", &selector, None, "qa@x")
            .await
            .unwrap();
        store
            .update_schedule(
                created.id,
                "Smoke",
                "*/30 * * * *",
                false,
                "SIT1",
                &selector,
                None,
                "qa@x",
            )
            .await
            .unwrap();
        assert!(store.list_schedules(true).await.unwrap().is_empty());
        assert_eq!(store.list_schedules(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_triggered_stamps_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let selector = Selector::Explicit { test_keys: vec!["a".to_string()] };
        let created = store
            .create_schedule("Explicit", "0 * * * *", "SIT1", &selector, None, "qa@x")
            .await
            .unwrap();
        store.mark_schedule_triggered(created.id).await.unwrap();
        let fetched = store.get_schedule(created.id).await.unwrap().unwrap();
        assert!(fetched.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn delete_missing_schedule_errors() {
        let store = Store::open_in_memory().unwrap();
        let err = store.delete_schedule(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
