//! Typed CRUD over the test catalog (`test_definitions`).
//!
//! Discovery is the only writer of `folder_path`/`spec_path`/`meta`/
//! `constants`/`active`; the override endpoint is the only writer of
//! `overrides`. Both paths funnel through this module so that invariant
//! stays enforced in one place.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use super::{ConstantSet, Store, StoreError, StoreResult, TestDefinition, TestMeta};

fn row_to_definition(row: &rusqlite::Row) -> rusqlite::Result<TestDefinition> {
    let id: String = row.get("id")?;
    let meta_json: String = row.get("meta")?;
    let constants_json: String = row.get("constants")?;
    let overrides_json: Option<String> = row.get("overrides")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(TestDefinition {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        test_key: row.get("test_key")?,
        folder_path: row.get("folder_path")?,
        spec_path: row.get("spec_path")?,
        meta: serde_json::from_str(&meta_json).unwrap_or_default(),
        constants: serde_json::from_str(&constants_json).unwrap_or_default(),
        overrides: overrides_json.and_then(|s| serde_json::from_str(&s).ok()),
        active: row.get::<_, i64>("active")? != 0,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Inserts a newly discovered test, or updates the existing row sharing
    /// its `test_key`, leaving `overrides` untouched either way.
    pub async fn upsert_test_definition(
        &self,
        test_key: &str,
        folder_path: &str,
        spec_path: &str,
        meta: &TestMeta,
        constants: &ConstantSet,
    ) -> StoreResult<TestDefinition> {
        let conn = self.lock().await;
        let now = Utc::now();
        let meta_json = serde_json::to_string(meta)?;
        let constants_json = serde_json::to_string(constants)?;

        let existing_id: Option<String> = conn
            .query_row(
                "SELECT id FROM test_definitions WHERE test_key = ?1",
                params![test_key],
                |r| r.get(0),
            )
            .optional()?;

        let id = match existing_id {
            Some(id) => {
                conn.execute(
                    "UPDATE test_definitions
                     SET folder_path = ?1, spec_path = ?2, meta = ?3, constants = ?4,
                         active = 1, updated_at = ?5
                     WHERE test_key = ?6",
                    params![folder_path, spec_path, meta_json, constants_json, now.to_rfc3339(), test_key],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO test_definitions
                        (id, test_key, folder_path, spec_path, meta, constants, overrides,
                         active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 1, ?7, ?7)",
                    params![id, test_key, folder_path, spec_path, meta_json, constants_json, now.to_rfc3339()],
                )?;
                id
            }
        };

        conn.query_row(
            "SELECT * FROM test_definitions WHERE id = ?1",
            params![id],
            row_to_definition,
        )
        .map_err(StoreError::from)
    }

    /// Marks every active row whose `test_key` is not in `seen_keys` as
    /// inactive. A no-op (the "safety valve") if `seen_keys` is empty.
    pub async fn deactivate_missing_tests(&self, seen_keys: &[String]) -> StoreResult<usize> {
        if seen_keys.is_empty() {
            return Ok(0);
        }
        let conn = self.lock().await;
        let placeholders = seen_keys.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE test_definitions SET active = 0
             WHERE active = 1 AND test_key NOT IN ({placeholders})"
        );
        let params: Vec<&dyn rusqlite::ToSql> =
            seen_keys.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
        let affected = conn.execute(&sql, params.as_slice())?;
        Ok(affected)
    }

    pub async fn get_test_by_key(&self, test_key: &str) -> StoreResult<Option<TestDefinition>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM test_definitions WHERE test_key = ?1",
            params![test_key],
            row_to_definition,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub async fn get_test_by_id(&self, id: Uuid) -> StoreResult<Option<TestDefinition>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM test_definitions WHERE id = ?1",
            params![id.to_string()],
            row_to_definition,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Lists active tests, optionally filtered by folder prefix and/or
    /// any-of-tags.
    pub async fn list_tests(
        &self,
        folder_prefix: Option<&str>,
        any_tags: &[String],
    ) -> StoreResult<Vec<TestDefinition>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM test_definitions WHERE active = 1 ORDER BY test_key ASC",
        )?;
        let rows = stmt.query_map([], row_to_definition)?;
        let mut out = Vec::new();
        for row in rows {
            let def = row?;
            if let Some(prefix) = folder_prefix
                && !def.folder_path.starts_with(prefix)
            {
                continue;
            }
            if !any_tags.is_empty() && !def.meta.tags.iter().any(|t| any_tags.contains(t)) {
                continue;
            }
            out.push(def);
        }
        Ok(out)
    }

    pub async fn list_tags(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT meta FROM test_definitions WHERE active = 1")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut tags = std::collections::BTreeSet::new();
        for row in rows {
            let meta_json = row?;
            if let Ok(meta) = serde_json::from_str::<TestMeta>(&meta_json) {
                tags.extend(meta.tags);
            }
        }
        Ok(tags.into_iter().collect())
    }

    pub async fn list_folder_paths(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT folder_path FROM test_definitions WHERE active = 1 ORDER BY folder_path ASC",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    /// Replaces a test's `overrides` column atomically. The value is
    /// arbitrary JSON, not re-validated here.
    pub async fn update_test_overrides(
        &self,
        test_key: &str,
        overrides: &Value,
    ) -> StoreResult<TestDefinition> {
        let conn = self.lock().await;
        let overrides_json = serde_json::to_string(overrides)?;
        let affected = conn.execute(
            "UPDATE test_definitions SET overrides = ?1, updated_at = ?2 WHERE test_key = ?3",
            params![overrides_json, Utc::now().to_rfc3339(), test_key],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        conn.query_row(
            "SELECT * FROM test_definitions WHERE test_key = ?1",
            params![test_key],
            row_to_definition,
        )
        .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> TestMeta {
        TestMeta { friendly_name: name.to_string(), description: String::new(), tags: vec![] }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_test_definition("auth.login", "auth/login", "login.spec.js", &meta("Login"), &ConstantSet::default())
            .await
            .unwrap();
        let fetched = store.get_test_by_key("auth.login").await.unwrap().unwrap();
        assert_eq!(fetched.test_key, "auth.login");
        assert!(fetched.active);
        assert!(fetched.overrides.is_none());
    }

    #[tokio::test]
    async fn reupsert_mutates_existing_row_not_insert() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .upsert_test_definition("auth.login", "auth/login", "login.spec.js", &meta("Login"), &ConstantSet::default())
            .await
            .unwrap();
        let second = store
            .upsert_test_definition("auth.login", "auth/login-v2", "login.spec.js", &meta("Login v2"), &ConstantSet::default())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.folder_path, "auth/login-v2");
    }

    #[tokio::test]
    async fn discovery_never_touches_overrides() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_test_definition("auth.login", "auth/login", "login.spec.js", &meta("Login"), &ConstantSet::default())
            .await
            .unwrap();
        store
            .update_test_overrides("auth.login", &serde_json::json!({"foo": "bar"}))
            .await
            .unwrap();
        store
            .upsert_test_definition("auth.login", "auth/login", "login.spec.js", &meta("Login"), &ConstantSet::default())
            .await
            .unwrap();
        let fetched = store.get_test_by_key("auth.login").await.unwrap().unwrap();
        assert_eq!(fetched.overrides.unwrap(), serde_json::json!({"foo": "bar"}));
    }

    #[tokio::test]
    async fn empty_seen_keys_leaves_catalog_untouched() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_test_definition("auth.login", "auth/login", "login.spec.js", &meta("Login"), &ConstantSet::default())
            .await
            .unwrap();
        let affected = store.deactivate_missing_tests(&[]).await.unwrap();
        assert_eq!(affected, 0);
        assert!(store.get_test_by_key("auth.login").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn unseen_keys_are_deactivated() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_test_definition("auth.login", "auth/login", "login.spec.js", &meta("Login"), &ConstantSet::default())
            .await
            .unwrap();
        store
            .upsert_test_definition("auth.logout", "auth/logout", "logout.spec.js", &meta("Logout"), &ConstantSet::default())
            .await
            .unwrap();
        store.deactivate_missing_tests(&["auth.login".to_string()]).await.unwrap();
        assert!(store.get_test_by_key("auth.login").await.unwrap().unwrap().active);
        assert!(!store.get_test_by_key("auth.logout").await.unwrap().unwrap().active);
    }
}
