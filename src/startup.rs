//! One-shot recovery, run before any background worker is spawned: no run
//! may be left in a non-terminal state that this process did not itself
//! create.

use tracing::info;

use crate::store::{Store, StoreError};

const INTERRUPT_MESSAGE: &str = "Test execution interrupted by server restart";

pub async fn recover(store: &Store) -> Result<(), StoreError> {
    let affected = store.fail_all_nonterminal_runs(INTERRUPT_MESSAGE).await?;
    if affected > 0 {
        info!(count = affected, "startup recovery: failed pre-existing non-terminal runs");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn recovery_leaves_no_nonterminal_runs() {
        let store = Store::open_in_memory().unwrap();
        let run = store
            .create_run(
                "SIT1",
                crate::store::TriggerType::Manual,
                None,
                None,
                &HashMap::new(),
                &serde_json::Value::Null,
                &[],
            )
            .await
            .unwrap();
        store.set_run_status(run.id, crate::store::RunStatus::Running).await.unwrap();

        recover(&store).await.unwrap();

        assert!(store.list_nonterminal_runs().await.unwrap().is_empty());
        let recovered = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, crate::store::RunStatus::Failed);
    }

    #[tokio::test]
    async fn recovery_on_empty_store_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        recover(&store).await.unwrap();
        assert!(store.list_nonterminal_runs().await.unwrap().is_empty());
    }
}
