//! In-memory item store for tests and local development.
//!
//! Unlike a throwaway fake, this implementation enforces the same
//! optimistic-concurrency and state-machine rules as the durable store, so
//! tests exercise the real failure modes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::store::{ItemStore, StoreError};
use super::{Item, ItemId, ItemStatus, Priority, StatusEvent};

/// In-memory implementation of [`ItemStore`].
#[derive(Default)]
pub struct MemoryItemStore {
    items: RwLock<HashMap<ItemId, Item>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn save(&self, item: &Item) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        if let Some(existing) = items.get(&item.id) {
            if existing.version != item.version - 1 {
                return Err(StoreError::OptimisticLock(item.id));
            }
        }
        items.insert(item.id, item.clone());
        Ok(())
    }

    async fn find(&self, id: ItemId) -> Result<Item, StoreError> {
        self.items
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn find_by_group(&self, group: &str) -> Result<Vec<Item>, StoreError> {
        let items = self.items.read().await;
        let mut found: Vec<Item> = items
            .values()
            .filter(|item| item.group == group)
            .cloned()
            .collect();
        found.sort_by_key(|item| item.created_at);
        Ok(found)
    }

    async fn find_by_status(&self, status: ItemStatus) -> Result<Vec<Item>, StoreError> {
        let items = self.items.read().await;
        let mut found: Vec<Item> = items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|item| item.created_at);
        Ok(found)
    }

    async fn find_older_than(&self, threshold: DateTime<Utc>) -> Result<Vec<Item>, StoreError> {
        let items = self.items.read().await;
        let mut found: Vec<Item> = items
            .values()
            .filter(|item| item.created_at < threshold)
            .cloned()
            .collect();
        found.sort_by_key(|item| item.created_at);
        Ok(found)
    }

    async fn update_priority_batch(
        &self,
        ids: &[ItemId],
        new_priority: Priority,
    ) -> Result<u64, StoreError> {
        let mut items = self.items.write().await;
        let mut affected = 0u64;
        for id in ids {
            if let Some(item) = items.get_mut(id) {
                if item.status == ItemStatus::Queued {
                    item.priority = new_priority;
                    item.version += 1;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn update_status(
        &self,
        id: ItemId,
        status: ItemStatus,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if item.version != expected_version {
            return Err(StoreError::OptimisticLock(id));
        }

        match StatusEvent::leading_to(status) {
            Some(StatusEvent::Start) => item.start_processing()?,
            Some(StatusEvent::Complete) => item.complete_processing()?,
            Some(StatusEvent::Fail) => item.fail_processing()?,
            None => {
                return Err(StoreError::InvalidState(super::ItemError::InvalidTarget {
                    target: status,
                }))
            }
        }
        Ok(())
    }

    async fn delete(&self, id: ItemId) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        items.remove(&id).ok_or(StoreError::NotFound(id))?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.items.read().await.len() as u64)
    }

    async fn count_by_status(&self, status: ItemStatus) -> Result<u64, StoreError> {
        let items = self.items.read().await;
        Ok(items.values().filter(|i| i.status == status).count() as u64)
    }

    async fn count_by_priority(&self, priority: Priority) -> Result<u64, StoreError> {
        let items = self.items.read().await;
        Ok(items.values().filter(|i| i.priority == priority).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(group: &str, priority: Priority) -> Item {
        Item::new(
            "test item",
            group,
            vec!["all".to_string()],
            priority,
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let store = MemoryItemStore::new();
        let it = item("g1", Priority::NORMAL);
        store.save(&it).await.unwrap();

        let loaded = store.find(it.id).await.unwrap();
        assert_eq!(loaded, it);
    }

    #[tokio::test]
    async fn test_find_missing() {
        let store = MemoryItemStore::new();
        let err = store.find(ItemId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_update_requires_next_version() {
        let store = MemoryItemStore::new();
        let mut it = item("g1", Priority::NORMAL);
        store.save(&it).await.unwrap();

        // Stale save: same version as what is stored.
        let err = store.save(&it).await.unwrap_err();
        assert!(matches!(err, StoreError::OptimisticLock(_)));

        it.change_priority(Priority::HIGH).unwrap();
        store.save(&it).await.unwrap();

        let loaded = store.find(it.id).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.priority, Priority::HIGH);
    }

    #[tokio::test]
    async fn test_find_by_group_sorted_by_age() {
        let store = MemoryItemStore::new();
        let mut first = item("g1", Priority::NORMAL);
        first.created_at = Utc::now() - chrono::Duration::seconds(20);
        let second = item("g1", Priority::NORMAL);
        let other = item("g2", Priority::NORMAL);

        store.save(&second).await.unwrap();
        store.save(&first).await.unwrap();
        store.save(&other).await.unwrap();

        let found = store.find_by_group("g1").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, first.id);
        assert_eq!(found[1].id, second.id);
    }

    #[tokio::test]
    async fn test_find_by_status() {
        let store = MemoryItemStore::new();
        let queued = item("g", Priority::NORMAL);
        let mut processing = item("g", Priority::NORMAL);
        store.save(&queued).await.unwrap();
        store.save(&processing).await.unwrap();
        processing.start_processing().unwrap();
        store.save(&processing).await.unwrap();

        let found = store.find_by_status(ItemStatus::Queued).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, queued.id);

        let found = store.find_by_status(ItemStatus::Processing).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, processing.id);
    }

    #[tokio::test]
    async fn test_find_older_than() {
        let store = MemoryItemStore::new();
        let mut old = item("g", Priority::NORMAL);
        old.created_at = Utc::now() - chrono::Duration::minutes(10);
        let fresh = item("g", Priority::NORMAL);

        store.save(&old).await.unwrap();
        store.save(&fresh).await.unwrap();

        let threshold = Utc::now() - chrono::Duration::minutes(5);
        let found = store.find_older_than(threshold).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, old.id);
    }

    #[tokio::test]
    async fn test_update_priority_batch_only_queued() {
        let store = MemoryItemStore::new();
        let queued = item("g", Priority::LOW);
        let mut processing = item("g", Priority::LOW);
        store.save(&queued).await.unwrap();
        store.save(&processing).await.unwrap();
        processing.start_processing().unwrap();
        store.save(&processing).await.unwrap();

        let affected = store
            .update_priority_batch(&[queued.id, processing.id], Priority::HIGH)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let q = store.find(queued.id).await.unwrap();
        assert_eq!(q.priority, Priority::HIGH);
        assert_eq!(q.version, 2);

        let p = store.find(processing.id).await.unwrap();
        assert_eq!(p.priority, Priority::LOW);
    }

    #[tokio::test]
    async fn test_update_status_version_mismatch() {
        let store = MemoryItemStore::new();
        let it = item("g", Priority::NORMAL);
        store.save(&it).await.unwrap();

        let err = store
            .update_status(it.id, ItemStatus::Processing, 99)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OptimisticLock(_)));
    }

    #[tokio::test]
    async fn test_update_status_consults_state_machine() {
        let store = MemoryItemStore::new();
        let it = item("g", Priority::NORMAL);
        store.save(&it).await.unwrap();

        // Queued cannot jump straight to completed.
        let err = store
            .update_status(it.id, ItemStatus::Completed, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));

        // And nothing transitions back to queued.
        store
            .update_status(it.id, ItemStatus::Processing, 1)
            .await
            .unwrap();
        let err = store
            .update_status(it.id, ItemStatus::Queued, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_delete_and_counts() {
        let store = MemoryItemStore::new();
        let a = item("g", Priority::LOW);
        let b = item("g", Priority::HIGH);
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(
            store.count_by_status(ItemStatus::Queued).await.unwrap(),
            2
        );
        assert_eq!(store.count_by_priority(Priority::HIGH).await.unwrap(), 1);

        store.delete(a.id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(matches!(
            store.delete(a.id).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
