use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{find_unique_conflict, Entity, EntityStore, StoreError, UniqueConflict};
use crate::message::EntityFields;

/// Process-local store with the same uniqueness rules as the users table.
pub struct InMemoryStore {
    entities: RwLock<BTreeMap<i64, Entity>>,
    next_id: AtomicI64,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn find_conflict(&self, fields: &EntityFields) -> Result<Option<UniqueConflict>, StoreError> {
        self.check_available()?;
        let entities = self.entities.read().await;
        Ok(find_unique_conflict(entities.values(), fields))
    }

    async fn create(&self, fields: EntityFields) -> Result<Entity, StoreError> {
        self.check_available()?;
        let mut entities = self.entities.write().await;

        if let Some(conflict) = find_unique_conflict(entities.values(), &fields) {
            return Err(StoreError::Conflict(conflict.field.to_string()));
        }

        let now = Utc::now();
        let entity = Entity {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            public_key: Uuid::new_v4().simple().to_string(),
            fields,
            created_at: now,
            updated_at: now,
        };
        entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn update(&self, id: i64, fields: EntityFields) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut entities = self.entities.write().await;

        if !entities.contains_key(&id) {
            return Ok(0);
        }
        let others = entities.values().filter(|entity| entity.id != id);
        if let Some(conflict) = find_unique_conflict(others, &fields) {
            return Err(StoreError::Conflict(conflict.field.to_string()));
        }

        match entities.get_mut(&id) {
            Some(entity) => {
                entity.fields = fields;
                entity.updated_at = Utc::now();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, id: i64) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.entities.write().await.remove(&id).map_or(0, |_| 1))
    }

    async fn get(&self, id: i64) -> Result<Option<Entity>, StoreError> {
        self.check_available()?;
        Ok(self.entities.read().await.get(&id).cloned())
    }
}
