// src/dispatch.rs
//! Routes decoded events to the persistence collaborator.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::message::{EntityFields, Event};
use crate::store::{EntityStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Name of the unique field that is already taken.
    Conflict(String),
    NotFound,
    InternalError(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Conflict(field) => write!(f, "conflict on {}", field),
            Outcome::NotFound => f.write_str("not found"),
            Outcome::InternalError(detail) => write!(f, "internal error: {}", detail),
        }
    }
}

/// What the consumer invokes for every decoded event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Outcome;
}

pub struct EventDispatcher {
    store: Arc<dyn EntityStore>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Apply one event. Never retries; failures are reported as outcomes.
    pub async fn dispatch(&self, event: Event) -> Outcome {
        match event {
            Event::Created(fields) => self.on_created(fields).await,
            Event::Updated(updated) => self.on_updated(updated.id, updated.fields).await,
            Event::Deleted(deleted) => self.on_deleted(deleted.id).await,
        }
    }

    async fn on_created(&self, fields: EntityFields) -> Outcome {
        match self.store.find_conflict(&fields).await {
            Ok(Some(conflict)) => {
                debug!(
                    existing_id = conflict.existing_id,
                    field = %conflict.field,
                    "create rejected by existing record"
                );
                return Outcome::Conflict(conflict.field.to_string());
            }
            Ok(None) => {}
            Err(e) => return internal(e),
        }

        match self.store.create(fields).await {
            Ok(entity) => {
                info!(id = entity.id, username = %entity.fields.username, "entity created");
                Outcome::Success
            }
            // Lost a race with a concurrent create
            Err(StoreError::Conflict(field)) => Outcome::Conflict(field),
            Err(e) => internal(e),
        }
    }

    async fn on_updated(&self, id: i64, fields: EntityFields) -> Outcome {
        match self.store.update(id, fields).await {
            Ok(0) => Outcome::NotFound,
            Ok(_) => {
                info!(id, "entity updated");
                Outcome::Success
            }
            Err(StoreError::Conflict(field)) => Outcome::Conflict(field),
            Err(e) => internal(e),
        }
    }

    async fn on_deleted(&self, id: i64) -> Outcome {
        match self.store.delete(id).await {
            Ok(0) => Outcome::NotFound,
            Ok(_) => {
                info!(id, "entity deleted");
                Outcome::Success
            }
            Err(e) => internal(e),
        }
    }
}

fn internal(error: StoreError) -> Outcome {
    warn!(error = %error, "persistence call failed");
    Outcome::InternalError(error.to_string())
}

#[async_trait]
impl EventHandler for EventDispatcher {
    async fn handle(&self, event: Event) -> Outcome {
        self.dispatch(event).await
    }
}
