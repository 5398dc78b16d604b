// src/store/mod.rs
//! Persistence collaborator used by the event dispatcher.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::message::EntityFields;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: i64,
    pub public_key: String,
    pub fields: EntityFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields that identify an entity, in the order conflicts are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Username,
    PhoneNumber,
    EmailAddress,
}

impl UniqueField {
    pub const PRIORITY: [UniqueField; 3] = [
        UniqueField::Username,
        UniqueField::PhoneNumber,
        UniqueField::EmailAddress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UniqueField::Username => "username",
            UniqueField::PhoneNumber => "phone_number",
            UniqueField::EmailAddress => "email_address",
        }
    }

    /// Whether `a` and `b` share this field. Absent optional fields never match.
    pub fn matches(self, a: &EntityFields, b: &EntityFields) -> bool {
        fn same(a: &Option<String>, b: &Option<String>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a == b)
        }

        match self {
            UniqueField::Username => a.username == b.username,
            UniqueField::PhoneNumber => same(&a.phone_number, &b.phone_number),
            UniqueField::EmailAddress => same(&a.email_address, &b.email_address),
        }
    }
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored entity already holding one of the candidate's unique values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueConflict {
    pub field: UniqueField,
    pub existing_id: i64,
}

/// Highest-priority conflict between `candidate` and any of `existing`.
///
/// Priority is decided per field across all records: a username clash on
/// any record beats a phone clash on an earlier one.
pub fn find_unique_conflict<'a, I>(existing: I, candidate: &EntityFields) -> Option<UniqueConflict>
where
    I: IntoIterator<Item = &'a Entity>,
    I::IntoIter: Clone,
{
    let existing = existing.into_iter();
    UniqueField::PRIORITY.into_iter().find_map(|field| {
        existing
            .clone()
            .find(|entity| field.matches(&entity.fields, candidate))
            .map(|entity| UniqueConflict {
                field,
                existing_id: entity.id,
            })
    })
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique field (`username`, `phone_number`, `email_address`) is taken.
    #[error("{0} already exists")]
    Conflict(String),

    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Each call is its own unit of work; implementations must be safe to call
/// from concurrently processed messages.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// The conflict `fields` would cause, resolved in `UniqueField::PRIORITY`
    /// order across every stored entity.
    async fn find_conflict(&self, fields: &EntityFields) -> Result<Option<UniqueConflict>, StoreError>;

    async fn create(&self, fields: EntityFields) -> Result<Entity, StoreError>;

    /// Returns the number of rows affected.
    async fn update(&self, id: i64, fields: EntityFields) -> Result<u64, StoreError>;

    /// Returns the number of rows affected.
    async fn delete(&self, id: i64) -> Result<u64, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Entity>, StoreError>;
}
