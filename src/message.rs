use serde::{Deserialize, Serialize};
use validator::ValidateEmail;

use crate::rabbitmq::{RabbitMQError, Result};

pub const ENTITY_CREATED: &str = "entity.created";
pub const ENTITY_UPDATED: &str = "entity.updated";
pub const ENTITY_DELETED: &str = "entity.deleted";

const MAX_USERNAME_LEN: usize = 256;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_NAME_LEN: usize = 256;
const MAX_EMAIL_LEN: usize = 320;
const MAX_PHONE_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Other,
}

/// Full field set carried by created/updated events.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntityFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

impl EntityFields {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            first_name: None,
            last_name: None,
            username: username.into(),
            password: password.into(),
            email_address: None,
            phone_number: None,
            gender: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email_address = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = Some(gender);
        self
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.username.is_empty() {
            return Err("username must not be empty".to_string());
        }
        check_len("username", Some(&self.username), MAX_USERNAME_LEN)?;
        check_len("password", Some(&self.password), MAX_PASSWORD_LEN)?;
        check_len("first_name", self.first_name.as_ref(), MAX_NAME_LEN)?;
        check_len("last_name", self.last_name.as_ref(), MAX_NAME_LEN)?;
        check_len("email_address", self.email_address.as_ref(), MAX_EMAIL_LEN)?;
        check_len("phone_number", self.phone_number.as_ref(), MAX_PHONE_LEN)?;
        if let Some(email) = &self.email_address {
            if !email.validate_email() {
                return Err(format!("email_address '{}' is not a valid address", email));
            }
        }
        Ok(())
    }

    /// An update replaces the whole record, so the optional contact fields
    /// must all be present.
    fn validate_replacement(&self) -> std::result::Result<(), String> {
        let missing = [
            ("email_address", self.email_address.is_none()),
            ("phone_number", self.phone_number.is_none()),
            ("gender", self.gender.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }
}

fn check_len(field: &str, value: Option<&String>, max: usize) -> std::result::Result<(), String> {
    match value {
        Some(value) if value.chars().count() > max => Err(format!(
            "{} is longer than {} characters",
            field, max
        )),
        _ => Ok(()),
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpdatedEntity {
    pub id: i64,
    #[serde(flatten)]
    pub fields: EntityFields,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedEntity {
    pub id: i64,
}

/// An entity lifecycle event. On the wire:
/// `{"event_type": "entity.created", "data": {...}}`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "event_type", content = "data")]
pub enum Event {
    #[serde(rename = "entity.created")]
    Created(EntityFields),
    #[serde(rename = "entity.updated")]
    Updated(UpdatedEntity),
    #[serde(rename = "entity.deleted")]
    Deleted(DeletedEntity),
}

impl Event {
    pub fn created(fields: EntityFields) -> Self {
        Event::Created(fields)
    }

    pub fn updated(id: i64, fields: EntityFields) -> Self {
        Event::Updated(UpdatedEntity { id, fields })
    }

    pub fn deleted(id: i64) -> Self {
        Event::Deleted(DeletedEntity { id })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Created(_) => ENTITY_CREATED,
            Event::Updated(_) => ENTITY_UPDATED,
            Event::Deleted(_) => ENTITY_DELETED,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body. Unknown tags, shape mismatches and out-of-range
    /// fields are all `DeserializationError`.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let event: Event = serde_json::from_slice(body)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))?;

        let checked = match &event {
            Event::Created(fields) => fields.validate(),
            Event::Updated(updated) => updated
                .fields
                .validate()
                .and_then(|()| updated.fields.validate_replacement()),
            Event::Deleted(_) => Ok(()),
        };
        checked.map_err(|reason| {
            RabbitMQError::DeserializationError(format!("{}: {}", event.event_type(), reason))
        })?;
        Ok(event)
    }
}
