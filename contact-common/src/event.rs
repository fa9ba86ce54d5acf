use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::CanonicalContact;

/// The only record kind this service synchronizes.
pub const CONTACTS_RECORD_KIND: &str = "contacts";

/// Payload fields that must be present on every contact event.
pub const MANDATORY_PAYLOAD_FIELDS: [&str; 5] = ["id", "name", "email", "phone", "category"];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Create, Operation::Update, Operation::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            invalid => Err(format!("{invalid} is not a valid operation")),
        }
    }
}

/// A contact change as it travels from the validator to the transformer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub record_kind: String,
    pub operation: Operation,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub payload: CanonicalContact,
}

impl ChangeEvent {
    pub fn new(operation: Operation, payload: CanonicalContact) -> Self {
        Self {
            record_kind: CONTACTS_RECORD_KIND.to_owned(),
            operation,
            timestamp: Utc::now(),
            payload,
        }
    }
}
