//! # Contact
//!
//! The canonical, vendor-neutral contact record and the field validation gate every record must
//! pass before it is transformed for a target system.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_NAME_LENGTH: usize = 255;
const MAX_FIELD_LENGTH: usize = 255;
const MAX_ADDRESS_LENGTH: usize = 500;
const MAX_NOTES_LENGTH: usize = 1000;
const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_LENGTH: usize = 20;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("email pattern is a valid regex")
});

/// The closed set of contact categories. Routing is decided on this value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactCategory {
    Lead,
    Customer,
    Prospect,
    Vendor,
    Partner,
    Employee,
}

impl ContactCategory {
    pub const ALL: [ContactCategory; 6] = [
        ContactCategory::Lead,
        ContactCategory::Customer,
        ContactCategory::Prospect,
        ContactCategory::Vendor,
        ContactCategory::Partner,
        ContactCategory::Employee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactCategory::Lead => "lead",
            ContactCategory::Customer => "customer",
            ContactCategory::Prospect => "prospect",
            ContactCategory::Vendor => "vendor",
            ContactCategory::Partner => "partner",
            ContactCategory::Employee => "employee",
        }
    }

    /// Position in `ALL`, used to index per-category counters.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ContactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid contact category")]
pub struct UnknownCategoryError(pub String);

impl FromStr for ContactCategory {
    type Err = UnknownCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "lead" => Ok(ContactCategory::Lead),
            "customer" => Ok(ContactCategory::Customer),
            "prospect" => Ok(ContactCategory::Prospect),
            "vendor" => Ok(ContactCategory::Vendor),
            "partner" => Ok(ContactCategory::Partner),
            "employee" => Ok(ContactCategory::Employee),
            invalid => Err(UnknownCategoryError(invalid.to_owned())),
        }
    }
}

/// Enumeration of field level violations of the contact schema.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("contact id must not be empty")]
    EmptyId,
    #[error("contact name must not be blank")]
    BlankName,
    #[error("contact name must not start or end with whitespace")]
    UntrimmedName,
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{0:?} is not a valid email address")]
    InvalidEmail(String),
    #[error("{0:?} is not a valid phone number, at least 10 digits are required")]
    InvalidPhone(String),
}

/// The internal representation of a contact. Records are never mutated once emitted,
/// transformation produces new records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalContact {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub category: ContactCategory,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CanonicalContact {
    /// Check the record against the contact schema: non-empty id, non-blank name, a well formed
    /// email, a phone number with enough digits, and length limits on free text fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }

        if self.name.trim().is_empty() {
            return Err(ValidationError::BlankName);
        }
        if self.name.trim() != self.name {
            return Err(ValidationError::UntrimmedName);
        }
        check_length("name", &self.name, MAX_NAME_LENGTH)?;

        if !is_valid_email(&self.email) {
            return Err(ValidationError::InvalidEmail(self.email.clone()));
        }

        if !is_valid_phone(&self.phone) {
            return Err(ValidationError::InvalidPhone(self.phone.clone()));
        }

        let optional_fields = [
            ("company", &self.company, MAX_FIELD_LENGTH),
            ("title", &self.title, MAX_FIELD_LENGTH),
            ("department", &self.department, MAX_FIELD_LENGTH),
            ("address", &self.address, MAX_ADDRESS_LENGTH),
            ("notes", &self.notes, MAX_NOTES_LENGTH),
        ];
        for (field, value, max) in optional_fields {
            if let Some(value) = value {
                check_length(field, value, max)?;
            }
        }

        Ok(())
    }

    /// The domain part of the email address, if there is one.
    pub fn email_domain(&self) -> Option<&str> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
    }
}

fn check_length(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        Err(ValidationError::TooLong { field, max })
    } else {
        Ok(())
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

/// A phone number is accepted when it has at least 10 digits, separators are ignored.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    digits >= MIN_PHONE_DIGITS && phone.chars().count() <= MAX_PHONE_LENGTH
}

/// Split a full name at its first space. The remainder, which may be empty, is the last name.
pub fn split_name(full_name: &str) -> (String, String) {
    match full_name.split_once(' ') {
        Some((first, last)) => (first.to_owned(), last.to_owned()),
        None => (full_name.to_owned(), String::new()),
    }
}

/// Inverse of `split_name`.
pub fn join_name(first_name: &str, last_name: &str) -> String {
    if last_name.is_empty() {
        first_name.to_owned()
    } else {
        format!("{first_name} {last_name}")
    }
}
