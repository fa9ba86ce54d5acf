//! # Vendor schemas
//!
//! Wire formats of the target systems and the field mapping tables used to fill them. Every
//! table is a total `match` over the category enum, so adding a category fails to compile
//! until every table has an entry for it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::ContactCategory;

/// A contact as the Salesforce contact endpoint expects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SalesforceContact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailing_street: Option<String>,
    pub lead_source: String,
    #[serde(rename = "Type")]
    pub contact_type: String,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

/// A contact as the HubSpot contact endpoint expects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubspotContact {
    pub id: String,
    pub properties: HubspotContactProperties,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubspotContactProperties {
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub jobtitle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub lifecyclestage: String,
    pub createdate: DateTime<Utc>,
    pub lastmodifieddate: DateTime<Utc>,
}

/// Salesforce `Type` picklist value for a category.
pub fn salesforce_type(category: ContactCategory) -> &'static str {
    match category {
        ContactCategory::Lead => "Lead",
        ContactCategory::Customer => "Customer",
        ContactCategory::Prospect => "Prospect",
        ContactCategory::Vendor => "Vendor",
        ContactCategory::Partner => "Partner",
        ContactCategory::Employee => "Employee",
    }
}

/// Reverse of `salesforce_type`. Unknown values fall back to a lead.
pub fn category_from_salesforce_type(contact_type: &str) -> ContactCategory {
    ContactCategory::ALL
        .into_iter()
        .find(|category| salesforce_type(*category).eq_ignore_ascii_case(contact_type))
        .unwrap_or(ContactCategory::Lead)
}

pub fn salesforce_lead_source(category: ContactCategory) -> &'static str {
    match category {
        ContactCategory::Lead => "Web",
        ContactCategory::Prospect => "Outbound",
        ContactCategory::Customer => "Existing Customer",
        ContactCategory::Partner => "Partner Referral",
        ContactCategory::Vendor => "Purchasing",
        ContactCategory::Employee => "Internal",
    }
}

/// HubSpot `lifecyclestage` for a category. HubSpot has no stage for vendors or employees.
pub fn hubspot_lifecycle_stage(category: ContactCategory) -> &'static str {
    match category {
        ContactCategory::Lead => "lead",
        ContactCategory::Prospect => "salesqualifiedlead",
        ContactCategory::Customer => "customer",
        ContactCategory::Partner => "evangelist",
        ContactCategory::Vendor | ContactCategory::Employee => "other",
    }
}

/// Reverse of `hubspot_lifecycle_stage`. Lossy: "other" and unknown stages come back as customers.
pub fn category_from_hubspot_lifecycle_stage(stage: &str) -> ContactCategory {
    match stage {
        "lead" | "subscriber" | "marketingqualifiedlead" => ContactCategory::Lead,
        "salesqualifiedlead" | "opportunity" => ContactCategory::Prospect,
        "evangelist" => ContactCategory::Partner,
        _ => ContactCategory::Customer,
    }
}

/// Job title used when a contact has none.
pub fn default_title(category: ContactCategory) -> &'static str {
    match category {
        ContactCategory::Lead => "Lead Contact",
        ContactCategory::Customer => "Customer Contact",
        ContactCategory::Prospect => "Prospective Contact",
        ContactCategory::Vendor => "Vendor Representative",
        ContactCategory::Partner => "Partner Representative",
        ContactCategory::Employee => "Employee",
    }
}

/// Company name derived from an email domain: the first label, title cased.
/// `john@acme-corp.com` gives `Acme-corp`.
pub fn company_from_email_domain(domain: Option<&str>) -> String {
    let label = domain
        .and_then(|domain| domain.split('.').next())
        .filter(|label| !label.is_empty());

    match label {
        Some(label) => {
            let mut chars = label.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => UNKNOWN_COMPANY.to_owned(),
            }
        }
        None => UNKNOWN_COMPANY.to_owned(),
    }
}

const UNKNOWN_COMPANY: &str = "Unknown";
