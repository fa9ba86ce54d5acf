//! # Transform
//!
//! Converts canonical contacts into the wire format of the target system they are routed to,
//! and back. The forward direction fills every vendor field that has a sensible default, the
//! reverse direction only restores the identity fields exactly since vendor schemas are lossy.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contact::{join_name, split_name, CanonicalContact, ContactCategory, ValidationError};
use crate::event::Operation;
use crate::routing::{RoutingTable, TargetSystem};
use crate::vendor::{
    category_from_hubspot_lifecycle_stage, category_from_salesforce_type,
    company_from_email_domain, default_title, hubspot_lifecycle_stage, salesforce_lead_source,
    salesforce_type, HubspotContact, HubspotContactProperties, SalesforceContact,
};

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("contact failed validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("{target_system} body could not be parsed: {error}")]
    MalformedBody {
        target_system: TargetSystem,
        error: serde_json::Error,
    },
}

/// A contact in the schema of one target system. The variant is the target system, so a body
/// can never be sent to a system it was not built for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum VendorContact {
    Salesforce(SalesforceContact),
    Hubspot(HubspotContact),
}

impl VendorContact {
    pub fn target_system(&self) -> TargetSystem {
        match self {
            VendorContact::Salesforce(_) => TargetSystem::Salesforce,
            VendorContact::Hubspot(_) => TargetSystem::Hubspot,
        }
    }
}

/// Travels with a record through the pipeline, never sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchMetadata {
    pub source_id: String,
    pub category: ContactCategory,
    pub target_system: TargetSystem,
    pub operation: Option<Operation>,
    pub produced_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformedRecord {
    pub body: VendorContact,
    pub metadata: DispatchMetadata,
}

impl TransformedRecord {
    pub fn target_system(&self) -> TargetSystem {
        self.body.target_system()
    }
}

/// Routes and converts contacts. Cheap to clone, the routing table is shared.
#[derive(Clone, Debug)]
pub struct Transformer {
    routing: Arc<RoutingTable>,
}

impl Transformer {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self { routing }
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Validate the contact, resolve its target system and build the vendor body.
    pub fn transform(&self, contact: &CanonicalContact) -> Result<TransformedRecord, TransformError> {
        contact.validate()?;

        let target_system = self.routing.resolve(contact.category);
        let body = match target_system {
            TargetSystem::Salesforce => VendorContact::Salesforce(to_salesforce(contact)),
            TargetSystem::Hubspot => VendorContact::Hubspot(to_hubspot(contact)),
        };

        Ok(TransformedRecord {
            body,
            metadata: DispatchMetadata {
                source_id: contact.id.clone(),
                category: contact.category,
                target_system,
                operation: None,
                produced_at: Utc::now(),
            },
        })
    }

    /// Like `transform`, recording the operation of the change event in the metadata.
    pub fn transform_event(
        &self,
        operation: Operation,
        contact: &CanonicalContact,
    ) -> Result<TransformedRecord, TransformError> {
        let mut record = self.transform(contact)?;
        record.metadata.operation = Some(operation);
        Ok(record)
    }

    /// Rebuild a canonical contact from a body in the schema of `target_system`.
    pub fn inverse_transform(
        &self,
        target_system: TargetSystem,
        body: serde_json::Value,
    ) -> Result<CanonicalContact, TransformError> {
        let malformed = |error| TransformError::MalformedBody {
            target_system,
            error,
        };

        match target_system {
            TargetSystem::Salesforce => {
                let contact: SalesforceContact = serde_json::from_value(body).map_err(malformed)?;
                Ok(from_salesforce(contact))
            }
            TargetSystem::Hubspot => {
                let contact: HubspotContact = serde_json::from_value(body).map_err(malformed)?;
                Ok(from_hubspot(contact))
            }
        }
    }

    pub fn supported_categories(&self, target_system: TargetSystem) -> &'static [ContactCategory] {
        target_system.supported_categories()
    }
}

fn company_or_fallback(contact: &CanonicalContact) -> String {
    contact
        .company
        .clone()
        .unwrap_or_else(|| company_from_email_domain(contact.email_domain()))
}

fn title_or_fallback(contact: &CanonicalContact) -> String {
    contact
        .title
        .clone()
        .unwrap_or_else(|| default_title(contact.category).to_owned())
}

fn to_salesforce(contact: &CanonicalContact) -> SalesforceContact {
    let (first_name, last_name) = split_name(&contact.name);

    SalesforceContact {
        id: contact.id.clone(),
        first_name,
        last_name,
        email: contact.email.clone(),
        phone: contact.phone.clone(),
        company: company_or_fallback(contact),
        title: title_or_fallback(contact),
        department: contact.department.clone(),
        mailing_street: contact.address.clone(),
        lead_source: salesforce_lead_source(contact.category).to_owned(),
        contact_type: salesforce_type(contact.category).to_owned(),
        created_date: contact.created_at,
        last_modified_date: contact.updated_at,
    }
}

fn to_hubspot(contact: &CanonicalContact) -> HubspotContact {
    let (firstname, lastname) = split_name(&contact.name);

    HubspotContact {
        id: contact.id.clone(),
        properties: HubspotContactProperties {
            firstname,
            lastname,
            email: contact.email.clone(),
            phone: contact.phone.clone(),
            company: company_or_fallback(contact),
            jobtitle: title_or_fallback(contact),
            department: contact.department.clone(),
            address: contact.address.clone(),
            lifecyclestage: hubspot_lifecycle_stage(contact.category).to_owned(),
            createdate: contact.created_at,
            lastmodifieddate: contact.updated_at,
        },
    }
}

fn from_salesforce(contact: SalesforceContact) -> CanonicalContact {
    CanonicalContact {
        name: join_name(&contact.first_name, &contact.last_name),
        category: category_from_salesforce_type(&contact.contact_type),
        id: contact.id,
        email: contact.email,
        phone: contact.phone,
        created_at: contact.created_date,
        updated_at: contact.last_modified_date,
        company: Some(contact.company),
        title: Some(contact.title),
        department: contact.department,
        address: contact.mailing_street,
        notes: None,
    }
}

fn from_hubspot(contact: HubspotContact) -> CanonicalContact {
    let properties = contact.properties;

    CanonicalContact {
        name: join_name(&properties.firstname, &properties.lastname),
        category: category_from_hubspot_lifecycle_stage(&properties.lifecyclestage),
        id: contact.id,
        email: properties.email,
        phone: properties.phone,
        created_at: properties.createdate,
        updated_at: properties.lastmodifieddate,
        company: Some(properties.company),
        title: Some(properties.jobtitle),
        department: properties.department,
        address: properties.address,
        notes: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::contact::tests::contact;

    fn transformer() -> Transformer {
        Transformer::new(Arc::new(RoutingTable::default()))
    }

    fn assert_identity_fields_eq(restored: &CanonicalContact, original: &CanonicalContact) {
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.name, original.name);
        assert_eq!(restored.email, original.email);
        assert_eq!(restored.phone, original.phone);
        assert_eq!(restored.created_at, original.created_at);
        assert_eq!(restored.updated_at, original.updated_at);
    }

    #[test]
    fn test_identity_fields_round_trip() {
        let transformer = transformer();

        for category in ContactCategory::ALL {
            for name in ["John Doe", "Cher", "Mary Ann van der Berg"] {
                let mut original = contact(category);
                original.name = name.to_owned();

                let record = transformer.transform(&original).unwrap();
                let body = serde_json::to_value(&record.body).unwrap();
                let restored = transformer
                    .inverse_transform(record.target_system(), body)
                    .unwrap();

                assert_identity_fields_eq(&restored, &original);
            }
        }
    }

    #[test]
    fn test_customer_goes_to_hubspot_with_fallbacks() {
        let record = transformer()
            .transform(&contact(ContactCategory::Customer))
            .unwrap();

        assert_eq!(record.target_system(), TargetSystem::Hubspot);
        assert_eq!(record.metadata.target_system, TargetSystem::Hubspot);
        assert_eq!(record.metadata.source_id, "C12345");
        assert_eq!(record.metadata.category, ContactCategory::Customer);

        let body = serde_json::to_value(&record.body).unwrap();
        assert_eq!(body["id"], "C12345");
        assert_eq!(body["properties"]["firstname"], "John");
        assert_eq!(body["properties"]["lastname"], "Doe");
        assert_eq!(body["properties"]["company"], "Acme");
        assert_eq!(body["properties"]["jobtitle"], "Customer Contact");
        assert_eq!(body["properties"]["lifecyclestage"], "customer");
        assert_eq!(body["properties"]["createdate"], "2024-01-15T10:30:00Z");
        // Metadata is not part of the body
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn test_lead_goes_to_salesforce_keeping_given_fields() {
        let mut lead = contact(ContactCategory::Lead);
        lead.company = Some("Initech".to_owned());
        lead.title = Some("CTO".to_owned());
        lead.address = Some("1 Main St".to_owned());

        let record = transformer().transform(&lead).unwrap();
        let body = serde_json::to_value(&record.body).unwrap();

        assert_eq!(record.target_system(), TargetSystem::Salesforce);
        assert_eq!(body["Id"], "C12345");
        assert_eq!(body["Company"], "Initech");
        assert_eq!(body["Title"], "CTO");
        assert_eq!(body["MailingStreet"], "1 Main St");
        assert_eq!(body["LeadSource"], "Web");
        assert_eq!(body["Type"], "Lead");
    }

    #[test]
    fn test_invalid_contact_is_not_transformed() {
        let mut invalid = contact(ContactCategory::Lead);
        invalid.email = "john.doe".to_owned();

        assert!(matches!(
            transformer().transform(&invalid),
            Err(TransformError::Validation(ValidationError::InvalidEmail(_)))
        ));
    }

    #[test]
    fn test_routing_update_applies_to_next_transform() {
        let transformer = transformer();
        let customer = contact(ContactCategory::Customer);

        let before = transformer.transform(&customer).unwrap();
        transformer.routing().update(HashMap::from([(
            ContactCategory::Customer,
            TargetSystem::Salesforce,
        )]));
        let after = transformer.transform(&customer).unwrap();

        assert_eq!(before.target_system(), TargetSystem::Hubspot);
        assert_eq!(after.target_system(), TargetSystem::Salesforce);
        // Records built earlier keep their target
        assert!(matches!(before.body, VendorContact::Hubspot(_)));
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        let result = transformer()
            .inverse_transform(TargetSystem::Hubspot, serde_json::json!({"Id": "1"}));
        assert!(matches!(
            result,
            Err(TransformError::MalformedBody {
                target_system: TargetSystem::Hubspot,
                ..
            })
        ));
    }

    #[test]
    fn test_supported_categories() {
        let transformer = transformer();
        assert!(transformer
            .supported_categories(TargetSystem::Hubspot)
            .contains(&ContactCategory::Customer));
        assert!(!transformer
            .supported_categories(TargetSystem::Salesforce)
            .contains(&ContactCategory::Customer));
    }
}
