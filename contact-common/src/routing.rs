//! # Routing
//!
//! Decides which target system receives a contact, based on its category.
//!
//! The table is total: every category resolves to a target system, unmapped or unknown
//! categories resolve to the configured default. It is shared by all pipeline workers and
//! may be updated while the pipeline runs; an update is applied under a single write lock so
//! readers observe either the table before or after the whole merge.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::contact::ContactCategory;

/// The closed set of external systems contacts are synchronized to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSystem {
    Salesforce,
    Hubspot,
}

impl TargetSystem {
    pub const ALL: [TargetSystem; 2] = [TargetSystem::Salesforce, TargetSystem::Hubspot];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetSystem::Salesforce => "salesforce",
            TargetSystem::Hubspot => "hubspot",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Categories this system expects to receive. Informational, routing does not enforce it.
    pub fn supported_categories(&self) -> &'static [ContactCategory] {
        match self {
            TargetSystem::Salesforce => &[
                ContactCategory::Lead,
                ContactCategory::Prospect,
                ContactCategory::Employee,
            ],
            TargetSystem::Hubspot => &[
                ContactCategory::Customer,
                ContactCategory::Partner,
                ContactCategory::Vendor,
            ],
        }
    }
}

impl fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a known target system")]
pub struct UnknownTargetSystemError(pub String);

impl FromStr for TargetSystem {
    type Err = UnknownTargetSystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "salesforce" => Ok(TargetSystem::Salesforce),
            "hubspot" => Ok(TargetSystem::Hubspot),
            invalid => Err(UnknownTargetSystemError(invalid.to_owned())),
        }
    }
}

/// Where each category goes when nothing overrides it.
pub fn default_routes() -> HashMap<ContactCategory, TargetSystem> {
    HashMap::from([
        (ContactCategory::Lead, TargetSystem::Salesforce),
        (ContactCategory::Customer, TargetSystem::Hubspot),
        (ContactCategory::Prospect, TargetSystem::Salesforce),
        (ContactCategory::Vendor, TargetSystem::Hubspot),
        (ContactCategory::Partner, TargetSystem::Hubspot),
        (ContactCategory::Employee, TargetSystem::Salesforce),
    ])
}

#[derive(Debug)]
pub struct RoutingTable {
    routes: RwLock<HashMap<ContactCategory, TargetSystem>>,
    default_target: TargetSystem,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(TargetSystem::Salesforce)
    }
}

impl RoutingTable {
    /// A table with the default routes and the given fallback target.
    pub fn new(default_target: TargetSystem) -> Self {
        Self {
            routes: RwLock::new(default_routes()),
            default_target,
        }
    }

    pub fn with_overrides(default_target: TargetSystem, overrides: &RoutingOverrides) -> Self {
        let table = Self::new(default_target);
        table.update(overrides.0.clone());
        table
    }

    /// Resolve the target system for a category. Never fails.
    pub fn resolve(&self, category: ContactCategory) -> TargetSystem {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&category) {
            Some(target) => *target,
            None => {
                warn!(
                    "no route configured for category {}, using {}",
                    category, self.default_target
                );
                self.default_target
            }
        }
    }

    /// Resolve a category given by name. Names outside the category enum get the default target.
    pub fn resolve_name(&self, category: &str) -> TargetSystem {
        match category.parse::<ContactCategory>() {
            Ok(category) => self.resolve(category),
            Err(_) => {
                warn!(
                    "unknown category {:?}, using {}",
                    category, self.default_target
                );
                self.default_target
            }
        }
    }

    /// Merge overrides into the table, last write wins per category.
    pub fn update(&self, overrides: HashMap<ContactCategory, TargetSystem>) {
        if overrides.is_empty() {
            return;
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.extend(overrides);
        info!("routing table updated: {:?}", routes);
    }

    /// A sorted copy of the current routes, for display.
    pub fn snapshot(&self) -> BTreeMap<ContactCategory, TargetSystem> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseRoutingOverridesError {
    #[error("routing override {0:?} must be of the form category=target")]
    Malformed(String),
    #[error(transparent)]
    UnknownCategory(#[from] crate::contact::UnknownCategoryError),
    #[error(transparent)]
    UnknownTargetSystem(#[from] UnknownTargetSystemError),
}

/// Routing overrides as given in configuration: `category=target` pairs separated by commas,
/// e.g. `customer=salesforce,vendor=salesforce`. An empty string means no overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingOverrides(pub HashMap<ContactCategory, TargetSystem>);

impl FromStr for RoutingOverrides {
    type Err = ParseRoutingOverridesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut overrides = HashMap::new();

        for pair in s.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (category, target) = pair
                .split_once('=')
                .ok_or_else(|| ParseRoutingOverridesError::Malformed(pair.to_owned()))?;
            overrides.insert(category.parse()?, target.parse()?);
        }

        Ok(RoutingOverrides(overrides))
    }
}
