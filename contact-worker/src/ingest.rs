//! # Ingest
//!
//! Sources of raw change events for the pipeline feeder.
use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use contact_common::contact::{CanonicalContact, ContactCategory};
use contact_common::event::{ChangeEvent, Operation};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::warn;

/// Produces batches of raw, not yet validated events.
#[async_trait]
pub trait EventSource: Send {
    /// Up to `max` events. `None` once the source is exhausted, which ends the feeder.
    async fn next_batch(&mut self, max: usize) -> Option<Vec<Value>>;
}

/// Replays a fixed list of events, then reports exhaustion.
#[derive(Debug, Default)]
pub struct VecSource {
    events: VecDeque<Value>,
}

impl VecSource {
    pub fn new(events: Vec<Value>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn next_batch(&mut self, max: usize) -> Option<Vec<Value>> {
        if self.events.is_empty() {
            return None;
        }
        let take = max.min(self.events.len());
        Some(self.events.drain(..take).collect())
    }
}

const FIRST_NAMES: &[&str] = &[
    "Ada", "Brian", "Chloe", "Dmitri", "Elena", "Farid", "Greta", "Hiro", "Ines", "Jonas", "Keiko",
    "Lars", "Maya", "Nikolai", "Olga", "Pedro", "Rosa", "Sven", "Tomas", "Yusuf",
];

const LAST_NAMES: &[&str] = &[
    "Almeida", "Becker", "Chen", "Dubois", "Eriksen", "Fischer", "Garcia", "Hansen", "Ivanova",
    "Jensen", "Kowalski", "Lindqvist", "Moreau", "Nakamura", "Okafor", "Petrov", "Rossi",
    "Schmidt", "Tanaka", "Weber",
];

const EMAIL_DOMAINS: &[&str] = &["example.com", "example.org", "acme.io", "initech.net"];

/// Relative frequency of each category in generated contacts.
const CATEGORY_WEIGHTS: [(ContactCategory, u32); 6] = [
    (ContactCategory::Lead, 40),
    (ContactCategory::Customer, 25),
    (ContactCategory::Prospect, 20),
    (ContactCategory::Vendor, 10),
    (ContactCategory::Partner, 3),
    (ContactCategory::Employee, 2),
];

/// Relative frequency of each operation in generated events.
const OPERATION_WEIGHTS: [(Operation, u32); 3] = [
    (Operation::Create, 60),
    (Operation::Update, 35),
    (Operation::Delete, 5),
];

/// Generates an endless stream of plausible contact events. Updates and deletes pick a contact
/// created earlier in the session, so ids stay consistent across events.
pub struct ContactEventGenerator {
    rng: StdRng,
    categories: WeightedIndex<u32>,
    operations: WeightedIndex<u32>,
    known: Vec<CanonicalContact>,
    next_id: u64,
}

impl Default for ContactEventGenerator {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl ContactEventGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic output, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            categories: WeightedIndex::new(CATEGORY_WEIGHTS.iter().map(|(_, w)| *w))
                .expect("category weights are positive"),
            operations: WeightedIndex::new(OPERATION_WEIGHTS.iter().map(|(_, w)| *w))
                .expect("operation weights are positive"),
            known: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of contacts created and not deleted so far.
    pub fn known_contacts(&self) -> usize {
        self.known.len()
    }

    pub fn generate_event(&mut self) -> ChangeEvent {
        let operation = OPERATION_WEIGHTS[self.operations.sample(&mut self.rng)].0;

        // Updates and deletes need an existing contact, create one when there is none yet.
        if self.known.is_empty() || operation == Operation::Create {
            let contact = self.new_contact();
            self.known.push(contact.clone());
            return ChangeEvent::new(operation, contact);
        }

        let index = self.rng.gen_range(0..self.known.len());
        match operation {
            Operation::Delete => ChangeEvent::new(operation, self.known.swap_remove(index)),
            _ => {
                let mut contact = self.known[index].clone();
                self.modify(&mut contact);
                self.known[index] = contact.clone();
                ChangeEvent::new(operation, contact)
            }
        }
    }

    fn new_contact(&mut self) -> CanonicalContact {
        let (name, email) = self.name_and_email();
        let now = Utc::now();
        let id = format!("C{:06}", self.next_id);
        self.next_id += 1;

        CanonicalContact {
            id,
            name,
            email,
            phone: self.phone(),
            category: CATEGORY_WEIGHTS[self.categories.sample(&mut self.rng)].0,
            created_at: now,
            updated_at: now,
            company: None,
            title: None,
            department: None,
            address: None,
            notes: None,
        }
    }

    /// Change a random non-empty subset of name, email and phone.
    fn modify(&mut self, contact: &mut CanonicalContact) {
        let changes: u8 = self.rng.gen_range(1..8);

        if changes & 1 != 0 {
            let (name, email) = self.name_and_email();
            contact.name = name;
            contact.email = email;
        }
        if changes & 2 != 0 {
            let domain = EMAIL_DOMAINS.choose(&mut self.rng).unwrap_or(&"example.com");
            let local = contact.email.split('@').next().unwrap_or("contact").to_owned();
            contact.email = format!("{local}@{domain}");
        }
        if changes & 4 != 0 {
            contact.phone = self.phone();
        }
        contact.updated_at = Utc::now();
    }

    fn name_and_email(&mut self) -> (String, String) {
        let first = FIRST_NAMES.choose(&mut self.rng).unwrap_or(&"Ada");
        let last = LAST_NAMES.choose(&mut self.rng).unwrap_or(&"Almeida");
        let domain = EMAIL_DOMAINS.choose(&mut self.rng).unwrap_or(&"example.com");

        (
            format!("{first} {last}"),
            format!(
                "{}.{}@{}",
                first.to_lowercase(),
                last.to_lowercase(),
                domain
            ),
        )
    }

    fn phone(&mut self) -> String {
        format!(
            "+1-{}-{}-{}",
            self.rng.gen_range(200..1000),
            self.rng.gen_range(200..1000),
            self.rng.gen_range(1000..10000)
        )
    }
}

#[async_trait]
impl EventSource for ContactEventGenerator {
    async fn next_batch(&mut self, max: usize) -> Option<Vec<Value>> {
        let batch = (0..max)
            .filter_map(|_| {
                let event = self.generate_event();
                serde_json::to_value(&event)
                    .map_err(|e| warn!("failed to serialize generated event: {}", e))
                    .ok()
            })
            .collect();
        Some(batch)
    }
}
