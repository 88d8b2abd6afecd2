//! Shared service-ticket store.
//!
//! The store is append-only from the session core's point of view: the
//! tool bridge prepends new tickets and the dashboard reads snapshots and
//! listens for "ticket created" notifications.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// Ticket severity as declared in the tool schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Case-insensitive parse of a severity name.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    Open,
    #[serde(rename = "In Progress")]
    InProgress,
    Resolved,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "Open",
            Self::InProgress => "In Progress",
            Self::Resolved => "Resolved",
        })
    }
}

/// A logged service complaint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub category: String,
    pub location: String,
    pub severity: Severity,
    pub description: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub impact: String,
    /// Callback number given by the caller, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// Language the caller spoke, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Notification that a ticket was added to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketCreated {
    pub ticket_id: String,
}

/// Aggregate counts for dashboard stat cards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketSummary {
    pub total: usize,
    pub open: usize,
    pub critical: usize,
    pub by_severity: BTreeMap<Severity, usize>,
}

const NOTIFY_CAPACITY: usize = 32;

/// Cloneable handle to the shared, most-recent-first ticket list.
#[derive(Clone)]
pub struct TicketStore {
    tickets: Arc<RwLock<Vec<Ticket>>>,
    created_tx: broadcast::Sender<TicketCreated>,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TicketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketStore").field("len", &self.len()).finish()
    }
}

impl TicketStore {
    pub fn new() -> Self {
        let (created_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            tickets: Arc::new(RwLock::new(Vec::new())),
            created_tx,
        }
    }

    /// A store pre-filled with the dashboard's sample tickets.
    pub fn with_demo_data() -> Self {
        let store = Self::new();
        *store.write() = demo_tickets(Utc::now());
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Ticket>> {
        match self.tickets.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Ticket>> {
        match self.tickets.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Insert `ticket` at the front and notify subscribers.
    pub(crate) fn prepend(&self, ticket: Ticket) {
        let ticket_id = ticket.id.clone();
        self.write().insert(0, ticket);
        // No subscribers is fine.
        let _ = self.created_tx.send(TicketCreated { ticket_id });
    }

    /// All tickets, most recent first.
    pub fn snapshot(&self) -> Vec<Ticket> {
        self.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Ticket> {
        self.read().iter().find(|t| t.id == id).cloned()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.read().iter().any(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn summary(&self) -> TicketSummary {
        let tickets = self.read();
        let mut summary = TicketSummary {
            total: tickets.len(),
            ..TicketSummary::default()
        };
        for ticket in tickets.iter() {
            *summary.by_severity.entry(ticket.severity).or_default() += 1;
            if ticket.status == TicketStatus::Open {
                summary.open += 1;
            }
            if ticket.severity == Severity::Critical {
                summary.critical += 1;
            }
        }
        summary
    }

    /// Receive a [`TicketCreated`] for every ticket added from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TicketCreated> {
        self.created_tx.subscribe()
    }
}

/// Draws `PREFIX-NNNN` ids that are unique within a store.
#[derive(Debug, Clone)]
pub struct TicketIdGenerator {
    prefix: String,
}

const MAX_DRAWS: usize = 64;

impl TicketIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Draw an id not already present in `store`.
    ///
    /// The four-digit space is small; after repeated collisions a longer
    /// uuid-derived suffix is used instead.
    pub fn next_id(&self, store: &TicketStore) -> String {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_DRAWS {
            let id = format!("{}-{}", self.prefix, rng.gen_range(1000..=9999));
            if !store.contains_id(&id) {
                return id;
            }
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.prefix, &suffix[..8])
    }

    /// Whether `id` has the `PREFIX-NNNN` shape.
    pub fn matches(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|digits| digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()))
    }
}

fn demo_tickets(now: DateTime<Utc>) -> Vec<Ticket> {
    let demo = |id: &str,
                category: &str,
                location: &str,
                severity: Severity,
                description: &str,
                status: TicketStatus,
                age: ChronoDuration,
                impact: &str| Ticket {
        id: id.to_owned(),
        category: category.to_owned(),
        location: location.to_owned(),
        severity,
        description: description.to_owned(),
        status,
        created_at: now - age,
        impact: impact.to_owned(),
        contact: None,
        language: None,
    };
    vec![
        demo(
            "MAH-1024",
            "Drainage",
            "Shivaji Nagar, Zone 4",
            Severity::High,
            "Overflowing sewage near school entrance",
            TicketStatus::Open,
            ChronoDuration::minutes(10),
            "500 students at risk",
        ),
        demo(
            "MAH-1021",
            "Water",
            "Shivaji Nagar, Zone 4",
            Severity::Medium,
            "Low pressure in supply lines",
            TicketStatus::Open,
            ChronoDuration::hours(2),
            "50 households",
        ),
        demo(
            "MAH-0998",
            "Street Light",
            "MG Road",
            Severity::Low,
            "Pole 45 flickering",
            TicketStatus::Resolved,
            ChronoDuration::hours(5),
            "Traffic visibility reduced",
        ),
        demo(
            "MAH-1033",
            "Health",
            "Dharavi Sector 2",
            Severity::Critical,
            "Reports of contaminated water and fever",
            TicketStatus::InProgress,
            ChronoDuration::hours(1),
            "Potential outbreak vector",
        ),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn ticket(id: &str, severity: Severity) -> Ticket {
        Ticket {
            id: id.into(),
            category: "Water".into(),
            location: "Zone 4".into(),
            severity,
            description: "Low pressure".into(),
            status: TicketStatus::Open,
            created_at: Utc::now(),
            impact: "10 homes".into(),
            contact: None,
            language: None,
        }
    }

    #[test]
    fn severity_parse_is_case_insensitive() {
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(Severity::parse(" Medium "), Some(Severity::Medium));
        assert_eq!(Severity::parse("urgent"), None);
    }

    #[test]
    fn prepend_orders_most_recent_first() {
        let store = TicketStore::new();
        store.prepend(ticket("MAH-1111", Severity::Low));
        store.prepend(ticket("MAH-2222", Severity::High));
        let ids: Vec<String> = store.snapshot().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["MAH-2222", "MAH-1111"]);
        assert_eq!(store.get("MAH-1111").unwrap().severity, Severity::Low);
        assert!(store.get("MAH-3333").is_none());
    }

    #[tokio::test]
    async fn prepend_notifies_subscribers() {
        let store = TicketStore::new();
        let mut rx = store.subscribe();
        store.prepend(ticket("MAH-4242", Severity::Medium));
        let created = rx.recv().await.unwrap();
        assert_eq!(created.ticket_id, "MAH-4242");
    }

    #[test]
    fn clones_share_state() {
        let store = TicketStore::new();
        let other = store.clone();
        store.prepend(ticket("MAH-1000", Severity::Low));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn demo_data_summary() {
        let store = TicketStore::with_demo_data();
        let summary = store.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.open, 2);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.by_severity.get(&Severity::High), Some(&1));
        assert_eq!(store.snapshot()[0].id, "MAH-1024");
    }

    #[test]
    fn generated_ids_match_pattern() {
        let ids = TicketIdGenerator::new("MAH");
        let store = TicketStore::new();
        for _ in 0..100 {
            let id = ids.next_id(&store);
            assert!(ids.matches(&id), "{id}");
        }
        assert!(!ids.matches("MAH-12"));
        assert!(!ids.matches("ABC-1234"));
        assert!(!ids.matches("MAH-12a4"));
    }

    #[test]
    fn generator_avoids_existing_ids() {
        let ids = TicketIdGenerator::new("T");
        let store = TicketStore::new();
        // Fill all but one slot of the four-digit space.
        {
            let mut all = store.write();
            for n in 1000..=9999 {
                if n != 5555 {
                    all.push(ticket(&format!("T-{n}"), Severity::Low));
                }
            }
        }
        let id = ids.next_id(&store);
        assert!(!store.contains_id(&id));
    }

    #[test]
    fn status_serializes_with_space() {
        let json = serde_json::to_string(&TicketStatus::InProgress).unwrap();
        assert_eq!(json, "\"In Progress\"");
    }
}
