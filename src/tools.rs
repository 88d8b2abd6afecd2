//! Tool bridge: turns remote tool invocations into tickets.
//!
//! The only declared tool is `log_complaint`. Each invocation id is handled
//! at most once; replays of an already-acknowledged id are ignored so a
//! re-delivered message never creates a second ticket or a second ack.

use crate::channel::ToolInvocation;
use crate::channel::protocol::{
    FunctionDeclaration, FunctionResponse, ParameterSchema, PropertySchema,
};
use crate::error::{Result, SessionError};
use crate::tickets::{Severity, Ticket, TicketIdGenerator, TicketStatus, TicketStore};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// Name of the complaint tool declared to the remote engine.
pub const LOG_COMPLAINT: &str = "log_complaint";

const REQUIRED_FIELDS: [&str; 6] = [
    "category",
    "location",
    "description",
    "severity",
    "impact_details",
    "conversation_summary",
];

/// Schema of the `log_complaint` tool.
pub fn complaint_tool_declaration() -> FunctionDeclaration {
    let mut properties = BTreeMap::new();
    let mut add = |name: &str, schema: PropertySchema| {
        properties.insert(name.to_owned(), schema);
    };
    add(
        "category",
        PropertySchema::string("Category (Drainage, Water, Health, Road, Electricity)."),
    );
    add("location", PropertySchema::string("Specific area or landmark."));
    add("description", PropertySchema::string("Problem description."));
    add(
        "severity",
        PropertySchema::one_of(
            "Severity: Low, Medium, High, Critical.",
            &Severity::ALL.map(Severity::as_str),
        ),
    );
    add(
        "impact_details",
        PropertySchema::string("Population affected or safety risks."),
    );
    add(
        "phone_number",
        PropertySchema::string("Mobile number for WhatsApp tracking."),
    );
    add("language_used", PropertySchema::string("Language spoken."));
    add(
        "conversation_summary",
        PropertySchema::string("English summary of the issue."),
    );

    FunctionDeclaration {
        name: LOG_COMPLAINT.to_owned(),
        description: "Logs a formal municipal complaint into the database.".to_owned(),
        parameters: ParameterSchema {
            kind: "OBJECT".to_owned(),
            properties,
            required: REQUIRED_FIELDS.iter().map(|f| (*f).to_owned()).collect(),
        },
    }
}

/// Arguments of one `log_complaint` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplaintArgs {
    pub category: String,
    pub location: String,
    pub description: String,
    pub severity: Severity,
    pub impact_details: String,
    pub conversation_summary: String,
    pub phone_number: Option<String>,
    pub language_used: Option<String>,
}

fn field(args: &Map<String, Value>, name: &str) -> Option<String> {
    match args.get(name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ComplaintArgs {
    /// Strict parse against the declared schema.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ToolValidation`] naming every missing required
    /// field, or an unknown severity.
    pub fn from_arguments(args: &Map<String, Value>) -> Result<Self> {
        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| field(args, f).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(SessionError::ToolValidation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        let raw_severity = field(args, "severity").unwrap_or_default();
        let severity = Severity::parse(&raw_severity).ok_or_else(|| {
            SessionError::ToolValidation(format!("unknown severity '{raw_severity}'"))
        })?;
        Ok(Self::lenient(args).with_severity(severity))
    }

    /// Best-effort parse substituting defaults for missing fields.
    pub fn lenient(args: &Map<String, Value>) -> Self {
        let get = |name: &str| field(args, name).unwrap_or_else(|| "Unspecified".to_owned());
        let conversation_summary = get("conversation_summary");
        Self {
            category: get("category"),
            location: get("location"),
            description: field(args, "description")
                .unwrap_or_else(|| conversation_summary.clone()),
            severity: field(args, "severity")
                .and_then(|s| Severity::parse(&s))
                .unwrap_or(Severity::Medium),
            impact_details: get("impact_details"),
            conversation_summary,
            phone_number: field(args, "phone_number"),
            language_used: field(args, "language_used"),
        }
    }

    fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    fn into_ticket(self, id: String) -> Ticket {
        Ticket {
            id,
            category: self.category,
            location: self.location,
            severity: self.severity,
            // The dashboard shows the English summary, not the caller's wording.
            description: self.conversation_summary,
            status: TicketStatus::Open,
            created_at: Utc::now(),
            impact: self.impact_details,
            contact: self.phone_number,
            language: self.language_used,
        }
    }
}

/// Acknowledgements and tickets produced by one tool-call batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// One response per newly handled invocation, in received order.
    pub responses: Vec<FunctionResponse>,
    /// Ids of tickets created by this batch.
    pub tickets: Vec<String>,
}

/// Maps tool invocations onto ticket-store mutations.
pub struct ToolBridge {
    store: TicketStore,
    ids: TicketIdGenerator,
    acknowledged: HashSet<String>,
}

impl ToolBridge {
    pub fn new(store: TicketStore, ids: TicketIdGenerator) -> Self {
        Self {
            store,
            ids,
            acknowledged: HashSet::new(),
        }
    }

    pub fn store(&self) -> &TicketStore {
        &self.store
    }

    pub fn is_acknowledged(&self, invocation_id: &str) -> bool {
        self.acknowledged.contains(invocation_id)
    }

    /// Handle every invocation in order, skipping ids already acknowledged.
    pub fn handle_batch(&mut self, invocations: &[ToolInvocation]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for invocation in invocations {
            if !invocation.id.is_empty() && self.acknowledged.contains(&invocation.id) {
                info!(invocation = %invocation.id, "ignoring replayed tool invocation");
                continue;
            }
            let (response, ticket) = self.handle(invocation);
            if !invocation.id.is_empty() {
                self.acknowledged.insert(invocation.id.clone());
            }
            outcome.responses.push(FunctionResponse {
                id: invocation.id.clone(),
                name: invocation.name.clone(),
                response,
            });
            outcome.tickets.extend(ticket);
        }
        outcome
    }

    fn handle(&self, invocation: &ToolInvocation) -> (Value, Option<String>) {
        if invocation.name != LOG_COMPLAINT {
            warn!(invocation = %invocation.id, name = %invocation.name, "unknown tool invoked");
            return (
                json!({"result": "error", "error": format!("unknown tool '{}'", invocation.name)}),
                None,
            );
        }

        let args = match ComplaintArgs::from_arguments(&invocation.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(invocation = %invocation.id, "{e}; substituting defaults");
                ComplaintArgs::lenient(&invocation.arguments)
            }
        };

        let id = self.ids.next_id(&self.store);
        let ticket = args.into_ticket(id.clone());
        info!(
            invocation = %invocation.id,
            ticket = %id,
            category = %ticket.category,
            severity = %ticket.severity,
            "ticket logged"
        );
        self.store.prepend(ticket);
        (json!({"result": "success", "ticketId": id}), Some(id))
    }
}
