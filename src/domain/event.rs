use crate::domain::processor::ProcessorIdentity;
use crate::domain::transaction::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic on which transaction state changes are published.
pub const TRANSACTION_STATE_TOPIC: &str = "transaction-state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    Submitted,
    Retried { attempt: u32 },
    Succeeded,
    Failed,
    Exhausted,
}

impl EventType {
    /// Key used by the dedup ledger. Each retry is its own logical event.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Submitted => "submitted".to_string(),
            Self::Retried { attempt } => format!("retried#{attempt}"),
            Self::Succeeded => "succeeded".to_string(),
            Self::Failed => "failed".to_string(),
            Self::Exhausted => "exhausted".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub processor: ProcessorIdentity,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: TransactionId,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(transaction_id: TransactionId, event_type: EventType, payload: EventPayload) -> Self {
        Self {
            transaction_id,
            event_type,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// One delivery of an event by the channel. The same event may be
/// delivered several times under different delivery ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub event: TransactionEvent,
}

/// Append-only proof that a (transaction, event type) pair was processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub transaction_id: TransactionId,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

impl DedupRecord {
    pub fn for_event(event: &TransactionEvent) -> Self {
        Self {
            transaction_id: event.transaction_id.clone(),
            event_type: event.event_type.dedup_key(),
            processed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.transaction_id, &self.event_type)
    }

    pub fn key_for(transaction_id: &TransactionId, event_type: &str) -> String {
        format!("{transaction_id}\u{1f}{event_type}")
    }
}

/// Result of an atomic check-and-insert against the dedup ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Side effects were applied for the first time.
    Applied,
    /// A previous delivery already applied them.
    Duplicate,
}
