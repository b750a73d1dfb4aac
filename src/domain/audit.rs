use crate::domain::account::AccountId;
use crate::domain::processor::ProcessorIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the gate handed out a client for a given processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionReason {
    /// The routed processor was used as-is.
    Selected,
    /// The routed processor could not serve the attempt and its fallback was used.
    FallbackSubstituted {
        original: ProcessorIdentity,
        cause: String,
    },
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selected => f.write_str("selected"),
            Self::FallbackSubstituted { original, cause } => {
                write!(f, "fallback from {original}: {cause}")
            }
        }
    }
}

/// One line of the acquisition audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub processor: ProcessorIdentity,
    pub account_id: AccountId,
    pub decision_reason: DecisionReason,
}

impl AuditEntry {
    pub fn new(
        processor: ProcessorIdentity,
        account_id: AccountId,
        decision_reason: DecisionReason,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            processor,
            account_id,
            decision_reason,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.decision_reason, DecisionReason::FallbackSubstituted { .. })
    }
}
