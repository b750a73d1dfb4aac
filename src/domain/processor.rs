use crate::domain::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of processors a transaction can be routed to.
///
/// String names exist only at the serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorIdentity {
    Primary,
    RegionalSecondary,
    LegacyContracted,
}

impl ProcessorIdentity {
    pub const ALL: [ProcessorIdentity; 3] = [
        ProcessorIdentity::Primary,
        ProcessorIdentity::RegionalSecondary,
        ProcessorIdentity::LegacyContracted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::RegionalSecondary => "regional-secondary",
            Self::LegacyContracted => "legacy-contracted",
        }
    }
}

impl fmt::Display for ProcessorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown processor: {s}"))
    }
}

/// Token handed to the processor so that a redelivered attempt is also
/// deduplicated on the processor side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken {
    transaction_id: TransactionId,
    attempt: u32,
}

impl IdempotencyToken {
    pub fn derive(transaction_id: &TransactionId, attempt: u32) -> Self {
        Self {
            transaction_id: transaction_id.clone(),
            attempt,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.attempt)
    }
}

/// What a processor reported for a charge or refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub processor_code: String,
}

impl Outcome {
    pub fn approved() -> Self {
        Self {
            success: true,
            processor_code: "OK".to_string(),
        }
    }

    pub fn declined(code: impl Into<String>) -> Self {
        Self {
            success: false,
            processor_code: code.into(),
        }
    }
}
