use crate::domain::processor::ProcessorIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultClass {
    CustomerFault,
    ProcessorFault,
    InternalFault,
}

impl FaultClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerFault => "customer-fault",
            Self::ProcessorFault => "processor-fault",
            Self::InternalFault => "internal-fault",
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed outcome. `retryable` is derived from the class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorVerdict {
    pub class: FaultClass,
    pub code: String,
}

impl ErrorVerdict {
    pub fn new(class: FaultClass, code: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self.class, FaultClass::ProcessorFault)
    }

    pub fn pages_operator(&self) -> bool {
        matches!(self.class, FaultClass::InternalFault)
    }
}

/// Something that went wrong during an attempt, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutcome {
    /// The processor answered with a non-success code.
    Declined {
        processor: ProcessorIdentity,
        code: String,
    },
    /// The processor could not be reached or timed out mid-call.
    ProcessorUnreachable { processor: ProcessorIdentity },
    /// The gate had no token for the processor.
    RateExceeded { processor: ProcessorIdentity },
    /// No valid credential could be produced for the processor.
    CredentialUnavailable { processor: ProcessorIdentity },
    /// Platform infrastructure (dedup store, event channel, audit trail) failed.
    Infrastructure { component: String, detail: String },
}
