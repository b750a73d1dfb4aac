use crate::domain::processor::ProcessorIdentity;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Secret material for one processor, valid for a fixed rotation window.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub processor: ProcessorIdentity,
    pub secret_material: String,
    pub issued_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl Credential {
    pub fn issue(
        processor: ProcessorIdentity,
        secret_material: impl Into<String>,
        issued_at: DateTime<Utc>,
        rotation_period: Duration,
    ) -> Self {
        Self {
            processor,
            secret_material: secret_material.into(),
            issued_at,
            valid_until: issued_at + rotation_period,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("processor", &self.processor)
            .field("secret_material", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("valid_until", &self.valid_until)
            .finish()
    }
}
