use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique transaction identifier, assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    #[default]
    Submitted,
    Succeeded,
    Failed,
    Exhausted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment transaction.
///
/// Identity, amount, currency and destination are fixed at creation. Only
/// `state` and `attempt_count` change, and only the retry controller
/// increments `attempt_count`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub amount: Amount,
    pub currency: String,
    pub destination_country: String,
    /// Opaque payment instrument reference handed to the processor.
    pub instrument: String,
    #[serde(default)]
    pub state: TransactionState,
    #[serde(default)]
    pub attempt_count: u32,
}

impl Transaction {
    pub fn new(
        transaction_id: TransactionId,
        amount: Amount,
        currency: impl Into<String>,
        destination_country: impl Into<String>,
        instrument: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            amount,
            currency: currency.into(),
            destination_country: destination_country.into(),
            instrument: instrument.into(),
            state: TransactionState::Submitted,
            attempt_count: 0,
        }
    }
}
