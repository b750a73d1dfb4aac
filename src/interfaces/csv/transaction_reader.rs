use crate::domain::account::{AccountId, AccountTier, CustomerAccount};
use crate::domain::transaction::{Amount, Transaction, TransactionId};
use crate::error::{PaymentError, Result};
use serde::Deserialize;
use std::io::Read;

/// Separator between scripted processor replies in the `outcomes` column.
pub const OUTCOME_SEPARATOR: char = ';';

/// One payment initiation row.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct PaymentRequest {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    #[serde(default)]
    pub tier: AccountTier,
    pub amount: Amount,
    pub currency: String,
    pub destination_country: String,
    #[serde(default)]
    pub instrument: String,
    /// Replies the simulated processor gives, in attempt order.
    #[serde(default)]
    pub outcomes: String,
}

impl PaymentRequest {
    pub fn transaction(&self) -> Transaction {
        Transaction::new(
            self.transaction_id.clone(),
            self.amount,
            self.currency.clone(),
            self.destination_country.clone(),
            self.instrument.clone(),
        )
    }

    pub fn account(&self) -> CustomerAccount {
        CustomerAccount::new(self.account_id.clone(), self.tier)
    }

    pub fn scripted_outcomes(&self) -> Vec<String> {
        self.outcomes
            .split(OUTCOME_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Reads payment requests from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<PaymentRequest>`.
/// It handles whitespace trimming and flexible record lengths automatically.
pub struct TransactionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransactionReader<R> {
    /// Creates a new `TransactionReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes requests.
    pub fn requests(self) -> impl Iterator<Item = Result<PaymentRequest>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
