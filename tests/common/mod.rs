#![allow(dead_code)]

use payrouter::application::classifier::{CodeTable, ErrorClassifier};
use payrouter::application::engine::PaymentRouter;
use payrouter::application::gate::{BudgetSpec, CredentialGate};
use payrouter::application::retry::{RetryController, RetryPolicy};
use payrouter::application::routing::{RoutingResolver, RoutingTable};
use payrouter::domain::account::{AccountId, CustomerAccount};
use payrouter::domain::processor::ProcessorIdentity;
use payrouter::domain::transaction::{Amount, Transaction, TransactionId};
use payrouter::infrastructure::in_memory::{
    InMemoryAuditSink, InMemoryCredentialStore, InMemoryEventChannel, RecordingPager,
    ScriptedProcessor,
};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const LEGACY_ACCOUNT: &str = "acc_legcy_0012";
pub const RESTRICTED_COUNTRY: &str = "TH";

/// A fully wired router over in-memory adapters, with handles on every
/// adapter so tests can script and inspect them.
pub struct Harness {
    pub router: PaymentRouter,
    pub processor: ScriptedProcessor,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub pager: Arc<RecordingPager>,
    pub channel: Arc<InMemoryEventChannel>,
    pub gate: Arc<CredentialGate>,
}

pub struct HarnessBuilder {
    delay: Duration,
    max_retries: u32,
    budgets: HashMap<ProcessorIdentity, BudgetSpec>,
    fallbacks: HashMap<ProcessorIdentity, ProcessorIdentity>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_retries: 2,
            budgets: HashMap::new(),
            fallbacks: HashMap::new(),
        }
    }
}

impl HarnessBuilder {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn budget(mut self, processor: ProcessorIdentity, capacity: u64, refill_per_sec: f64) -> Self {
        self.budgets
            .insert(processor, BudgetSpec::new(capacity, refill_per_sec));
        self
    }

    pub fn fallback(mut self, from: ProcessorIdentity, to: ProcessorIdentity) -> Self {
        self.fallbacks.insert(from, to);
        self
    }

    pub fn build(self) -> Harness {
        let processor = ScriptedProcessor::new();
        let credentials = Arc::new(InMemoryCredentialStore::new(chrono::Duration::days(30)));
        let audit = Arc::new(InMemoryAuditSink::new());
        let pager = Arc::new(RecordingPager::new());
        let channel = Arc::new(InMemoryEventChannel::new());

        let classifier = Arc::new(ErrorClassifier::new(CodeTable::default(), pager.clone()));
        let gate = Arc::new(CredentialGate::new(
            self.budgets,
            self.fallbacks,
            credentials.clone(),
            Arc::new(processor.clone()),
            audit.clone(),
        ));
        let controller = RetryController::new(
            RetryPolicy::new(self.delay, self.max_retries),
            gate.clone(),
            classifier,
            channel.clone(),
        );
        let table = RoutingTable::new(
            [AccountId::new(LEGACY_ACCOUNT)],
            [RESTRICTED_COUNTRY.to_string()],
        );
        let router = PaymentRouter::new(RoutingResolver::new(table), controller);

        Harness {
            router,
            processor,
            credentials,
            audit,
            pager,
            channel,
            gate,
        }
    }
}

pub fn transaction(id: &str, country: &str) -> Transaction {
    Transaction::new(
        TransactionId::new(id),
        Amount::new(dec!(42.00)).unwrap(),
        "USD",
        country,
        "card_4242",
    )
}

pub fn account(id: &str) -> CustomerAccount {
    CustomerAccount::standard(id)
}

/// Writes a request file where every transaction carries the same script.
pub fn generate_csv(path: &Path, rows: usize, outcomes: &str) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record([
        "transaction_id",
        "account_id",
        "tier",
        "amount",
        "currency",
        "destination_country",
        "instrument",
        "outcomes",
    ])?;

    for i in 1..=rows {
        wtr.write_record([
            format!("tx_{i}").as_str(),
            "acc_1",
            "standard",
            "10.00",
            "USD",
            "US",
            "card_1",
            outcomes,
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
