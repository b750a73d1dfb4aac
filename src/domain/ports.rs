use super::audit::AuditEntry;
use super::credential::Credential;
use super::event::{DedupRecord, Delivery, InsertOutcome, TransactionEvent};
use super::processor::{IdempotencyToken, Outcome, ProcessorIdentity};
use super::transaction::{Amount, TransactionId};
use super::verdict::ErrorVerdict;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Charge/refund capability of one external processor.
///
/// An `Err` means the call itself failed (transport, timeout). A processor
/// that answered, even with a decline, returns `Ok(Outcome)`.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    fn processor(&self) -> ProcessorIdentity;

    async fn charge(
        &self,
        amount: Amount,
        currency: &str,
        instrument: &str,
        idempotency_token: &IdempotencyToken,
    ) -> Result<Outcome>;

    async fn refund(
        &self,
        amount: Amount,
        currency: &str,
        reference: &TransactionId,
        idempotency_token: &IdempotencyToken,
    ) -> Result<Outcome>;
}

/// Builds a raw client for a processor bound to a specific credential.
pub trait ProcessorConnector: Send + Sync {
    fn connect(&self, processor: ProcessorIdentity, credential: Credential) -> ProcessorClientBox;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_current(&self, processor: ProcessorIdentity) -> Result<Credential>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;
}

pub trait Pager: Send + Sync {
    fn page(&self, verdict: &ErrorVerdict);
}

/// Durable record of processed (transaction, event type) pairs.
#[async_trait]
pub trait DedupLedger: Send + Sync {
    /// Inserts the record unless one with the same key exists, as a single
    /// atomic operation against the backing store.
    async fn try_insert(&self, record: DedupRecord) -> Result<InsertOutcome>;
    async fn contains(&self, transaction_id: &TransactionId, event_type: &str) -> Result<bool>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: TransactionEvent) -> Result<()>;
}

/// Consumer side of an at-least-once channel.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Delivery>>;
    async fn ack(&self, delivery_id: u64) -> Result<()>;
}

/// Downstream side effect (ledger write, billing trigger) for an event.
#[async_trait]
pub trait EventEffect: Send + Sync {
    async fn apply(&self, event: &TransactionEvent) -> Result<()>;
}

pub type ProcessorClientBox = Box<dyn ProcessorClient>;
pub type ProcessorConnectorRef = Arc<dyn ProcessorConnector>;
pub type CredentialStoreRef = Arc<dyn CredentialStore>;
pub type AuditSinkRef = Arc<dyn AuditSink>;
pub type PagerRef = Arc<dyn Pager>;
pub type DedupLedgerBox = Box<dyn DedupLedger>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;
pub type EventSubscriberRef = Arc<dyn EventSubscriber>;
pub type EventEffectBox = Box<dyn EventEffect>;
