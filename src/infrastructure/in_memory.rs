use crate::domain::audit::AuditEntry;
use crate::domain::credential::Credential;
use crate::domain::event::{DedupRecord, Delivery, InsertOutcome, TransactionEvent};
use crate::domain::ports::{
    AuditSink, CredentialStore, DedupLedger, EventEffect, EventPublisher, EventSubscriber, Pager,
    ProcessorClient, ProcessorClientBox, ProcessorConnector,
};
use crate::domain::processor::{IdempotencyToken, Outcome, ProcessorIdentity};
use crate::domain::transaction::{Amount, TransactionId};
use crate::domain::verdict::ErrorVerdict;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A thread-safe in-memory dedup ledger.
///
/// Check-and-insert runs under the map shard's write lock, so concurrent
/// duplicates race on a single atomic step. `Clone` shares the underlying
/// map, which lets several consumer instances use the same ledger.
#[derive(Default, Clone)]
pub struct InMemoryDedupLedger {
    records: Arc<DashMap<String, DedupRecord>>,
}

impl InMemoryDedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DedupLedger for InMemoryDedupLedger {
    async fn try_insert(&self, record: DedupRecord) -> Result<InsertOutcome> {
        match self.records.entry(record.key()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyPresent),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn contains(&self, transaction_id: &TransactionId, event_type: &str) -> Result<bool> {
        let key = DedupRecord::key_for(transaction_id, event_type);
        Ok(self.records.contains_key(&key))
    }
}

/// Credential store that issues credentials on first request and rotates
/// only when told to, like an out-of-band rotation job.
pub struct InMemoryCredentialStore {
    rotation_period: chrono::Duration,
    current: Mutex<HashMap<ProcessorIdentity, Credential>>,
    unreachable: Mutex<HashSet<ProcessorIdentity>>,
    fetches: Mutex<HashMap<ProcessorIdentity, u64>>,
    generation: AtomicU64,
}

impl InMemoryCredentialStore {
    pub fn new(rotation_period: chrono::Duration) -> Self {
        Self {
            rotation_period,
            current: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            fetches: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn issue(&self, processor: ProcessorIdentity, issued_at: chrono::DateTime<Utc>) -> Credential {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        Credential::issue(
            processor,
            format!("{processor}-secret-{generation}"),
            issued_at,
            self.rotation_period,
        )
    }

    pub fn rotate(&self, processor: ProcessorIdentity) {
        let fresh = self.issue(processor, Utc::now());
        self.current.lock().insert(processor, fresh);
    }

    /// Replaces the current credential with one whose window has passed.
    pub fn issue_expired(&self, processor: ProcessorIdentity) {
        let stale = self.issue(processor, Utc::now() - self.rotation_period * 2);
        self.current.lock().insert(processor, stale);
    }

    pub fn set_unreachable(&self, processor: ProcessorIdentity, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(processor);
        } else {
            set.remove(&processor);
        }
    }

    pub fn fetches(&self, processor: ProcessorIdentity) -> u64 {
        self.fetches.lock().get(&processor).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_current(&self, processor: ProcessorIdentity) -> Result<Credential> {
        *self.fetches.lock().entry(processor).or_insert(0) += 1;
        if self.unreachable.lock().contains(&processor) {
            return Err(PaymentError::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("credential store unreachable for {processor}"),
            )));
        }
        let mut current = self.current.lock();
        if let Some(credential) = current.get(&processor) {
            return Ok(credential.clone());
        }
        let credential = self.issue(processor, Utc::now());
        current.insert(processor, credential.clone());
        Ok(credential)
    }
}

/// Audit sink that keeps entries in memory.
#[derive(Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::IoError(io::Error::other("audit sink unavailable")));
        }
        self.entries.lock().push(entry);
        Ok(())
    }
}

/// Pager that records every page instead of waking anyone up.
#[derive(Default)]
pub struct RecordingPager {
    pages: Mutex<Vec<ErrorVerdict>>,
}

impl RecordingPager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages(&self) -> Vec<ErrorVerdict> {
        self.pages.lock().clone()
    }
}

impl Pager for RecordingPager {
    fn page(&self, verdict: &ErrorVerdict) {
        self.pages.lock().push(verdict.clone());
    }
}

/// Ledger write side effect that records applied events.
#[derive(Default, Clone)]
pub struct LedgerEffect {
    applied: Arc<Mutex<Vec<TransactionEvent>>>,
    failing: Arc<AtomicBool>,
}

impl LedgerEffect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<TransactionEvent> {
        self.applied.lock().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventEffect for LedgerEffect {
    async fn apply(&self, event: &TransactionEvent) -> Result<()> {
        tokio::task::yield_now().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::SideEffect(format!(
                "ledger write rejected for {}",
                event.transaction_id
            )));
        }
        self.applied.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<UnboundedSender<Delivery>>,
    next_subscriber: usize,
    backlog: Vec<Delivery>,
}

/// At-least-once channel held in memory.
///
/// Each published event is delivered to one subscriber of its topic
/// (round-robin across subscribers) and stays unacknowledged until `ack`.
/// `redeliver_unacked` puts every unacknowledged event back on the wire
/// under a new delivery id, the way a broker does after a visibility
/// timeout.
#[derive(Default)]
pub struct InMemoryEventChannel {
    topics: Mutex<HashMap<String, TopicState>>,
    unacked: Mutex<BTreeMap<u64, (String, TransactionEvent)>>,
    published: Mutex<Vec<TransactionEvent>>,
    next_delivery_id: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn dispatch(&self, topic: &str, event: TransactionEvent) {
        let delivery_id = self.next_delivery_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.unacked
            .lock()
            .insert(delivery_id, (topic.to_string(), event.clone()));
        let delivery = Delivery { delivery_id, event };

        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.subscribers.retain(|s| !s.is_closed());
        if state.subscribers.is_empty() {
            state.backlog.push(delivery);
            return;
        }
        let idx = state.next_subscriber % state.subscribers.len();
        state.next_subscriber = state.next_subscriber.wrapping_add(1);
        if let Err(err) = state.subscribers[idx].unbounded_send(delivery) {
            state.backlog.push(err.into_inner());
        }
    }

    /// Re-sends every unacknowledged event. Returns how many were re-sent.
    pub fn redeliver_unacked(&self) -> usize {
        let pending = std::mem::take(&mut *self.unacked.lock());
        let count = pending.len();
        for (_, (topic, event)) in pending {
            self.dispatch(&topic, event);
        }
        count
    }

    /// Ends every subscription stream once its buffered deliveries drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for state in self.topics.lock().values_mut() {
            state.subscribers.clear();
        }
    }

    pub fn published(&self) -> Vec<TransactionEvent> {
        self.published.lock().clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventChannel {
    async fn publish(&self, topic: &str, event: TransactionEvent) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PaymentError::EventChannel("channel closed".to_string()));
        }
        self.published.lock().push(event.clone());
        self.dispatch(topic, event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for InMemoryEventChannel {
    /// Subscribing after `close` still hands out the backlog; the stream
    /// then ends.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Delivery>> {
        let (tx, rx) = unbounded();
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        for delivery in state.backlog.drain(..) {
            // Receiver is alive in this scope.
            let _ = tx.unbounded_send(delivery);
        }
        if !self.closed.load(Ordering::SeqCst) {
            state.subscribers.push(tx);
        }
        Ok(rx.boxed())
    }

    async fn ack(&self, delivery_id: u64) -> Result<()> {
        self.unacked.lock().remove(&delivery_id);
        Ok(())
    }
}

/// Script entry meaning "approve".
pub const SCRIPT_APPROVE: &str = "OK";
/// Script entry meaning "the call timed out".
pub const SCRIPT_TIMEOUT: &str = "TIMEOUT";

/// A processor call observed by [`ScriptedProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorCall {
    pub processor: ProcessorIdentity,
    pub token: IdempotencyToken,
    pub at: tokio::time::Instant,
}

#[derive(Default)]
struct ScriptState {
    scripts: DashMap<TransactionId, VecDeque<String>>,
    settled: DashMap<String, Outcome>,
    calls: Mutex<Vec<ProcessorCall>>,
    credentials: Mutex<Vec<Credential>>,
}

/// Simulated processor shared by all three processor identities.
///
/// Replies follow a per-transaction script of codes; an exhausted or missing
/// script approves. Like a real processor it remembers outcomes per
/// idempotency token and replays them for repeated tokens.
#[derive(Default, Clone)]
pub struct ScriptedProcessor {
    state: Arc<ScriptState>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<I, S>(&self, transaction_id: &TransactionId, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.scripts.insert(
            transaction_id.clone(),
            codes.into_iter().map(Into::into).collect(),
        );
    }

    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.state.calls.lock().clone()
    }

    pub fn calls_for(&self, transaction_id: &TransactionId) -> Vec<ProcessorCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.token.transaction_id() == transaction_id)
            .collect()
    }

    pub fn credentials_seen(&self) -> Vec<Credential> {
        self.state.credentials.lock().clone()
    }
}

impl ProcessorConnector for ScriptedProcessor {
    fn connect(&self, processor: ProcessorIdentity, credential: Credential) -> ProcessorClientBox {
        self.state.credentials.lock().push(credential);
        Box::new(ScriptedClient {
            processor,
            state: Arc::clone(&self.state),
        })
    }
}

struct ScriptedClient {
    processor: ProcessorIdentity,
    state: Arc<ScriptState>,
}

impl ScriptedClient {
    fn reply(&self, settle_key: String, token: &IdempotencyToken) -> Result<Outcome> {
        self.state.calls.lock().push(ProcessorCall {
            processor: self.processor,
            token: token.clone(),
            at: tokio::time::Instant::now(),
        });
        if let Some(previous) = self.state.settled.get(&settle_key) {
            return Ok(previous.clone());
        }

        let code = self
            .state
            .scripts
            .get_mut(token.transaction_id())
            .and_then(|mut script| script.pop_front());
        let outcome = match code.as_deref() {
            None | Some(SCRIPT_APPROVE) | Some("") => Outcome::approved(),
            Some(SCRIPT_TIMEOUT) => {
                return Err(PaymentError::IoError(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} timed out", self.processor),
                )));
            }
            Some(code) => Outcome::declined(code),
        };
        self.state.settled.insert(settle_key, outcome.clone());
        Ok(outcome)
    }
}

#[async_trait]
impl ProcessorClient for ScriptedClient {
    fn processor(&self) -> ProcessorIdentity {
        self.processor
    }

    async fn charge(
        &self,
        _amount: Amount,
        _currency: &str,
        _instrument: &str,
        idempotency_token: &IdempotencyToken,
    ) -> Result<Outcome> {
        self.reply(format!("charge:{idempotency_token}"), idempotency_token)
    }

    async fn refund(
        &self,
        _amount: Amount,
        _currency: &str,
        _reference: &TransactionId,
        idempotency_token: &IdempotencyToken,
    ) -> Result<Outcome> {
        self.reply(format!("refund:{idempotency_token}"), idempotency_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{EventPayload, EventType};
    use rust_decimal_macros::dec;

    fn event(tx: &str) -> TransactionEvent {
        TransactionEvent::new(
            TransactionId::new(tx),
            EventType::Succeeded,
            EventPayload {
                processor: ProcessorIdentity::Primary,
                attempt_count: 1,
                code: None,
            },
        )
    }

    #[tokio::test]
    async fn test_in_memory_dedup_ledger() {
        let ledger = InMemoryDedupLedger::new();
        let e = event("tx_1");
        assert_eq!(
            ledger.try_insert(DedupRecord::for_event(&e)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            ledger.try_insert(DedupRecord::for_event(&e)).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert!(
            ledger
                .contains(&TransactionId::new("tx_1"), "succeeded")
                .await
                .unwrap()
        );
        assert!(
            !ledger
                .contains(&TransactionId::new("tx_1"), "failed")
                .await
                .unwrap()
        );
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_credential_store_issues_once_until_rotated() {
        let store = InMemoryCredentialStore::new(chrono::Duration::days(30));
        let first = store.get_current(ProcessorIdentity::Primary).await.unwrap();
        let again = store.get_current(ProcessorIdentity::Primary).await.unwrap();
        assert_eq!(first, again);

        store.rotate(ProcessorIdentity::Primary);
        let rotated = store.get_current(ProcessorIdentity::Primary).await.unwrap();
        assert_ne!(first.secret_material, rotated.secret_material);
        assert_eq!(store.fetches(ProcessorIdentity::Primary), 3);

        store.set_unreachable(ProcessorIdentity::Primary, true);
        assert!(store.get_current(ProcessorIdentity::Primary).await.is_err());
    }

    #[tokio::test]
    async fn test_event_channel_redelivers_unacked() {
        let channel = InMemoryEventChannel::new();
        channel.publish("t", event("tx_1")).await.unwrap();
        channel.publish("t", event("tx_2")).await.unwrap();

        let mut stream = channel.subscribe("t").await.unwrap();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        channel.ack(first.delivery_id).await.unwrap();
        assert_eq!(channel.unacked_count(), 1);

        assert_eq!(channel.redeliver_unacked(), 1);
        let again = stream.next().await.unwrap();
        assert_eq!(again.event, second.event);
        assert_ne!(again.delivery_id, second.delivery_id);

        channel.close();
        assert!(stream.next().await.is_none());
        assert!(channel.publish("t", event("tx_3")).await.is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_drains_backlog_after_close() {
        let channel = InMemoryEventChannel::new();
        channel.publish("t", event("tx_1")).await.unwrap();
        channel.close();

        let deliveries: Vec<Delivery> = channel.subscribe("t").await.unwrap().collect().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].event.transaction_id, TransactionId::new("tx_1"));
    }

    #[tokio::test]
    async fn test_scripted_processor_replays_per_token() {
        let processor = ScriptedProcessor::new();
        let tx_id = TransactionId::new("tx_1");
        processor.script(&tx_id, ["PE-503", SCRIPT_TIMEOUT]);
        let credential = Credential::issue(
            ProcessorIdentity::Primary,
            "s",
            Utc::now(),
            chrono::Duration::days(1),
        );
        let client = processor.connect(ProcessorIdentity::Primary, credential);
        let amount = Amount::new(dec!(1)).unwrap();

        let token = IdempotencyToken::derive(&tx_id, 1);
        let first = client.charge(amount, "USD", "card", &token).await.unwrap();
        assert_eq!(first, Outcome::declined("PE-503"));
        // Same token: processor answers from its own record.
        let replay = client.charge(amount, "USD", "card", &token).await.unwrap();
        assert_eq!(replay, first);

        let token2 = IdempotencyToken::derive(&tx_id, 2);
        assert!(client.charge(amount, "USD", "card", &token2).await.is_err());
        let token3 = IdempotencyToken::derive(&tx_id, 3);
        assert!(client.charge(amount, "USD", "card", &token3).await.unwrap().success);
        assert_eq!(processor.calls_for(&tx_id).len(), 4);
    }
}
