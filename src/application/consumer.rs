//! Idempotent consumer for transaction-state events.
//!
//! The channel delivers at least once and without ordering across
//! transactions. Before any side effect the consumer inserts a
//! [`DedupRecord`] for `(transaction_id, event_type)` through the ledger's
//! atomic check-and-insert. Only the delivery that wins the insert applies
//! the side effect; every other delivery of the same pair is acknowledged as
//! a duplicate. Records are never removed, so a delivery that fails to ack
//! is seen as done when redelivered.

use super::classifier::ErrorClassifier;
use crate::domain::event::{Ack, DedupRecord, InsertOutcome, TransactionEvent};
use crate::domain::ports::{DedupLedgerBox, EventEffectBox, EventSubscriber};
use crate::domain::verdict::RawOutcome;
use crate::error::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Counters for one `run` of the consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

impl ConsumerStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct IdempotentEventConsumer {
    ledger: DedupLedgerBox,
    effect: EventEffectBox,
    classifier: Arc<ErrorClassifier>,
}

impl IdempotentEventConsumer {
    pub fn new(
        ledger: DedupLedgerBox,
        effect: EventEffectBox,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            ledger,
            effect,
            classifier,
        }
    }

    /// Processes one delivery. Safe to call concurrently, including for
    /// duplicates of the same event.
    ///
    /// If the side effect fails after the record was inserted, the record is
    /// kept, the operator is paged and an error is returned. Every later
    /// delivery of that event is acked as [`Ack::Duplicate`] without running
    /// the effect, so the effect has to be replayed by hand after the page.
    pub async fn handle(&self, event: &TransactionEvent) -> Result<Ack> {
        let record = DedupRecord::for_event(event);
        let outcome = match self.ledger.try_insert(record).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.classifier.classify(&RawOutcome::Infrastructure {
                    component: "dedup-ledger".to_string(),
                    detail: err.to_string(),
                });
                return Err(err);
            }
        };

        match outcome {
            InsertOutcome::AlreadyPresent => {
                debug!(
                    transaction_id = %event.transaction_id,
                    event_type = %event.event_type.dedup_key(),
                    "Duplicate delivery skipped"
                );
                Ok(Ack::Duplicate)
            }
            InsertOutcome::Inserted => {
                if let Err(err) = self.effect.apply(event).await {
                    // The record stays: redelivery must not re-apply.
                    self.classifier.classify(&RawOutcome::Infrastructure {
                        component: "event-side-effect".to_string(),
                        detail: format!(
                            "{} {}: {err}",
                            event.transaction_id,
                            event.event_type.dedup_key()
                        ),
                    });
                    return Err(err);
                }
                Ok(Ack::Applied)
            }
        }
    }

    /// Whether a dedup record exists for the event's
    /// `(transaction_id, event_type)` pair. A recorded event is never applied
    /// again by [`handle`](Self::handle).
    pub async fn is_recorded(&self, event: &TransactionEvent) -> Result<bool> {
        self.ledger
            .contains(&event.transaction_id, &event.event_type.dedup_key())
            .await
    }

    /// Drains a subscription until the channel closes, handling up to
    /// `concurrency` deliveries at once. Deliveries that fail are left
    /// unacknowledged for redelivery.
    pub async fn run(
        &self,
        subscriber: &dyn EventSubscriber,
        topic: &str,
        concurrency: usize,
    ) -> Result<ConsumerStats> {
        let stats = ConsumerStats::default();
        let deliveries = subscriber.subscribe(topic).await?;

        deliveries
            .for_each_concurrent(concurrency.max(1), |delivery| {
                let stats = &stats;
                async move {
                    match self.handle(&delivery.event).await {
                        Ok(ack) => {
                            match ack {
                                Ack::Applied => stats.applied.fetch_add(1, Ordering::Relaxed),
                                Ack::Duplicate => {
                                    stats.duplicates.fetch_add(1, Ordering::Relaxed)
                                }
                            };
                            if let Err(err) = subscriber.ack(delivery.delivery_id).await {
                                warn!(
                                    delivery_id = delivery.delivery_id,
                                    error = %err,
                                    "Ack failed; delivery will be redelivered"
                                );
                            }
                        }
                        Err(err) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                delivery_id = delivery.delivery_id,
                                transaction_id = %delivery.event.transaction_id,
                                error = %err,
                                "Event handling failed"
                            );
                        }
                    }
                }
            })
            .await;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::classifier::CodeTable;
    use crate::domain::event::{EventPayload, EventType};
    use crate::domain::processor::ProcessorIdentity;
    use crate::domain::transaction::TransactionId;
    use crate::infrastructure::in_memory::{
        InMemoryDedupLedger, LedgerEffect, RecordingPager,
    };

    fn event(tx: &str, event_type: EventType) -> TransactionEvent {
        TransactionEvent::new(
            TransactionId::new(tx),
            event_type,
            EventPayload {
                processor: ProcessorIdentity::Primary,
                attempt_count: 1,
                code: None,
            },
        )
    }

    fn consumer(effect: LedgerEffect, pager: Arc<RecordingPager>) -> IdempotentEventConsumer {
        let classifier = Arc::new(ErrorClassifier::new(CodeTable::default(), pager));
        IdempotentEventConsumer::new(
            Box::new(InMemoryDedupLedger::new()),
            Box::new(effect),
            classifier,
        )
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let effect = LedgerEffect::new();
        let consumer = consumer(effect.clone(), Arc::new(RecordingPager::new()));
        let e = event("tx_1", EventType::Succeeded);

        assert_eq!(consumer.handle(&e).await.unwrap(), Ack::Applied);
        assert_eq!(consumer.handle(&e).await.unwrap(), Ack::Duplicate);
        assert_eq!(effect.applied_count(), 1);
        assert!(consumer.is_recorded(&e).await.unwrap());
        assert!(
            !consumer
                .is_recorded(&event("tx_1", EventType::Failed))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_distinct_event_types_each_apply() {
        let effect = LedgerEffect::new();
        let consumer = consumer(effect.clone(), Arc::new(RecordingPager::new()));
        consumer.handle(&event("tx_1", EventType::Submitted)).await.unwrap();
        consumer
            .handle(&event("tx_1", EventType::Retried { attempt: 2 }))
            .await
            .unwrap();
        consumer
            .handle(&event("tx_1", EventType::Retried { attempt: 3 }))
            .await
            .unwrap();
        consumer.handle(&event("tx_1", EventType::Succeeded)).await.unwrap();
        assert_eq!(effect.applied_count(), 4);
    }

    #[tokio::test]
    async fn test_failed_side_effect_keeps_record_and_pages() {
        let effect = LedgerEffect::new();
        effect.set_failing(true);
        let pager = Arc::new(RecordingPager::new());
        let consumer = consumer(effect.clone(), pager.clone());
        let e = event("tx_1", EventType::Succeeded);

        assert!(!consumer.is_recorded(&e).await.unwrap());
        assert!(consumer.handle(&e).await.is_err());
        assert_eq!(pager.pages().len(), 1);
        assert!(consumer.is_recorded(&e).await.unwrap());

        effect.set_failing(false);
        assert_eq!(consumer.handle(&e).await.unwrap(), Ack::Duplicate);
        assert_eq!(effect.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_apply_once() {
        let effect = LedgerEffect::new();
        let consumer = Arc::new(consumer(effect.clone(), Arc::new(RecordingPager::new())));
        let e = event("tx_1", EventType::Succeeded);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let consumer = consumer.clone();
            let e = e.clone();
            handles.push(tokio::spawn(async move { consumer.handle(&e).await.unwrap() }));
        }
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() == Ack::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(effect.applied_count(), 1);
    }
}
