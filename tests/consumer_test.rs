use futures::future::join_all;
use payrouter::application::classifier::{CodeTable, ErrorClassifier};
use payrouter::application::consumer::IdempotentEventConsumer;
use payrouter::domain::event::{Ack, DedupRecord, TRANSACTION_STATE_TOPIC};
use payrouter::domain::ports::DedupLedger;
use payrouter::domain::transaction::TransactionId;
use payrouter::infrastructure::in_memory::{InMemoryDedupLedger, LedgerEffect, RecordingPager};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::{HarnessBuilder, account, transaction};

/// Runs a handful of transactions so the channel holds a realistic mix of
/// submitted, retried and terminal events.
async fn settle_transactions(harness: &common::Harness, count: usize) {
    for i in 0..count {
        let id = format!("tx_{i}");
        let script: &[&str] = match i % 3 {
            0 => &["OK"],
            1 => &["PE-503", "OK"],
            _ => &["CE-401"],
        };
        harness
            .processor
            .script(&TransactionId::new(id.as_str()), script.iter().copied());
        harness
            .router
            .process(transaction(&id, "US"), &account("acc_1"))
            .await
            .unwrap();
    }
}

fn consumer(ledger: InMemoryDedupLedger, effect: LedgerEffect) -> IdempotentEventConsumer {
    let classifier = Arc::new(ErrorClassifier::new(
        CodeTable::default(),
        Arc::new(RecordingPager::new()),
    ));
    IdempotentEventConsumer::new(Box::new(ledger), Box::new(effect), classifier)
}

#[tokio::test]
async fn test_shuffled_duplicates_apply_exactly_once() {
    let harness = HarnessBuilder::default()
        .delay(Duration::from_millis(1))
        .build();
    settle_transactions(&harness, 9).await;

    let published = harness.channel.published();
    let mut deliveries: Vec<_> = published
        .iter()
        .flat_map(|e| std::iter::repeat_n(e.clone(), 3))
        .collect();
    deliveries.shuffle(&mut rand::thread_rng());

    let ledger = InMemoryDedupLedger::new();
    let effect = LedgerEffect::new();
    let consumer = consumer(ledger.clone(), effect.clone());

    let acks = join_all(deliveries.iter().map(|e| consumer.handle(e))).await;
    let applied = acks
        .iter()
        .filter(|a| matches!(a, Ok(Ack::Applied)))
        .count();
    assert_eq!(applied, published.len());
    assert!(acks.iter().all(|a| a.is_ok()));

    assert_eq!(effect.applied_count(), published.len());
    assert_eq!(ledger.len(), published.len());
    let distinct: HashSet<String> = effect
        .applied()
        .iter()
        .map(|e| DedupRecord::for_event(e).key())
        .collect();
    assert_eq!(distinct.len(), published.len());

    for event in &published {
        assert!(consumer.is_recorded(event).await.unwrap());
    }
}

#[tokio::test]
async fn test_redelivered_events_are_acked_as_duplicates() {
    let harness = HarnessBuilder::default()
        .delay(Duration::from_millis(1))
        .build();
    settle_transactions(&harness, 6).await;
    let published = harness.channel.published().len();

    // Nothing has been consumed yet, so every event goes out twice.
    assert_eq!(harness.channel.redeliver_unacked(), published);

    let effect = LedgerEffect::new();
    let consumer = consumer(InMemoryDedupLedger::new(), effect.clone());
    let channel = harness.channel.clone();

    let drain = async {
        while channel.unacked_count() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        channel.close();
    };
    let (stats, ()) = tokio::join!(
        consumer.run(channel.as_ref(), TRANSACTION_STATE_TOPIC, 4),
        drain
    );
    let stats = stats.unwrap();

    assert_eq!(stats.applied() as usize, published);
    assert_eq!(stats.duplicates() as usize, published);
    assert_eq!(stats.failed(), 0);
    assert_eq!(effect.applied_count(), published);
}

#[tokio::test]
async fn test_failed_side_effect_is_not_reapplied_on_redelivery() {
    let harness = HarnessBuilder::default().build();
    settle_transactions(&harness, 1).await;
    let published = harness.channel.published().len();

    let effect = LedgerEffect::new();
    effect.set_failing(true);
    let pager = Arc::new(RecordingPager::new());
    let classifier = Arc::new(ErrorClassifier::new(CodeTable::default(), pager.clone()));
    let consumer = IdempotentEventConsumer::new(
        Box::new(InMemoryDedupLedger::new()),
        Box::new(effect.clone()),
        classifier,
    );
    let channel = harness.channel.clone();

    let first_pass = async {
        // Failed deliveries stay unacked; wait until each one has been tried.
        while pager.pages().len() < published {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(channel.unacked_count(), published);
        effect.set_failing(false);
        channel.redeliver_unacked();
        while channel.unacked_count() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        channel.close();
    };
    let (stats, ()) = tokio::join!(
        consumer.run(channel.as_ref(), TRANSACTION_STATE_TOPIC, 2),
        first_pass
    );
    let stats = stats.unwrap();

    assert_eq!(stats.failed() as usize, published);
    assert_eq!(stats.duplicates() as usize, published);
    assert_eq!(effect.applied_count(), 0);
}

#[tokio::test]
async fn test_ledger_as_trait_object_is_shared_across_tasks() {
    let ledger = InMemoryDedupLedger::new();
    let shared: Arc<dyn DedupLedger> = Arc::new(ledger.clone());
    let harness = HarnessBuilder::default().build();
    settle_transactions(&harness, 1).await;
    let event = harness.channel.published().remove(0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let shared = shared.clone();
        let record = DedupRecord::for_event(&event);
        handles.push(tokio::spawn(async move { shared.try_insert(record).await.unwrap() }));
    }
    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() == payrouter::domain::event::InsertOutcome::Inserted {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(ledger.len(), 1);
}
