use payrouter::domain::account::AccountId;
use payrouter::domain::audit::DecisionReason;
use payrouter::domain::processor::ProcessorIdentity;
use payrouter::domain::transaction::TransactionId;
use payrouter::error::PaymentError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Barrier;

mod common;

use common::{HarnessBuilder, account, transaction};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquisition_never_exceeds_budget() {
    const CAPACITY: u64 = 5;
    const CALLERS: usize = 40;

    let harness = Arc::new(
        HarnessBuilder::default()
            .budget(ProcessorIdentity::Primary, CAPACITY, 0.0)
            .build(),
    );
    let barrier = Arc::new(Barrier::new(CALLERS));
    let granted = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for i in 0..CALLERS {
        let harness = harness.clone();
        let barrier = barrier.clone();
        let granted = granted.clone();
        handles.push(tokio::spawn(async move {
            let account_id = AccountId::new(format!("acc_{i}"));
            let client = harness
                .gate
                .acquire(ProcessorIdentity::Primary, &account_id)
                .await;
            match &client {
                Ok(_) => {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => assert!(matches!(err, PaymentError::RateExceeded { .. })),
            }
            // Every caller has tried before any permit is released.
            barrier.wait().await;
            let outstanding = harness
                .gate
                .budget(ProcessorIdentity::Primary)
                .unwrap()
                .outstanding();
            assert!(outstanding <= CAPACITY);
            drop(client);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(granted.load(Ordering::SeqCst), CAPACITY);
    assert_eq!(harness.audit.entries().len() as u64, CAPACITY);

    let budget = harness.gate.budget(ProcessorIdentity::Primary).unwrap();
    assert_eq!(budget.outstanding(), 0);
    // Unused permits hand their tokens back.
    assert_eq!(budget.available(), CAPACITY);
}

#[tokio::test]
async fn test_exhausted_budget_substitutes_fallback() {
    let harness = HarnessBuilder::default()
        .budget(ProcessorIdentity::Primary, 1, 0.0)
        .fallback(ProcessorIdentity::Primary, ProcessorIdentity::RegionalSecondary)
        .build();

    let held = harness
        .gate
        .acquire(ProcessorIdentity::Primary, &AccountId::new("acc_0"))
        .await
        .unwrap();
    assert_eq!(held.processor(), ProcessorIdentity::Primary);

    let report = harness
        .router
        .process(transaction("tx_1", "US"), &account("acc_1"))
        .await
        .unwrap();
    assert_eq!(report.processor, ProcessorIdentity::RegionalSecondary);

    let calls = harness.processor.calls_for(&TransactionId::new("tx_1"));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].processor, ProcessorIdentity::RegionalSecondary);

    let entries = harness.audit.entries();
    let substitution = entries.iter().find(|e| e.is_fallback()).unwrap();
    assert_eq!(substitution.processor, ProcessorIdentity::RegionalSecondary);
    assert_eq!(substitution.account_id, AccountId::new("acc_1"));
    assert!(matches!(
        substitution.decision_reason,
        DecisionReason::FallbackSubstituted {
            original: ProcessorIdentity::Primary,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_without_fallback_is_retried() {
    let harness = HarnessBuilder::default()
        .budget(ProcessorIdentity::Primary, 1, 0.0)
        .build();

    let held = harness
        .gate
        .acquire(ProcessorIdentity::Primary, &AccountId::new("acc_0"))
        .await
        .unwrap();
    let release = async move {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        drop(held);
    };

    // The first attempt hits the empty bucket; the retry finds the returned token.
    let customer = account("acc_1");
    let (report, ()) = tokio::join!(
        harness.router.process(transaction("tx_1", "US"), &customer),
        release
    );
    let report = report.unwrap();
    assert_eq!(report.transaction.attempt_count, 2);
    assert_eq!(report.processor, ProcessorIdentity::Primary);
    assert_eq!(
        harness
            .processor
            .calls_for(&TransactionId::new("tx_1"))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_failed_audit_denies_the_call() {
    let harness = HarnessBuilder::default()
        .budget(ProcessorIdentity::Primary, 2, 0.0)
        .build();
    harness.audit.set_failing(true);

    let result = harness
        .gate
        .acquire(ProcessorIdentity::Primary, &AccountId::new("acc_1"))
        .await;
    assert!(matches!(result, Err(PaymentError::AuditUnavailable(_))));

    let budget = harness.gate.budget(ProcessorIdentity::Primary).unwrap();
    assert_eq!(budget.available(), 2);
    assert_eq!(budget.outstanding(), 0);
}
