//! Retry controller.
//!
//! Drives one transaction through `Attempting -> (AwaitingRetryDelay ->
//! Attempting)* -> Succeeded | Exhausted`. Each attempt takes a fresh
//! [`ScopedClient`](super::gate::ScopedClient) from the gate. The delay
//! between attempts is fixed and carries no jitter, so retries stay spread
//! exactly as the original failures were. Waiting is a timer suspension, not
//! a parked worker.
//!
//! Cancellation is only observed before acquiring the next attempt or while
//! waiting out the delay; an attempt already submitted to a processor runs
//! to completion.

use super::classifier::ErrorClassifier;
use super::gate::CredentialGate;
use crate::domain::account::CustomerAccount;
use crate::domain::event::{EventPayload, EventType, TRANSACTION_STATE_TOPIC, TransactionEvent};
use crate::domain::ports::EventPublisherRef;
use crate::domain::processor::{IdempotencyToken, ProcessorIdentity};
use crate::domain::transaction::{Transaction, TransactionState};
use crate::domain::verdict::{ErrorVerdict, FaultClass, RawOutcome};
use crate::error::PaymentError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting,
    AwaitingRetryDelay,
    Succeeded,
    Exhausted,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Attempting => "attempting",
            Self::AwaitingRetryDelay => "awaiting-retry-delay",
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Fixed-delay retry policy. `max_retries` is the ceiling on retries, so a
/// transaction gets at most `max_retries + 1` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// State that follows a failed attempt, where `attempts_made` counts the
    /// attempt that just failed.
    pub fn after_failure(&self, attempts_made: u32, verdict: &ErrorVerdict) -> AttemptState {
        if verdict.retryable() && attempts_made <= self.max_retries {
            AttemptState::AwaitingRetryDelay
        } else {
            AttemptState::Exhausted
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 2)
    }
}

/// Live view and cancellation switch for one in-flight transaction.
#[derive(Debug)]
pub struct AttemptHandle {
    state: Mutex<AttemptState>,
    cancel: CancellationToken,
}

impl AttemptHandle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AttemptState::Attempting),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    /// Marks the transaction as permanently failed. Takes effect before the
    /// next attempt is acquired.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set(&self, state: AttemptState) {
        *self.state.lock() = state;
    }
}

impl Default for AttemptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Final result of driving a transaction through the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub transaction: Transaction,
    pub state: AttemptState,
    /// Processor used by the last attempt.
    pub processor: ProcessorIdentity,
    /// Verdict of the last failed attempt, if any.
    pub verdict: Option<ErrorVerdict>,
    pub cancelled: bool,
}

pub const OPERATOR_CANCELLED: &str = "OPERATOR_CANCELLED";

pub struct RetryController {
    policy: RetryPolicy,
    gate: Arc<CredentialGate>,
    classifier: Arc<ErrorClassifier>,
    events: EventPublisherRef,
}

impl RetryController {
    pub fn new(
        policy: RetryPolicy,
        gate: Arc<CredentialGate>,
        classifier: Arc<ErrorClassifier>,
        events: EventPublisherRef,
    ) -> Self {
        Self {
            policy,
            gate,
            classifier,
            events,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs attempts against `processor` until the transaction succeeds,
    /// exhausts its retries, hits a non-retryable fault, or is cancelled.
    pub async fn run(
        &self,
        mut transaction: Transaction,
        account: &CustomerAccount,
        processor: ProcessorIdentity,
        handle: &AttemptHandle,
    ) -> AttemptReport {
        let mut last_processor = processor;
        let mut last_verdict = None;
        self.emit(&transaction, EventType::Submitted, processor, None)
            .await;

        loop {
            if handle.is_cancelled() {
                return self
                    .cancelled(transaction, last_processor, last_verdict, handle)
                    .await;
            }

            handle.set(AttemptState::Attempting);
            transaction.state = TransactionState::Submitted;
            transaction.attempt_count += 1;
            let attempt = transaction.attempt_count;
            let token = IdempotencyToken::derive(&transaction.transaction_id, attempt);

            let raw = match self.gate.acquire(processor, &account.account_id).await {
                Ok(client) => {
                    last_processor = client.processor();
                    match client
                        .charge(
                            transaction.amount,
                            &transaction.currency,
                            &transaction.instrument,
                            &token,
                        )
                        .await
                    {
                        Ok(outcome) if outcome.success => {
                            info!(
                                transaction_id = %transaction.transaction_id,
                                processor = %last_processor,
                                attempt,
                                "Charge succeeded"
                            );
                            handle.set(AttemptState::Succeeded);
                            transaction.state = TransactionState::Succeeded;
                            self.emit(&transaction, EventType::Succeeded, last_processor, None)
                                .await;
                            return AttemptReport {
                                transaction,
                                state: AttemptState::Succeeded,
                                processor: last_processor,
                                verdict: None,
                                cancelled: false,
                            };
                        }
                        Ok(outcome) => RawOutcome::Declined {
                            processor: last_processor,
                            code: outcome.processor_code,
                        },
                        Err(err) => {
                            debug!(processor = %last_processor, error = %err, "Processor call failed");
                            RawOutcome::ProcessorUnreachable {
                                processor: last_processor,
                            }
                        }
                    }
                }
                Err(err) => raw_from_gate_error(err, processor),
            };

            let verdict = self.classifier.classify(&raw);
            transaction.state = TransactionState::Failed;
            let next = self.policy.after_failure(attempt, &verdict);
            warn!(
                transaction_id = %transaction.transaction_id,
                processor = %last_processor,
                attempt,
                class = %verdict.class,
                code = %verdict.code,
                next = %next,
                "Charge attempt failed"
            );

            if next == AttemptState::Exhausted {
                handle.set(AttemptState::Exhausted);
                // Internal faults are held in `failed` for manual intervention.
                let event_type = if verdict.class == FaultClass::InternalFault {
                    EventType::Failed
                } else {
                    transaction.state = TransactionState::Exhausted;
                    EventType::Exhausted
                };
                self.emit(&transaction, event_type, last_processor, Some(verdict.code.clone()))
                    .await;
                return AttemptReport {
                    transaction,
                    state: AttemptState::Exhausted,
                    processor: last_processor,
                    verdict: Some(verdict),
                    cancelled: false,
                };
            }

            handle.set(AttemptState::AwaitingRetryDelay);
            self.emit(
                &transaction,
                EventType::Retried {
                    attempt: attempt + 1,
                },
                last_processor,
                Some(verdict.code.clone()),
            )
            .await;
            last_verdict = Some(verdict);

            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = handle.cancel.cancelled() => {}
            }
        }
    }

    async fn cancelled(
        &self,
        mut transaction: Transaction,
        processor: ProcessorIdentity,
        verdict: Option<ErrorVerdict>,
        handle: &AttemptHandle,
    ) -> AttemptReport {
        info!(
            transaction_id = %transaction.transaction_id,
            attempts = transaction.attempt_count,
            "Transaction cancelled by operator"
        );
        handle.set(AttemptState::Exhausted);
        transaction.state = TransactionState::Exhausted;
        self.emit(
            &transaction,
            EventType::Exhausted,
            processor,
            Some(OPERATOR_CANCELLED.to_string()),
        )
        .await;
        AttemptReport {
            transaction,
            state: AttemptState::Exhausted,
            processor,
            verdict,
            cancelled: true,
        }
    }

    /// Publishes a state change. A broken channel pages but does not undo
    /// the charge outcome already reached.
    async fn emit(
        &self,
        transaction: &Transaction,
        event_type: EventType,
        processor: ProcessorIdentity,
        code: Option<String>,
    ) {
        let event = TransactionEvent::new(
            transaction.transaction_id.clone(),
            event_type,
            EventPayload {
                processor,
                attempt_count: transaction.attempt_count,
                code,
            },
        );
        if let Err(err) = self.events.publish(TRANSACTION_STATE_TOPIC, event).await {
            self.classifier.classify(&RawOutcome::Infrastructure {
                component: "event-channel".to_string(),
                detail: err.to_string(),
            });
        }
    }
}

fn raw_from_gate_error(err: PaymentError, processor: ProcessorIdentity) -> RawOutcome {
    match err {
        PaymentError::RateExceeded { processor } => RawOutcome::RateExceeded { processor },
        PaymentError::CredentialUnavailable { processor, .. } => {
            RawOutcome::CredentialUnavailable { processor }
        }
        PaymentError::AuditUnavailable(detail) => RawOutcome::Infrastructure {
            component: "audit-trail".to_string(),
            detail,
        },
        other => RawOutcome::Infrastructure {
            component: format!("gate:{processor}"),
            detail: other.to_string(),
        },
    }
}
