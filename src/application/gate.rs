//! Credential and rate-limit gate.
//!
//! Every processor call goes through a [`ScopedClient`] handed out by
//! [`CredentialGate::acquire`]. A scoped client carries:
//!
//! 1. **A budget permit** taken from the processor's token bucket. The token
//!    is returned when the client is dropped without a successful call and
//!    stays consumed after a success.
//! 2. **A credential valid at acquisition time.** Expired cached credentials
//!    are rotated before the client is built.
//!
//! Each acquisition is appended to the audit trail. When the routed
//! processor has no budget or no usable credential and a fallback is
//! configured for it, the fallback is used and the substitution is audited
//! as such.

use crate::domain::account::AccountId;
use crate::domain::audit::{AuditEntry, DecisionReason};
use crate::domain::credential::Credential;
use crate::domain::ports::{
    AuditSinkRef, CredentialStoreRef, ProcessorClientBox, ProcessorConnectorRef,
};
use crate::domain::processor::{IdempotencyToken, Outcome, ProcessorIdentity};
use crate::domain::transaction::{Amount, TransactionId};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bucket size and sustained refill rate for one processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSpec {
    pub capacity: u64,
    pub refill_per_sec: f64,
}

impl BudgetSpec {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    /// Available tokens, scaled by 1000 for sub-token refill precision.
    tokens_millis: u64,
    capacity_millis: u64,
    refill_rate: f64,
    last_refill: Instant,
    /// Tokens currently held by live permits.
    outstanding: u64,
}

impl TokenBucket {
    fn new(spec: BudgetSpec) -> Self {
        Self {
            tokens_millis: spec.capacity.saturating_mul(1000),
            capacity_millis: spec.capacity.saturating_mul(1000),
            refill_rate: spec.refill_per_sec,
            last_refill: Instant::now(),
            outstanding: 0,
        }
    }

    /// Ceiling for available tokens: held permits count against capacity.
    fn headroom_millis(&self) -> u64 {
        self.capacity_millis
            .saturating_sub(self.outstanding.saturating_mul(1000))
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        // Float-to-int casts saturate, so an unbounded rate fills the bucket.
        let refill = (elapsed.as_secs_f64() * self.refill_rate * 1000.0) as u64;
        if refill > 0 {
            self.tokens_millis = self
                .tokens_millis
                .saturating_add(refill)
                .min(self.headroom_millis());
            self.last_refill = now;
        }
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens_millis >= 1000 {
            self.tokens_millis -= 1000;
            self.outstanding += 1;
            true
        } else {
            false
        }
    }

    fn release(&mut self, return_token: bool) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if return_token {
            self.tokens_millis = self
                .tokens_millis
                .saturating_add(1000)
                .min(self.headroom_millis());
        }
    }
}

/// Per-processor token budget shared by all concurrent attempts.
#[derive(Debug)]
pub struct RateBudget {
    processor: ProcessorIdentity,
    bucket: Mutex<TokenBucket>,
}

impl RateBudget {
    pub fn new(processor: ProcessorIdentity, spec: BudgetSpec) -> Self {
        Self {
            processor,
            bucket: Mutex::new(TokenBucket::new(spec)),
        }
    }

    fn try_acquire(self: &Arc<Self>) -> Result<BudgetPermit> {
        if self.bucket.lock().try_acquire() {
            Ok(BudgetPermit {
                budget: Arc::clone(self),
                consumed: false,
            })
        } else {
            Err(PaymentError::RateExceeded {
                processor: self.processor,
            })
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens_millis / 1000
    }

    pub fn outstanding(&self) -> u64 {
        self.bucket.lock().outstanding
    }
}

/// A token held for the duration of one attempt.
#[derive(Debug)]
struct BudgetPermit {
    budget: Arc<RateBudget>,
    consumed: bool,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.bucket.lock().release(!self.consumed);
    }
}

/// A processor client valid for exactly one logical attempt.
pub struct ScopedClient {
    client: ProcessorClientBox,
    permit: BudgetPermit,
    decision: DecisionReason,
}

impl ScopedClient {
    pub fn processor(&self) -> ProcessorIdentity {
        self.client.processor()
    }

    pub fn decision(&self) -> &DecisionReason {
        &self.decision
    }

    pub async fn charge(
        self,
        amount: Amount,
        currency: &str,
        instrument: &str,
        idempotency_token: &IdempotencyToken,
    ) -> Result<Outcome> {
        let Self {
            client, mut permit, ..
        } = self;
        let outcome = client
            .charge(amount, currency, instrument, idempotency_token)
            .await;
        if matches!(&outcome, Ok(o) if o.success) {
            permit.consumed = true;
        }
        outcome
    }

    pub async fn refund(
        self,
        amount: Amount,
        currency: &str,
        reference: &TransactionId,
        idempotency_token: &IdempotencyToken,
    ) -> Result<Outcome> {
        let Self {
            client, mut permit, ..
        } = self;
        let outcome = client
            .refund(amount, currency, reference, idempotency_token)
            .await;
        if matches!(&outcome, Ok(o) if o.success) {
            permit.consumed = true;
        }
        outcome
    }
}

pub struct CredentialGate {
    budgets: HashMap<ProcessorIdentity, Arc<RateBudget>>,
    fallbacks: HashMap<ProcessorIdentity, ProcessorIdentity>,
    credentials: CredentialStoreRef,
    cache: Mutex<HashMap<ProcessorIdentity, Credential>>,
    connector: ProcessorConnectorRef,
    audit: AuditSinkRef,
}

impl CredentialGate {
    /// Processors missing from `budgets` get `default_budget`.
    pub fn new(
        budgets: HashMap<ProcessorIdentity, BudgetSpec>,
        fallbacks: HashMap<ProcessorIdentity, ProcessorIdentity>,
        credentials: CredentialStoreRef,
        connector: ProcessorConnectorRef,
        audit: AuditSinkRef,
    ) -> Self {
        let default_budget = BudgetSpec::new(100, 50.0);
        let budgets = ProcessorIdentity::ALL
            .into_iter()
            .map(|p| {
                let spec = budgets.get(&p).copied().unwrap_or(default_budget);
                (p, Arc::new(RateBudget::new(p, spec)))
            })
            .collect();
        Self {
            budgets,
            fallbacks,
            credentials,
            cache: Mutex::new(HashMap::new()),
            connector,
            audit,
        }
    }

    pub fn budget(&self, processor: ProcessorIdentity) -> Option<&Arc<RateBudget>> {
        self.budgets.get(&processor)
    }

    /// Produces a client for `processor`, or for its fallback when the
    /// processor is out of budget or has no usable credential.
    pub async fn acquire(
        &self,
        processor: ProcessorIdentity,
        account_id: &AccountId,
    ) -> Result<ScopedClient> {
        let (client, permit, decision) = match self.lease(processor).await {
            Ok((client, permit)) => (client, permit, DecisionReason::Selected),
            Err(err) if substitutable(&err) => {
                let Some(&fallback) = self.fallbacks.get(&processor) else {
                    return Err(err);
                };
                match self.lease(fallback).await {
                    Ok((client, permit)) => {
                        warn!(
                            processor = %processor,
                            fallback = %fallback,
                            account_id = %account_id,
                            cause = %err,
                            "Substituting fallback processor"
                        );
                        let decision = DecisionReason::FallbackSubstituted {
                            original: processor,
                            cause: err.to_string(),
                        };
                        (client, permit, decision)
                    }
                    Err(fallback_err) => {
                        debug!(fallback = %fallback, error = %fallback_err, "Fallback unavailable");
                        return Err(err);
                    }
                }
            }
            Err(err) => return Err(err),
        };

        let entry = AuditEntry::new(client.processor(), account_id.clone(), decision.clone());
        // On audit failure the permit drops here and the token goes back.
        self.audit
            .append(entry)
            .await
            .map_err(|e| PaymentError::AuditUnavailable(e.to_string()))?;

        Ok(ScopedClient {
            client,
            permit,
            decision,
        })
    }

    async fn lease(&self, processor: ProcessorIdentity) -> Result<(ProcessorClientBox, BudgetPermit)> {
        let budget = self.budgets.get(&processor).ok_or_else(|| {
            PaymentError::InternalError(format!("no budget configured for {processor}").into())
        })?;
        let permit = budget.try_acquire()?;
        let credential = self.current_credential(processor).await?;
        Ok((self.connector.connect(processor, credential), permit))
    }

    async fn current_credential(&self, processor: ProcessorIdentity) -> Result<Credential> {
        let now = Utc::now();
        let cached = self.cache.lock().get(&processor).cloned();
        if let Some(credential) = cached
            && credential.is_valid_at(now)
        {
            return Ok(credential);
        }

        let fresh = self
            .credentials
            .get_current(processor)
            .await
            .map_err(|e| PaymentError::CredentialUnavailable {
                processor,
                reason: e.to_string(),
            })?;
        if !fresh.is_valid_at(now) {
            return Err(PaymentError::CredentialUnavailable {
                processor,
                reason: format!("store returned a credential expired at {}", fresh.valid_until),
            });
        }

        info!(
            processor = %processor,
            issued_at = %fresh.issued_at,
            valid_until = %fresh.valid_until,
            "Rotated processor credential"
        );
        self.cache.lock().insert(processor, fresh.clone());
        Ok(fresh)
    }
}

fn substitutable(err: &PaymentError) -> bool {
    matches!(
        err,
        PaymentError::RateExceeded { .. } | PaymentError::CredentialUnavailable { .. }
    )
}
