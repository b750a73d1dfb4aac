use super::retry::{AttemptHandle, AttemptReport, AttemptState, RetryController};
use super::routing::RoutingResolver;
use crate::domain::account::CustomerAccount;
use crate::domain::transaction::{Transaction, TransactionId};
use crate::error::{PaymentError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::info;

/// Entry point for the transaction-initiation path.
///
/// `PaymentRouter` resolves a processor for each transaction and hands it to
/// the retry controller. It keeps one [`AttemptHandle`] per in-flight
/// transaction so that the same transaction can never be driven twice
/// concurrently, and so operators can inspect or cancel it.
pub struct PaymentRouter {
    resolver: RoutingResolver,
    controller: RetryController,
    in_flight: DashMap<TransactionId, Arc<AttemptHandle>>,
}

/// Removes the in-flight entry on every exit path.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<TransactionId, Arc<AttemptHandle>>,
    transaction_id: TransactionId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.transaction_id);
    }
}

impl PaymentRouter {
    pub fn new(resolver: RoutingResolver, controller: RetryController) -> Self {
        Self {
            resolver,
            controller,
            in_flight: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &RoutingResolver {
        &self.resolver
    }

    /// Routes and charges a transaction, retrying under the fixed-delay
    /// policy. Fails only if the transaction is already terminal or already
    /// in flight; charge failures are reported in the returned
    /// [`AttemptReport`].
    pub async fn process(
        &self,
        transaction: Transaction,
        account: &CustomerAccount,
    ) -> Result<AttemptReport> {
        if transaction.state.is_terminal() {
            return Err(PaymentError::ValidationError(format!(
                "transaction {} is already {}",
                transaction.transaction_id, transaction.state
            )));
        }

        let handle = match self.in_flight.entry(transaction.transaction_id.clone()) {
            Entry::Occupied(_) => {
                return Err(PaymentError::AlreadyInFlight(
                    transaction.transaction_id.clone(),
                ));
            }
            Entry::Vacant(slot) => slot.insert(Arc::new(AttemptHandle::new())).clone(),
        };
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            transaction_id: transaction.transaction_id.clone(),
        };

        let processor = self.resolver.resolve(&transaction, account);
        let report = self
            .controller
            .run(transaction, account, processor, &handle)
            .await;
        info!(
            transaction_id = %report.transaction.transaction_id,
            processor = %report.processor,
            state = %report.transaction.state,
            attempts = report.transaction.attempt_count,
            "Transaction settled"
        );
        Ok(report)
    }

    /// Cancels an in-flight transaction. Returns `false` if it is not in
    /// flight.
    pub fn cancel(&self, transaction_id: &TransactionId) -> bool {
        match self.in_flight.get(transaction_id) {
            Some(handle) => {
                info!(transaction_id = %transaction_id, "Operator cancellation requested");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn attempt_state(&self, transaction_id: &TransactionId) -> Option<AttemptState> {
        self.in_flight.get(transaction_id).map(|h| h.state())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
