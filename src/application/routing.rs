use crate::domain::account::{AccountId, CustomerAccount};
use crate::domain::processor::ProcessorIdentity;
use crate::domain::transaction::Transaction;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Rule tables consulted by the resolver. Either set may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    legacy_contracted: HashSet<AccountId>,
    regional_restricted: HashSet<String>,
}

impl RoutingTable {
    pub fn new(
        legacy_contracted: impl IntoIterator<Item = AccountId>,
        regional_restricted: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            legacy_contracted: legacy_contracted.into_iter().collect(),
            regional_restricted: regional_restricted
                .into_iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        }
    }

    /// Applies the rules in their fixed order. The contractual override
    /// short-circuits geography, and `Primary` is the fall-through.
    pub fn resolve(&self, transaction: &Transaction, account: &CustomerAccount) -> ProcessorIdentity {
        if self.legacy_contracted.contains(&account.account_id) {
            ProcessorIdentity::LegacyContracted
        } else if self
            .regional_restricted
            .contains(&transaction.destination_country.to_ascii_uppercase())
        {
            ProcessorIdentity::RegionalSecondary
        } else {
            ProcessorIdentity::Primary
        }
    }
}

/// Maps a transaction to a processor using hot-swappable rule tables.
///
/// Reads are lock-free; `reload` swaps the whole table atomically so a
/// resolution never observes a half-updated rule set.
#[derive(Debug, Clone)]
pub struct RoutingResolver {
    table: Arc<ArcSwap<RoutingTable>>,
}

impl RoutingResolver {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn resolve(&self, transaction: &Transaction, account: &CustomerAccount) -> ProcessorIdentity {
        let processor = self.table.load().resolve(transaction, account);
        debug!(
            transaction_id = %transaction.transaction_id,
            account_id = %account.account_id,
            country = %transaction.destination_country,
            processor = %processor,
            "Resolved route"
        );
        processor
    }

    pub fn reload(&self, table: RoutingTable) {
        info!(
            legacy_contracted = table.legacy_contracted.len(),
            regional_restricted = table.regional_restricted.len(),
            "Routing table reloaded"
        );
        self.table.store(Arc::new(table));
    }
}

impl Default for RoutingResolver {
    fn default() -> Self {
        Self::new(RoutingTable::default())
    }
}
