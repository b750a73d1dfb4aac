use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccountTier {
    #[default]
    Standard,
    LegacyContracted,
}

/// A provisioned customer account. Immutable once created.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct CustomerAccount {
    pub account_id: AccountId,
    pub tier: AccountTier,
}

impl CustomerAccount {
    pub fn new(account_id: AccountId, tier: AccountTier) -> Self {
        Self { account_id, tier }
    }

    pub fn standard(account_id: impl Into<String>) -> Self {
        Self::new(AccountId::new(account_id), AccountTier::Standard)
    }
}
