//! Runtime configuration.
//!
//! Loaded once at startup from a TOML file. Every section has defaults so an
//! empty file (or no file) is a valid configuration. Routing and classifier
//! tables can later be swapped at runtime through their owning services.

use crate::application::classifier::CodeTable;
use crate::application::gate::BudgetSpec;
use crate::application::retry::RetryPolicy;
use crate::application::routing::RoutingTable;
use crate::domain::account::AccountId;
use crate::domain::processor::ProcessorIdentity;
use crate::domain::verdict::FaultClass;
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Largest per-processor bucket accepted from configuration.
pub const MAX_BUDGET_CAPACITY: u64 = 1_000_000_000;
/// Longest credential rotation period accepted from configuration.
pub const MAX_ROTATION_DAYS: i64 = 3_650;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Accounts bound by contract to the legacy processor.
    #[serde(default)]
    pub legacy_contracted_accounts: Vec<String>,
    /// ISO country codes served by the regional processor.
    #[serde(default)]
    pub regional_restricted_countries: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub capacity: u64,
    pub refill_per_sec: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_per_sec: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Budget applied to processors without an explicit entry.
    #[serde(default)]
    pub default_budget: BudgetConfig,
    /// Per-processor budgets, keyed by processor name.
    #[serde(default)]
    pub budgets: BTreeMap<String, BudgetConfig>,
    /// Designated fallback processor per routed processor.
    #[serde(default)]
    pub fallbacks: BTreeMap<String, String>,
    #[serde(default = "default_rotation_days")]
    pub credential_rotation_days: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_budget: BudgetConfig::default(),
            budgets: BTreeMap::new(),
            fallbacks: BTreeMap::new(),
            credential_rotation_days: default_rotation_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Explicit processor code to class mappings, consulted before the
    /// `CE-`/`PE-`/`IE-` prefix convention.
    #[serde(default)]
    pub codes: BTreeMap<String, FaultClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_concurrency")]
    pub concurrency: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_consumer_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

const fn default_rotation_days() -> i64 {
    30
}

const fn default_retry_delay_ms() -> u64 {
    2_000
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_consumer_concurrency() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn parse_processor(name: &str) -> Result<ProcessorIdentity> {
    name.parse().map_err(PaymentError::ConfigError)
}

impl AppConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| PaymentError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.concurrency == 0 {
            return Err(PaymentError::ConfigError(
                "consumer.concurrency must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_ROTATION_DAYS).contains(&self.gate.credential_rotation_days) {
            return Err(PaymentError::ConfigError(format!(
                "gate.credential_rotation_days must be between 1 and {MAX_ROTATION_DAYS}"
            )));
        }
        self.budgets()?;
        self.fallbacks()?;
        Ok(())
    }

    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(
            self.routing
                .legacy_contracted_accounts
                .iter()
                .map(AccountId::new),
            self.routing.regional_restricted_countries.iter().cloned(),
        )
    }

    pub fn budgets(&self) -> Result<HashMap<ProcessorIdentity, BudgetSpec>> {
        let mut budgets = HashMap::new();
        for processor in ProcessorIdentity::ALL {
            budgets.insert(processor, to_spec(processor.as_str(), self.gate.default_budget)?);
        }
        for (name, budget) in &self.gate.budgets {
            budgets.insert(parse_processor(name)?, to_spec(name, *budget)?);
        }
        Ok(budgets)
    }

    pub fn fallbacks(&self) -> Result<HashMap<ProcessorIdentity, ProcessorIdentity>> {
        let mut fallbacks = HashMap::new();
        for (from, to) in &self.gate.fallbacks {
            let from = parse_processor(from)?;
            let to = parse_processor(to)?;
            if from == to {
                return Err(PaymentError::ConfigError(format!(
                    "processor {from} cannot fall back to itself"
                )));
            }
            fallbacks.insert(from, to);
        }
        Ok(fallbacks)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.delay_ms),
            self.retry.max_retries,
        )
    }

    pub fn code_table(&self) -> CodeTable {
        CodeTable::new(self.classifier.codes.clone())
    }

    pub fn rotation_period(&self) -> chrono::Duration {
        let days = self.gate.credential_rotation_days.clamp(1, MAX_ROTATION_DAYS);
        chrono::Duration::days(days)
    }
}

fn to_spec(name: &str, budget: BudgetConfig) -> Result<BudgetSpec> {
    if budget.capacity == 0 || budget.capacity > MAX_BUDGET_CAPACITY {
        return Err(PaymentError::ConfigError(format!(
            "budget for {name} must have a capacity between 1 and {MAX_BUDGET_CAPACITY}"
        )));
    }
    if !budget.refill_per_sec.is_finite() || budget.refill_per_sec < 0.0 {
        return Err(PaymentError::ConfigError(format!(
            "budget for {name} must have a finite, non-negative refill rate"
        )));
    }
    Ok(BudgetSpec::new(budget.capacity, budget.refill_per_sec))
}
