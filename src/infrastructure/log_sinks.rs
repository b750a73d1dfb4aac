//! Collaborators that write to the `tracing` pipeline.

use crate::domain::audit::AuditEntry;
use crate::domain::ports::{AuditSink, Pager};
use crate::domain::verdict::ErrorVerdict;
use crate::error::Result;
use async_trait::async_trait;
use tracing::{error, info};

/// Emits each audit entry as a structured event under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        info!(
            target: "audit",
            timestamp = %entry.timestamp,
            processor = %entry.processor,
            account_id = %entry.account_id,
            fallback = entry.is_fallback(),
            decision_reason = %entry.decision_reason,
            "processor acquisition"
        );
        Ok(())
    }
}

/// Pager that raises an error-level event under the `page` target for the
/// alerting pipeline to pick up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPager;

impl Pager for LogPager {
    fn page(&self, verdict: &ErrorVerdict) {
        error!(
            target: "page",
            class = %verdict.class,
            code = %verdict.code,
            "internal fault requires operator attention"
        );
    }
}
