use crate::application::retry::AttemptReport;
use crate::domain::processor::ProcessorIdentity;
use crate::domain::transaction::{TransactionId, TransactionState};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct OutcomeRow<'a> {
    transaction_id: &'a TransactionId,
    processor: ProcessorIdentity,
    state: TransactionState,
    attempts: u32,
    code: &'a str,
}

/// Writes final transaction outcomes as CSV.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_reports<'a>(&mut self, reports: impl IntoIterator<Item = &'a AttemptReport>) -> Result<()> {
        for report in reports {
            self.writer.serialize(OutcomeRow {
                transaction_id: &report.transaction.transaction_id,
                processor: report.processor,
                state: report.transaction.state,
                attempts: report.transaction.attempt_count,
                code: report.verdict.as_ref().map_or("", |v| v.code.as_str()),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
