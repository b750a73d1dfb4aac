use crate::domain::ports::PagerRef;
use crate::domain::verdict::{ErrorVerdict, FaultClass, RawOutcome};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};

pub const RATE_LIMITED: &str = "RATE_LIMITED";
pub const PROCESSOR_UNREACHABLE: &str = "PE-UNREACHABLE";
pub const CREDENTIALS_UNAVAILABLE: &str = "IE-CREDENTIALS";
pub const INFRASTRUCTURE_FAILURE: &str = "IE-INFRASTRUCTURE";
pub const UNMAPPED_OUTCOME: &str = "IE-UNMAPPED";

/// Processor code table. Explicit entries win over the `CE-`/`PE-`/`IE-`
/// prefix convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeTable {
    codes: BTreeMap<String, FaultClass>,
}

impl CodeTable {
    pub fn new(codes: BTreeMap<String, FaultClass>) -> Self {
        Self { codes }
    }

    pub fn lookup(&self, code: &str) -> Option<FaultClass> {
        if let Some(class) = self.codes.get(code) {
            return Some(*class);
        }
        let (prefix, _) = code.split_once('-')?;
        match prefix {
            "CE" => Some(FaultClass::CustomerFault),
            "PE" => Some(FaultClass::ProcessorFault),
            "IE" => Some(FaultClass::InternalFault),
            _ => None,
        }
    }
}

/// Maps raw failures onto the three fault classes and pages on
/// `InternalFault`.
pub struct ErrorClassifier {
    table: ArcSwap<CodeTable>,
    pager: PagerRef,
}

impl ErrorClassifier {
    pub fn new(table: CodeTable, pager: PagerRef) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            pager,
        }
    }

    pub fn reload(&self, table: CodeTable) {
        self.table.store(Arc::new(table));
    }

    pub fn classify(&self, raw: &RawOutcome) -> ErrorVerdict {
        let verdict = match raw {
            RawOutcome::Declined { processor, code } => match self.table.load().lookup(code) {
                Some(class) => ErrorVerdict::new(class, code.clone()),
                None => {
                    error!(processor = %processor, code = %code, "Unmapped processor code");
                    ErrorVerdict::new(FaultClass::InternalFault, UNMAPPED_OUTCOME)
                }
            },
            RawOutcome::ProcessorUnreachable { .. } => {
                ErrorVerdict::new(FaultClass::ProcessorFault, PROCESSOR_UNREACHABLE)
            }
            RawOutcome::RateExceeded { processor } => {
                warn!(target: "capacity", processor = %processor, "Rate budget exhausted");
                ErrorVerdict::new(FaultClass::ProcessorFault, RATE_LIMITED)
            }
            RawOutcome::CredentialUnavailable { .. } => {
                ErrorVerdict::new(FaultClass::InternalFault, CREDENTIALS_UNAVAILABLE)
            }
            RawOutcome::Infrastructure { component, detail } => {
                error!(component = %component, detail = %detail, "Infrastructure failure");
                ErrorVerdict::new(FaultClass::InternalFault, INFRASTRUCTURE_FAILURE)
            }
        };

        if verdict.pages_operator() {
            self.pager.page(&verdict);
        }
        verdict
    }
}
