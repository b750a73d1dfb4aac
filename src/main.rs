use clap::Parser;
use futures::StreamExt;
use miette::{IntoDiagnostic, Result};
use payrouter::application::classifier::ErrorClassifier;
use payrouter::application::consumer::IdempotentEventConsumer;
use payrouter::application::engine::PaymentRouter;
use payrouter::application::gate::CredentialGate;
use payrouter::application::retry::RetryController;
use payrouter::application::routing::RoutingResolver;
use payrouter::config::AppConfig;
use payrouter::domain::account::AccountTier;
use payrouter::domain::event::TRANSACTION_STATE_TOPIC;
use payrouter::domain::ports::DedupLedgerBox;
use payrouter::infrastructure::in_memory::{
    InMemoryCredentialStore, InMemoryDedupLedger, InMemoryEventChannel, LedgerEffect,
    ScriptedProcessor,
};
use payrouter::infrastructure::log_sinks::{LogPager, TracingAuditSink};
use payrouter::interfaces::csv::outcome_writer::OutcomeWriter;
use payrouter::interfaces::csv::transaction_reader::TransactionReader;
use payrouter::logging::init_logging;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Upper bound on transactions driven at once from a single input file.
const MAX_CONCURRENT_TRANSACTIONS: usize = 64;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input payment requests CSV file
    input: PathBuf,

    /// Configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent dedup ledger (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Overrides the configured fixed retry delay.
    #[arg(long)]
    retry_delay_ms: Option<u64>,
}

fn open_ledger(db_path: Option<PathBuf>) -> Result<DedupLedgerBox> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let ledger = payrouter::infrastructure::rocksdb::RocksDBDedupLedger::open(path)
            .into_diagnostic()?;
        return Ok(Box::new(ledger));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok(Box::new(InMemoryDedupLedger::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path).into_diagnostic()?,
        None => AppConfig::default(),
    };
    if let Some(delay_ms) = cli.retry_delay_ms {
        config.retry.delay_ms = delay_ms;
    }
    init_logging(&config.logging);

    let processor = ScriptedProcessor::new();

    // Read requests
    let file = File::open(&cli.input).into_diagnostic()?;
    let mut seen = HashSet::new();
    let mut requests = Vec::new();
    for request in TransactionReader::new(file).requests() {
        match request {
            Ok(request) => {
                if !seen.insert(request.transaction_id.clone()) {
                    warn!(transaction_id = %request.transaction_id, "Ignoring duplicate transaction id");
                    continue;
                }
                if request.tier == AccountTier::LegacyContracted {
                    config
                        .routing
                        .legacy_contracted_accounts
                        .push(request.account_id.as_str().to_string());
                }
                processor.script(&request.transaction_id, request.scripted_outcomes());
                requests.push(request);
            }
            Err(e) => {
                error!("Error reading transaction: {}", e);
            }
        }
    }

    let classifier = Arc::new(ErrorClassifier::new(config.code_table(), Arc::new(LogPager)));
    let channel = Arc::new(InMemoryEventChannel::new());

    let gate = CredentialGate::new(
        config.budgets().into_diagnostic()?,
        config.fallbacks().into_diagnostic()?,
        Arc::new(InMemoryCredentialStore::new(config.rotation_period())),
        Arc::new(processor.clone()),
        Arc::new(TracingAuditSink),
    );
    let controller = RetryController::new(
        config.retry_policy(),
        Arc::new(gate),
        classifier.clone(),
        channel.clone(),
    );
    let router = PaymentRouter::new(RoutingResolver::new(config.routing_table()), controller);

    let effect = LedgerEffect::new();
    let consumer = IdempotentEventConsumer::new(
        open_ledger(cli.db_path)?,
        Box::new(effect.clone()),
        classifier,
    );

    let produce = async {
        let results: Vec<_> = futures::stream::iter(&requests)
            .map(|request| {
                let router = &router;
                async move {
                    let account = request.account();
                    router.process(request.transaction(), &account).await
                }
            })
            .buffered(MAX_CONCURRENT_TRANSACTIONS)
            .collect()
            .await;
        channel.close();
        results
    };
    let consume = consumer.run(
        channel.as_ref(),
        TRANSACTION_STATE_TOPIC,
        config.consumer.concurrency,
    );
    let (stats, results) = tokio::join!(consume, produce);
    let stats = stats.into_diagnostic()?;
    info!(
        applied = stats.applied(),
        duplicates = stats.duplicates(),
        failed = stats.failed(),
        ledger_entries = effect.applied_count(),
        "Event consumption finished"
    );

    let mut reports = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => error!("Error processing transaction: {}", e),
        }
    }

    // Output final outcomes
    let stdout = io::stdout();
    let mut writer = OutcomeWriter::new(stdout.lock());
    writer.write_reports(&reports).into_diagnostic()?;

    Ok(())
}
