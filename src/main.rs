// src/main.rs
use clap::{Args, Parser, Subcommand};
use cmf_extractor::cmf::{
    load_roster, AccountingStandard, CompanyIdentity, Consolidation, FilingJob, HttpSessionFactory, PolitenessGate,
    SessionFactory, TaxId,
};
use cmf_extractor::config::RunConfig;
use cmf_extractor::reconcile::{LocalCorpusIndex, Reconciler, RemoteAvailabilityProbe};
use cmf_extractor::retrieval::{
    event_channel, BulkOrchestrator, EventEmitter, JobState, RetrievalJob, RunEvent, RunState, RunStatistics,
};
use cmf_extractor::storage::StorageManager;
use cmf_extractor::utils::{logging, AppError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Command Line Interface for the CMF financial statements extractor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Retrieve and extract statements for every period in the year range
    Extract {
        #[command(flatten)]
        target: TargetArgs,

        /// Re-extract periods already present in the local corpus
        #[arg(long)]
        force: bool,
    },
    /// Compare the local corpus against what the regulator publishes
    Reconcile {
        #[command(flatten)]
        target: TargetArgs,

        /// Retrieve every missing period after reconciling
        #[arg(long)]
        fetch_missing: bool,

        /// Only probe periods newer than the newest local one
        #[arg(long)]
        incremental: bool,
    },
    /// Print the periods already captured locally
    Scan,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Tax id (RUT) of a single company, e.g. 96505760-9
    #[arg(long, conflicts_with = "roster")]
    rut: Option<String>,

    /// Display name for --rut (used for the company folder)
    #[arg(long, requires = "rut")]
    name: Option<String>,

    /// CSV roster of companies
    #[arg(long)]
    roster: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    start_year: Option<i32>,

    #[arg(long, global = true)]
    end_year: Option<i32>,

    /// Maximum number of concurrent sessions
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[arg(long, global = true, value_enum)]
    consolidation: Option<Consolidation>,

    #[arg(long, global = true, value_enum)]
    standard: Option<AccountingStandard>,

    /// Corpus root directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[arg(long, global = true, overrides_with = "visible")]
    headless: bool,

    #[arg(long, global = true, overrides_with = "headless")]
    visible: bool,

    /// Debug mode - verbose logs and annotated dumps of pages that fail to extract
    #[arg(short, long, global = true)]
    debug: bool,
}

impl CommonArgs {
    fn resolve(&self) -> Result<RunConfig, AppError> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(year) = self.start_year {
            config.start_year = year;
        }
        if let Some(year) = self.end_year {
            config.end_year = year;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrency = concurrency;
        }
        if let Some(consolidation) = self.consolidation {
            config.consolidation = consolidation;
        }
        if let Some(standard) = self.standard {
            config.standard = standard;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.visible {
            config.headless = false;
        } else if self.headless {
            config.headless = true;
        }
        config.debug |= self.debug;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Parse CLI Arguments
    let cli = Cli::parse();

    // 2. Setup Logging (reads RUST_LOG env var)
    logging::setup_logging(cli.common.debug);

    // 3. Resolve configuration
    let mut config = cli.common.resolve()?;
    tracing::debug!("Effective configuration: {:?}", config);

    // 4. Ctrl-C cancels the run: queued work is dropped, in-flight attempts finish
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing in-flight jobs and stopping");
            let _ = cancel_tx.send(true);
        }
    });

    // 5. Dispatch
    match cli.command {
        Command::Scan => {
            let index = LocalCorpusIndex::new(&config.output_dir).scan();
            for (company, periods) in &index {
                let keys: Vec<String> = periods.iter().map(|p| p.to_string()).collect();
                println!("{} [{}]: {}", company, periods.len(), keys.join(", "));
            }
            Ok(())
        }
        Command::Extract { target, force } => {
            let companies = resolve_companies(&target)?
                .ok_or_else(|| AppError::Roster("extract needs --rut or --roster".to_string()))?;
            let storage = StorageManager::new(&config.output_dir, &config.summary_dir)?;

            let today = chrono::Local::now().date_naive();
            let mut jobs: Vec<FilingJob> = FilingJob::enumerate(
                &companies,
                config.start_year,
                config.end_year,
                &config.months,
                config.consolidation,
                config.standard,
            )
            .into_iter()
            .filter(|job| job.period.end_date() <= today)
            .collect();

            if !force {
                let index = LocalCorpusIndex::new(&config.output_dir).scan();
                let before = jobs.len();
                jobs.retain(|job| !LocalCorpusIndex::periods_for(&index, &job.company).contains(&job.period));
                tracing::info!("Skipping {} period(s) already extracted (use --force to redo)", before - jobs.len());
            }

            let stats = run_bulk(&config, &storage, jobs, &companies, cancel_rx).await?;
            finish(&stats)
        }
        Command::Reconcile { target, fetch_missing, incremental } => {
            config.incremental_probe |= incremental;
            let storage = StorageManager::new(&config.output_dir, &config.summary_dir)?;
            let index = LocalCorpusIndex::new(&config.output_dir).scan();

            // Without an explicit target, reconcile every company already in the corpus
            let companies = match resolve_companies(&target)? {
                Some(companies) => companies,
                None => index.keys().cloned().collect(),
            };
            if companies.is_empty() {
                return Err(AppError::Roster("no companies to reconcile".to_string()));
            }

            let (factory, gate) = remote_stack(&config);
            let probe = RemoteAvailabilityProbe::new(factory, gate, config.retry_policy())
                .with_filing_type(config.consolidation, config.standard);
            let reconciler = Reconciler::new(probe, config.probe_config());
            let report = reconciler
                .reconcile_all(&companies, &index, config.max_concurrency, cancel_rx.clone())
                .await;
            let (_, txt_path) = storage.save_reconcile_summary(&report)?;
            println!(
                "Reconciliation: {} missing, {} extra (review only), {} probe failures. Details in {}",
                report.total_missing(),
                report.total_extra(),
                report.probe_failures(),
                txt_path.display()
            );

            if !fetch_missing {
                return Ok(());
            }
            let jobs = report.work_list(config.consolidation, config.standard);
            if jobs.is_empty() {
                println!("Nothing missing; corpus is up to date.");
                return Ok(());
            }
            let stats = run_bulk(&config, &storage, jobs, &companies, cancel_rx).await?;
            finish(&stats)
        }
    }
}

/// Companies named on the command line, or `None` when neither flag was given.
fn resolve_companies(target: &TargetArgs) -> Result<Option<Vec<CompanyIdentity>>, AppError> {
    if let Some(rut) = &target.rut {
        let tax_id: TaxId = rut.parse()?;
        let name = target.name.clone().unwrap_or_else(|| tax_id.number().to_string());
        return Ok(Some(vec![CompanyIdentity::new(tax_id, name)]));
    }
    if let Some(path) = &target.roster {
        let companies = load_roster(path)?;
        if companies.is_empty() {
            return Err(AppError::Roster(format!("no valid companies in {}", path.display())));
        }
        return Ok(Some(companies));
    }
    Ok(None)
}

fn remote_stack(config: &RunConfig) -> (Arc<dyn SessionFactory>, PolitenessGate) {
    let factory: Arc<dyn SessionFactory> = Arc::new(HttpSessionFactory::new(config.session_config()));
    (factory, PolitenessGate::new(config.politeness_config()))
}

async fn run_bulk(
    config: &RunConfig,
    storage: &StorageManager,
    jobs: Vec<FilingJob>,
    companies: &[CompanyIdentity],
    cancel: watch::Receiver<bool>,
) -> Result<RunStatistics, AppError> {
    let total = jobs.len();
    if total == 0 {
        tracing::info!("No jobs to run");
        return Ok(RunStatistics::default());
    }
    tracing::info!(
        "Running {} job(s) with concurrency {} ({})",
        total,
        config.max_concurrency,
        if config.headless { "headless" } else { "visible" }
    );

    let (factory, gate) = remote_stack(config);
    let (events_tx, mut events_rx) = event_channel(256);
    let mut runner = RetrievalJob::new(factory, gate, config.retry_policy()).with_events(EventEmitter::new(events_tx));
    if config.debug {
        runner = runner.with_debug_dir(config.summary_dir.join("debug"));
    }

    // Progress observer
    let progress = tokio::spawn(async move {
        let mut finished = 0usize;
        loop {
            match events_rx.recv().await {
                Ok(RunEvent::Job { state: JobState::Succeeded | JobState::PartiallySucceeded | JobState::Failed, .. }) => {
                    finished += 1;
                    tracing::info!("Progress: {}/{} jobs finished", finished, total);
                }
                Ok(RunEvent::Run { state: RunState::Completed | RunState::Cancelled, .. }) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Progress observer skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let orchestrator = BulkOrchestrator::new(runner);
    let stats = orchestrator.run_all(jobs, config.max_concurrency, storage, cancel).await;
    drop(orchestrator);
    if let Err(e) = progress.await {
        tracing::debug!("Progress observer ended abnormally: {}", e);
    }

    storage.save_run_summary(&stats)?;
    for company in companies {
        if let Err(e) = storage.consolidate_company(company) {
            tracing::error!("Could not consolidate tables for {}: {}", company, e);
        }
    }
    Ok(stats)
}

/// Prints the run summary and turns any failed job into a non-zero exit.
fn finish(stats: &RunStatistics) -> Result<(), AppError> {
    println!(
        "Run {:?}: {} attempted, {} succeeded, {} partial, {} failed, {} not dispatched ({} ms)",
        stats.state,
        stats.attempted,
        stats.succeeded,
        stats.partial,
        stats.failed(),
        stats.not_dispatched,
        stats.elapsed_ms
    );
    for record in stats.failures() {
        println!(
            "  FAILED {} {} {}: {:?} {}",
            record.rut,
            record.company,
            record.period,
            record.error_kind,
            record.message.as_deref().unwrap_or("")
        );
    }

    if stats.has_failures() {
        return Err(AppError::JobsFailed(stats.failed() + stats.persistence_failures));
    }
    Ok(())
}
