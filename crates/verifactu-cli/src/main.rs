// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

mod transport;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing_subscriber::EnvFilter;
use verifactu_config::{load_config, save_config, update, validate_config, ConfigPatch, LockKeeper};
use verifactu_core::{InvoiceSnapshot, InvoiceType, OperatingMode, RecordType};
use verifactu_engine::{Clock, SystemClock, VerifactuEngine};
use verifactu_events::FileEventLog;
use verifactu_recovery::FileRecoveryPointerStore;
use verifactu_store::{FileChainStore, QueryFilter};
use verifactu_transmission::SoftwareIdentity;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "verifactu", version, about = "VERI*FACTU record engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the chain, event log, and recovery pointer files.
    #[arg(long, global = true, default_value = ".verifactu")]
    data_dir: PathBuf,

    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build and append a new record, transmitting it if online.
    CreateRecord {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        issuer_name: String,
        #[arg(long)]
        invoice_number: String,
        /// Invoice date, `YYYY-MM-DD`.
        #[arg(long)]
        invoice_date: String,
        #[arg(long, value_enum)]
        invoice_type: InvoiceTypeArg,
        #[arg(long)]
        base_amount: Decimal,
        #[arg(long)]
        tax_rate: Decimal,
        #[arg(long)]
        tax_amount: Decimal,
        #[arg(long)]
        total_amount: Decimal,
        /// Registration or cancellation.
        #[arg(long, value_enum, default_value_t = RecordTypeArg::Registration)]
        record_type: RecordTypeArg,
    },

    /// List records for an issuer.
    ListRecords {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Fetch one record by sequence number.
    GetRecord {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        sequence_number: u64,
    },

    /// Drain the contingency retry queue.
    ProcessQueue,

    /// Verify an issuer's local hash chain linkage.
    VerifyChain {
        #[arg(long)]
        issuer_nif: String,
    },

    /// Probe authority connectivity.
    ProbeConnection,

    /// Compare the local chain against the authority and classify any
    /// disagreement.
    Reconcile {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        year: i32,
        /// Pull the authority's latest record unconditionally instead of
        /// classifying a conflict.
        #[arg(long)]
        sync: bool,
    },

    /// Attempt to automatically resolve a detected conflict.
    ResolveConflict {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        year: i32,
    },

    /// Record a manually-supplied recovery hash.
    RecoverManual {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        last_hash: String,
    },

    /// Compare the local chain head against the authority without
    /// attempting resolution.
    ChainStatus {
        #[arg(long)]
        issuer_nif: String,
        #[arg(long)]
        year: i32,
    },

    /// Overall engine health.
    Health,

    /// Run the background queue-drain/health-check loop until interrupted.
    Daemon {
        /// Seconds between queue-drain passes.
        #[arg(long, default_value_t = 30)]
        poll_interval_secs: u64,
    },

    /// Change the operating mode, subject to the fiscal-year mode lock and
    /// module-protection invariants.
    SetMode {
        #[arg(long, value_enum)]
        mode: OperatingModeArg,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OperatingModeArg {
    Verifactu,
    NoVerifactu,
}

impl From<OperatingModeArg> for OperatingMode {
    fn from(v: OperatingModeArg) -> Self {
        match v {
            OperatingModeArg::Verifactu => OperatingMode::Verifactu,
            OperatingModeArg::NoVerifactu => OperatingMode::NoVerifactu,
        }
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum InvoiceTypeArg {
    F1,
    F2,
    F3,
    R1,
    R2,
    R3,
    R4,
    R5,
}

impl From<InvoiceTypeArg> for InvoiceType {
    fn from(v: InvoiceTypeArg) -> Self {
        match v {
            InvoiceTypeArg::F1 => InvoiceType::F1,
            InvoiceTypeArg::F2 => InvoiceType::F2,
            InvoiceTypeArg::F3 => InvoiceType::F3,
            InvoiceTypeArg::R1 => InvoiceType::R1,
            InvoiceTypeArg::R2 => InvoiceType::R2,
            InvoiceTypeArg::R3 => InvoiceType::R3,
            InvoiceTypeArg::R4 => InvoiceType::R4,
            InvoiceTypeArg::R5 => InvoiceType::R5,
        }
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum RecordTypeArg {
    Registration,
    Cancellation,
}

impl From<RecordTypeArg> for RecordType {
    fn from(v: RecordTypeArg) -> Self {
        match v {
            RecordTypeArg::Registration => RecordType::Registration,
            RecordTypeArg::Cancellation => RecordType::Cancellation,
        }
    }
}

type Engine = VerifactuEngine<FileChainStore, FileRecoveryPointerStore, FileEventLog, transport::Transport>;

/// Everything [`run`] needs beyond the engine itself to drive the
/// `SetMode` subcommand: the same `LockKeeper`/config handles the engine
/// was built from, plus where to write the config back to.
struct Session {
    engine: Engine,
    lock: Arc<LockKeeper>,
    config: Arc<RwLock<verifactu_config::VerifactuConfig>>,
    config_path: Option<PathBuf>,
}

async fn build_session(data_dir: &PathBuf, config_path: Option<&PathBuf>) -> Result<Session> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data directory {}", data_dir.display()))?;

    let lock = Arc::new(
        LockKeeper::open(data_dir.join("lock.json"))
            .await
            .map_err(|e| anyhow::anyhow!("open lock state: {e}"))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let config = load_config(config_path.map(PathBuf::as_path), &lock, clock.now())
        .await
        .context("load configuration")?;

    let store = Arc::new(
        FileChainStore::open(data_dir.join("chain"))
            .await
            .context("open chain store")?,
    );
    let pointers = Arc::new(
        FileRecoveryPointerStore::open(data_dir.join("recovery_pointers.json"))
            .await
            .context("open recovery pointer store")?,
    );
    let events = Arc::new(
        FileEventLog::open(data_dir.join("events.ndjson"))
            .await
            .map_err(|e| anyhow::anyhow!("open event log: {e}"))?,
    );

    let software = SoftwareIdentity {
        name: config.software_name.clone(),
        nif: config.software_name.clone(),
        software_id: "VERIFACTU-ENGINE".to_string(),
        version: config.software_version.clone(),
    };
    let transport = transport::build_transport(config.certificate_path.as_deref(), config.environment, software)
        .context("build AEAT transport")?;

    let config = Arc::new(RwLock::new(config));

    let engine = VerifactuEngine::new(
        store,
        pointers,
        events,
        Arc::new(transport),
        lock.clone(),
        clock,
        config.clone(),
    );

    Ok(Session {
        engine,
        lock,
        config,
        config_path: config_path.cloned(),
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("verifactu=debug")
    } else {
        EnvFilter::new("verifactu=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir;
    let config_path = cli.config;
    let session = build_session(&data_dir, config_path.as_ref()).await?;
    let engine = session.engine;

    match cli.command {
        Commands::CreateRecord {
            issuer_nif,
            issuer_name,
            invoice_number,
            invoice_date,
            invoice_type,
            base_amount,
            tax_rate,
            tax_amount,
            total_amount,
            record_type,
        } => {
            let invoice_date = NaiveDate::parse_from_str(&invoice_date, "%Y-%m-%d").context("parse invoice_date")?;
            let snapshot = InvoiceSnapshot {
                issuer_nif,
                issuer_name,
                invoice_number,
                invoice_date,
                invoice_type: invoice_type.into(),
                base_amount,
                tax_rate,
                tax_amount,
                total_amount,
            };
            let record = engine.create_record(snapshot, record_type.into(), "cli").await?;
            println!("{}", serde_json::to_string_pretty(&record_json(&record))?);
        }
        Commands::ListRecords { issuer_nif, limit } => {
            let filter = QueryFilter { limit, ..Default::default() };
            let records = engine.list_records(&issuer_nif, filter).await?;
            for record in records {
                println!("{}", serde_json::to_string(&record_json(&record))?);
            }
        }
        Commands::GetRecord { issuer_nif, sequence_number } => match engine.get_record(&issuer_nif, sequence_number).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record_json(&record))?),
            None => {
                eprintln!("no record found");
                std::process::exit(EXIT_RUNTIME_ERROR);
            }
        },
        Commands::ProcessQueue => {
            let (submitted, requeued) = engine.process_queue().await;
            println!("submitted={submitted} requeued={requeued}");
        }
        Commands::VerifyChain { issuer_nif } => {
            engine.verify_chain(&issuer_nif).await?;
            println!("chain linkage verified");
        }
        Commands::ProbeConnection => match engine.probe_connection().await {
            Ok(()) => println!("reachable"),
            Err(kind) => {
                println!("unreachable: {kind:?}");
                std::process::exit(EXIT_RUNTIME_ERROR);
            }
        },
        Commands::Reconcile { issuer_nif, year, sync } => {
            let outcome = if sync {
                engine.sync_from_aeat(&issuer_nif, year).await?
            } else {
                engine.reconcile(&issuer_nif, year).await?
            };
            println!("{outcome:?}");
        }
        Commands::ResolveConflict { issuer_nif, year } => {
            let outcome = engine.resolve_conflict(&issuer_nif, year).await?;
            println!("{outcome:?}");
        }
        Commands::RecoverManual { issuer_nif, last_hash } => {
            let result = engine.recover_manual(&issuer_nif, &last_hash).await?;
            println!("{:?}: {}", result.status, result.message);
        }
        Commands::ChainStatus { issuer_nif, year } => {
            let report = engine.chain_status(&issuer_nif, year).await?;
            println!("synced={} message={}", report.is_synced, report.message);
        }
        Commands::Health => {
            let (healthy, message) = engine.health().await;
            println!("healthy={healthy} message={message}");
            if !healthy {
                std::process::exit(EXIT_RUNTIME_ERROR);
            }
        }
        Commands::Daemon { poll_interval_secs } => {
            let (cancel, handle) = engine.run_forever(std::time::Duration::from_secs(poll_interval_secs));
            println!("daemon started, polling every {poll_interval_secs}s (ctrl-c to stop)");
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            cancel.cancel();
            handle.await.context("join daemon task")?;
            println!("daemon stopped");
        }
        Commands::SetMode { mode } => {
            // Like `apply_env_overrides`, `chain_is_empty` is fixed to
            // `true`: this subcommand is not scoped to one issuer, so
            // `LockKeeper`'s durable `module_activated` flag is the
            // binding signal rather than a per-issuer chain check.
            let now = chrono::Utc::now().with_timezone(&chrono::FixedOffset::east_opt(0).unwrap());
            let patch = ConfigPatch {
                mode: Some(mode.into()),
                ..Default::default()
            };
            let mut config = session.config.read().expect("config lock poisoned").clone();
            update(&session.lock, &mut config, patch, now, true)
                .await
                .context("mode change rejected")?;
            validate_config(&config).context("resulting configuration is invalid")?;
            if let Some(path) = &session.config_path {
                save_config(path, &config).context("save configuration")?;
            }
            *session.config.write().expect("config lock poisoned") = config;
            println!("mode changed to {mode:?}");
        }
    }

    Ok(())
}

fn record_json(record: &verifactu_core::Record) -> serde_json::Value {
    serde_json::json!({
        "sequence_number": record.sequence_number,
        "issuer_nif": record.issuer_nif,
        "invoice_number": record.invoice_number,
        "invoice_date": record.invoice_date.to_string(),
        "record_hash": record.record_hash,
        "previous_hash": record.previous_hash,
        "status": format!("{:?}", record.status),
        "qr_url": record.qr_url,
    })
}
