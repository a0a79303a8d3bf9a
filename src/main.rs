//! Inventory Ledger daemon and maintenance CLI
//!
//! ## Usage
//!
//! ```bash
//! # Run the daily invoice follow-up at 09:00 regional time
//! inventory-ledger schedule
//!
//! # Run one follow-up cycle now
//! inventory-ledger escalate --no-jitter
//!
//! # Recompute the counters of one item (or all)
//! inventory-ledger heal --name "Filter" --category "Parts"
//! inventory-ledger heal --all
//!
//! # Configure the responsible managers
//! inventory-ledger init-settings --biz-manager u-17 --tax-manager u-4
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use inventory_ledger::db::{directory, WorkManagers};
use inventory_ledger::services::events::spawn_logging_listener;
use inventory_ledger::{
    Config, HttpHolidaySource, ItemIdentity, LedgerDb, LocalAttachmentStore, Services, SystemClock,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "inventory-ledger")]
#[command(about = "Inventory ledger with self-healing counters and invoice follow-ups")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "INVENTORY_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "INVENTORY_LEDGER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the escalation job every day at the configured time
    Schedule,

    /// Run one escalation cycle now
    Escalate {
        /// Skip the randomized start delay
        #[arg(long)]
        no_jitter: bool,
    },

    /// Recompute meta counters from ledger rows
    Heal {
        #[arg(long, required_unless_present = "all")]
        name: Option<String>,

        #[arg(long, required_unless_present = "all")]
        category: Option<String>,

        #[arg(long)]
        master_id: Option<String>,

        /// Heal every known identity
        #[arg(long, conflicts_with_all = ["name", "category", "master_id"])]
        all: bool,
    },

    /// Write the work-manager settings document
    InitSettings {
        /// User id of the business registration manager
        #[arg(long)]
        biz_manager: String,

        /// User id of the tax invoice manager
        #[arg(long)]
        tax_manager: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("inventory_ledger=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Command::Escalate { no_jitter: true } = args.command {
        config.escalation.jitter_min_secs = 0;
        config.escalation.jitter_max_secs = 0;
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(LedgerDb::open(&config.storage_dir)?);
    let attachments = Arc::new(
        LocalAttachmentStore::new(config.attachments_dir(), config.trash_dir()).await?,
    );
    let holidays = Arc::new(HttpHolidaySource::new(&config.holidays));
    let clock = Arc::new(SystemClock);
    let services = Services::new(db.clone(), &config, holidays, attachments, clock)?;

    info!(
        storage_dir = %config.storage_dir.display(),
        "Starting inventory-ledger"
    );

    match args.command {
        Command::Schedule => {
            let listener = spawn_logging_listener(services.events.clone());
            let job = services.escalation.clone();

            info!(run_at = %config.escalation.run_at, "Scheduler running. Press Ctrl+C to stop.");
            tokio::select! {
                _ = job.run_daily() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                }
            }
            listener.abort();
        }

        Command::Escalate { .. } => {
            match services.escalation.run(chrono::Utc::now()).await {
                Some(report) => info!(
                    today = %report.today,
                    business_day = report.business_day,
                    candidates = report.candidates,
                    sent = report.sent,
                    skipped = report.skipped,
                    "Escalation run complete"
                ),
                None => warn!("Escalation run failed, see log above"),
            }
        }

        Command::Heal { all: true, .. } => {
            let healed = services.reconcile.heal_all()?;
            info!(identities = healed.len(), "Healed all meta counters");
        }

        Command::Heal {
            name,
            category,
            master_id,
            ..
        } => {
            let identity = ItemIdentity::new(
                name.as_deref().unwrap_or_default(),
                category.as_deref().unwrap_or_default(),
                master_id.as_deref(),
            );
            let meta = services.reconcile.heal(&identity, None, None, None)?;
            info!(
                key = %meta.key,
                total_inflow = meta.total_inflow,
                total_outflow = meta.total_outflow,
                current_stock = meta.current_stock,
                "Healed meta counter"
            );
        }

        Command::InitSettings {
            biz_manager,
            tax_manager,
        } => {
            let managers = WorkManagers {
                biz_registration_manager_id: biz_manager,
                tax_invoice_manager_id: tax_manager,
            };
            managers.validate()?;
            db.with_conn(|conn| directory::put_setting(conn, directory::WORK_MANAGERS_DOC, &managers))?;
            info!("Saved work manager settings");
        }
    }

    let stats = db.stats()?;
    info!(
        rows = stats.row_count,
        identities = stats.identity_count,
        activities = stats.activity_count,
        open_requests = stats.open_request_count,
        "Ledger stats"
    );

    Ok(())
}
