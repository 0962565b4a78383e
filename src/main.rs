use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use partnerlink::backfill::scheduler::StartBackfillRequest;
use partnerlink::backfill::BackfillType;
use partnerlink::config::Config;
use partnerlink::logging;
use partnerlink::server::PartnerServer;
use partnerlink::service::PartnerService;
use partnerlink::store::postgres::PostgresPartnerStore;
use rmcp::ServiceExt;

#[derive(Parser)]
#[command(name = "partnerlink", version, about = "Care request partner association server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Skip automatic database migration on startup
    #[arg(long)]
    skip_migrate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations and exit
    Migrate,
    /// Backfill operations
    Backfill {
        #[command(subcommand)]
        action: BackfillAction,
    },
}

#[derive(Subcommand)]
enum BackfillAction {
    /// Start a backfill for one partner and wait for it to finish
    Start {
        /// Station channel item id of the partner
        #[arg(long)]
        partner: i64,
        /// Backfill type (e.g., "pophealth")
        #[arg(long = "type", default_value = "pophealth")]
        backfill_type: String,
        /// First day of the window, YYYY-MM-DD
        #[arg(long)]
        start: NaiveDate,
        /// Exclusive last day of the window, YYYY-MM-DD
        #[arg(long)]
        end: NaiveDate,
    },
    /// Run every unfinished backfill to completion
    Sweep,
}

/// Run the pending sweep once at startup and then on the configured interval.
fn spawn_sweeps(service: Arc<PartnerService>, config: &Config) {
    let on_startup = config.backfill.sweep_on_startup;
    let interval_secs = config.backfill.sweep_interval_secs;
    if !on_startup && interval_secs == 0 {
        return;
    }

    tokio::spawn(async move {
        if on_startup {
            run_sweep(&service).await;
        }
        if interval_secs == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_sweep(&service).await;
        }
    });
}

async fn run_sweep(service: &PartnerService) {
    match service.process_pending_backfills().await {
        Ok(summary) => tracing::info!(
            launched = summary.launched,
            finished = summary.finished,
            skipped = summary.skipped,
            "Pending backfill sweep finished"
        ),
        Err(e) => tracing::error!(error = %e, "Pending backfill sweep failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        Config::default()
    });

    // 3. Initialize logging FIRST (before any other output)
    // stdout is reserved for JSON-RPC; the guard flushes the log file on exit
    let _log_guard = logging::init_logging(&config);

    // 4. Handle subcommands
    match cli.command {
        Some(Commands::Migrate) => {
            tracing::info!("Running database migrations...");
            PostgresPartnerStore::new(&config.database_url, true).await?;
            println!("Migrations completed successfully.");
        }

        Some(Commands::Backfill { action }) => {
            let service = PartnerService::connect(&config, !cli.skip_migrate).await?;
            match action {
                BackfillAction::Start { partner, backfill_type, start, end } => {
                    let backfill_type: BackfillType = backfill_type
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))?;
                    let job = service
                        .start_backfill(StartBackfillRequest {
                            partner_channel_item_id: partner,
                            backfill_type: Some(backfill_type),
                            start_date: Some(start),
                            end_date: Some(end),
                        })
                        .await?;
                    println!("Backfill {} started for partner {}", job.id, partner);

                    service.flush_backfills().await;
                    let job = service.get_backfill(job.id).await?;
                    println!(
                        "Backfill {}: {:?}, {} matches{}",
                        job.id,
                        job.state(),
                        job.number_of_matches,
                        job.error_description
                            .map(|e| format!(" (error: {})", e))
                            .unwrap_or_default()
                    );
                }
                BackfillAction::Sweep => {
                    let summary = service.process_pending_backfills().await?;
                    println!(
                        "Backfill sweep: launched={} finished={} skipped={}",
                        summary.launched, summary.finished, summary.skipped
                    );
                }
            }
        }

        None => {
            // Default: run MCP server
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "partnerlink server starting"
            );

            let service = Arc::new(PartnerService::connect(&config, !cli.skip_migrate).await?);
            spawn_sweeps(Arc::clone(&service), &config);

            let (stdin, stdout) = rmcp::transport::io::stdio();
            let server = PartnerServer::new(service).serve((stdin, stdout)).await?;

            tracing::info!("partnerlink server running, awaiting tool calls via stdio");

            server.waiting().await?;

            tracing::info!("partnerlink server stopped");
        }
    }

    Ok(())
}
