use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use repf_core::EnergyDomain;
use repf_sync::{DomainRunSummary, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "repf-cli")]
#[command(about = "REPF command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest, clean and upsert measurement data for all domains or one.
    Sync {
        /// Restrict the run to a single domain (hydro, wind, solar).
        #[arg(long)]
        domain: Option<String>,
    },
    /// Apply the store schema migrations.
    Migrate,
    /// Serve the prediction endpoints (and the sync scheduler, if enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { domain: None }) {
        Commands::Sync { domain } => {
            let config = SyncConfig::from_env();
            let pipeline = SyncPipeline::new(config).await?;

            let outcomes = match domain {
                Some(name) => {
                    let domain = EnergyDomain::from_name(&name)
                        .ok_or_else(|| anyhow!("unknown domain `{name}`"))?;
                    vec![(domain, pipeline.run_domain(domain).await)]
                }
                None => pipeline.run_all().await,
            };

            let mut failures = 0usize;
            for (domain, outcome) in outcomes {
                match outcome {
                    Ok(summary) => print_summary(&summary),
                    Err(err) => {
                        eprintln!("{domain}: run failed: {err}");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                return Err(anyhow!("{failures} domain run(s) failed"));
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = repf_storage::Store::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            if let Some(scheduler) = repf_sync::maybe_build_scheduler(&config).await? {
                scheduler.start().await?;
                println!("sync scheduler started ({})", config.sync_cron);
            }
            repf_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn print_summary(summary: &DomainRunSummary) {
    println!(
        "{}: run_id={} wrote {} rows (kept {}, bad dates {}, out of range {}, duplicates {}, outliers rejected {}, without metrics {})",
        summary.domain,
        summary.run_id,
        summary.rows_written,
        summary.clean.kept,
        summary.clean.bad_date,
        summary.clean.out_of_range,
        summary.clean.duplicate_date,
        summary.outliers_rejected,
        summary.rows_without_metrics,
    );
}
