/// Operator CLI for the tenant control plane.
/// Run against the same environment as the API (DATABASE_URL, REDIS_URL, ...).
///
/// Usage: tenancy-admin <COMMAND>
///   stats                          : provisioning counts and success rate
///   orphans                        : list records without schema and schemas without record
///   cleanup-orphans                : drop every unrecorded schema
///   recover                        : rebuild every record whose schema is missing
///   cleanup-failed [--max-age-days N]
///   migrate-all                    : apply pending tenant scripts everywhere
use clap::{Parser, Subcommand};

use scolaris_api::{config::Config, models::provision::SweepReport, AppState};

#[derive(Parser)]
#[command(name = "tenancy-admin", about = "Maintain tenant schemas and provisioning records")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Stats,
    Orphans,
    CleanupOrphans,
    Recover,
    CleanupFailed {
        /// Defaults to FAILED_PROVISION_MAX_AGE_DAYS
        #[arg(long)]
        max_age_days: Option<i64>,
    },
    MigrateAll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let state = AppState::connect(Config::from_env()?).await?;
    let orchestrator = &state.orchestrator;

    match args.command {
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&orchestrator.get_stats().await?)?);
        }
        Command::Orphans => {
            let provisions = orchestrator.find_orphaned_provisions().await?;
            let schemas = orchestrator.find_orphaned_schemas().await?;
            println!("Records without schema: {}", provisions.len());
            for record in &provisions {
                println!("  {} {} ({})", record.id, record.schema_name, record.status);
            }
            println!("Schemas without record: {}", schemas.len());
            for schema in &schemas {
                println!("  {schema}");
            }
        }
        Command::CleanupOrphans => print_report(&orchestrator.cleanup_all_orphaned_schemas().await?),
        Command::Recover => print_report(&orchestrator.recover_all_orphaned_provisions().await?),
        Command::CleanupFailed { max_age_days } => {
            let days = max_age_days.unwrap_or(state.config.failed_provision_max_age_days);
            print_report(&orchestrator.cleanup_failed_provisions(days).await?)
        }
        Command::MigrateAll => print_report(&orchestrator.migrate_all_provisioned().await?),
    }

    Ok(())
}

fn print_report(report: &SweepReport) {
    println!(
        "attempted: {}, succeeded: {}, failed: {}",
        report.attempted, report.succeeded, report.failed
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.target, failure.error);
    }
}
