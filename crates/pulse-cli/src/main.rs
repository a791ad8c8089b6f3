use std::process::ExitCode;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use pulse_core::{ClientScope, DateRange, PeriodType};
use pulse_storage::PgStore;
use pulse_sync::{AggregateRequest, SyncConfig, SyncRuntime};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Client portal metrics sync and aggregation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull platform metrics for one integration, or every active/errored one.
    Sync {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long)]
        integration: Option<Uuid>,
    },
    /// Roll daily facts up into weekly or monthly KPI values.
    Aggregate {
        #[arg(long, default_value = "weekly")]
        period: PeriodType,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        /// Defaults to every client with facts in the range.
        #[arg(long)]
        client: Option<Uuid>,
        #[arg(long)]
        actor: Option<Uuid>,
    },
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PULSE_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A second init (e.g. under a test harness) keeps the first subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync { from, to, integration } => {
            let range = DateRange::new(from, to)?;
            let runtime = SyncRuntime::connect(&config).await?;
            match integration {
                Some(id) => {
                    let integration = runtime
                        .store
                        .integration(id)
                        .await?
                        .ok_or_else(|| anyhow!("integration {id} not found"))?;
                    let outcome = runtime.orchestrator.sync_integration(&integration, range).await?;
                    print_json(&outcome)?;
                    if !outcome.success {
                        return Ok(ExitCode::FAILURE);
                    }
                }
                None => {
                    let summary = runtime.orchestrator.sync_all_active(range).await?;
                    print_json(&summary)?;
                    if summary.failed > 0 {
                        return Ok(ExitCode::FAILURE);
                    }
                }
            }
        }
        Commands::Aggregate {
            period,
            from,
            to,
            client,
            actor,
        } => {
            let request = AggregateRequest {
                scope: client.map_or(ClientScope::AllWithFacts, ClientScope::Client),
                period_type: period,
                range: DateRange::new(from, to)?,
                actor_id: actor,
            };
            let runtime = SyncRuntime::connect(&config).await?;
            let summary = runtime.aggregator.aggregate(&request).await?;
            print_json(&summary)?;
            if !summary.errors.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn aggregate_args_parse_period_and_ids() {
        let client = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "pulse-cli",
            "aggregate",
            "--period",
            "monthly",
            "--from",
            "2024-03-01",
            "--to",
            "2024-03-31",
            "--client",
            &client.to_string(),
        ])
        .unwrap();
        match cli.command {
            Commands::Aggregate { period, client: parsed, actor, .. } => {
                assert_eq!(period, PeriodType::Monthly);
                assert_eq!(parsed, Some(client));
                assert_eq!(actor, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_period_is_rejected() {
        assert!(Cli::try_parse_from([
            "pulse-cli", "aggregate", "--period", "daily", "--from", "2024-03-01", "--to", "2024-03-02",
        ])
        .is_err());
    }
}
