//! sqlx-binds - schema and fixture maintenance for configured binds.

use clap::Parser;
use serde_json::json;
use sqlx_binds::config::{Cli, Command, DbCommand, FixturesCommand};
use sqlx_binds::db::{BindRegistry, BindSelection, SchemaReport};
use sqlx_binds::error::DbResult;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output
    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn print_report(report: &SchemaReport) -> bool {
    for (bind, result) in &report.results {
        match result {
            Ok(count) => println!("{}: {} {} table(s)", bind, report.operation, count),
            Err(e) => println!("{}: {} failed: {}", bind, report.operation, e),
        }
    }
    report.is_success()
}

async fn info(registry: &BindRegistry, uri_only: bool) -> DbResult<bool> {
    if uri_only {
        println!("{}", registry.default_bind()?.config().engine.masked_url());
        return Ok(true);
    }
    let binds: Vec<_> = registry
        .binds()
        .map(|bind| {
            json!({
                "name": bind.name(),
                "url": bind.config().engine.masked_url(),
                "database": bind.db_type().to_string(),
                "read_only": bind.is_read_only(),
                "async": bind.is_async(),
                "tables": bind.tables().iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&binds)?);
    Ok(true)
}

async fn run(cli: &Cli) -> DbResult<bool> {
    let config = cli.app_config()?;
    let registry = BindRegistry::from_config(config).await?;

    let ok = match &cli.command {
        Command::Db(DbCommand::Info { uri_only }) => info(&registry, *uri_only).await?,
        Command::Db(DbCommand::Create { bind }) => {
            print_report(&registry.create_all(BindSelection::from(bind.as_str())).await?)
        }
        Command::Db(DbCommand::Drop { bind }) => {
            print_report(&registry.drop_all(BindSelection::from(bind.as_str())).await?)
        }
        Command::Db(DbCommand::Recreate { bind }) => {
            let selection = BindSelection::from(bind.as_str());
            let dropped = print_report(&registry.drop_all(selection.clone()).await?);
            dropped && print_report(&registry.create_all(selection).await?)
        }
        Command::Fixtures(FixturesCommand::Load { names }) => {
            let rows = registry.load_fixtures(names).await?;
            println!("Loaded {} row(s)", rows);
            true
        }
    };

    registry.dispose_all().await;
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    info!("sqlx-binds v{}", env!("CARGO_PKG_VERSION"));

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {}", suggestion);
            }
            ExitCode::FAILURE
        }
    }
}
