//! `solbatch` command line entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use solbatch::batch::{BatchRunner, RunMode};
use solbatch::config::{load_app_config, load_run_config};
use solbatch::entities::read_entity_ids;
use solbatch::observability;
use solbatch::transport::PgTransport;

/// Apply a list of stored procedures or extractions to every SOL
#[derive(Debug, Parser)]
#[command(name = "solbatch", version, about)]
struct Cli {
    /// Application config (database, concurrency, entity list, log directory)
    #[arg(long, env = "SOLBATCH_APP_CONFIG")]
    app_config: PathBuf,

    /// Run config (package, procedures, output settings)
    #[arg(long, env = "SOLBATCH_RUN_CONFIG")]
    run_config: PathBuf,

    /// `invoke` / `I` to call procedures, `extract` / `E` to extract rows
    #[arg(long)]
    mode: RunMode,

    /// Tracing filter, e.g. `solbatch=debug`; defaults to RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init(cli.log_level.as_deref());

    let app = load_app_config(&cli.app_config)
        .with_context(|| format!("loading {}", cli.app_config.display()))?;
    let run = load_run_config(&cli.run_config)
        .with_context(|| format!("loading {}", cli.run_config.display()))?;

    let entities = read_entity_ids(&app.sol_file_path)
        .await
        .context("reading entity list")?;

    let connections = app
        .connection_pool_size(&run, cli.mode)
        .context("sizing connection pool")?;
    let transport = PgTransport::connect(&app.database, connections)
        .await
        .context("connecting to database")?;
    info!(connections = connections, "Database pool ready");

    let runner = BatchRunner::new(app, run, cli.mode, Arc::new(transport.clone()));
    let result = runner.run(entities).await;
    transport.close().await;

    let report = result.context("batch run failed")?;
    for consolidation in &report.consolidation {
        if let Err(e) = &consolidation.result {
            warn!(operation = %consolidation.operation, error = %e, "Output not consolidated");
        }
    }
    if report.failures > 0 {
        error!(
            failures = report.failures,
            log = %report.log_path.display(),
            "Some operations failed"
        );
    }
    info!(
        entities = report.entities,
        outcomes = report.outcomes,
        summary = %report.summary_path.display(),
        elapsed_secs = report.elapsed.as_secs_f64(),
        "Done"
    );
    Ok(())
}
