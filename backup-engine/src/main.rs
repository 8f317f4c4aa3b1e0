//! Backup Engine - Main entry point
//!
//! Runs the configured backup jobs once, one after another.

use anyhow::{bail, Context, Result};
use backup_engine::{utils, AppContext, Config};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

const CONFIG_ENV: &str = "BACKUP_ENGINE_CONFIG";
const DEFAULT_CONFIG: &str = "/etc/backup-engine/config.toml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run only the named job (repeatable)
    #[arg(short, long = "job", value_name = "NAME")]
    jobs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting backup-engine"
    );

    for name in &args.jobs {
        if config.job(name).is_none() {
            bail!("no job named '{}' in {}", name, config_path.display());
        }
    }

    let ctx = AppContext::new(config);
    let mut failed = 0usize;

    for job_config in &ctx.config.jobs {
        if !args.jobs.is_empty() && !args.jobs.contains(&job_config.name) {
            continue;
        }

        let mut job = match ctx.build_job(job_config).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job = %job_config.name, error = %e, "Job configuration rejected");
                failed += 1;
                continue;
            }
        };

        let mut report = job.run().await;
        report.errors.extend(job.close().await);

        for err in &report.errors {
            tracing::error!(job = %report.job, error = %err, "Job error");
        }
        if !report.is_clean() {
            failed += 1;
        }
    }

    if failed > 0 {
        tracing::error!(failed_jobs = failed, "Backup run finished with errors");
        Ok(ExitCode::FAILURE)
    } else {
        tracing::info!("Backup run finished");
        Ok(ExitCode::SUCCESS)
    }
}
