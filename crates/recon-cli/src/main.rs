use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recon_sync::baseline::DEFAULT_LINK_TTL_SECS;
use recon_sync::reports::report_runs_markdown;
use recon_sync::{
    acknowledge_run, write_run_artifacts, BaselineWorkflow, LeadsOptions, LeadsPipeline,
    ReconConfig, UploadedFile,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Leads reconciliation command-line interface")]
struct Cli {
    /// Overrides RECON_REPORTS_DIR.
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process a leads export and write the run artifacts.
    Leads {
        #[arg(long)]
        current: PathBuf,
        #[arg(long)]
        previous: Option<PathBuf>,
        #[arg(long)]
        skip_remote: bool,
        #[arg(long)]
        skip_overlay: bool,
    },
    /// Mark the pending updates of a stored run as applied.
    Acknowledge {
        #[arg(long)]
        run_id: Uuid,
    },
    /// Compare a survey workbook with the stored baseline.
    Baseline {
        #[arg(long)]
        file: PathBuf,
        /// Report changes without replacing the stored baseline.
        #[arg(long)]
        no_replace: bool,
    },
    BaselineLink {
        #[arg(long, default_value_t = DEFAULT_LINK_TTL_SECS)]
        ttl: u64,
    },
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn read_upload(path: &Path) -> Result<UploadedFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(UploadedFile {
        name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        bytes,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ReconConfig::from_env();
    if let Some(dir) = cli.reports_dir {
        config.reports_dir = dir;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Leads {
            current,
            previous,
            skip_remote,
            skip_overlay,
        } => {
            let current = read_upload(&current).await?;
            let previous = match previous {
                Some(path) => Some(read_upload(&path).await?),
                None => None,
            };
            let reports_dir = config.reports_dir.clone();
            let pipeline = LeadsPipeline::from_config(config)?;
            let report = pipeline
                .run(
                    &current,
                    previous.as_ref(),
                    LeadsOptions {
                        skip_remote,
                        skip_overlay,
                    },
                )
                .await?;
            let dir = write_run_artifacts(&reports_dir, &report).await?;
            let summary = &report.summary;
            println!(
                "leads run complete: run_id={} records={} added={} modified={} unchanged={} pending_updates={} reports={}",
                summary.run_id,
                summary.record_count,
                summary.added,
                summary.modified,
                summary.unchanged,
                summary.processed_update_ids.len(),
                dir.display()
            );
        }
        Commands::Acknowledge { run_id } => {
            let reports_dir = config.reports_dir.clone();
            let pipeline = LeadsPipeline::from_config(config)?;
            let outcome = acknowledge_run(&pipeline, &reports_dir, run_id)
                .await?
                .with_context(|| format!("no run {run_id} under {}", reports_dir.display()))?;
            if outcome.already_acknowledged {
                println!("run {run_id} was already acknowledged at {}", outcome.acknowledged_at);
            } else {
                println!("run {run_id} acknowledged: updated={}", outcome.updated);
            }
        }
        Commands::Baseline { file, no_replace } => {
            let upload = read_upload(&file).await?;
            let profile = config.load_profile()?;
            let files = config.file_store()?;
            let workflow = BaselineWorkflow::from_config(&config, profile, files);
            let comparison = workflow
                .compare(upload.name.as_deref(), &upload.bytes, !no_replace)
                .await?;
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        }
        Commands::BaselineLink { ttl } => {
            let profile = config.load_profile()?;
            let files = config.file_store()?;
            let workflow = BaselineWorkflow::from_config(&config, profile, files);
            match workflow.link(ttl).await? {
                Some(url) => println!("{url}"),
                None => println!("no baseline"),
            }
        }
        Commands::Runs { limit } => {
            print!("{}", report_runs_markdown(&config.reports_dir, limit).await?);
        }
        Commands::Serve => {
            info!(port = config.web_port, "starting web server");
            recon_web::serve(config).await?;
        }
    }

    Ok(())
}
