use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pbc_adapters::PageShape;
use pbc_core::IdentityPolicy;
use pbc_sync::{
    ComparisonReport, OutputFormat, ReportWriter, RunController, RunSettings, TargetConfig,
    TargetRegistry,
};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "pbc")]
#[command(about = "Price basket comparator: fetch offers, reconcile baskets, write reports")]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the `PBC_*` environment settings.
#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, global = true)]
    out: Option<PathBuf>,
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[arg(long, global = true)]
    format: Option<OutputFormat>,
    #[arg(long, global = true)]
    identity: Option<IdentityPolicy>,
    /// Per-fetch timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every target in a YAML registry.
    Run {
        #[arg(long, default_value = "targets.yaml")]
        config: PathBuf,
    },
    /// Compare the given locators (URLs or saved pages) as one target.
    Compare {
        #[arg(required = true)]
        locators: Vec<String>,
        #[arg(long, default_value = "summary")]
        shape: PageShape,
        #[arg(long)]
        title: Option<String>,
    },
}

impl RunArgs {
    fn apply(&self, mut settings: RunSettings) -> RunSettings {
        if let Some(out) = &self.out {
            settings.output_dir = out.clone();
        }
        if let Some(cap) = self.concurrency {
            settings.concurrency_cap = cap;
        }
        if let Some(format) = self.format {
            settings.output_format = format;
        }
        if let Some(identity) = self.identity {
            settings.identity = identity;
        }
        if let Some(secs) = self.timeout {
            settings.task_timeout = Some(std::time::Duration::from_secs(secs));
        }
        settings
    }
}

/// Plain paths to saved pages become `file://` locators.
fn to_locator(raw: &str) -> Result<String> {
    if Url::parse(raw).is_ok() {
        return Ok(raw.to_string());
    }
    let path = Path::new(raw);
    if !path.exists() {
        return Ok(raw.to_string());
    }
    let abs = path
        .canonicalize()
        .with_context(|| format!("resolving {}", path.display()))?;
    Url::from_file_path(&abs)
        .map(String::from)
        .map_err(|_| anyhow::anyhow!("cannot express {} as a file URL", abs.display()))
}

fn print_summary(report: &ComparisonReport) {
    for table in &report.tables {
        println!(
            "{}: rows={} baskets={} status={}",
            table.title(),
            table.rows().len(),
            table.basket_columns().len(),
            table.status()
        );
    }
    for f in &report.failures {
        eprintln!("failed [{}] {}: {}", f.target, f.failure.locator, f.failure.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let settings = cli
        .run
        .apply(RunSettings::from_env().context("loading PBC_* settings")?);
    let controller = RunController::new(&settings)?;

    let registry = match cli.command {
        Commands::Run { config } => TargetRegistry::load(&config)?,
        Commands::Compare {
            locators,
            shape,
            title,
        } => {
            let locators = locators
                .iter()
                .map(|l| to_locator(l))
                .collect::<Result<Vec<_>>>()?;
            let mut target = TargetConfig::new(shape, locators);
            target.title = title;
            TargetRegistry::single(target)
        }
    };

    tracing::info!(
        targets = registry.targets.len(),
        cap = controller.concurrency_cap(),
        "starting comparison"
    );
    let report = controller.run_batch(&registry).await?;
    let written = ReportWriter::from_settings(&settings).write(&report).await?;

    print_summary(&report);
    println!(
        "comparison complete: batch_id={} rows={} failures={} reports={}",
        report.batch_id,
        report.rows().count(),
        report.failures.len(),
        written.dir.display()
    );
    Ok(())
}
