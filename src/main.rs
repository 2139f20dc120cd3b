use anyhow::{Context, Result};
use clap::Parser;
use fiscal_panel::{write_outputs, InputTables, Pipeline, PipelineConfig};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Build the region-year fiscal panel")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "fiscal-panel.toml")]
    config: PathBuf,

    /// Validate the configuration and input tables, then exit without running.
    #[arg(long)]
    check: bool,

    /// Run every stage but write nothing.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    let tables = InputTables::load(&config.inputs).context("failed to load input tables")?;

    if cli.check {
        println!("✓ Configuration and input tables are valid");
        return Ok(());
    }

    // Outputs are written only after every stage has succeeded
    let run = Pipeline::new(&config).run(&tables).context("pipeline aborted")?;

    println!("📊 Panel: {} region-years", run.report.panel_rows);
    println!(
        "🔗 Crosswalk retention: {:.1}% ({} of {} pairs)",
        run.report.crosswalk.retention_rate * 100.0,
        run.report.crosswalk.one_to_one,
        run.report.crosswalk.distinct_pairs
    );
    for stage in &run.report.stages {
        println!("   {}", stage.summary());
    }
    println!("🔑 Digest: {}", run.report.panel_digest);

    if cli.dry_run {
        println!("Dry run: nothing written");
        return Ok(());
    }

    write_outputs(&config.output, &run).context("failed to write outputs")?;
    println!("✅ Wrote {}", config.output.panel_csv.display());

    Ok(())
}
