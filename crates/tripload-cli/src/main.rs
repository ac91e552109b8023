use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tripload_pipeline::RunConfig;

#[derive(Debug, Parser)]
#[command(name = "tripload")]
#[command(about = "Clean, deduplicate and bulk-load trip records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify the input and bulk-load valid records.
    Run(RunArgs),
    /// Classify and report without touching the database.
    Check(RunArgs),
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Delimited trip file to load (env: TRIPLOAD_INPUT).
    #[arg(long)]
    input: Option<PathBuf>,
    /// Destination table, optionally schema-qualified (env: TRIPLOAD_TABLE).
    #[arg(long)]
    table: Option<String>,
    /// IANA zone the input timestamps are recorded in (env: TRIPLOAD_SOURCE_TZ).
    #[arg(long)]
    time_zone: Option<String>,
    /// Write duplicate records to a secondary CSV file.
    #[arg(long)]
    export_duplicates: bool,
    /// Where to write duplicates; defaults to the run's report directory.
    #[arg(long)]
    duplicates_path: Option<PathBuf>,
    /// Root directory for per-run reports (env: TRIPLOAD_REPORTS_DIR).
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    /// Skip the bulk load.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn into_config(self, base: RunConfig) -> RunConfig {
        RunConfig {
            input_path: self.input.unwrap_or(base.input_path),
            table: self.table.unwrap_or(base.table),
            source_time_zone: self.time_zone.unwrap_or(base.source_time_zone),
            export_duplicates: self.export_duplicates || base.export_duplicates,
            duplicates_path: self.duplicates_path.or(base.duplicates_path),
            reports_dir: self.reports_dir.unwrap_or(base.reports_dir),
            dry_run: self.dry_run || base.dry_run,
            database_url: base.database_url,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => args.into_config(RunConfig::from_env()),
        Commands::Check(args) => RunConfig {
            dry_run: true,
            ..args.into_config(RunConfig::from_env())
        },
    };

    let summary = tripload_pipeline::run_once(config).await?;
    println!(
        "load complete: run_id={} rows={} valid={} duplicates={} defects={} loaded={} report={}",
        summary.run_id,
        summary.data_rows,
        summary.valid_rows,
        summary.duplicate_rows,
        summary.dropped_rows,
        summary
            .loaded_rows
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary.report_path
    );

    if let Some(err) = &summary.load_error {
        bail!("bulk load failed: {err}");
    }
    if let Some(err) = &summary.export_error {
        bail!("duplicate export failed: {err}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment_config() {
        let cli = Cli::parse_from([
            "tripload",
            "run",
            "--input",
            "trips.csv",
            "--time-zone",
            "America/Chicago",
            "--export-duplicates",
        ]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run subcommand");
        };
        let config = args.into_config(RunConfig::default());
        assert_eq!(config.input_path, PathBuf::from("trips.csv"));
        assert_eq!(config.source_time_zone, "America/Chicago");
        assert!(config.export_duplicates);
        assert!(!config.dry_run);
        assert_eq!(config.table, "trips");
    }

    #[test]
    fn bare_invocation_defaults_to_run() {
        let cli = Cli::parse_from(["tripload"]);
        assert!(cli.command.is_none());
    }
}
