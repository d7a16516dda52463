use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use dwsync::catalog::{Catalog, SourceSettings};
use dwsync::checkpoint::CheckpointResolver;
use dwsync::config::SyncConfig;
use dwsync::runner::{RunOptions, RunReport};
use dwsync::warehouse::{SyncJob, DW_VERSION};
use dwsync::workspace::ExclusiveWorkspace;
use dwsync::{logging, Result, SyncError};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dwsync", version)]
#[command(about = "Incrementally synchronize a local datawarehouse with its upstream sources", long_about = None)]
struct Cli {
    /// Datawarehouse directory (defaults to DWSYNC_DW_PATH or ./datawarehouse)
    #[arg(long, short = 'd')]
    datawarehouse: Option<PathBuf>,

    /// Collector catalog (defaults to DWSYNC_CATALOG or ./catalog.json)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Wipe the datawarehouse before running
    #[arg(long = "delete-force", short = 'D')]
    delete_force: bool,

    /// Platforms to run (all when omitted)
    #[arg(long, short = 'p', num_args = 1..)]
    platforms: Vec<String>,

    /// Networks to run (all when omitted)
    #[arg(long, short = 'n', num_args = 1..)]
    networks: Vec<String>,

    /// Collectors to run, by name or runner/name (all when omitted)
    #[arg(long, short = 'c', num_args = 1..)]
    collectors: Vec<String>,

    /// Use the last block at or before this date (RFC 3339 or YYYY-MM-DD)
    #[arg(long = "block-datetime", short = 'B', value_parser = parse_datetime)]
    block_datetime: Option<DateTime<Utc>>,

    /// Ignore stored checkpoints and refetch every partition
    #[arg(long, short = 'F')]
    force: bool,

    /// Stop at the first failing collector
    #[arg(long = "fail-fast")]
    fail_fast: bool,

    /// Only run collectors that can be updated incrementally
    #[arg(long = "only-updatable")]
    only_updatable: bool,

    /// Run collectors even if their verification fails
    #[arg(long = "skip-verify")]
    skip_verify: bool,

    /// Print warnings and write debug entries to the log file
    #[arg(long)]
    debug: bool,
}

fn parse_datetime(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .ok_or_else(|| format!("invalid date {:?}, expected RFC 3339 or YYYY-MM-DD", raw))
}

fn check_selection(kind: &str, selected: &[String], available: &[String]) -> Result<()> {
    match selected.iter().find(|s| !available.contains(s)) {
        Some(unknown) => Err(SyncError::Config(format!(
            "unknown {} {} (available: {})",
            kind,
            unknown,
            available.join(", ")
        ))),
        None => Ok(()),
    }
}

fn print_report(report: &RunReport) {
    println!(
        "[dwsync] {}: {} succeeded, {} failed, {} excluded",
        report.runner,
        report.succeeded.len(),
        report.failed.len(),
        report.excluded.len()
    );
    for (id, error) in &report.failed {
        println!("[dwsync]   {} failed: {}", id, error);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::from_env()?;
    if let Some(dw) = cli.datawarehouse {
        config.datawarehouse = dw;
    }
    if let Some(catalog) = cli.catalog {
        config.catalog = catalog;
    }
    config.log.debug |= cli.debug;

    let workspace = ExclusiveWorkspace::acquire(&config.datawarehouse)?;
    logging::init(&workspace, &config.log)?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "Running dwsync");

    let catalog = Catalog::load(&config.catalog)?;
    check_selection("platform", &cli.platforms, &catalog.platform_names())?;
    check_selection("network", &cli.networks, &catalog.networks())?;

    let settings = SourceSettings {
        api_key: config.api_key.clone(),
        page_size: config.page_size,
    };
    let resolver = CheckpointResolver::new(Box::new(catalog.block_source(&settings)?), config.skip_invalid_blocks);

    let job = SyncJob {
        resolver: &resolver,
        options: RunOptions {
            force: cli.force,
            until: cli.block_datetime,
            fail_fast: cli.fail_fast,
            skip_verify: cli.skip_verify,
            only_updatable: cli.only_updatable,
            networks: cli.networks,
            collectors: cli.collectors,
        },
        delete_force: cli.delete_force,
        version: DW_VERSION,
    };

    println!("[dwsync] Datawarehouse: {}", config.datawarehouse.display());
    let reports = job.run(workspace.staged_root(), |dw| {
        catalog.build_runners(dw, &cli.platforms, &settings)
    })?;
    workspace.publish()?;

    for report in &reports {
        print_report(report);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("[dwsync] {}", e);
        std::process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_formats() {
        assert_eq!(parse_datetime("2022-03-01").unwrap().to_rfc3339(), "2022-03-01T00:00:00+00:00");
        assert_eq!(
            parse_datetime("2022-03-01T10:00:00+02:00").unwrap().to_rfc3339(),
            "2022-03-01T08:00:00+00:00"
        );
        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["dwsync", "-p", "daostack", "-n", "mainnet", "xdai", "--force", "--fail-fast"]);
        assert_eq!(cli.platforms, vec!["daostack"]);
        assert_eq!(cli.networks, vec!["mainnet", "xdai"]);
        assert!(cli.force && cli.fail_fast && !cli.delete_force);
    }

    #[test]
    fn test_unknown_selection_is_rejected() {
        let available = vec!["mainnet".to_string()];
        assert!(check_selection("network", &["mainnet".to_string()], &available).is_ok());
        assert!(check_selection("network", &["ropsten".to_string()], &available).is_err());
    }
}
