/*!
Snapkeep CLI - unattended EBS snapshot creation and retention rotation.

Each invocation discovers volumes, snapshots and/or purges, prints a summary
and exits. Exit status is non-zero when any volume or snapshot failed.
*/

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use snapkeep_core::inventory::runtime;
use snapkeep_core::tags::parse_tag_pair;
use snapkeep_core::{
    init_logging, run, CleanupVerdict, CloudInventory, ConfigOverrides, DetachedHost,
    FreezeRegistry, FsFreeze, LocalHost, RetentionClock, RetentionCutoff, RunMode, RunReport,
    SnapkeepConfig,
    TagFilter, TagMapEntry, Tags, VolumeOutcome,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "snapkeep")]
#[command(about = "Create EBS snapshots and rotate them by age and tags")]
#[command(version)]
struct Cli {
    /// Volume to operate on (repeatable, or comma separated)
    #[arg(long = "volume", value_name = "VOLUME_ID", global = true, value_delimiter = ',')]
    volumes: Vec<String>,

    /// Instance whose attached volumes are operated on
    #[arg(long = "instance", value_name = "INSTANCE_ID", global = true, value_delimiter = ',')]
    instances: Vec<String>,

    /// Only snapshot volumes carrying one of these tags (`key` or `key=value`)
    #[arg(long = "tag-list", value_name = "FILTER", global = true, value_delimiter = ',')]
    tag_list: Vec<TagFilter>,

    /// Copy volume tags onto snapshots (`Source` or `Source=Target`)
    #[arg(long = "tag-map", value_name = "MAPPING", global = true, value_delimiter = ',')]
    tag_map: Vec<TagMapEntry>,

    /// Only purge snapshots carrying one of these tags
    #[arg(long = "snapshot-tag-filter", value_name = "FILTER", global = true, value_delimiter = ',')]
    snapshot_tag_filter: Vec<TagFilter>,

    /// Additional `key=value` tags for new snapshots
    #[arg(long = "extra-tags", value_name = "TAG", global = true, value_delimiter = ',', value_parser = parse_tag_pair)]
    extra_tags: Vec<(String, String)>,

    /// Retention age: N, Nd, Nw, Nm, Ny, or a date phrase such as "last monday"
    #[arg(long, global = true)]
    max_age: Option<String>,

    /// Absolute retention cutoff date
    #[arg(long, global = true)]
    max_date: Option<String>,

    /// Ignore snapshot age; purge every owned snapshot matching the filters.
    /// Takes precedence over --max-date and --max-age.
    #[arg(long, global = true)]
    no_max_date: bool,

    /// Log every decision without creating, tagging or deleting anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Freeze locally mounted filesystems while snapshotting
    #[arg(long, global = true)]
    freeze: bool,

    /// JSON configuration file
    #[arg(long, global = true, env = "SNAPKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Cloud region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Write Prometheus metrics to this file after the run
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Snapshot the selected volumes
    #[command(visible_alias = "backup")]
    Snapshot,
    /// Delete expired snapshots of the selected volumes
    Cleanup,
    /// Snapshot, then delete expired snapshots
    #[command(visible_alias = "cycle")]
    Maintain,
}

impl From<Commands> for RunMode {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Snapshot => RunMode::Snapshot,
            Commands::Cleanup => RunMode::Cleanup,
            Commands::Maintain => RunMode::Maintain,
        }
    }
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Volume")]
    volume: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
    #[tabled(rename = "Result")]
    result: String,
}

#[derive(Tabled)]
struct CleanupRow {
    #[tabled(rename = "Volume")]
    volume: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Result")]
    result: String,
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    let mode = RunMode::from(cli.command);
    let log_json = cli.log_json;
    let metrics_file = cli.metrics_file.clone();

    let config = load_config(cli)?;
    init_logging(config.debug, log_json)?;

    let registry = FreezeRegistry::new(FsFreeze);
    install_signal_hook(registry.clone());

    let inventory = connect_inventory(&config)?;
    let host = local_host(&config);

    let report = run(
        mode,
        &config,
        inventory.as_ref(),
        host.as_ref(),
        registry,
        RetentionClock::system(),
    )?;

    print_summary(&report);

    if let Some(path) = metrics_file {
        write_metrics(&path)?;
    }

    if report.has_failures() {
        error!(failures = report.failures(), "Run completed with failures");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Defaults, then the config file, then command-line flags.
fn load_config(cli: Cli) -> Result<SnapkeepConfig, anyhow::Error> {
    let base = SnapkeepConfig::load(cli.config.as_deref())?;

    let extra_tags = (!cli.extra_tags.is_empty())
        .then(|| cli.extra_tags.into_iter().collect::<Tags>());

    Ok(base.apply(ConfigOverrides {
        volumes: non_empty(cli.volumes),
        instances: non_empty(cli.instances),
        tag_list: non_empty(cli.tag_list),
        tag_map: non_empty(cli.tag_map),
        snapshot_tag_filter: non_empty(cli.snapshot_tag_filter),
        extra_tags,
        max_age: cli.max_age,
        max_date: cli.max_date,
        no_max_date: cli.no_max_date,
        dry_run: cli.dry_run,
        debug: cli.debug,
        freeze_filesystems: cli.freeze,
        region: cli.region,
    }))
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

#[cfg(feature = "ec2")]
fn connect_inventory(config: &SnapkeepConfig) -> Result<Box<dyn CloudInventory>, anyhow::Error> {
    let inventory = snapkeep_core::create_ec2_inventory(config.region.clone())
        .context("Failed to connect to EC2")?;
    Ok(Box::new(inventory))
}

#[cfg(not(feature = "ec2"))]
fn connect_inventory(_config: &SnapkeepConfig) -> Result<Box<dyn CloudInventory>, anyhow::Error> {
    anyhow::bail!("snapkeep was built without EC2 support (enable the `ec2` feature)")
}

fn local_host(config: &SnapkeepConfig) -> Box<dyn LocalHost> {
    if !config.freeze_filesystems {
        return Box::new(DetachedHost);
    }

    #[cfg(feature = "ec2")]
    {
        Box::new(snapkeep_core::Ec2Host::new())
    }
    #[cfg(not(feature = "ec2"))]
    {
        warn!("Filesystem freeze needs EC2 support, continuing without it");
        Box::new(DetachedHost)
    }
}

/// Thaw anything still frozen when the process is interrupted, then exit 130.
fn install_signal_hook(registry: FreezeRegistry) {
    runtime().spawn(async move {
        wait_for_shutdown_signal().await;
        warn!(frozen = registry.outstanding().len(), "Interrupted, releasing frozen filesystems");
        if let Err(e) = registry.release_all() {
            error!(error = %e, "Failed to thaw filesystems during shutdown");
        }
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, handling Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_summary(report: &RunReport) {
    let prefix = if report.dry_run { "[dry run] " } else { "" };

    if report.mode.takes_snapshots() {
        let rows: Vec<SnapshotRow> = report.snapshots.iter().map(snapshot_row).collect();
        if rows.is_empty() {
            println!("{prefix}No volumes selected for snapshot");
        } else {
            println!("{prefix}Snapshots");
            println!("{}", Table::new(rows));
        }
    }

    if report.mode.cleans_up() {
        if let Some(cutoff) = report.cutoff {
            println!("{prefix}{}", cutoff_line(cutoff));
        }
        let rows: Vec<CleanupRow> = report.cleanup.iter().map(cleanup_row).collect();
        if rows.is_empty() {
            println!("{prefix}No snapshots found for cleanup");
        } else {
            println!("{prefix}Cleanup");
            println!("{}", Table::new(rows));
        }
    }

    info!(
        created = report.created(),
        deleted = report.deleted(),
        failures = report.failures(),
        "Summary"
    );
}

fn snapshot_row(outcome: &VolumeOutcome) -> SnapshotRow {
    let result = match outcome {
        VolumeOutcome::Failed { error, .. } => format!("{}: {error}", outcome.label()),
        VolumeOutcome::Created {
            thaw_error: Some(error),
            ..
        } => format!("{}: {error}", outcome.label()),
        VolumeOutcome::Created { tag_failures, .. } if !tag_failures.is_empty() => {
            format!("{} ({} tag writes failed)", outcome.label(), tag_failures.len())
        }
        _ => outcome.label().to_string(),
    };
    SnapshotRow {
        volume: outcome.volume_id().to_string(),
        snapshot: outcome.snapshot_id().unwrap_or("-").to_string(),
        result,
    }
}

fn cleanup_row(verdict: &CleanupVerdict) -> CleanupRow {
    let created = match verdict {
        CleanupVerdict::Retained { created, .. }
        | CleanupVerdict::Deleted { created, .. }
        | CleanupVerdict::DryRunDeleted { created, .. } => format_time(*created),
        _ => "-".to_string(),
    };
    let result = match verdict {
        CleanupVerdict::DeleteFailed { error, .. } => format!("{}: {error}", verdict.label()),
        _ => verdict.label().to_string(),
    };
    CleanupRow {
        volume: verdict.volume_id().to_string(),
        snapshot: verdict.snapshot_id().to_string(),
        created,
        result,
    }
}

fn cutoff_line(cutoff: RetentionCutoff) -> String {
    match cutoff {
        RetentionCutoff::NoMaxDate => "Retention cutoff: none, age gate disabled".to_string(),
        RetentionCutoff::Before(at) => format!("Retention cutoff: {}", format_time(at)),
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn write_metrics(path: &Path) -> Result<(), anyhow::Error> {
    let text = snapkeep_core::observability::gather_metrics()?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    info!(path = %path.display(), "Wrote metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "snapkeep",
            "backup",
            "--instance",
            "i-1,i-2",
            "--tag-list",
            "env=prod",
            "--tag-map",
            "Name=BackupLabel",
            "--extra-tags",
            "Team=storage",
            "--max-age",
            "2w",
            "--dry-run",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Snapshot));

        let config = load_config(cli).unwrap();
        assert_eq!(config.instances, vec!["i-1", "i-2"]);
        assert_eq!(config.tag_list, vec![TagFilter::equals("env", "prod")]);
        assert_eq!(config.tag_map, vec![TagMapEntry::new("Name", "BackupLabel")]);
        assert_eq!(config.extra_tags.get("Team").unwrap(), "storage");
        assert_eq!(config.retention.max_age.as_deref(), Some("2w"));
        assert!(config.dry_run);
        assert_eq!(config.default_tags.get("CreatedBy").unwrap(), "AutomatedBackup");
    }

    #[test]
    fn test_aliases_and_invalid_tags() {
        let cli = Cli::try_parse_from(["snapkeep", "cycle"]).unwrap();
        assert_eq!(RunMode::from(cli.command), RunMode::Maintain);

        assert!(Cli::try_parse_from(["snapkeep", "cleanup", "--tag-list", "=prod"]).is_err());
        assert!(Cli::try_parse_from(["snapkeep", "snapshot", "--extra-tags", "novalue"]).is_err());
    }

    #[test]
    fn test_no_max_date_wins_over_other_retention_flags() {
        let cli = Cli::try_parse_from([
            "snapkeep",
            "cleanup",
            "--no-max-date",
            "--max-age",
            "3",
            "--max-date",
            "2024-01-01",
        ])
        .unwrap();

        let config = load_config(cli).unwrap();
        assert!(config.retention.no_max_date);
        let cutoff = RetentionClock::system()
            .resolve_policy(&config.retention)
            .unwrap();
        assert_eq!(cutoff, RetentionCutoff::NoMaxDate);
    }

    #[test]
    fn test_cutoff_line() {
        assert_eq!(
            cutoff_line(RetentionCutoff::NoMaxDate),
            "Retention cutoff: none, age gate disabled"
        );
        let at = DateTime::parse_from_rfc3339("2024-05-08T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            cutoff_line(RetentionCutoff::Before(at)),
            "Retention cutoff: 2024-05-08 12:00:00 UTC"
        );
    }
}
