//! CLI entry point for the EV adoption pipeline.
//!
//! Loads the vehicle registry snapshot, cleans it, and prints or exports
//! aggregated views, trends, dispersion and prioritisation tables.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ev_adoption::analyzers::aggregate::{
    Order, RankMetric, aggregate, available_departments, available_periods, drilldown, rank,
    summary,
};
use ev_adoption::analyzers::filter::{
    DepartmentSelection, FilterSpec, QuarterSelection, ThresholdScope,
};
use ev_adoption::analyzers::priority::{DEFAULT_TARGETS, priorities};
use ev_adoption::analyzers::trends::{dispersion, dispersion_series, movers, trends};
use ev_adoption::analyzers::types::{AggregatedView, GroupKey, Grouping, Mover, Period};
use ev_adoption::cleaner::{CleanRecord, CleanerSettings};
use ev_adoption::config::PipelineConfig;
use ev_adoption::loader::load;
use ev_adoption::output::{
    ExportFormat, export_dispersion, export_rows, export_trend, export_views, read_views,
    write_export,
};
use ev_adoption::snapshot::{RefreshOutcome, Snapshot, SnapshotStore, load_snapshot};
use serde::Serialize;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "ev_adoption")]
#[command(
    about = "Electric vehicle adoption rates per French commune and department",
    long_about = None
)]
struct Cli {
    /// Path or URL of the raw dataset (overrides config and EV_SOURCE)
    #[arg(long, global = true)]
    source: Option<String>,

    /// Offline cache file used when the remote source is unreachable
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// JSON config file (falls back to EV_CONFIG)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct FilterArgs {
    /// Quarter to select: `2024-Q1`, `T1 2024` or `all`
    #[arg(short, long, default_value = "all")]
    quarter: QuarterSelection,

    /// Comma-separated department codes; empty means all
    #[arg(short, long, value_delimiter = ',')]
    departments: Vec<String>,

    /// Leave out overseas departments (97x, 98x)
    #[arg(long, default_value_t = false)]
    exclude_overseas: bool,

    /// Minimum fleet size (defaults to the configured threshold)
    #[arg(long)]
    min_fleet: Option<u64>,

    /// `ranking_only` or `everywhere`
    #[arg(long)]
    threshold_scope: Option<ThresholdScope>,
}

impl FilterArgs {
    fn to_filter(&self, config: &PipelineConfig) -> FilterSpec {
        FilterSpec {
            quarter: self.quarter,
            departments: DepartmentSelection::from_codes(&self.departments),
            exclude_overseas: self.exclude_overseas,
            min_fleet_size: self.min_fleet.unwrap_or(config.min_fleet_threshold),
            threshold_scope: self.threshold_scope.unwrap_or(config.threshold_scope),
        }
    }
}

#[derive(Args, Clone)]
struct OutputArgs {
    /// File to write to instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// `csv` or `json`
    #[arg(short, long, default_value = "csv")]
    format: ExportFormat,

    /// Gzip compress the output file
    #[arg(long, default_value_t = false)]
    gzip: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the quarters and departments present in the dataset
    Periods,
    /// National headline figures for a quarter (latest by default)
    Summary {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Full listing of weighted rates per group
    Aggregate {
        /// commune, department or national
        #[arg(short, long, default_value = "department")]
        grouping: Grouping,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Top or bottom groups by rate or electric vehicle count
    Rank {
        #[arg(short, long, default_value = "department")]
        grouping: Grouping,

        /// Rank from the lowest value instead of the highest
        #[arg(long, default_value_t = false)]
        bottom: bool,

        /// `rate` or `ev_count`
        #[arg(short, long, default_value = "rate")]
        metric: RankMetric,

        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Communes of one department, best rate first
    Drilldown {
        #[arg(value_name = "DEPARTMENT")]
        department: String,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Quarter-by-quarter rate of one group
    Trends {
        /// `national`, `department:75` or `commune:75056`
        #[arg(value_name = "GROUP", default_value = "national")]
        key: GroupKey,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Largest rate gains and losses against the previous quarter
    Movers {
        #[arg(short, long, default_value = "department")]
        grouping: Grouping,

        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Spread of rates across groups, with Gini and top-10 share
    Dispersion {
        #[arg(short, long, default_value = "department")]
        grouping: Grouping,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Departments with a large fleet and a rate at or below the median
    Priorities {
        #[arg(short = 'n', long, default_value_t = DEFAULT_TARGETS)]
        limit: usize,

        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        out: OutputArgs,
    },
    /// Write the filtered view to a file and check it re-imports unchanged
    Export {
        #[arg(short, long, default_value = "commune")]
        grouping: Grouping,

        /// Export the cleaned rows instead of grouped views
        #[arg(long, default_value_t = false)]
        clean_rows: bool,

        #[command(flatten)]
        filter: FilterArgs,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Reload the source periodically and log the national figures
    Watch {
        /// Seconds between reloads
        #[arg(short, long, default_value_t = 3600)]
        interval: u64,

        /// Number of reloads (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        samples: usize,

        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _file_guard = init_tracing();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let bounds = config.rate_bounds;

    let snapshot = load_snapshot(&config)
        .await
        .with_context(|| format!("failed to load {}", config.source))?;
    log_snapshot(&snapshot);
    let records = &snapshot.records[..];

    match cli.command {
        Commands::Periods => {
            let mut stdout = std::io::stdout().lock();
            for period in available_periods(records) {
                writeln!(stdout, "{period}\t{}", period.label())?;
            }
            writeln!(stdout, "departments: {}", available_departments(records).join(","))?;
        }
        Commands::Summary { filter } => {
            let spec = filter.to_filter(&config);
            match summary(records, &spec, bounds) {
                Some(kpi) => println!("{}", serde_json::to_string_pretty(&kpi)?),
                None => warn!("No record matches the selected filters"),
            }
        }
        Commands::Aggregate {
            grouping,
            filter,
            out,
        } => {
            let spec = filter.to_filter(&config);
            let views = aggregate(records, &spec, grouping, bounds);
            emit(&export_views(&views, &spec.quarter, out.format)?, &out)?;
        }
        Commands::Rank {
            grouping,
            bottom,
            metric,
            limit,
            filter,
            out,
        } => {
            let spec = filter.to_filter(&config);
            let views = aggregate(records, &spec, grouping, bounds);
            let order = if bottom { Order::Bottom } else { Order::Top };
            let ranked: Vec<AggregatedView> =
                rank(&views, order, metric, limit, spec.min_fleet_size)
                    .into_iter()
                    .cloned()
                    .collect();
            emit(&export_views(&ranked, &spec.quarter, out.format)?, &out)?;
        }
        Commands::Drilldown {
            department,
            filter,
            out,
        } => {
            let spec = filter.to_filter(&config);
            let views = drilldown(records, &department, &spec, bounds);
            if views.is_empty() {
                warn!(department = %department, "No commune to show for this department");
            }
            emit(&export_views(&views, &spec.quarter, out.format)?, &out)?;
        }
        Commands::Trends { key, filter, out } => {
            let spec = filter.to_filter(&config);
            let series = trends(records, &key, &spec, bounds);
            if let Some(s) = series.summary() {
                info!(
                    group = %key,
                    start = %s.start,
                    end = %s.end,
                    rate_change = ?s.rate_change,
                    ev_change = s.ev_change,
                    ev_cagr_pct = ?s.ev_cagr_pct,
                    "Trend summary"
                );
            }
            emit(&export_trend(&series, out.format)?, &out)?;
        }
        Commands::Movers {
            grouping,
            limit,
            filter,
            out,
        } => {
            let spec = filter.to_filter(&config);
            let period = selected_or_latest(&spec, records)?;
            let found = movers(records, period, grouping, &spec, bounds, limit);
            let rows: Vec<MoverRow> = found
                .gains
                .iter()
                .map(|m| MoverRow::new("gain", period, m))
                .chain(found.losses.iter().map(|m| MoverRow::new("loss", period, m)))
                .collect();
            emit(&export_rows(&rows, out.format)?, &out)?;
        }
        Commands::Dispersion {
            grouping,
            filter,
            out,
        } => {
            let spec = filter.to_filter(&config);
            let stats = match spec.quarter {
                QuarterSelection::Single(p) => {
                    vec![dispersion(records, p, grouping, &spec, bounds)]
                }
                QuarterSelection::All => dispersion_series(records, grouping, &spec, bounds),
            };
            emit(&export_dispersion(&stats, out.format)?, &out)?;
        }
        Commands::Priorities { limit, filter, out } => {
            let spec = filter.to_filter(&config);
            let period = selected_or_latest(&spec, records)?;
            let matrix = priorities(records, period, &spec, bounds, limit);
            info!(
                period = %period,
                departments = matrix.entries.len(),
                median_rate = ?matrix.median_rate,
                fleet_p75 = ?matrix.fleet_p75,
                targets = matrix.targets.len(),
                "Priority matrix"
            );
            let rows: Vec<PriorityRow> = matrix
                .entries
                .iter()
                .map(|e| PriorityRow {
                    period,
                    department: e.department.clone(),
                    fleet_size: e.fleet_size,
                    ev_electric_count: e.ev_electric_count,
                    weighted_rate: e.weighted_rate,
                    delta: e.delta,
                    target: matrix.targets.iter().any(|t| t.department == e.department),
                })
                .collect();
            emit(&export_rows(&rows, out.format)?, &out)?;
        }
        Commands::Export {
            grouping,
            clean_rows,
            filter,
            output,
            format,
            gzip,
        } => {
            let spec = filter.to_filter(&config);
            let bytes = if clean_rows {
                let rows: Vec<_> = spec.select(records).into_iter().cloned().collect();
                export_rows(&rows, format)?
            } else {
                let views = aggregate(records, &spec, grouping, bounds);
                let bytes = export_views(&views, &spec.quarter, format)?;
                if format == ExportFormat::Csv {
                    let restored = read_views(&bytes).context("exported file does not re-import")?;
                    anyhow::ensure!(restored == views, "exported views differ after re-import");
                    debug!(rows = restored.len(), "Export re-import check passed");
                }
                bytes
            };
            write_export(&output, &bytes, gzip || has_gz_extension(&output))
                .with_context(|| format!("failed to write {}", output.display()))?;
        }
        Commands::Watch {
            interval,
            samples,
            filter,
        } => {
            let spec = filter.to_filter(&config);
            watch(&config, snapshot, interval, samples, &spec).await?;
        }
    }

    Ok(())
}

/// Colored stderr plus a JSON daily-rolling log file. The returned guard
/// flushes the file writer on drop.
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/ev_adoption.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("ev_adoption.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("RUST_LOG")
                .from_env_lossy(),
        );

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::DEBUG.into())
                .with_env_var("RUST_LOG_JSON")
                .from_env_lossy(),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    file_guard
}

/// Config file, then environment, then command line flags.
fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    let config_path = cli.config.clone().or_else(|| std::env::var("EV_CONFIG").ok());
    let mut config = match config_path {
        Some(path) => PipelineConfig::load(&path)
            .with_context(|| format!("failed to load config {path}"))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    if let Some(source) = &cli.source {
        config.source = source.clone();
    }
    if let Some(cache) = &cli.cache {
        config.cache_path = Some(cache.clone());
    }
    config.validate()?;
    debug!(source = %config.source, cache = ?config.cache_path, "Configuration resolved");
    Ok(config)
}

fn log_snapshot(snapshot: &Snapshot) {
    let report = &snapshot.report;
    info!(
        origin = ?snapshot.origin,
        snapshot = %snapshot.id,
        kept = report.kept_rows,
        sentinel_dropped = report.sentinel_dropped,
        malformed = report.malformed_total(),
        clamped = report.clamped_rates,
        undefined_rates = report.undefined_rates,
        "Snapshot ready"
    );
}

fn selected_or_latest(filter: &FilterSpec, records: &[CleanRecord]) -> Result<Period> {
    match filter.quarter {
        QuarterSelection::Single(p) => Ok(p),
        QuarterSelection::All => records
            .iter()
            .filter(|r| filter.matches_geography(r))
            .map(CleanRecord::period)
            .max()
            .context("no quarter available under the selected filters"),
    }
}

fn has_gz_extension(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// Writes to `--output` when given, stdout otherwise.
fn emit(bytes: &[u8], out: &OutputArgs) -> Result<()> {
    match &out.output {
        Some(path) => write_export(path, bytes, out.gzip || has_gz_extension(path))
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            if out.gzip {
                warn!("--gzip ignored when writing to stdout");
            }
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct MoverRow {
    direction: &'static str,
    period: Period,
    key: String,
    label: String,
    rate: f64,
    previous_rate: f64,
    delta: f64,
}

impl MoverRow {
    fn new(direction: &'static str, period: Period, m: &Mover) -> Self {
        Self {
            direction,
            period,
            key: m.key.clone(),
            label: m.label.clone(),
            rate: m.rate,
            previous_rate: m.previous_rate,
            delta: m.delta,
        }
    }
}

#[derive(Serialize)]
struct PriorityRow {
    period: Period,
    department: String,
    fleet_size: u64,
    ev_electric_count: u64,
    weighted_rate: f64,
    delta: Option<f64>,
    target: bool,
}

/// Reloads the source every `interval` seconds into a [`SnapshotStore`],
/// rebuilding only when the input digest changes.
#[tracing::instrument(skip(config, initial, filter), fields(source = %config.source))]
async fn watch(
    config: &PipelineConfig,
    initial: Snapshot,
    interval: u64,
    samples: usize,
    filter: &FilterSpec,
) -> Result<()> {
    let store = SnapshotStore::new(initial, CleanerSettings::from_config(config));

    if samples == 0 {
        info!(interval, "Watching infinitely. Press Ctrl+C to stop.");
    } else {
        info!(samples, interval, "Starting watch");
    }

    let mut sample_count = 0;
    loop {
        let current = store.current();
        match summary(&current.records, filter, config.rate_bounds) {
            Some(kpi) => info!(
                snapshot = %current.id,
                period = %kpi.period,
                fleet_size = kpi.fleet_size,
                ev_electric_count = kpi.ev_electric_count,
                weighted_rate = ?kpi.weighted_rate,
                rate_delta = ?kpi.rate_delta,
                "National figures"
            ),
            None => warn!(snapshot = %current.id, "No record matches the selected filters"),
        }

        sample_count += 1;
        if samples > 0 && sample_count >= samples {
            break;
        }

        info!(interval, "Waiting before next reload");
        tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

        match load(config).await {
            Ok(dataset) => match store.refresh(dataset) {
                RefreshOutcome::Replaced => log_snapshot(&store.current()),
                RefreshOutcome::Unchanged => debug!("Source unchanged"),
            },
            Err(e) => error!(error = %e, "Reload failed, keeping current snapshot"),
        }
    }

    info!(reloads = sample_count, "Finished watching");
    Ok(())
}
