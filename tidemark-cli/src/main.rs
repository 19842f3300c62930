//! CLI for the tidemark tank level collector.
//!
//! Runs the acquisition loop, surveys the sensor for calibration, and reads
//! the level history back as raw rows, bucketed statistics, or a summary.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::thread;

use chrono::{Local, TimeDelta};
use clap::{Parser, Subcommand, ValueEnum};
use tidemark::query::{self, Granularity, TimeBound, TimeRange, format_timestamp};
use tidemark::sensor::{AdcFileSensor, Sensor};
use tidemark::store::{LevelReading, LevelStore};
use tidemark::window::survey;
use tidemark::{Collector, Config};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// tidemark: tank level monitoring with change-compacted history.
#[derive(Parser)]
#[command(name = "tidemark", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = "tidemark.json")]
    config: PathBuf,

    /// Database path, overriding `store.path` from the configuration.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and create the database.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Run the acquisition loop until killed.
    Collect,

    /// Sample the sensor and report the most frequent readings.
    ///
    /// Run once with the tank empty and once with it full to find
    /// `raw_min` and `raw_max`.
    Calibrate {
        /// Number of readings to take.
        #[arg(long, default_value = "600")]
        ticks: usize,

        /// Number of most frequent readings to print.
        #[arg(long, default_value = "5")]
        top: usize,
    },

    /// Print raw rows in a time range.
    Query {
        #[command(flatten)]
        range: RangeArgs,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print bucketed statistics over a time range.
    Aggregate {
        #[command(flatten)]
        range: RangeArgs,

        /// Bucket width.
        #[arg(long, short, default_value = "hour")]
        granularity: Granularity,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print the most recent row.
    Latest {
        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Display database location, size, row count and summary statistics.
    Info,
}

/// Time range selection shared by the read commands.
#[derive(clap::Args)]
struct RangeArgs {
    /// Range start: `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`.
    #[arg(long)]
    from: Option<String>,

    /// Range end: `YYYY-MM-DD` (whole day) or `YYYY-MM-DD HH:MM:SS`. Defaults to now.
    #[arg(long)]
    to: Option<String>,

    /// Range ending now (e.g., "90m", "24h", "7d"), used when `--from` is absent.
    #[arg(long, default_value = "24h")]
    last: String,
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { force } => cmd_init(&cli.config, cli.db, force),
        Commands::Collect => cmd_collect(&cli.config, cli.db),
        Commands::Calibrate { ticks, top } => cmd_calibrate(&cli.config, ticks, top),
        Commands::Query { range, format } => cmd_query(&cli.config, cli.db, &range, &format),
        Commands::Aggregate {
            range,
            granularity,
            format,
        } => cmd_aggregate(&cli.config, cli.db, &range, granularity, &format),
        Commands::Latest { format } => cmd_latest(&cli.config, cli.db, &format),
        Commands::Info => cmd_info(&cli.config, cli.db),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `tidemark init`.
fn cmd_init(
    config_path: &Path,
    db: Option<PathBuf>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if config_path.exists() && !force {
        return Err(format!(
            "'{}' already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    let mut config = Config::default();
    if let Some(db) = db {
        config.store.path = db;
    }
    config.save(config_path)?;
    println!("Wrote {}", config_path.display());

    let store = LevelStore::open(&config.store.path, config.store_options())?;
    println!("Database: {} ({} rows)", store.path().display(), store.count()?);

    Ok(())
}

/// Implements `tidemark collect`.
fn cmd_collect(config_path: &Path, db: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, db)?;
    let mut store = LevelStore::open(&config.store.path, config.store_options())?;
    let sensor = AdcFileSensor::from_config(&config.sensor)?;
    info!(sensor = %sensor.path().display(), reducer = ?config.sampling.reducer, "starting acquisition");

    let mut collector = Collector::new(sensor, &config, &mut store)?;
    let stats = collector.run(&AtomicBool::new(false));
    println!(
        "Collected {} ticks: {} recorded, {} skipped, {} failed writes",
        stats.ticks, stats.recorded, stats.skipped, stats.write_failures
    );

    Ok(())
}

/// Implements `tidemark calibrate`.
#[allow(clippy::cast_precision_loss)] // counts are display-only
fn cmd_calibrate(
    config_path: &Path,
    ticks: usize,
    top: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, None)?;
    let mut sensor = AdcFileSensor::from_config(&config.sensor)?;
    let progress_every = (ticks / 10).max(1);

    println!(
        "Sampling {} for {ticks} ticks every {:?}...",
        sensor.path().display(),
        config.sampling.tick_interval
    );

    let mut values = Vec::with_capacity(ticks);
    for i in 1..=ticks {
        match sensor.read_raw() {
            Some(value) if value > 0.0 => values.push(value),
            Some(value) => warn!(value, "discarding non-positive reading"),
            None => {}
        }
        if i % progress_every == 0 {
            println!("  {i}/{ticks} ticks, {} valid", values.len());
        }
        if i < ticks {
            thread::sleep(config.sampling.tick_interval);
        }
    }

    let survey = survey(&values, top).ok_or("no valid readings collected")?;

    println!();
    println!("Most frequent reading: {}", survey.mode);
    println!("Top {} of {} readings:", survey.top.len(), survey.total);
    for (value, count) in &survey.top {
        let share = *count as f64 / survey.total as f64 * 100.0;
        println!("  {value:>10.3}  {count:>6}  ({share:.1}%)");
    }
    println!();
    println!("Use this value as calibration.raw_min (empty tank) or raw_max (full tank).");

    Ok(())
}

/// Implements `tidemark query`.
fn cmd_query(
    config_path: &Path,
    db: Option<PathBuf>,
    range_args: &RangeArgs,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, db)?;
    let store = LevelStore::open_read_only(&config.store.path)?;
    let range = resolve_range(range_args)?;
    let rows = store.query_raw(&range)?;

    match format {
        OutputFormat::Csv => {
            println!("# range={range}, rows={}", rows.len());
            print_rows_csv(&rows);
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "start": format_timestamp(range.start()),
                "end": format_timestamp(range.end()),
                "count": rows.len(),
                "data": rows.iter().map(row_json).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tidemark aggregate`.
fn cmd_aggregate(
    config_path: &Path,
    db: Option<PathBuf>,
    range_args: &RangeArgs,
    granularity: Granularity,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, db)?;
    let store = LevelStore::open_read_only(&config.store.path)?;
    let range = resolve_range(range_args)?;
    let aggregation = store.aggregate(&range, granularity, &config.query.range_caps)?;

    match format {
        OutputFormat::Csv => {
            if let Some(adjustment) = &aggregation.adjustment {
                eprintln!("Note: {adjustment}");
            }
            println!(
                "# granularity={granularity}, range={}..{}, buckets={}",
                format_timestamp(aggregation.start),
                format_timestamp(aggregation.end),
                aggregation.buckets.len()
            );
            println!(
                "bucket,count,level_min,level_max,level_mean,level_std_dev,\
                 volume_min,volume_max,volume_mean,volume_std_dev"
            );
            for b in &aggregation.buckets {
                println!(
                    "{},{},{},{},{:.3},{:.3},{},{},{:.3},{:.3}",
                    format_timestamp(b.start),
                    b.count,
                    b.level.min,
                    b.level.max,
                    b.level.mean,
                    b.level.std_dev,
                    b.volume.min,
                    b.volume.max,
                    b.volume.mean,
                    b.volume.std_dev
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&aggregation)?);
        }
    }

    Ok(())
}

/// Implements `tidemark latest`.
fn cmd_latest(
    config_path: &Path,
    db: Option<PathBuf>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, db)?;
    let store = LevelStore::open_read_only(&config.store.path)?;
    let latest = store.latest()?.ok_or("no measurements recorded yet")?;

    match format {
        OutputFormat::Csv => print_rows_csv(std::slice::from_ref(&latest)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&row_json(&latest))?),
    }

    Ok(())
}

/// Implements `tidemark info`.
fn cmd_info(config_path: &Path, db: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, db)?;
    let store = LevelStore::open_read_only(&config.store.path)?;

    let size = db_size(store.path())?;
    println!("Database: {}", store.path().display());
    println!("Disk usage: {} ({size} bytes)", format_bytes(size));
    println!("Rows: {}", store.count()?);
    println!(
        "Window: {} ticks of {:?}, reducer {:?}",
        config.window_ticks(),
        config.sampling.tick_interval,
        config.sampling.reducer
    );
    println!(
        "Boundary offset: {:?}",
        config.store_options().boundary_offset
    );

    if let Some(latest) = store.latest()? {
        println!();
        println!(
            "Latest: {} level={} volume={}",
            format_timestamp(latest.timestamp),
            latest.level,
            latest.volume
        );
    }

    if let Some(summary) = query::summarize(&store.all()?) {
        println!();
        println!(
            "History: {} .. {}",
            format_timestamp(summary.first),
            format_timestamp(summary.last)
        );
        println!(
            "  level   min={} max={} mean={:.3} std_dev={:.3}",
            summary.level.min, summary.level.max, summary.level.mean, summary.level.std_dev
        );
        println!(
            "  volume  min={} max={} mean={:.3} std_dev={:.3}",
            summary.volume.min, summary.volume.max, summary.volume.mean, summary.volume.std_dev
        );
    }

    Ok(())
}

/// Loads the configuration, falling back to defaults when the file is absent.
fn load_config(path: &Path, db: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(db) = db {
        config.store.path = db;
    }
    Ok(config)
}

/// Resolves `--from`/`--to`/`--last` into a time range.
fn resolve_range(args: &RangeArgs) -> Result<TimeRange, Box<dyn std::error::Error>> {
    let now = Local::now().naive_local();
    let end: TimeBound = match &args.to {
        Some(to) => to.parse()?,
        None => now.into(),
    };
    let start: TimeBound = match &args.from {
        Some(from) => from.parse()?,
        None => (end.as_end() - parse_duration(&args.last)?).into(),
    };
    Ok(TimeRange::from_bounds(start, end)?)
}

/// Parses a human-readable duration string (e.g., "90m", "24h", "7d").
fn parse_duration(s: &str) -> Result<TimeDelta, Box<dyn std::error::Error>> {
    let s = s.trim();
    let Some((split, unit)) = s.char_indices().next_back() else {
        return Err("Empty duration string".into());
    };
    let num_str = &s[..split];

    let from_unit: fn(i64) -> Option<TimeDelta> = match unit {
        's' => TimeDelta::try_seconds,
        'm' => TimeDelta::try_minutes,
        'h' => TimeDelta::try_hours,
        'd' => TimeDelta::try_days,
        'w' => TimeDelta::try_weeks,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, d, or w.").into()),
    };
    let num: i64 = num_str
        .parse()
        .map_err(|_| format!("Invalid duration number: '{num_str}'"))?;

    from_unit(num).ok_or_else(|| format!("Duration out of range: '{s}'").into())
}

fn print_rows_csv(rows: &[LevelReading]) {
    println!("time,level,volume");
    for row in rows {
        println!("{},{},{}", format_timestamp(row.timestamp), row.level, row.volume);
    }
}

fn row_json(row: &LevelReading) -> serde_json::Value {
    serde_json::json!({
        "time": format_timestamp(row.timestamp),
        "level": row.level,
        "volume": row.volume,
    })
}

/// Size of the database file plus its WAL.
fn db_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = std::fs::metadata(path)?.len();
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    if let Ok(metadata) = std::fs::metadata(PathBuf::from(wal)) {
        total += metadata.len();
    }
    Ok(total)
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
