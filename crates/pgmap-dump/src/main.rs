use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use pgmap_core::delta::IoRate;
use pgmap_core::fmt::{
    FmtStyle, format_bytes, format_bytes_rate, format_duration, format_rate, format_ratio,
    format_since, format_stamp,
};
use pgmap_core::map::PgFilter;
use pgmap_core::model::{PgId, PgRecord, PgState, RecoverySummary};
use pgmap_core::storage::{self, SnapshotHeader};
use pgmap_core::stuck::StuckConditions;
use pgmap_core::{MapConfig, PgMap};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pgmap-dump", about = "Inspect a saved PG map snapshot")]
struct Cli {
    /// Path to a snapshot file
    path: PathBuf,

    /// Stuck conditions to report, comma separated
    /// (inactive, unclean, undersized, degraded, stale)
    #[arg(long, default_value = "inactive,unclean,stale")]
    stuck: String,

    /// Seconds a PG must sit in a condition before it counts as stuck
    #[arg(long)]
    threshold: Option<u64>,

    /// Reference time for the stuck check in epoch milliseconds
    /// (defaults to the snapshot's own stamp)
    #[arg(long)]
    now: Option<i64>,

    /// Override the full ratio (values above 1 are percentages)
    #[arg(long)]
    full_ratio: Option<f64>,

    /// Override the nearfull ratio (values above 1 are percentages)
    #[arg(long)]
    nearfull_ratio: Option<f64>,

    /// Number of most recent delta samples used for rates (default: all)
    #[arg(long)]
    window: Option<usize>,

    /// List PGs with any of these states (e.g. "degraded+peering")
    #[arg(long)]
    state: Option<String>,

    /// List PGs of this pool
    #[arg(long)]
    pool: Option<i64>,

    /// List PGs mapped to this node
    #[arg(long)]
    node: Option<i32>,

    /// With --node, list only PGs the node is acting primary for
    #[arg(long, requires = "node")]
    primary: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let conditions: StuckConditions = cli.stuck.parse().unwrap_or_else(|e| {
        eprintln!("Invalid --stuck value: {e}");
        std::process::exit(1);
    });

    let filter = pg_filter(&cli).unwrap_or_else(|e| {
        eprintln!("Invalid --state value: {e}");
        std::process::exit(1);
    });

    let header = storage::read_header(&cli.path).unwrap_or_else(|e| {
        eprintln!("Error reading header of {}: {e}", cli.path.display());
        std::process::exit(1);
    });
    let file_size = fs::metadata(&cli.path).map(|m| m.len()).unwrap_or(0);

    let mut map = storage::load_map(&cli.path).unwrap_or_else(|e| {
        eprintln!("Error loading {}: {e}", cli.path.display());
        std::process::exit(1);
    });
    info!(
        version = map.version(),
        pgs = map.num_pgs(),
        nodes = map.num_nodes(),
        "snapshot loaded"
    );

    if cli.full_ratio.is_some() || cli.nearfull_ratio.is_some() {
        let full = cli.full_ratio.unwrap_or(map.full_ratio());
        let nearfull = cli.nearfull_ratio.unwrap_or(map.nearfull_ratio());
        for change in map.set_ratios(full, nearfull) {
            info!(
                node = change.node,
                from = %change.from,
                to = %change.to,
                "fullness changed by ratio override"
            );
        }
    }

    let threshold_ms = threshold_ms(cli.threshold);
    let now = cli.now.unwrap_or(map.stamp());

    let report = build_report(
        &cli,
        header,
        file_size,
        &mut map,
        conditions,
        filter.as_ref(),
        now,
        threshold_ms,
    );

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                std::process::exit(1);
            }
        }
    } else {
        print_report(&report, now);
    }
}

/// Stuck threshold in milliseconds; huge values saturate.
fn threshold_ms(secs: Option<u64>) -> i64 {
    secs.map(|secs| i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000))
        .unwrap_or_else(|| MapConfig::default().stuck_threshold_ms())
}

/// PG listing criteria from the command line, `None` if no listing was asked for.
fn pg_filter(cli: &Cli) -> Result<Option<PgFilter>, pgmap_core::model::ParseStateError> {
    if cli.state.is_none() && cli.pool.is_none() && cli.node.is_none() {
        return Ok(None);
    }
    let mut filter = PgFilter::default();
    if let Some(state) = &cli.state {
        filter = filter.state(state.parse::<PgState>()?);
    }
    if let Some(pool) = cli.pool {
        filter = filter.pool(pool);
    }
    if let Some(node) = cli.node {
        filter = filter.node(node);
        if cli.primary {
            filter = filter.primary_only();
        }
    }
    Ok(Some(filter))
}

/// Initializes the tracing subscriber. Default level is WARN so that the
/// report stays readable; -q limits output to errors.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgmap_dump", "pgmap_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Report {
    file: String,
    file_size: u64,
    format_version: u16,
    version: u64,
    last_epoch: u32,
    last_pg_scan: u32,
    stamp: i64,
    num_pgs: usize,
    num_nodes: usize,
    min_last_epoch_clean: u32,
    pg_states: BTreeMap<String, i64>,
    recovery: RecoveryJson,
    creating_pgs: usize,
    blocked_by: BTreeMap<i32, i64>,
    usage: UsageJson,
    full_ratio: f64,
    nearfull_ratio: f64,
    full_nodes: Vec<i32>,
    nearfull_nodes: Vec<i32>,
    pools: Vec<PoolJson>,
    io: IoRate,
    stuck_conditions: String,
    stuck_threshold_secs: i64,
    stuck: Vec<StuckJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    listed: Option<Vec<ListedJson>>,
}

#[derive(Serialize)]
struct RecoveryJson {
    degraded_objects: i64,
    degraded_ratio: f64,
    misplaced_objects: i64,
    misplaced_ratio: f64,
    unfound_objects: i64,
    unfound_ratio: f64,
}

impl From<RecoverySummary> for RecoveryJson {
    fn from(r: RecoverySummary) -> Self {
        Self {
            degraded_objects: r.degraded,
            degraded_ratio: r.degraded_ratio(),
            misplaced_objects: r.misplaced,
            misplaced_ratio: r.misplaced_ratio(),
            unfound_objects: r.unfound,
            unfound_ratio: r.unfound_ratio(),
        }
    }
}

#[derive(Serialize)]
struct ListedJson {
    pg: String,
    state: String,
    num_objects: i64,
    num_bytes: i64,
    up: Vec<i32>,
    acting: Vec<i32>,
}

#[derive(Serialize)]
struct UsageJson {
    total_bytes: i64,
    used_bytes: i64,
    avail_bytes: i64,
}

#[derive(Serialize)]
struct PoolJson {
    pool: i64,
    num_pg: i64,
    num_objects: i64,
    num_bytes: i64,
    recovery: RecoveryJson,
    samples: usize,
    io: IoRate,
}

#[derive(Serialize)]
struct StuckJson {
    pg: String,
    state: String,
    last_change: i64,
    acting_primary: Option<i32>,
}

fn build_report(
    cli: &Cli,
    header: SnapshotHeader,
    file_size: u64,
    map: &mut PgMap,
    conditions: StuckConditions,
    filter: Option<&PgFilter>,
    now: i64,
    threshold_ms: i64,
) -> Report {
    let min_last_epoch_clean = map.min_last_epoch_clean();

    let pg_states = map
        .pg_state_summary()
        .iter()
        .map(|(state, count)| (state.to_string(), *count))
        .collect();

    let pools = map
        .pool_sums()
        .iter()
        .map(|(&pool, sum)| PoolJson {
            pool,
            num_pg: sum.num_pg,
            num_objects: sum.stats.num_objects,
            num_bytes: sum.stats.num_bytes,
            recovery: RecoverySummary::from_stats(&sum.stats).into(),
            samples: map.pool_delta(pool).map_or(0, |t| t.len()),
            io: map.pool_io_rate(pool, cli.window).unwrap_or_default(),
        })
        .collect();

    let stuck = map
        .stuck_pgs_older_than(conditions, now, threshold_ms)
        .into_iter()
        .map(|(id, rec)| stuck_entry(id, rec))
        .collect();

    let listed = filter.map(|f| {
        map.filtered_pgs(f)
            .into_iter()
            .map(|(id, rec)| ListedJson {
                pg: id.to_string(),
                state: rec.state.to_string(),
                num_objects: rec.stats.num_objects,
                num_bytes: rec.stats.num_bytes,
                up: rec.up.clone(),
                acting: rec.acting.clone(),
            })
            .collect()
    });

    let nodes = map.node_sum();
    Report {
        file: cli.path.display().to_string(),
        file_size,
        format_version: header.version,
        version: map.version(),
        last_epoch: map.last_epoch(),
        last_pg_scan: map.last_pg_scan(),
        stamp: map.stamp(),
        num_pgs: map.num_pgs(),
        num_nodes: map.num_nodes(),
        min_last_epoch_clean,
        pg_states,
        recovery: map.recovery_summary().into(),
        creating_pgs: map.creating_pgs().len(),
        blocked_by: map.blocked_by_sum().clone(),
        usage: UsageJson {
            total_bytes: nodes.total_bytes,
            used_bytes: nodes.used_bytes,
            avail_bytes: nodes.avail_bytes,
        },
        full_ratio: map.full_ratio(),
        nearfull_ratio: map.nearfull_ratio(),
        full_nodes: map.full_nodes().iter().copied().collect(),
        nearfull_nodes: map.nearfull_nodes().iter().copied().collect(),
        pools,
        io: map.global_io_rate(cli.window),
        stuck_conditions: conditions.to_string(),
        stuck_threshold_secs: threshold_ms / 1000,
        stuck,
        listed,
    }
}

fn stuck_entry(id: PgId, rec: &PgRecord) -> StuckJson {
    StuckJson {
        pg: id.to_string(),
        state: rec.state.to_string(),
        last_change: rec.last_change,
        acting_primary: rec.acting_primary(),
    }
}

// ── Text output ──────────────────────────────────────────────────────────────

fn bytes(v: i64, style: FmtStyle) -> String {
    format_bytes(v.max(0) as u64, style)
}

fn io_line(io: &IoRate, style: FmtStyle) -> String {
    let mut line = format!(
        "rd {} ({}), wr {} ({})",
        format_bytes_rate(io.read_bytes_sec, style),
        format_rate(io.read_ops_sec, style),
        format_bytes_rate(io.write_bytes_sec, style),
        format_rate(io.write_ops_sec, style),
    );
    if io.recovered_objects_sec > 0.0 || io.recovered_bytes_sec > 0.0 {
        line.push_str(&format!(
            ", recovery {} ({} objects)",
            format_bytes_rate(io.recovered_bytes_sec, style),
            format_rate(io.recovered_objects_sec, style),
        ));
    }
    line
}

fn recovery_line(r: &RecoveryJson) -> String {
    format!(
        "{} degraded ({}), {} misplaced ({}), {} unfound ({})",
        r.degraded_objects,
        format_ratio(r.degraded_ratio),
        r.misplaced_objects,
        format_ratio(r.misplaced_ratio),
        r.unfound_objects,
        format_ratio(r.unfound_ratio),
    )
}

fn print_report(r: &Report, now: i64) {
    let detail = FmtStyle::Detail;
    let compact = FmtStyle::Compact;

    println!(
        "File:        {} ({})",
        r.file,
        format_bytes(r.file_size, detail)
    );
    println!("Format:      PGM1 v{}", r.format_version);
    println!("Version:     {}", r.version);
    println!("Epoch:       {}", r.last_epoch);
    println!("PG scan:     {}", r.last_pg_scan);
    println!(
        "Stamp:       {} ({} ago)",
        format_stamp(r.stamp),
        format_since(r.stamp, now)
    );
    println!("Min LEC:     {}", r.min_last_epoch_clean);
    println!();

    println!("PGs: {}", r.num_pgs);
    for (state, count) in &r.pg_states {
        println!("  {:>8}  {}", count, state);
    }
    println!("Recovery: {}", recovery_line(&r.recovery));
    println!("Creating: {}", r.creating_pgs);
    if !r.blocked_by.is_empty() {
        let blocked: Vec<String> = r
            .blocked_by
            .iter()
            .map(|(node, n)| format!("{node}:{n}"))
            .collect();
        println!("Blocked by: {}", blocked.join(" "));
    }
    println!();

    println!(
        "Nodes: {}  used {} of {} ({} avail)",
        r.num_nodes,
        bytes(r.usage.used_bytes, detail),
        bytes(r.usage.total_bytes, detail),
        bytes(r.usage.avail_bytes, detail),
    );
    println!(
        "  full >= {}: {:?}",
        format_ratio(r.full_ratio),
        r.full_nodes
    );
    println!(
        "  nearfull >= {}: {:?}",
        format_ratio(r.nearfull_ratio),
        r.nearfull_nodes
    );
    println!();

    println!("Client I/O: {}", io_line(&r.io, detail));
    println!();

    println!(
        "{:>6} {:>6} {:>10} {:>8} {:>9} {:>9} {:>9} {:>7}  I/O",
        "POOL", "PGS", "OBJECTS", "STORED", "DEGRADED", "MISPLACED", "UNFOUND", "SAMPLES"
    );
    for p in &r.pools {
        println!(
            "{:>6} {:>6} {:>10} {:>8} {:>9} {:>9} {:>9} {:>7}  {}",
            p.pool,
            p.num_pg,
            p.num_objects,
            bytes(p.num_bytes, compact),
            p.recovery.degraded_objects,
            p.recovery.misplaced_objects,
            p.recovery.unfound_objects,
            p.samples,
            io_line(&p.io, compact),
        );
    }
    println!();

    println!(
        "Stuck ({}) for {}s or more: {}",
        r.stuck_conditions,
        r.stuck_threshold_secs,
        r.stuck.len()
    );
    for s in &r.stuck {
        println!(
            "  {:<10} {:<32} since {} ({} ago) primary {}",
            s.pg,
            s.state,
            format_stamp(s.last_change),
            format_duration(now.saturating_sub(s.last_change) / 1000, compact),
            s.acting_primary
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    if let Some(listed) = &r.listed {
        println!();
        println!("Matching PGs: {}", listed.len());
        println!(
            "  {:<10} {:<32} {:>10} {:>8}  UP / ACTING",
            "PG", "STATE", "OBJECTS", "STORED"
        );
        for p in listed {
            println!(
                "  {:<10} {:<32} {:>10} {:>8}  {:?} / {:?}",
                p.pg,
                p.state,
                p.num_objects,
                bytes(p.num_bytes, compact),
                p.up,
                p.acting,
            );
        }
    }
}
