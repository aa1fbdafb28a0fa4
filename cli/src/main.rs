//! capmaster: one-shot driver for capmaster-core. Compares the TCP
//! connections observed in one or more side-A captures against one or more
//! side-B captures (two observation points of the same traffic) and reports
//! matches and per-pair packet diffs.
//!
//! Plays the role `thegwan-retina`'s `examples/*` binaries play for
//! `retina-core`: argument parsing, wiring a `Runtime`, and driving it to
//! completion. The analysis suite, Markdown/DB output, and YAML pipeline a
//! full CapMaster distribution would carry around this core are out of
//! scope (spec.md §1); this binary exists only so the library underneath
//! is runnable end to end.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use prettytable::{row, Table};

use capmaster_core::config::{BucketStrategy, Config, MatchMode};
use capmaster_core::{RunSummary, Runtime};

#[derive(Parser, Debug)]
#[clap(name = "capmaster", about = "Cross-capture TCP connection matching and per-connection diffing")]
struct Args {
    /// Capture file(s) from observation point A.
    #[clap(short = 'a', long = "side-a", parse(from_os_str), value_name = "PCAP", required = true)]
    side_a: Vec<PathBuf>,

    /// Capture file(s) from observation point B.
    #[clap(short = 'b', long = "side-b", parse(from_os_str), value_name = "PCAP", required = true)]
    side_b: Vec<PathBuf>,

    /// TOML configuration file overriding scoring weights, thresholds,
    /// worker count, bucket strategy, and match mode.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,

    /// Service-list file for ServerDetector's well-known-port rule
    /// (spec.md §6): `<port> <service-name>` per line, `#` for comments.
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    service_list: Option<PathBuf>,

    /// Override the dissector executable path (takes precedence over
    /// `TSHARK_PATH` and `PATH` lookup).
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    dissector_path: Option<PathBuf>,

    /// Worker pool size for per-file and per-match parallelism. `0` (the
    /// default) resolves to the CPU count at run time.
    #[clap(long)]
    workers: Option<usize>,

    /// Per-dissector-invocation timeout in seconds. Unset means no timeout.
    #[clap(long)]
    timeout_secs: Option<u64>,

    /// Matching mode (spec.md §4.D.5).
    #[clap(long, value_name = "one-to-one|one-to-many")]
    match_mode: Option<String>,

    /// Bucketing strategy (spec.md §4.D.2).
    #[clap(long, value_name = "server|port|none|auto")]
    bucket: Option<String>,

    /// Enable the behavioural (IAT/duration/byte-totals) fast path for
    /// two-hop scenarios where per-packet features are destroyed by an
    /// intermediate device (spec.md §4.D.1).
    #[clap(long)]
    behavioural: bool,

    /// Write JSON Lines (connections, matches, diffs) to this file instead
    /// of stdout.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    out: Option<PathBuf>,
}

fn parse_bucket_strategy(s: &str) -> Result<BucketStrategy> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "server" => BucketStrategy::Server,
        "port" => BucketStrategy::Port,
        "none" => BucketStrategy::None,
        "auto" => BucketStrategy::Auto,
        other => bail!("unrecognized bucket strategy: {other}"),
    })
}

fn parse_match_mode(s: &str) -> Result<MatchMode> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "one-to-one" => MatchMode::OneToOne,
        "one-to-many" => MatchMode::OneToMany,
        other => bail!("unrecognized match mode: {other}"),
    })
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(mode) = &args.match_mode {
        config.match_mode = parse_match_mode(mode)?;
    }
    if let Some(bucket) = &args.bucket {
        config.bucket_strategy = parse_bucket_strategy(bucket)?;
    }
    if let Some(path) = &args.service_list {
        config.service_list_path = Some(path.clone());
    }
    if let Some(path) = &args.dissector_path {
        config.dissector_path = Some(path.clone());
    }
    Ok(config)
}

/// Prints the run summary distinguishing "0 outputs because no matches"
/// from "0 outputs because all files failed" (spec.md §7's "single most
/// important operational rule").
fn print_summary(summary: &RunSummary) {
    eprintln!(
        "{}{} connection(s) from side A, {} from side B",
        "extracted: ".bold(),
        summary.side_a_connections.len(),
        summary.side_b_connections.len()
    );
    for (path, reason) in &summary.side_a_failures {
        eprintln!("{} side A file {} failed: {reason}", "error:".red(), path.display());
    }
    for (path, reason) in &summary.side_b_failures {
        eprintln!("{} side B file {} failed: {reason}", "error:".red(), path.display());
    }

    let any_failures = !summary.side_a_failures.is_empty() || !summary.side_b_failures.is_empty();
    if summary.cancelled {
        eprintln!("{}", "run was cancelled".yellow());
    } else if summary.matches.is_empty() {
        if any_failures {
            eprintln!(
                "{}",
                "0 matches: every input file failed, not because nothing matched".red().bold()
            );
        } else {
            eprintln!("{}", "0 matches: all files succeeded, nothing matched".yellow());
        }
    } else {
        eprintln!(
            "{} {} match(es), {} diff report(s)",
            "ok:".green().bold(),
            summary.matches.len(),
            summary.diffs.len()
        );
    }
}

/// Human-readable match summary printed to stdout before the JSONL report
/// (the JSONL is the machine-consumable artifact; this table is what a
/// human invoking `capmaster` directly actually reads).
fn print_match_table(summary: &RunSummary) {
    let mut table = Table::new();
    table.add_row(row!["A stream", "B stream", "score", "force", "evidence"]);
    for m in &summary.matches {
        table.add_row(row![
            m.conn_a,
            m.conn_b,
            format!("{:.3}", m.score.normalized),
            m.score.force_accept,
            m.score.evidence,
        ]);
    }
    table.printstd();
}

/// One line of the JSONL report. Kept flat so a consumer can filter by
/// `kind` without a tagged-union schema.
#[derive(serde::Serialize)]
#[serde(tag = "kind")]
enum ReportLine<'a> {
    #[serde(rename = "connection_a")]
    ConnectionA { connection: &'a capmaster_core::model::Connection },
    #[serde(rename = "connection_b")]
    ConnectionB { connection: &'a capmaster_core::model::Connection },
    #[serde(rename = "match")]
    Match {
        #[serde(rename = "match")]
        m: &'a capmaster_core::model::Match,
    },
    #[serde(rename = "diff")]
    Diff {
        #[serde(rename = "match")]
        m: &'a capmaster_core::model::Match,
        report: &'a capmaster_core::model::StreamDiffReport,
    },
}

fn write_report(summary: &RunSummary, mut out: impl Write) -> Result<()> {
    for conn in &summary.side_a_connections {
        serde_json::to_writer(&mut out, &ReportLine::ConnectionA { connection: conn })?;
        writeln!(out)?;
    }
    for conn in &summary.side_b_connections {
        serde_json::to_writer(&mut out, &ReportLine::ConnectionB { connection: conn })?;
        writeln!(out)?;
    }
    for m in &summary.matches {
        serde_json::to_writer(&mut out, &ReportLine::Match { m })?;
        writeln!(out)?;
    }
    for (m, report) in &summary.diffs {
        serde_json::to_writer(&mut out, &ReportLine::Diff { m, report })?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = build_config(&args)?;
    let timeout = args.timeout_secs.map(Duration::from_secs);

    let runtime = Runtime::new(config, timeout).context("locating dissector")?;

    let cancellation = runtime.cancellation_token();
    ctrlc::set_handler(move || {
        log::warn!("received interrupt, cancelling run");
        cancellation.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let summary = runtime.run(&args.side_a, &args.side_b, args.behavioural);
    print_summary(&summary);
    if !summary.matches.is_empty() {
        print_match_table(&summary);
    }

    match &args.out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            write_report(&summary, BufWriter::new(file))?;
        }
        None => {
            write_report(&summary, io::stdout().lock())?;
        }
    }

    std::process::exit(summary.exit_code());
}
