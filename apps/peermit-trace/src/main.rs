#![deny(clippy::pedantic, unsafe_code)]

//! Offline analyzer for resource manager trace files
//!
//! Traces are gzip-compressed streams of line-delimited JSON records. This
//! tool decodes them and either dumps the records or aggregates them per
//! scope class to show where resources went and what was blocked.

use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use peermit_errors::{Error, TraceError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "peermit-trace")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Decode and summarize peermit trace files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate the trace per scope class
    Summary {
        /// Path to the trace file
        trace: PathBuf,
    },

    /// Print every record on one line
    Dump {
        /// Path to the trace file
        trace: PathBuf,
        /// Only print records of this event type
        #[arg(long, value_name = "TYPE")]
        event_type: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ScopeRecord {
    #[serde(rename = "Class")]
    class: String,
    #[serde(rename = "Conn", default)]
    conn: Option<String>,
    #[serde(rename = "Stream", default)]
    stream: Option<String>,
    #[serde(rename = "Peer", default)]
    peer: Option<String>,
    #[serde(rename = "Service", default)]
    service: Option<String>,
    #[serde(rename = "Protocol", default)]
    protocol: Option<String>,
}

impl ScopeRecord {
    fn describe(&self) -> String {
        let mut out = self.class.clone();
        for part in [
            self.service.as_deref(),
            self.protocol.as_deref(),
            self.peer.as_deref(),
            self.conn.as_deref(),
            self.stream.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = write!(out, ":{part}");
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct TraceRecord {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Type")]
    evt_type: String,
    #[serde(rename = "Scope", default)]
    scope: Option<ScopeRecord>,
    #[serde(rename = "Delta", default)]
    delta: i64,
    #[serde(rename = "DeltaIn", default)]
    delta_in: i32,
    #[serde(rename = "DeltaOut", default)]
    delta_out: i32,
    #[serde(rename = "Memory", default)]
    memory: i64,
    #[serde(rename = "StreamsIn", default)]
    streams_in: i32,
    #[serde(rename = "StreamsOut", default)]
    streams_out: i32,
    #[serde(rename = "ConnsIn", default)]
    conns_in: i32,
    #[serde(rename = "ConnsOut", default)]
    conns_out: i32,
    #[serde(rename = "FD", default)]
    fd: i32,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Summary { trace } => summary(&read_trace(&trace)?),
        Commands::Dump { trace, event_type } => dump(&read_trace(&trace)?, event_type.as_deref()),
    }
    Ok(())
}

fn read_trace(path: &Path) -> Result<Vec<TraceRecord>, Error> {
    let file = std::fs::File::open(path).map_err(|e| TraceError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(GzDecoder::new(file)).lines().enumerate() {
        let line = line.map_err(|e| TraceError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| TraceError::Malformed {
            line: idx + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

#[derive(Default)]
struct ClassStats {
    events: u64,
    blocked: u64,
    peak_memory: i64,
    peak_streams_in: i32,
    peak_streams_out: i32,
    peak_conns_in: i32,
    peak_conns_out: i32,
    peak_fd: i32,
}

fn summary(records: &[TraceRecord]) {
    let mut by_class: BTreeMap<String, ClassStats> = BTreeMap::new();
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();

    for record in records {
        *by_type.entry(record.evt_type.clone()).or_default() += 1;

        let Some(scope) = &record.scope else { continue };
        let stats = by_class.entry(scope.class.clone()).or_default();
        stats.events += 1;
        if record.evt_type.starts_with("block_") {
            stats.blocked += 1;
        }
        stats.peak_memory = stats.peak_memory.max(record.memory);
        stats.peak_streams_in = stats.peak_streams_in.max(record.streams_in);
        stats.peak_streams_out = stats.peak_streams_out.max(record.streams_out);
        stats.peak_conns_in = stats.peak_conns_in.max(record.conns_in);
        stats.peak_conns_out = stats.peak_conns_out.max(record.conns_out);
        stats.peak_fd = stats.peak_fd.max(record.fd);
    }

    println!("{} events", records.len());
    if let (Some(first), Some(last)) = (records.first(), records.last()) {
        println!("from {} to {}", first.time, last.time);
    }

    println!();
    println!(
        "{:<16} {:>8} {:>8} {:>12} {:>12} {:>12} {:>6}",
        "class", "events", "blocked", "peak mem", "peak strms", "peak conns", "fd"
    );
    for (class, stats) in &by_class {
        println!(
            "{:<16} {:>8} {:>8} {:>12} {:>7}/{:<4} {:>7}/{:<4} {:>6}",
            class,
            stats.events,
            stats.blocked,
            stats.peak_memory,
            stats.peak_streams_in,
            stats.peak_streams_out,
            stats.peak_conns_in,
            stats.peak_conns_out,
            stats.peak_fd
        );
    }

    println!();
    println!("{:<24} {:>8}", "event type", "count");
    for (evt_type, count) in &by_type {
        println!("{evt_type:<24} {count:>8}");
    }
}

fn dump(records: &[TraceRecord], event_type: Option<&str>) {
    for record in records {
        if let Some(filter) = event_type {
            if record.evt_type != filter {
                continue;
            }
        }

        let scope = record
            .scope
            .as_ref()
            .map_or_else(|| "-".to_string(), ScopeRecord::describe);

        let mut detail = String::new();
        if record.delta != 0 {
            let _ = write!(detail, " delta={}", record.delta);
        }
        if record.delta_in != 0 || record.delta_out != 0 {
            let _ = write!(detail, " delta_io={}/{}", record.delta_in, record.delta_out);
        }
        if record.memory != 0 {
            let _ = write!(detail, " mem={}", record.memory);
        }
        if record.streams_in != 0 || record.streams_out != 0 {
            let _ = write!(
                detail,
                " streams={}/{}",
                record.streams_in, record.streams_out
            );
        }
        if record.conns_in != 0 || record.conns_out != 0 {
            let _ = write!(detail, " conns={}/{}", record.conns_in, record.conns_out);
        }
        if record.fd != 0 {
            let _ = write!(detail, " fd={}", record.fd);
        }

        println!("{} {:<20} {}{}", record.time, record.evt_type, scope, detail);
    }
}
