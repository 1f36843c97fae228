//! Inspect command implementation.

use super::open_existing;
use opsync_core::QueueStats;
use serde::Serialize;
use std::path::Path;

/// Attempts after which the engine stops retrying by default.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Queue directory.
    pub path: String,
    /// Log size in bytes.
    pub log_size: u64,
    /// Records in the log, including superseded ones.
    pub log_records: usize,
    /// Bytes of torn tail dropped on open.
    pub truncated_bytes: u64,
    /// Entry counts.
    pub stats: QueueStats,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_existing(path)?;
    let result = InspectResult {
        path: path.display().to_string(),
        log_size: queue.log_size()?,
        log_records: queue.log_records(),
        truncated_bytes: queue.recovery().truncated_bytes,
        stats: opsync_core::QueueStore::stats(&queue, DEFAULT_MAX_ATTEMPTS)?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    let stats = &result.stats;
    println!("opsync Queue Inspection");
    println!("=======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:    {}", format_size(result.log_size));
    println!("  Records: {} ({} live)", result.log_records, stats.total);
    if result.truncated_bytes > 0 {
        println!("  Torn tail dropped on open: {} bytes", result.truncated_bytes);
    }
    println!();
    println!("Entries:");
    println!("  Pending:    {}", stats.pending);
    println!("  Processing: {}", stats.processing);
    println!("  Completed:  {}", stats.completed);
    println!("  Failed:     {}", stats.failed);
    println!("    exhausted:  {}", stats.exhausted);
    println!("    conflicted: {}", stats.conflicted);
    println!("  Compressed: {}", stats.compressed);
    if !stats.failures_by_kind.is_empty() {
        println!();
        println!("Failures by kind:");
        for (kind, count) in &stats.failures_by_kind {
            println!("  {kind:<14} {count}");
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} bytes")
    }
}
