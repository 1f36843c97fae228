//! Compact command implementation.

use super::open_existing;
use opsync_core::CompactionStats;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting queue at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let queue = open_existing(path)?;
    let preview = queue.compaction_preview()?;
    print_stats("Compaction Analysis", &preview);

    if dry_run {
        return Ok(());
    }
    println!();
    if preview.records_removed() == 0 {
        println!("No compaction needed - log holds one record per entry");
        return Ok(());
    }

    println!("Performing compaction...");
    let stats = queue.compact()?;
    println!(
        "✓ Compaction complete: {} records removed, {} bytes now",
        stats.records_removed(),
        stats.bytes_after
    );
    Ok(())
}

fn print_stats(title: &str, stats: &CompactionStats) {
    let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
    println!("{title}:");
    println!("  Records before: {}", stats.records_before);
    println!("  Records after:  {}", stats.records_after);
    println!();
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if stats.bytes_before > 0 {
            saved as f64 / stats.bytes_before as f64 * 100.0
        } else {
            0.0
        }
    );
}
