//! Progress reporting for the crawler
//!
//! Provides a live spinner while consumers run, plus header, summary and
//! queue status printing.

use crate::broker::QueueStatus;
use crate::coordinator::{CrawlProgress, CrawlResult};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter that displays crawl status
#[derive(Clone)]
pub struct ProgressReporter {
    /// Progress bar
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(style);

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &CrawlProgress) {
        let msg = format!(
            "Dirs: {} | Products: {} | Inventories: {} | Rate: {:.0} dirs/s | Queued: {} | In flight: {} | Retries: {} | Consumers: {}",
            format_number(progress.stats.acked),
            format_number(progress.stats.published_products),
            format_number(progress.stats.published_collections),
            progress.dirs_per_second(),
            format_number(progress.queued),
            progress.in_flight,
            format_number(progress.stats.retried),
            progress.consumers,
        );

        self.bar.set_message(msg);
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header at the start of the crawl
pub fn print_header(broker: &str, mode: &str, consumers: usize, seed: Option<&str>) {
    println!();
    println!(
        "{} {}",
        style("pds-crawler").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Broker:").bold(), broker);
    println!("  {} {} x {}", style("Consumers:").bold(), consumers, mode);
    if let Some(seed) = seed {
        println!("  {} {}", style("Seed:").bold(), seed);
    }
    println!();
}

/// Print a summary of the crawl results
pub fn print_summary(result: &CrawlResult) {
    let duration_secs = result.duration.as_secs_f64();
    let title = if result.completed {
        style("Crawl Complete").green().bold()
    } else {
        style("Crawl Stopped").yellow().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Directories:").bold(), format_number(result.acked));
    println!(
        "  {} {}",
        style("Subdirectories queued:").bold(),
        format_number(result.published_directories)
    );
    println!("  {} {}", style("Products:").bold(), format_number(result.published_products));
    println!(
        "  {} {}",
        style("Inventories:").bold(),
        format_number(result.published_collections)
    );
    println!(
        "  {} {:.1}s ({:.0} dirs/sec)",
        style("Duration:").bold(),
        duration_secs,
        result.dirs_per_second()
    );
    if result.retried > 0 {
        println!("  {} {}", style("Retries:").yellow().bold(), format_number(result.retried));
    }
    if result.dropped > 0 {
        println!("  {} {}", style("Dropped:").yellow().bold(), format_number(result.dropped));
    }
    if result.quarantined > 0 {
        println!(
            "  {} {}",
            style("Quarantined:").red().bold(),
            format_number(result.quarantined)
        );
    }
    if result.transport_errors > 0 {
        println!(
            "  {} {}",
            style("Broker errors:").red().bold(),
            format_number(result.transport_errors)
        );
    }
    println!();
}

/// Print queue counts as a table
pub fn print_status(statuses: &[QueueStatus]) {
    println!();
    println!(
        "  {:<22} {:>14} {:>14}",
        style("Queue").bold(),
        style("Ready").bold(),
        style("Unacked").bold()
    );
    println!("  {}", style("─".repeat(52)).dim());
    for status in statuses {
        println!(
            "  {:<22} {:>14} {:>14}",
            status.queue.as_str(),
            format_number(status.ready),
            format_number(status.unacked)
        );
    }
    println!();
}
