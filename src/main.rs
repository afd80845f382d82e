//! pds-crawler - Broker-Driven Distributed Directory Crawler
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use pds_crawler::broker::{
    Broker, MemoryBroker, MemoryBrokerConfig, QueueName, QueueStatus, RedisBroker, RedisBrokerConfig,
};
use pds_crawler::config::{
    validate_seed_dir, BrokerKind, BrokerSettings, CliArgs, Command, CrawlArgs, CrawlConfig,
    SeedArgs, StatusFormat,
};
use pds_crawler::coordinator::{self, CoordinatorConfig, CrawlCoordinator};
use pds_crawler::processor::FsDirectoryProcessor;
use pds_crawler::progress::{print_header, print_status, print_summary, ProgressReporter};
use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Claim timeout used by commands that do not consume
const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(&args)?;

    match &args.command {
        Command::Crawl(crawl) => run_crawl(&args, crawl),
        Command::Seed(seed) => run_seed(&args, seed),
        Command::Status { format } => run_status(&args, *format),
    }
}

/// Consume directory work until interrupted or idle
fn run_crawl(args: &CliArgs, crawl: &CrawlArgs) -> Result<()> {
    // Validate and create config
    let config = CrawlConfig::from_args(args, crawl).context("Invalid configuration")?;

    // Print header
    if config.show_progress {
        print_header(
            &config.broker.display(),
            config.mode.as_str(),
            config.consumer_count,
            config.seed.as_ref().map(|s| s.dir.as_str()),
        );
    }

    match config.broker.kind {
        BrokerKind::Redis => {
            let broker = connect_redis(&config.broker)?;
            crawl_with(broker, &config)
        }
        BrokerKind::Memory => {
            let broker = MemoryBroker::with_config(MemoryBrokerConfig {
                redelivery_timeout: Some(config.broker.claim_timeout),
                ..Default::default()
            });
            crawl_with(broker, &config)
        }
    }
}

fn crawl_with<B: Broker>(broker: B, config: &CrawlConfig) -> Result<()> {
    let mut coordinator = CrawlCoordinator::new(
        broker,
        CoordinatorConfig {
            mode: config.mode,
            consumer_count: config.consumer_count,
            consumer: config.consumer.clone(),
            exit_when_idle: config.exit_when_idle,
            ..Default::default()
        },
    );

    // Create progress reporter
    let progress = config.show_progress.then(ProgressReporter::new);
    if let Some(p) = &progress {
        let reporter = p.clone();
        coordinator = coordinator.with_progress(move |update| reporter.update(update));
        p.set_status("Starting consumers...");
    }

    // Setup signal handler for graceful shutdown
    let shutdown_flag = coordinator.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    if let Some(seed) = &config.seed {
        coordinator.seed(seed).context("Failed to seed crawl")?;
    }

    // Run the crawl
    let processor_config = config.processor.clone();
    let result = coordinator
        .run(|_| FsDirectoryProcessor::new(processor_config.clone()))
        .context("Crawl failed")?;

    // Finish progress
    if let Some(p) = &progress {
        if result.completed {
            p.finish("Crawl completed");
        } else {
            p.finish("Crawl stopped");
        }
    }

    // Print summary
    if config.show_progress {
        print_summary(&result);
    }

    if !result.completed {
        info!("Crawl was interrupted before the queue was idle");
    }

    if result.quarantined > 0 {
        warn!(
            quarantined = result.quarantined,
            queue = %QueueName::Quarantine,
            "Some directories were quarantined"
        );
    }

    Ok(())
}

/// Publish the root work item of a new crawl
fn run_seed(args: &CliArgs, seed: &SeedArgs) -> Result<()> {
    let settings = BrokerSettings::from_args(args, DEFAULT_CLAIM_TIMEOUT)
        .context("Invalid configuration")?;
    if settings.kind == BrokerKind::Memory {
        bail!("seed needs a shared broker; use 'crawl --broker memory --seed <DIR>' instead");
    }

    let dir = validate_seed_dir(&seed.dir).context("Invalid configuration")?;
    let item = seed.job.root_item(&dir);

    let broker = connect_redis(&settings)?;
    coordinator::seed(&broker, &item).context("Failed to seed crawl")?;

    if !args.quiet {
        println!("Seeded job {} at {}", item.job_id, item.dir);
    }
    Ok(())
}

/// Report message counts per queue
fn run_status(args: &CliArgs, format: StatusFormat) -> Result<()> {
    let settings = BrokerSettings::from_args(args, DEFAULT_CLAIM_TIMEOUT)
        .context("Invalid configuration")?;
    if settings.kind == BrokerKind::Memory {
        bail!("status needs a shared broker; in-process queues exist only inside 'crawl'");
    }

    let broker = connect_redis(&settings)?;
    let statuses = QueueName::ALL
        .iter()
        .map(|&queue| broker.queue_status(queue))
        .collect::<Result<Vec<QueueStatus>, _>>()
        .context("Failed to read queue status")?;

    match format {
        StatusFormat::Text => print_status(&statuses),
        StatusFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
    }
    Ok(())
}

fn connect_redis(settings: &BrokerSettings) -> Result<RedisBroker> {
    let config = RedisBrokerConfig {
        url: settings.redis_url.clone(),
        key_prefix: settings.key_prefix.clone(),
        claim_timeout: settings.claim_timeout,
        ..Default::default()
    };

    RedisBroker::connect(config).context("Failed to connect to Redis")
}

fn setup_logging(args: &CliArgs) -> Result<()> {
    let level = args.effective_log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pds_crawler={},warn", level.directive())));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let file_layer = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file '{}'", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(())
}
