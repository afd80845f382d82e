//! Configuration types for pds-crawler
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Broker selection and connection settings

use crate::consumer::{ConsumerConfig, RetryPolicy};
use crate::error::ConfigError;
use crate::message::DirectoryWorkItem;
use crate::processor::FsProcessorConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use redis::IntoConnectionInfo;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum reasonable consumer count per process
const MAX_CONSUMERS: usize = 256;

/// Poll timeout limits (milliseconds)
const MIN_POLL_TIMEOUT_MS: u64 = 10;
const MAX_POLL_TIMEOUT_MS: u64 = 600_000;

/// Broker-driven directory crawler
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pds-crawler",
    version,
    about = "Broker-driven distributed directory crawler",
    long_about = "Traverses directory trees through a message broker.\n\n\
                  Every directory is a work item on a durable queue. Consumers take items,\n\
                  list the directory, publish its subdirectories back to the same queue and\n\
                  its products and collection inventories to their own queues. Items are\n\
                  acknowledged only after everything derived from them is published, so a\n\
                  crashed consumer never loses work.",
    after_help = "EXAMPLES:\n    \
        pds-crawler seed /data/archive --node-name PDS_GEO\n    \
        pds-crawler crawl -c 8 --mode push --extensions xml\n    \
        pds-crawler crawl --broker memory --seed /data/archive --exit-when-idle\n    \
        pds-crawler status --format json"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Message broker to use
    #[arg(long, value_enum, default_value_t = BrokerKind::Redis, global = true)]
    pub broker: BrokerKind,

    /// Redis connection URL
    #[arg(
        long = "redis",
        env = "REDIS_URL",
        default_value = "redis://127.0.0.1:6379",
        value_name = "URL",
        global = true
    )]
    pub redis_url: String,

    /// Namespace for Redis keys
    #[arg(long, default_value = "pds-crawler", value_name = "PREFIX", global = true)]
    pub key_prefix: String,

    /// Log verbosity (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,

    /// Also append log output to this file
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Verbose output (same as --log-level debug)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress header, progress and summary
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Consume directory work items until interrupted or idle
    Crawl(CrawlArgs),

    /// Publish the root work item of a new crawl
    Seed(SeedArgs),

    /// Show stored and unacknowledged message counts per queue
    Status {
        /// Output format
        #[arg(long, value_enum, default_value_t = StatusFormat::Text)]
        format: StatusFormat,
    },
}

/// Arguments of the `crawl` subcommand
#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Consumer model
    #[arg(long, value_enum, default_value_t = ConsumerMode::Poll)]
    pub mode: ConsumerMode,

    /// Number of consumers in this process
    #[arg(short = 'c', long, default_value_t = default_consumers(), value_name = "NUM")]
    pub consumers: usize,

    /// Bounded wait of one poll
    #[arg(long, default_value = "3000", value_name = "MILLIS")]
    pub poll_timeout_ms: u64,

    /// Unacknowledged messages older than this are redelivered
    #[arg(long, default_value = "120", value_name = "SECS")]
    pub claim_timeout: u64,

    /// Quarantine messages redelivered more often than this (unbounded if not set)
    #[arg(long, value_name = "NUM")]
    pub max_redeliveries: Option<u32>,

    /// Product file extensions, comma separated (all files if not set)
    #[arg(long, value_delimiter = ',', value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Exclude paths matching pattern (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Maximum directory depth (unlimited if not set)
    #[arg(short = 'd', long, value_name = "NUM")]
    pub max_depth: Option<u32>,

    /// Seed this directory before consuming
    #[arg(long, value_name = "DIR")]
    pub seed: Option<PathBuf>,

    #[command(flatten)]
    pub job: JobArgs,

    /// Stop once the directory queue stays empty
    #[arg(long)]
    pub exit_when_idle: bool,
}

/// Arguments of the `seed` subcommand
#[derive(Args, Debug, Clone)]
pub struct SeedArgs {
    /// Root directory of the crawl
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Job attributes carried by every message of a crawl
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Job identifier (random if not set)
    #[arg(long, value_name = "ID")]
    pub job_id: Option<String>,

    /// Registry node the products belong to
    #[arg(long, default_value = "local", value_name = "NAME")]
    pub node_name: String,

    /// Replace products that are already registered
    #[arg(long)]
    pub overwrite: bool,
}

impl JobArgs {
    /// Root work item for `dir`
    pub fn root_item(&self, dir: &Path) -> DirectoryWorkItem {
        let job_id = self
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        DirectoryWorkItem::root(job_id, self.node_name.clone(), dir.to_string_lossy())
            .with_overwrite(self.overwrite)
    }
}

/// Available brokers
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// Redis Streams (shared between processes)
    Redis,
    /// In-process queues (single-process crawls)
    Memory,
}

/// Consumer model
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    /// Consumer-driven bounded-wait receive
    Poll,
    /// Broker-driven callback delivery
    Push,
}

impl ConsumerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerMode::Poll => "poll",
            ConsumerMode::Push => "push",
        }
    }
}

impl std::fmt::Display for ConsumerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log verbosity
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    All,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive for this crate's EnvFilter
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::All => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// `status` output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    Text,
    Json,
}

impl CliArgs {
    /// Effective log level after `--verbose`
    pub fn effective_log_level(&self) -> LogLevel {
        match (self.verbose, self.log_level) {
            (true, LogLevel::Info | LogLevel::Warn | LogLevel::Error) => LogLevel::Debug,
            (_, level) => level,
        }
    }
}

fn default_consumers() -> usize {
    // Consumers mostly wait on the broker and the filesystem
    num_cpus::get()
}

/// Validated broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub redis_url: String,
    pub key_prefix: String,
    /// Redelivery delay for unacknowledged messages
    pub claim_timeout: Duration,
}

impl BrokerSettings {
    /// Create and validate broker settings from CLI arguments
    pub fn from_args(args: &CliArgs, claim_timeout: Duration) -> Result<Self, ConfigError> {
        if args.broker == BrokerKind::Redis {
            args.redis_url
                .as_str()
                .into_connection_info()
                .map_err(|e| ConfigError::InvalidRedisUrl(format!("{}: {}", args.redis_url, e)))?;
        }

        if args.key_prefix.trim().is_empty() {
            return Err(ConfigError::Unsupported("--key-prefix must not be empty".into()));
        }

        Ok(Self {
            kind: args.broker,
            redis_url: args.redis_url.clone(),
            key_prefix: args.key_prefix.clone(),
            claim_timeout,
        })
    }

    /// Display form of the broker location
    pub fn display(&self) -> String {
        match self.kind {
            BrokerKind::Redis => format!("{} ({})", self.redis_url, self.key_prefix),
            BrokerKind::Memory => "in-process".to_string(),
        }
    }
}

/// Validated runtime configuration of a crawl
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub broker: BrokerSettings,

    /// Consumer model
    pub mode: ConsumerMode,

    /// Number of consumers
    pub consumer_count: usize,

    /// Per-consumer settings
    pub consumer: ConsumerConfig,

    /// Directory processor settings
    pub processor: FsProcessorConfig,

    /// Root item to publish before consuming
    pub seed: Option<DirectoryWorkItem>,

    /// Stop once the directory queue stays empty
    pub exit_when_idle: bool,

    /// Show header, progress and summary
    pub show_progress: bool,
}

impl CrawlConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs, crawl: &CrawlArgs) -> Result<Self, ConfigError> {
        // Validate consumer count
        if crawl.consumers == 0 || crawl.consumers > MAX_CONSUMERS {
            return Err(ConfigError::InvalidConsumerCount {
                count: crawl.consumers,
                max: MAX_CONSUMERS,
            });
        }

        // Validate poll timeout
        if !(MIN_POLL_TIMEOUT_MS..=MAX_POLL_TIMEOUT_MS).contains(&crawl.poll_timeout_ms) {
            return Err(ConfigError::InvalidPollTimeout {
                millis: crawl.poll_timeout_ms,
                min: MIN_POLL_TIMEOUT_MS,
                max: MAX_POLL_TIMEOUT_MS,
            });
        }

        let broker = BrokerSettings::from_args(args, Duration::from_secs(crawl.claim_timeout))?;

        // In-process queues start empty
        if broker.kind == BrokerKind::Memory && crawl.seed.is_none() {
            return Err(ConfigError::Unsupported(
                "--broker memory requires --seed: in-process queues start empty".into(),
            ));
        }

        // Compile exclude patterns
        let exclude_patterns = compile_patterns(&crawl.exclude_patterns)?;

        let seed = crawl
            .seed
            .as_deref()
            .map(|dir| validate_seed_dir(dir).map(|dir| crawl.job.root_item(&dir)))
            .transpose()?;

        Ok(Self {
            broker,
            mode: crawl.mode,
            consumer_count: crawl.consumers,
            consumer: ConsumerConfig {
                poll_timeout: Duration::from_millis(crawl.poll_timeout_ms),
                retry_policy: RetryPolicy {
                    max_redeliveries: crawl.max_redeliveries,
                },
                ..Default::default()
            },
            processor: FsProcessorConfig {
                product_extensions: normalize_extensions(&crawl.extensions),
                max_depth: crawl.max_depth,
                exclude_patterns,
                ..Default::default()
            },
            seed,
            exit_when_idle: crawl.exit_when_idle,
            show_progress: !args.quiet,
        })
    }

    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        self.processor.is_excluded(path)
    }
}

/// Compile exclude patterns
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Lowercase, strip leading dots, drop blanks
fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Check that a seed directory exists and return its absolute path
pub fn validate_seed_dir(dir: &Path) -> Result<PathBuf, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSeedDir {
        path: dir.to_path_buf(),
        reason,
    };

    let absolute = dir.canonicalize().map_err(|e| invalid(e.to_string()))?;
    if !absolute.is_dir() {
        return Err(invalid("not a directory".into()));
    }
    Ok(absolute)
}
