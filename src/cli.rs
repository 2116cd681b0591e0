//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download a batch of media items resiliently.
///
/// Reads a JSON manifest of items (`id`, `url` or `manifest_url`, `path`
/// and optional metadata), downloads them with a bounded worker pool, and
/// resumes partial files on the next run.
#[derive(Parser, Debug)]
#[command(name = "mediafetch")]
#[command(author, version, about)]
pub struct Args {
    /// JSON manifest listing the items to download
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Config file (defaults to $XDG_CONFIG_HOME/mediafetch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Concurrent download workers (1-64)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Attempts per HTTP request (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_retries: Option<u32>,

    /// Minimum delay between requests in milliseconds (0 to disable, max 60000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,

    /// Per-transfer speed cap in bytes per second (0 for unlimited)
    #[arg(short = 's', long)]
    pub speed_limit: Option<u64>,

    /// Root directory for relative item paths
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Restart partial downloads instead of resuming them
    #[arg(long)]
    pub no_resume: bool,

    /// Program consulted per item; output "true", "skip" or "1" skips it
    #[arg(long)]
    pub skip_hook: Option<PathBuf>,

    /// Program consulted per item; non-empty output replaces the file name
    #[arg(long)]
    pub naming_hook: Option<PathBuf>,
}

impl Args {
    /// Default log filter for these flags when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}
