//! CLI entry point for mediafetch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use mediafetch_core::collab::{CommandHook, ScriptHook};
use mediafetch_core::transport::{DEFAULT_MAX_ATTEMPTS, constants};
use mediafetch_core::{
    Auth, BatchResult, DownloadItem, NormalHandler, NormalHandlerConfig, Orchestrator,
    OrchestratorConfig, ProgressTracker, ProtectedHandler, RetryConfig, RetryExecutor,
    SessionConfig, SessionManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;

#[cfg(test)]
#[path = "../tests/support/socket_guard.rs"]
mod socket_guard;

use app_config::FileConfig;
use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_file_config(args.config.as_deref())?;
    if let Some(path) = loaded.path.as_deref().filter(|_| loaded.config.is_some()) {
        debug!(path = %path.display(), "loaded config file");
    }
    let file = loaded.config.unwrap_or_default();
    let settings = Settings::resolve(&args, &file);
    debug!(?settings, "resolved settings");

    let mut items = load_manifest(&args.manifest)?;
    info!(items = items.len(), manifest = %args.manifest.display(), "mediafetch starting");

    let progress = Arc::new(ProgressTracker::new(items.len()));
    let bar = progress_bar(args.quiet, items.len());
    {
        let bar = bar.clone();
        progress.add_observer(move |update| {
            bar.set_position(update.processed() as u64);
            bar.set_message(format!(
                "{} / {} at {}/s",
                HumanBytes(update.bytes_done),
                HumanBytes(update.bytes_total),
                HumanBytes(update.speed as u64)
            ));
        });
    }
    let orchestrator = build_orchestrator(&settings, &file, &progress)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight items");
            signal_cancel.cancel();
        }
    });

    let result = orchestrator.run(&cancel, &mut items).await?;
    bar.finish_and_clear();

    report(&result);
    Ok(ExitCode::from(exit_status(&result)))
}

/// Flag, file and built-in values merged in that order of precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    workers: usize,
    max_attempts: u32,
    rate_interval: Duration,
    speed_limit: Option<u64>,
    output_dir: Option<PathBuf>,
    resume: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    skip_hook: Option<PathBuf>,
    naming_hook: Option<PathBuf>,
}

impl Settings {
    fn resolve(args: &Args, file: &FileConfig) -> Self {
        Self {
            workers: args
                .workers
                .map(usize::from)
                .or(file.workers)
                .unwrap_or(OrchestratorConfig::default().workers),
            max_attempts: args
                .max_retries
                .or(file.max_retries)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            rate_interval: Duration::from_millis(args.rate_limit.or(file.rate_limit).unwrap_or(0)),
            speed_limit: args
                .speed_limit
                .or(file.speed_limit)
                .filter(|limit| *limit > 0),
            output_dir: args.output_dir.clone().or_else(|| file.output_dir.clone()),
            resume: !args.no_resume && file.resume.unwrap_or(true),
            connect_timeout: Duration::from_secs(
                file.connect_timeout_secs
                    .unwrap_or(constants::CONNECT_TIMEOUT_SECS),
            ),
            read_timeout: Duration::from_secs(
                file.read_timeout_secs
                    .unwrap_or(constants::READ_TIMEOUT_SECS),
            ),
            skip_hook: args.skip_hook.clone().or_else(|| file.skip_hook.clone()),
            naming_hook: args
                .naming_hook
                .clone()
                .or_else(|| file.naming_hook.clone()),
        }
    }
}

fn build_orchestrator(
    settings: &Settings,
    file: &FileConfig,
    progress: &Arc<ProgressTracker>,
) -> Result<Orchestrator> {
    let mut auth = Auth::default();
    if let Some(cookie) = file.cookie_or_env() {
        auth = auth.with_cookie(cookie);
    }
    if let Some(user_agent) = &file.user_agent {
        auth = auth.with_user_agent(user_agent);
    }
    if let Some((name, value)) = &file.auth_header {
        auth = auth.with_header(name, value);
    }
    if auth.is_empty() {
        debug!("no auth material configured");
    }

    let session_config = SessionConfig {
        connect_timeout: settings.connect_timeout,
        read_timeout: settings.read_timeout,
        rate_interval: settings.rate_interval,
        ..SessionConfig::default()
    };
    let session =
        SessionManager::new(session_config, auth).context("Failed to create HTTP session")?;
    let executor = Arc::new(RetryExecutor::new(Arc::new(session)));

    let normal = NormalHandler::new(
        executor,
        NormalHandlerConfig {
            resume: settings.resume,
            speed_limit: settings.speed_limit,
            retry: RetryConfig::with_max_attempts(settings.max_attempts),
            ..NormalHandlerConfig::default()
        },
    )
    .with_progress(Arc::clone(progress));
    // Decryption is supplied by embedders; the CLI fails protected items.
    let protected = ProtectedHandler::new(None, file.license_url_template.clone());

    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig {
            workers: settings.workers,
            output_root: settings.output_dir.clone(),
        },
        Arc::new(normal),
        Arc::new(protected),
    )
    .with_progress(Arc::clone(progress));
    if let Some(program) = &settings.skip_hook {
        let hook: Arc<dyn ScriptHook> = Arc::new(CommandHook::new(program));
        orchestrator = orchestrator.with_skip_hook(hook);
    }
    if let Some(program) = &settings.naming_hook {
        let hook: Arc<dyn ScriptHook> = Arc::new(CommandHook::new(program));
        orchestrator = orchestrator.with_naming_hook(hook);
    }
    Ok(orchestrator)
}

fn load_manifest(path: &Path) -> Result<Vec<DownloadItem>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse manifest '{}'", path.display()))
}

fn progress_bar(quiet: bool, total: usize) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_bar} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn report(result: &BatchResult) {
    let mut by_category: BTreeMap<&'static str, usize> = BTreeMap::new();
    for failure in &result.errors {
        *by_category.entry(failure.error.category().label()).or_default() += 1;
        debug!(
            item_id = failure.item_id,
            source = %failure.source,
            error = %failure.error,
            "failed item"
        );
    }
    for (category, count) in &by_category {
        warn!(category, count, "failures");
    }

    info!(
        total = result.total,
        succeeded = result.succeeded,
        failed = result.failed,
        skipped = result.skipped,
        retried = result.retried,
        "Download complete"
    );
}

/// 0 when nothing failed, 2 on partial failure, 1 when nothing succeeded.
fn exit_status(result: &BatchResult) -> u8 {
    if result.is_total_failure() {
        1
    } else if result.has_failures() {
        2
    } else {
        0
    }
}
