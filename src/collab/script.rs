//! User script hooks.
//!
//! A hook receives the item's metadata through a fixed set of environment
//! variables and answers on stdout:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `MEDIA_ID` | numeric media id |
//! | `POST_ID` | owning post id (empty if unknown) |
//! | `MEDIA_TYPE` | e.g. `photo`, `video` |
//! | `USERNAME` | owning account |
//! | `SOURCE_URL` | direct URL or manifest URL |
//! | `TOTAL_COUNT` | number of items in the batch |
//! | `DOWNLOAD_TYPE` | `normal` or `protected` |

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Errors from running a hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// The program could not be started.
    #[error("failed to start hook {program}: {source}")]
    Spawn {
        /// Program path.
        program: String,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The program exited unsuccessfully.
    #[error("hook {program} exited with {status}: {stderr}")]
    Failed {
        /// Program path.
        program: String,
        /// Exit status description.
        status: String,
        /// Trimmed stderr.
        stderr: String,
    },

    /// The cancellation token fired while the hook was running.
    #[error("hook cancelled")]
    Cancelled,
}

/// Metadata exposed to a hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookContext {
    /// Media id.
    pub media_id: u64,
    /// Owning post id.
    pub post_id: Option<u64>,
    /// Media type label.
    pub media_type: String,
    /// Owning account.
    pub username: String,
    /// Direct or manifest URL.
    pub source_url: String,
    /// Batch size.
    pub total_count: usize,
    /// `normal` or `protected`.
    pub download_type: String,
}

impl HookContext {
    /// The environment passed to the hook process.
    #[must_use]
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("MEDIA_ID", self.media_id.to_string()),
            (
                "POST_ID",
                self.post_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
            ("MEDIA_TYPE", self.media_type.clone()),
            ("USERNAME", self.username.clone()),
            ("SOURCE_URL", self.source_url.clone()),
            ("TOTAL_COUNT", self.total_count.to_string()),
            ("DOWNLOAD_TYPE", self.download_type.clone()),
        ]
    }
}

/// A user script consulted per item.
#[async_trait]
pub trait ScriptHook: Send + Sync {
    /// Runs the hook and returns its trimmed stdout.
    async fn run(&self, cancel: &CancellationToken, ctx: &HookContext)
    -> Result<String, HookError>;
}

/// Returns true for a truthy skip answer (`true`, `skip` or `1`).
#[must_use]
pub fn is_skip_output(output: &str) -> bool {
    matches!(
        output.trim().to_ascii_lowercase().as_str(),
        "true" | "skip" | "1"
    )
}

/// Hook backed by an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHook {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandHook {
    /// Creates a hook running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Program path.
    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl ScriptHook for CommandHook {
    #[instrument(level = "debug", skip(self, cancel, ctx), fields(program = %self.program.display(), media_id = ctx.media_id))]
    async fn run(
        &self,
        cancel: &CancellationToken,
        ctx: &HookContext,
    ) -> Result<String, HookError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(ctx.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HookError::Cancelled),
            result = output => result.map_err(|source| HookError::Spawn {
                program: program.clone(),
                source,
            })?,
        };

        if !output.status.success() {
            return Err(HookError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(output = %stdout, "hook finished");
        Ok(stdout)
    }
}
