//! Concurrent download pipeline.
//!
//! An [`Orchestrator`] drains a batch of [`DownloadItem`]s with a fixed pool
//! of workers and dispatches each item on its [`Source`]:
//!
//! - direct URLs go to the [`NormalHandler`], which streams into
//!   `<path>.part`, resumes with a range request and commits by rename
//! - manifest URLs go to the [`ProtectedHandler`], which delegates to the
//!   decrypt collaborator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediafetch_core::download::{
//!     DownloadItem, NormalHandler, NormalHandlerConfig, Orchestrator, OrchestratorConfig,
//!     ProtectedHandler,
//! };
//! use mediafetch_core::transport::{Auth, RetryExecutor, SessionConfig, SessionManager};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(SessionManager::new(SessionConfig::default(), Auth::default())?);
//! let executor = Arc::new(RetryExecutor::new(session));
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(NormalHandler::new(executor, NormalHandlerConfig::default())),
//!     Arc::new(ProtectedHandler::unavailable()),
//! );
//!
//! let mut items = vec![
//!     DownloadItem::new(1)
//!         .with_url("https://cdn.example.com/1.jpg")
//!         .with_path("downloads/1.jpg"),
//! ];
//! let result = orchestrator.run(&CancellationToken::new(), &mut items).await?;
//! println!("{} succeeded, {} failed", result.succeeded, result.failed);
//! # Ok(())
//! # }
//! ```

pub mod constants;
mod error;
mod item;
mod normal;
mod orchestrator;
mod progress;
mod protected;
mod throttle;

pub use error::{DownloadError, ErrorCategory, OrchestratorError};
pub use item::{DownloadItem, ItemStatus, MediaMeta, Source};
pub use normal::{HandlerOutput, NormalHandler, NormalHandlerConfig};
pub use orchestrator::{BatchError, BatchResult, Orchestrator, OrchestratorConfig};
pub use progress::{ProgressObserver, ProgressTracker, ProgressUpdate};
pub use protected::ProtectedHandler;
pub use throttle::Throttle;
