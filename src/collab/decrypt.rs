//! Protected-content decrypt collaborator.
//!
//! License acquisition and manifest decryption happen entirely behind this
//! trait; the pipeline only hands over the URLs and the destination.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Error type returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a successful decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    /// Where the decrypted media was written.
    pub output_path: PathBuf,
    /// Identifier of the content key used.
    pub content_key_id: String,
}

/// Opaque decrypt operation for protected media.
#[async_trait]
pub trait Decrypter: Send + Sync {
    /// Returns false when the collaborator is configured but switched off.
    fn is_enabled(&self) -> bool;

    /// Fetches the license, decrypts the manifest's media and writes it to
    /// `destination`.
    async fn decrypt(
        &self,
        cancel: &CancellationToken,
        manifest_url: &str,
        license_url: &str,
        destination: &Path,
    ) -> Result<Decrypted, BoxError>;
}
