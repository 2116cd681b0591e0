//! Protected-content handler.
//!
//! Builds the license URL from the media id and hands everything else to
//! the [`Decrypter`] collaborator. No retry or resume happens here.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::constants::MEDIA_ID_PLACEHOLDER;
use super::{DownloadError, HandlerOutput};
use crate::collab::Decrypter;

/// Delegates protected items to a decrypt collaborator.
pub struct ProtectedHandler {
    decrypter: Option<Arc<dyn Decrypter>>,
    license_url_template: Option<String>,
}

impl std::fmt::Debug for ProtectedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedHandler")
            .field("decrypter", &self.decrypter.is_some())
            .field("license_url_template", &self.license_url_template)
            .finish()
    }
}

impl ProtectedHandler {
    /// Creates a handler.
    ///
    /// A template without `{media_id}` is discarded with a warning; protected
    /// items then fail as unavailable.
    #[must_use]
    pub fn new(
        decrypter: Option<Arc<dyn Decrypter>>,
        license_url_template: Option<String>,
    ) -> Self {
        let license_url_template = license_url_template.filter(|template| {
            let usable = template.contains(MEDIA_ID_PLACEHOLDER);
            if !usable {
                warn!(
                    template = %template,
                    "license URL template lacks {MEDIA_ID_PLACEHOLDER}, ignoring"
                );
            }
            usable
        });
        Self {
            decrypter,
            license_url_template,
        }
    }

    /// A handler with no decrypter: every protected item fails.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(None, None)
    }

    /// Whether an enabled decrypter and a license template are configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.license_url_template.is_some()
            && self.decrypter.as_ref().is_some_and(|d| d.is_enabled())
    }

    /// License URL for `media_id`, if a template is configured.
    #[must_use]
    pub fn license_url(&self, media_id: u64) -> Option<String> {
        self.license_url_template
            .as_ref()
            .map(|template| template.replace(MEDIA_ID_PLACEHOLDER, &media_id.to_string()))
    }

    /// Decrypts `manifest_url` into `destination`.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::DecrypterUnavailable`] if no enabled decrypter or no
    ///   license template is set
    /// - [`DownloadError::Decrypt`] with the collaborator's error
    /// - [`DownloadError::Cancelled`] if `cancel` fires first
    #[instrument(skip(self, cancel), fields(path = %destination.display()))]
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        item_id: u64,
        manifest_url: &str,
        destination: &Path,
    ) -> Result<HandlerOutput, DownloadError> {
        let decrypter = match &self.decrypter {
            None => {
                return Err(DownloadError::DecrypterUnavailable {
                    item_id,
                    reason: "no decrypter is configured",
                });
            }
            Some(d) if !d.is_enabled() => {
                return Err(DownloadError::DecrypterUnavailable {
                    item_id,
                    reason: "the decrypter is disabled",
                });
            }
            Some(d) => d,
        };

        let Some(license_url) = self.license_url(item_id) else {
            return Err(DownloadError::DecrypterUnavailable {
                item_id,
                reason: "no license URL template is configured",
            });
        };
        let decrypted = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = decrypter.decrypt(cancel, manifest_url, &license_url, destination) => {
                result.map_err(|source| DownloadError::Decrypt { item_id, source })?
            }
        };

        let bytes = tokio::fs::metadata(&decrypted.output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        info!(
            output = %decrypted.output_path.display(),
            key_id = %decrypted.content_key_id,
            bytes,
            "protected download complete"
        );

        Ok(HandlerOutput {
            path: decrypted.output_path,
            bytes,
            resumed_from: 0,
            content_key_id: Some(decrypted.content_key_id),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::collab::{BoxError, Decrypted};

    const TEMPLATE: &str = "https://api.example.com/drm/{media_id}/license";

    #[derive(Default)]
    struct FakeDecrypter {
        disabled: bool,
        fail: bool,
        hang: bool,
        calls: Mutex<Vec<(String, String, PathBuf)>>,
    }

    #[async_trait]
    impl Decrypter for FakeDecrypter {
        fn is_enabled(&self) -> bool {
            !self.disabled
        }

        async fn decrypt(
            &self,
            _cancel: &CancellationToken,
            manifest_url: &str,
            license_url: &str,
            destination: &Path,
        ) -> Result<Decrypted, BoxError> {
            self.calls.lock().unwrap().push((
                manifest_url.to_string(),
                license_url.to_string(),
                destination.to_path_buf(),
            ));
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err("license server refused".into());
            }
            tokio::fs::write(destination, b"clear media").await?;
            Ok(Decrypted {
                output_path: destination.to_path_buf(),
                content_key_id: "kid-42".to_string(),
            })
        }
    }

    fn template() -> Option<String> {
        Some(TEMPLATE.to_string())
    }

    #[test]
    fn test_license_url_substitutes_media_id() {
        let handler = ProtectedHandler::new(None, template());
        assert_eq!(
            handler.license_url(77).as_deref(),
            Some("https://api.example.com/drm/77/license")
        );
    }

    #[tokio::test]
    async fn test_template_without_placeholder_is_rejected() {
        let decrypter = Arc::new(FakeDecrypter::default());
        let handler = ProtectedHandler::new(
            Some(decrypter.clone()),
            Some("https://api.example.com/license".to_string()),
        );
        assert_eq!(handler.license_url(5), None);
        assert!(!handler.is_available());

        let result = handler
            .download(
                &CancellationToken::new(),
                5,
                "https://cdn.example.com/5.mpd",
                Path::new("/tmp/never"),
            )
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::DecrypterUnavailable { item_id: 5, .. })
        ));
        assert!(decrypter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_decrypter_is_configuration_error() {
        let handler = ProtectedHandler::unavailable();
        let result = handler
            .download(
                &CancellationToken::new(),
                1,
                "https://cdn.example.com/1.mpd",
                Path::new("/tmp/never"),
            )
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::DecrypterUnavailable { item_id: 1, .. })
        ));
        assert!(!handler.is_available());
    }

    #[tokio::test]
    async fn test_disabled_decrypter_is_not_called() {
        let decrypter = Arc::new(FakeDecrypter {
            disabled: true,
            ..FakeDecrypter::default()
        });
        let handler = ProtectedHandler::new(Some(decrypter.clone()), template());

        let result = handler
            .download(
                &CancellationToken::new(),
                1,
                "https://cdn.example.com/1.mpd",
                Path::new("/tmp/never"),
            )
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::DecrypterUnavailable { .. })
        ));
        assert!(decrypter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decrypt_success_passes_urls_and_returns_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("9.mp4");
        let decrypter = Arc::new(FakeDecrypter::default());
        let handler = ProtectedHandler::new(Some(decrypter.clone()), template());

        let output = handler
            .download(
                &CancellationToken::new(),
                9,
                "https://cdn.example.com/9.mpd",
                &dest,
            )
            .await
            .unwrap();

        assert_eq!(output.path, dest);
        assert_eq!(output.bytes, 11);
        assert_eq!(output.content_key_id.as_deref(), Some("kid-42"));
        let calls = decrypter.calls.lock().unwrap();
        assert_eq!(calls[0].0, "https://cdn.example.com/9.mpd");
        assert_eq!(calls[0].1, "https://api.example.com/drm/9/license");
    }

    #[tokio::test]
    async fn test_decrypt_error_passed_through() {
        let decrypter = Arc::new(FakeDecrypter {
            fail: true,
            ..FakeDecrypter::default()
        });
        let handler = ProtectedHandler::new(Some(decrypter), template());

        let error = handler
            .download(
                &CancellationToken::new(),
                3,
                "https://cdn.example.com/3.mpd",
                Path::new("/tmp/never"),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::Decrypt { item_id: 3, .. }));
        assert!(error.to_string().contains("license server refused"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_decrypt() {
        let decrypter = Arc::new(FakeDecrypter {
            hang: true,
            ..FakeDecrypter::default()
        });
        let handler = ProtectedHandler::new(Some(decrypter), template());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });

        let result = handler
            .download(&cancel, 3, "https://cdn.example.com/3.mpd", Path::new("/tmp/x"))
            .await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
