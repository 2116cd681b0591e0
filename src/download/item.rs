//! Download items and their lifecycle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-item state: `Queued` until the orchestrator reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Not processed yet.
    #[default]
    Queued,
    /// Not attempted (cancelled, no source, or skipped by hook).
    Skipped,
    /// Committed to its destination.
    Succeeded,
    /// Attempted and failed.
    Failed,
}

impl ItemStatus {
    /// Returns true for `Skipped`, `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued)
    }
}

/// Descriptive metadata passed to script hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMeta {
    /// Owning post id.
    #[serde(default)]
    pub post_id: Option<u64>,
    /// Media type label (`photo`, `video`, ...).
    #[serde(default)]
    pub media_type: String,
    /// Owning account.
    #[serde(default)]
    pub username: String,
}

/// Where an item's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source<'a> {
    /// Plain URL streamed by the normal handler.
    Direct(&'a str),
    /// Protected manifest handed to the decrypter.
    Protected(&'a str),
}

impl<'a> Source<'a> {
    /// The URL behind this source.
    #[must_use]
    pub fn url(self) -> &'a str {
        match self {
            Self::Direct(url) | Self::Protected(url) => url,
        }
    }

    /// `normal` or `protected`.
    #[must_use]
    pub fn download_type(self) -> &'static str {
        match self {
            Self::Direct(_) => "normal",
            Self::Protected(_) => "protected",
        }
    }
}

/// One unit of work in a batch.
///
/// Built by the caller, consumed once by the orchestrator, and handed back
/// with `attempted` and `status` filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    /// Media id.
    pub id: u64,
    /// Direct content URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Protected manifest URL.
    #[serde(default)]
    pub manifest_url: Option<String>,
    /// Destination file path.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Hook metadata.
    #[serde(default, flatten)]
    pub meta: MediaMeta,
    /// Whether a handler was invoked for this item.
    #[serde(skip)]
    pub attempted: bool,
    /// Outcome.
    #[serde(skip)]
    pub status: ItemStatus,
}

impl DownloadItem {
    /// Creates a queued item with no source or destination.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Sets the direct URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the protected manifest URL.
    #[must_use]
    pub fn with_manifest(mut self, manifest_url: impl Into<String>) -> Self {
        self.manifest_url = Some(manifest_url.into());
        self
    }

    /// Sets the destination path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets hook metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: MediaMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Selects the source: a manifest wins over a direct URL; empty strings
    /// count as absent.
    #[must_use]
    pub fn source(&self) -> Option<Source<'_>> {
        fn present(value: &Option<String>) -> Option<&str> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        }
        present(&self.manifest_url)
            .map(Source::Protected)
            .or_else(|| present(&self.url).map(Source::Direct))
    }

    /// Destination path, joined onto `root` when relative.
    #[must_use]
    pub fn destination(&self, root: Option<&Path>) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        match root {
            Some(root) if path.is_relative() => Some(root.join(path)),
            _ => Some(path.clone()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_source_prefers_manifest() {
        let item = DownloadItem::new(1)
            .with_url("https://cdn.example.com/1.mp4")
            .with_manifest("https://cdn.example.com/1.mpd");
        assert_eq!(
            item.source(),
            Some(Source::Protected("https://cdn.example.com/1.mpd"))
        );
    }

    #[test]
    fn test_source_direct_when_no_manifest() {
        let item = DownloadItem::new(1).with_url("https://cdn.example.com/1.jpg");
        let source = item.source().unwrap();
        assert_eq!(source.url(), "https://cdn.example.com/1.jpg");
        assert_eq!(source.download_type(), "normal");
    }

    #[test]
    fn test_blank_references_are_absent() {
        let item = DownloadItem::new(1).with_url("  ").with_manifest("");
        assert_eq!(item.source(), None);
        assert_eq!(DownloadItem::new(2).source(), None);
    }

    #[test]
    fn test_blank_manifest_falls_back_to_trimmed_url() {
        let item = DownloadItem::new(1)
            .with_url(" https://cdn.example.com/1.jpg\n")
            .with_manifest("   ");
        assert_eq!(
            item.source(),
            Some(Source::Direct("https://cdn.example.com/1.jpg"))
        );
    }

    #[test]
    fn test_destination_joins_relative_paths() {
        let item = DownloadItem::new(1).with_path("alice/1.jpg");
        assert_eq!(
            item.destination(Some(Path::new("/data"))),
            Some(PathBuf::from("/data/alice/1.jpg"))
        );
        assert_eq!(item.destination(None), Some(PathBuf::from("alice/1.jpg")));
        assert_eq!(DownloadItem::new(2).destination(Some(Path::new("/data"))), None);
    }

    #[test]
    fn test_item_deserializes_with_flattened_meta() {
        let json = r#"{"id": 9, "url": "https://cdn.example.com/9.jpg", "path": "9.jpg",
                       "username": "bob", "media_type": "photo", "post_id": 3}"#;
        let item: DownloadItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.id, 9);
        assert_eq!(item.meta.username, "bob");
        assert_eq!(item.meta.post_id, Some(3));
        assert_eq!(item.status, ItemStatus::Queued);
        assert!(!item.attempted);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ItemStatus::Queued.is_terminal());
        assert!(ItemStatus::Skipped.is_terminal());
        assert!(ItemStatus::Succeeded.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
    }
}
