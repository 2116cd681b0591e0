//! Constants for the download module (worker pool, temporary files).

/// Default number of concurrent download workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default suffix of the resumable temporary sibling file.
pub const DEFAULT_TEMP_SUFFIX: &str = "part";

/// Placeholder replaced by the media id in license URL templates.
pub const MEDIA_ID_PLACEHOLDER: &str = "{media_id}";
