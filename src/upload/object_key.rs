//! Date-partitioned storage keys.
//!
//! Keys have the shape `YYYY/MMDD/<filename>`, where the date is taken in a
//! fixed UTC offset (UTC+9 unless configured otherwise).

use chrono::{DateTime, FixedOffset, Offset, Utc};
use thiserror::Error;

use crate::config::ObjectKeyConfig;

/// Longest filename accepted, in bytes.
pub const MAX_FILENAME_BYTES: usize = 1024;

/// A filename that cannot become the last segment of a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidFilename {
    /// Empty string.
    #[error("filename is empty")]
    Empty,
    /// Longer than [`MAX_FILENAME_BYTES`].
    #[error("filename exceeds {MAX_FILENAME_BYTES} bytes")]
    TooLong,
    /// Contains `/` or `\`.
    #[error("filename must not contain path separators")]
    PathSeparator,
    /// `.`, or contains `..`.
    #[error("filename must not contain relative path components")]
    Traversal,
    /// Contains a control character.
    #[error("filename must not contain control characters")]
    ControlCharacter,
}

/// Builds storage keys in a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct ObjectKeyBuilder {
    offset: FixedOffset,
}

impl Default for ObjectKeyBuilder {
    fn default() -> Self {
        Self::from_config(&ObjectKeyConfig::default())
    }
}

impl ObjectKeyBuilder {
    /// Builder partitioning by dates in `offset`.
    #[must_use]
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Builder from configuration. Out-of-range offsets fall back to UTC;
    /// [`Config::validate`](crate::config::Config::validate) rejects them first.
    #[must_use]
    pub fn from_config(config: &ObjectKeyConfig) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).unwrap_or(Utc.fix());
        Self::new(offset)
    }

    /// The partitioning offset.
    #[must_use]
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// `YYYY/MMDD/<filename>` for `now`, converted to this builder's offset.
    pub fn build_key(&self, filename: &str, now: DateTime<Utc>) -> Result<String, InvalidFilename> {
        validate_filename(filename)?;
        let local = now.with_timezone(&self.offset);
        Ok(format!("{}/{}", local.format("%Y/%m%d"), filename))
    }
}

/// Check that `filename` is a single, plain path segment.
pub fn validate_filename(filename: &str) -> Result<(), InvalidFilename> {
    if filename.is_empty() {
        return Err(InvalidFilename::Empty);
    }
    if filename.len() > MAX_FILENAME_BYTES {
        return Err(InvalidFilename::TooLong);
    }
    if filename.contains(['/', '\\']) {
        return Err(InvalidFilename::PathSeparator);
    }
    if filename == "." || filename.contains("..") {
        return Err(InvalidFilename::Traversal);
    }
    if filename.chars().any(char::is_control) {
        return Err(InvalidFilename::ControlCharacter);
    }
    Ok(())
}
