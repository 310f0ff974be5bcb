// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error taxonomy for the archiver.
///
/// `NotFound` and `Transient` drive control flow: the fetch loop retries
/// `Transient` forever and treats `NotFound` as a per-item terminal state.
/// Everything else aborts the current item only, never the batch.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The post or author is gone upstream (deleted or made private).
    /// Carries the upstream human-readable reason and the URL attempted so
    /// callers can distinguish "gone" from a transient failure.
    #[error("not found: {reason} (url: {url})")]
    NotFound { reason: String, url: String },

    /// An invariant check failed: unexpected field shape, disagreeing
    /// duplicate sources, photo-count mismatch. The item is skipped, never
    /// silently coerced.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Rate limit or network hiccup. Retried indefinitely with backoff,
    /// never surfaced as terminal.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// A field that must be present is missing (e.g. no playable video URL
    /// on a video post). A visible gap beats a silent partial record.
    #[error("partial data: {0}")]
    PartialData(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("database pool error: {0}")]
    Pool(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

impl ArchiveError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ArchiveError::Validation(msg.into())
    }

    /// Whether the fetch loop should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArchiveError::Transient(_))
            || matches!(self, ArchiveError::Http(e) if e.is_timeout() || e.is_connect())
    }
}
