// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for storage backends.
//!
//! The one classification that matters to callers is *recoverable*: a
//! recoverable error is transient and safe to retry without operator
//! intervention. Callers test the marker with
//! [`StorageError::is_recoverable`], never by matching messages.

use thiserror::Error;

/// Boxed error source carried inside storage errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type using StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by storage factories and resource storages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Transient failure; retrying the same call is expected to succeed
    /// eventually.
    #[error("recoverable storage error: {0}")]
    Recoverable(#[source] BoxError),

    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The backend cannot serve the request as configured
    /// (schema mismatch, unsupported resource shape).
    #[error("storage configuration error: {0}")]
    Configuration(String),

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Internal(#[source] BoxError),
}

impl StorageError {
    /// Wrap an error as recoverable.
    pub fn recoverable(err: impl Into<BoxError>) -> Self {
        Self::Recoverable(err.into())
    }

    /// Wrap an error as an unclassified internal failure.
    pub fn internal(err: impl Into<BoxError>) -> Self {
        Self::Internal(err.into())
    }

    /// Whether this error is explicitly tagged as transient.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}
