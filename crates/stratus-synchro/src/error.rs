// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the synchronizer engine.
//!
//! Construction errors come in two flavors: *retryable* ones (the caller
//! should reschedule the whole construction, e.g. storage not reachable
//! yet) and plain ones (the caller should abandon). The flavor is tested
//! with [`SynchroError::is_retryable`], never by message.

use thiserror::Error;

use stratus_storage::StorageError;

/// Boxed error source carried inside synchro errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type using SynchroError.
pub type Result<T> = std::result::Result<T, SynchroError>;

/// Errors surfaced by the synchronizer engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SynchroError {
    /// Transient construction failure; the caller should reschedule.
    #[error("retryable: {0}")]
    Retryable(#[source] BoxError),

    /// The upstream connector could not produce a collaborator.
    #[error("cluster connector error: {0}")]
    Connector(#[source] BoxError),

    /// A per-resource synchro could not be constructed.
    #[error("failed to create resource synchro for {resource}: {reason}")]
    SynchroCreate {
        /// The sync resource that failed.
        resource: String,
        /// Why construction failed.
        reason: String,
    },

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SynchroError {
    /// Wrap an error as retryable.
    pub fn retryable(err: impl Into<BoxError>) -> Self {
        Self::Retryable(err.into())
    }

    /// Whether the caller should reschedule instead of abandoning.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
