//! Error types for the live inventory view
//!
//! Comprehensive error taxonomy using thiserror. Only `ViewError` reaches
//! callers as a user-visible failure; feed and profile errors are absorbed
//! into state (stale flag, employee fallback) wherever possible.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error surfaced to view consumers
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewError {
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Feed unavailable after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Errors reported by the feed collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl FeedError {
    /// Whether the failure may clear up by resubscribing.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Transport(_))
    }
}

/// Errors reported by the profile collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Permission denied reading profile {uid}")]
    PermissionDenied { uid: String },

    #[error("Profile store unavailable: {0}")]
    Unavailable(String),
}

/// Errors building a snapshot from a raw backend document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot {id}: document is not an object")]
    NotAnObject { id: String },

    #[error("Snapshot {id}: missing timestamp")]
    MissingTimestamp { id: String },

    #[error("Snapshot {id}: timestamp is neither an integer nor a string")]
    InvalidTimestamp { id: String },
}
