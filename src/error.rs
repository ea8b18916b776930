//! Error types for the tag index.

use crate::types::TagId;
use thiserror::Error;

/// Main error type for tag index operations.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write against the tag repository failed.
    #[error("Repository failure: {0}")]
    Repository(String),

    #[error("Tag not found: {0}")]
    TagNotFound(TagId),

    /// Every id up to `u64::MAX` has been handed out.
    #[error("Tag ids exhausted")]
    IdsExhausted,

    /// Another tag already uses this url.
    #[error("Tag url already in use: {0}")]
    DuplicateUrl(String),

    #[error("Parent tag not found: {0}")]
    ParentNotFound(TagId),

    /// Rejected at write time: attaching `id` under `parent` would close a loop.
    #[error("Setting parent of {id} to {parent} would create a cycle")]
    WouldCreateCycle { id: TagId, parent: TagId },

    /// An ancestor walk exceeded the configured depth bound.
    #[error("Cycle detected at tag {id} after {depth} ancestors")]
    CycleDetected { id: TagId, depth: usize },

    /// A recompute callback failed. Only ever logged by the registry.
    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Invalidation registry is shut down")]
    RegistryClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("Repository is locked by another process")]
    Locked,

    #[error("Repository not initialized")]
    NotInitialized,
}

impl TagError {
    /// Whether this error means the tree structure may be inconsistent and the
    /// whole mutation should be retried or escalated.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            TagError::Callback(_) | TagError::RegistryClosed
        )
    }
}

impl From<serde_json::Error> for TagError {
    fn from(e: serde_json::Error) -> Self {
        TagError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TagError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TagError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TagError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TagError::Deserialization(e.to_string())
    }
}

/// Result type for tag index operations.
pub type Result<T> = std::result::Result<T, TagError>;
