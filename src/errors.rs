//! Error Types
//!
//! This module defines the error types used throughout the crate.
//!
//! # Overview
//!
//! The main error type [`EmberError`] covers the recoverable failure modes:
//! - Host allocation failures while growing pools or building blobs
//! - Exhaustion of fixed-size GPU descriptor partitions
//! - Archive name collisions, oversized archive fields and malformed blobs
//! - Native backend failures reported through the capability traits
//!
//! Violated preconditions (double free, freeing a foreign allocation, an
//! input-layout slot with no bound buffer) are **not** represented here.
//! They are programming errors and panic; see the `# Panics` sections of
//! the respective operations.
//!
//! # Usage
//!
//! All fallible public APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, EmberError>`.
//!
//! ```rust,ignore
//! use ember::errors::{EmberError, Result};
//!
//! fn grow() -> Result<()> {
//!     Err(EmberError::OutOfHostMemory { context: "descriptor pool" })
//! }
//! ```

use thiserror::Error;

use crate::archive::ResourceKind;
use crate::backend::BackendType;

/// The main error type for the crate.
#[derive(Error, Debug)]
pub enum EmberError {
    // ========================================================================
    // Allocation Errors
    // ========================================================================
    /// The host ran out of memory while growing an internal structure.
    #[error("Out of host memory while allocating {context}")]
    OutOfHostMemory {
        /// What was being allocated
        context: &'static str,
    },

    /// A fixed-size shader-visible descriptor partition has no room left.
    #[error("{partition} partition of the {heap} GPU descriptor heap is exhausted ({requested} slots requested)")]
    DescriptorHeapExhausted {
        /// Heap kind name
        heap: &'static str,
        /// `"static"` or `"dynamic"`
        partition: &'static str,
        /// Number of slots that could not be satisfied
        requested: u32,
    },

    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// The native backend failed to create or reset an object.
    #[error("{backend:?} backend failed to {operation}: {reason}")]
    Backend {
        /// Backend that reported the failure
        backend: BackendType,
        /// Operation that failed
        operation: &'static str,
        /// Backend-provided reason
        reason: String,
    },

    // ========================================================================
    // Archive Errors
    // ========================================================================
    /// A different object is already registered under the same kind and name.
    #[error("{kind:?} with name '{name}' is already present in the archive with different content")]
    NameCollision {
        /// Object kind
        kind: ResourceKind,
        /// Colliding name
        name: String,
    },

    /// A field of an archived object does not fit the blob's u32 length prefix.
    #[error("Archive field '{field}' of '{object}' is {len} bytes, over the u32 length limit")]
    ArchiveFieldTooLarge {
        /// Name of the object holding the field
        object: String,
        /// Which field overflowed
        field: &'static str,
        /// Actual length
        len: usize,
    },

    /// The blob handed to the archive reader is not a valid archive.
    #[error("Malformed archive: {0}")]
    MalformedArchive(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Device settings failed validation.
    #[error("Invalid device settings: {0}")]
    InvalidSettings(String),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    // ========================================================================
    // I/O Errors
    // ========================================================================
    /// Stream I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Alias for `Result<T, EmberError>`.
pub type Result<T> = std::result::Result<T, EmberError>;
