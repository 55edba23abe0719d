//! Error Types
//!
//! This module defines the error types used throughout the synchronisation core.
//!
//! # Overview
//!
//! The main error type [`SyncError`] covers every per-placement failure mode:
//! - Evaluation failures reported by the host for a single placement
//! - Recognised-but-unsupported configurations
//! - Commands that outlived their target placement
//! - Structural identity violations (id collisions)
//! - Geometry construction failures
//!
//! # Propagation
//!
//! Only [`SyncError::IdCollision`] ever leaves a cycle driver; every other
//! variant is caught at the placement that produced it, logged, and the cycle
//! continues without that placement.
//!
//! ```rust,ignore
//! use mirror_sync::errors::{Result, SyncError};
//!
//! fn evaluate() -> Result<()> {
//!     Err(SyncError::transient(id, "modifier stack failed"))
//! }
//! ```

use thiserror::Error;

use crate::identity::{GeometryId, StableHandle};

/// The main error type for the synchronisation core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    // ========================================================================
    // Per-placement Errors (recoverable, placement skipped)
    // ========================================================================
    /// Evaluating a placement's backing object failed for this cycle.
    #[error("Evaluation of {id} failed: {reason}")]
    TransientEvaluation {
        /// The placement that failed to evaluate
        id: StableHandle,
        /// Host-provided description of the failure
        reason: String,
    },

    /// The placement uses a recognised configuration the renderer cannot express.
    #[error("Unsupported configuration on {id}: {cause}")]
    UnsupportedConfiguration {
        /// The placement that was omitted
        id: StableHandle,
        /// Stable description of the cause, used to de-duplicate warnings
        cause: String,
    },

    /// A queued command targets a placement that no longer resolves.
    #[error("Stale reference to {id}")]
    StaleReference {
        /// The vanished placement
        id: StableHandle,
    },

    // ========================================================================
    // Geometry Construction Errors
    // ========================================================================
    /// The external geometry builder rejected a group.
    #[error("Failed to build geometry {geometry}: {reason}")]
    Build {
        /// The geometry that could not be constructed
        geometry: GeometryId,
        /// Builder-provided description of the failure
        reason: String,
    },

    // ========================================================================
    // Configuration Errors (abort the cycle before mutation)
    // ========================================================================
    /// Two distinct placements resolved to the same stable id.
    #[error("Stable id collision on {id}")]
    IdCollision {
        /// The id claimed by more than one placement
        id: StableHandle,
    },
}

impl SyncError {
    /// Shorthand for [`SyncError::TransientEvaluation`].
    pub fn transient(id: StableHandle, reason: impl Into<String>) -> Self {
        Self::TransientEvaluation {
            id,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SyncError::UnsupportedConfiguration`].
    pub fn unsupported(id: StableHandle, cause: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            id,
            cause: cause.into(),
        }
    }

    /// Returns `true` if this error aborts a whole cycle rather than one placement.
    #[inline]
    #[must_use]
    pub fn is_fatal_for_cycle(&self) -> bool {
        matches!(self, Self::IdCollision { .. })
    }
}

/// Alias for `Result<T, SyncError>`.
pub type Result<T> = std::result::Result<T, SyncError>;
