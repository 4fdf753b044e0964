//! Engine error taxonomy.
//!
//! Every public operation returns [`Result`]. Storage and CRC problems are
//! recovered locally where that is safe (log truncation, single retry);
//! everything else surfaces to the caller with a typed reason.

use crate::registry::NodeId;

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Node id is not part of the innate registry
    #[error("unknown node {id} ({role}); node must be registered in the innate registry")]
    UnknownNode {
        /// The offending id
        id: NodeId,
        /// Which argument carried it, e.g. `"sender"`
        role: &'static str,
    },

    /// Disk read/write failure. The engine marks itself degraded; reads may
    /// still be served from cache.
    #[error("storage I/O failure: {context}")]
    StorageIo {
        /// What the engine was doing when the failure happened
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// CRC mismatch in the delta log. Recovered locally by truncating the
    /// log at the first bad record; surfaced only when truncation itself fails.
    #[error("corrupt delta record at offset {offset}")]
    CorruptRecord {
        /// Byte offset of the first bad record
        offset: u64,
    },

    /// Async operation against a runtime that was never started
    #[error("async runtime is not started; call start_async_runtime first")]
    RuntimeNotStarted,

    /// Async operation against a runtime that has been stopped
    #[error("async runtime has been stopped")]
    RuntimeStopped,

    /// Stimulus refused under `drop` guard mode
    #[error("ingress queue full; stimulus for node {id} refused")]
    QueueFull {
        /// The refused node
        id: NodeId,
    },

    /// Registry migration would evict an explicitly pinned node; the
    /// migration is aborted and the old state retained.
    #[error("registry migration conflict: pinned node {id} absent from new registry")]
    MigrationConflict {
        /// The pinned node the new registry no longer contains
        id: NodeId,
    },

    /// `consolidate()` requested while a consolidation is already running
    #[error("consolidation already in progress")]
    ConsolidateBusy,

    /// Non-finite or out-of-range numeric input rejected at an API boundary
    #[error("invalid value for {what}: {value}")]
    InvalidValue {
        /// Which parameter was rejected
        what: &'static str,
        /// Offending value, rendered for the message
        value: f64,
    },
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::StorageIo {
            context: context.into(),
            source,
        }
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Reject NaN / infinities at the API boundary.
pub(crate) fn check_finite(what: &'static str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::InvalidValue {
            what,
            value: value as f64,
        })
    }
}
