//! Error types for the repair store.

use mender_types::InvalidTransition;

/// Errors returned by [`RepairStore`](crate::RepairStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// A transform requested a state change the record does not allow.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// The record to modify does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A transform tried to change a record's identity.
    #[error("{kind} {id}: transform changed the record identity")]
    IdentityChanged {
        /// Kind of record.
        kind: &'static str,
        /// Identifier of the record.
        id: String,
    },
}

impl MetaError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
