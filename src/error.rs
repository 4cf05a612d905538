//! Caller-visible error taxonomy.

use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or initialized.
    #[error("backend connection failed: {0}")]
    Connection(String),

    /// An operation against a connected backend failed.
    #[error("backend operation failed: {0}")]
    Backend(String),

    /// A value could not be encoded or decoded at the contract
    /// boundary.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the public service operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    /// Rejected coordinates, empty agent id, or an invalid zone.
    /// Nothing was persisted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A public operation was called before `initialize` or after
    /// `shutdown`.
    #[error("service is not initialized")]
    NotInitialized,

    /// The storage driver reported a failure; partial effects may have
    /// occurred.
    #[error(transparent)]
    Backend(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_convert_transparently() {
        let storage = StorageError::Backend("bucket missing".to_string());
        let beacon: BeaconError = storage.into();
        assert_eq!(beacon.to_string(), "backend operation failed: bucket missing");
    }

    #[test]
    fn invalid_input_names_the_offender() {
        let err = BeaconError::InvalidInput("latitude 91 out of range".to_string());
        assert!(err.to_string().contains("latitude 91"));
    }
}
