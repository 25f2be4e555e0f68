//! Device credential persistence.
//!
//! A [`CredentialStore`] round-trips the opaque credential blob the
//! messaging network hands out for a linked device. Nothing here interprets
//! the blob; it is written and read back byte-for-byte.

mod file;
mod memory;

pub use file::{FileCredentialStore, default_credentials_dir};
pub use memory::MemoryCredentialStore;

/// Errors from credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid credentials: {0}")]
    Invalid(String),
}

/// Credentials of one device identity.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub device_id: String,
    pub blob: Vec<u8>,
}

impl CredentialBundle {
    pub fn new(device_id: impl Into<String>, blob: impl Into<Vec<u8>>) -> Self {
        Self {
            device_id: device_id.into(),
            blob: blob.into(),
        }
    }
}

// Session keys must never end up in logs.
impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("device_id", &self.device_id)
            .field("blob_len", &self.blob.len())
            .finish()
    }
}

/// Load/persist capability for device credentials.
///
/// `save` is called every time the transport reports rotated keys, so
/// implementations should be cheap and must not block for long.
pub trait CredentialStore: Send + Sync + 'static {
    /// Returns the stored bundle, or `None` when the device was never linked.
    fn load(&self) -> Result<Option<CredentialBundle>, StorageError>;

    /// Replaces the stored bundle.
    fn save(&self, bundle: &CredentialBundle) -> Result<(), StorageError>;

    /// Seeds the store from an operator-supplied backup blob.
    fn import_external(&self, blob: &[u8]) -> Result<(), StorageError>;
}
