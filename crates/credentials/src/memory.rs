use std::sync::RwLock;

use crate::{CredentialBundle, CredentialStore, StorageError};

/// Process-local store. Forgets everything on restart.
pub struct MemoryCredentialStore {
    device_id: String,
    bundle: RwLock<Option<CredentialBundle>>,
}

impl MemoryCredentialStore {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            bundle: RwLock::new(None),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<CredentialBundle>, StorageError> {
        let guard = self
            .bundle
            .read()
            .map_err(|_| StorageError::Invalid("store poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, bundle: &CredentialBundle) -> Result<(), StorageError> {
        let mut guard = self
            .bundle
            .write()
            .map_err(|_| StorageError::Invalid("store poisoned".into()))?;
        *guard = Some(bundle.clone());
        Ok(())
    }

    fn import_external(&self, blob: &[u8]) -> Result<(), StorageError> {
        if blob.is_empty() {
            return Err(StorageError::Invalid("empty credentials backup".into()));
        }
        self.save(&CredentialBundle::new(self.device_id.clone(), blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_loads_none() {
        let store = MemoryCredentialStore::new("dev-1");
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let store = MemoryCredentialStore::new("dev-1");
        let bundle = CredentialBundle::new("dev-1", vec![1, 2, 3]);
        store.save(&bundle).unwrap();
        assert_eq!(store.load().unwrap(), Some(bundle));
    }

    #[test]
    fn import_uses_store_identity() {
        let store = MemoryCredentialStore::new("dev-9");
        store.import_external(b"{\"noiseKey\":1}").unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.device_id, "dev-9");
        assert_eq!(loaded.blob, b"{\"noiseKey\":1}");
    }

    #[test]
    fn import_rejects_empty_blob() {
        let store = MemoryCredentialStore::new("dev-1");
        assert!(matches!(
            store.import_external(&[]),
            Err(StorageError::Invalid(_))
        ));
    }
}
