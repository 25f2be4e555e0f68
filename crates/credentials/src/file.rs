use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{CredentialBundle, CredentialStore, StorageError};

/// File name of the credential blob inside a device directory.
const CREDS_FILE: &str = "creds.json";

/// Credential store backed by one directory per device identity.
///
/// Layout: `<root>/<device_id>/creds.json`, holding the raw blob.
pub struct FileCredentialStore {
    root: PathBuf,
    device_id: String,
}

impl FileCredentialStore {
    /// Creates a store for `device_id` under `root`. Nothing touches the
    /// disk until the first load or save.
    pub fn new(root: impl Into<PathBuf>, device_id: impl Into<String>) -> Result<Self, StorageError> {
        let device_id = device_id.into();
        validate_device_id(&device_id)?;
        Ok(Self {
            root: root.into(),
            device_id,
        })
    }

    /// Path of the credential blob for this device.
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.device_id).join(CREDS_FILE)
    }

    fn write_blob(&self, blob: &[u8]) -> Result<(), StorageError> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to a sibling, then rename over the target.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, blob)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), bytes = blob.len(), "persisted credentials");
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<CredentialBundle>, StorageError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let blob = std::fs::read(&path)?;
        if blob.is_empty() {
            return Ok(None);
        }
        debug!(path = %path.display(), bytes = blob.len(), "loaded credentials");
        Ok(Some(CredentialBundle::new(self.device_id.clone(), blob)))
    }

    fn save(&self, bundle: &CredentialBundle) -> Result<(), StorageError> {
        if bundle.device_id != self.device_id {
            return Err(StorageError::Invalid(format!(
                "bundle for device {} cannot be stored as {}",
                bundle.device_id, self.device_id
            )));
        }
        self.write_blob(&bundle.blob)
    }

    fn import_external(&self, blob: &[u8]) -> Result<(), StorageError> {
        if blob.is_empty() {
            return Err(StorageError::Invalid("empty credentials backup".into()));
        }
        self.write_blob(blob)
    }
}

/// Device identities become directory names; keep them to one safe segment.
fn validate_device_id(device_id: &str) -> Result<(), StorageError> {
    let ok = !device_id.is_empty()
        && device_id != "."
        && device_id != ".."
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StorageError::Invalid(format!("bad device id: {device_id:?}")))
    }
}

/// Returns the default credentials directory.
pub fn default_credentials_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("herald").join("auth"))
}

/// Returns the platform-specific data directory.
fn data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| Path::new(&h).join(".local").join("share"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| Path::new(&h).join(".config"))
    }
}
