use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TorlineError};

/// On-disk representation of an identity keypair.
///
/// The private key is stored base64-encoded and the public key hex-encoded.
/// The file is NOT passphrase protected; anyone with read access to the data
/// directory can impersonate the user.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredKeys {
    pub private_key: String,
    pub public_key: String,
    pub generated_at: String,
}

impl std::fmt::Debug for StoredKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKeys")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("generated_at", &self.generated_at)
            .finish()
    }
}

/// Manages identity key files on disk.
///
/// Layout:
///   {base}/{user_id}_keys.json   – keypair for one logical user (mode 0600)
pub struct KeyStore {
    base_dir: PathBuf,
}

impl KeyStore {
    /// Initialise the key store, creating the base directory if absent.
    pub fn new(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|e| TorlineError::IdentityError(format!("create key dir: {}", e)))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Key file path, derived deterministically from the user id.
    pub fn key_path(&self, user_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}_keys.json", sanitize_file_stem(user_id)))
    }

    pub fn save_identity(&self, user_id: &str, keys: &StoredKeys) -> Result<()> {
        let path = self.key_path(user_id);
        let json = serde_json::to_string(keys)
            .map_err(|e| TorlineError::IdentityError(format!("serialize keys: {}", e)))?;
        fs::write(&path, json)
            .map_err(|e| TorlineError::IdentityError(format!("write key file: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .map_err(|e| TorlineError::IdentityError(format!("chmod key file: {}", e)))?;
        }
        log::info!("Keys saved to {:?}", path);
        Ok(())
    }

    /// Load the stored keys for a user.
    ///
    /// Returns `Ok(None)` when no key file exists and an error when the file
    /// exists but cannot be read or parsed.
    pub fn load_identity(&self, user_id: &str) -> Result<Option<StoredKeys>> {
        let path = self.key_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| TorlineError::IdentityError(format!("read key file: {}", e)))?;
        let keys = serde_json::from_str(&data)
            .map_err(|e| TorlineError::IdentityError(format!("parse key file: {}", e)))?;
        Ok(Some(keys))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Keep user ids from escaping the key directory.
fn sanitize_file_stem(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}
