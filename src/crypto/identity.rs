use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use crypto_box::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use super::key_store::{KeyStore, StoredKeys};
use crate::error::{Result, TorlineError};

const GENERATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A long-lived X25519 keypair.
///
/// Immutable once generated; the only way to change it is full regeneration.
pub struct Identity {
    secret_key: SecretKey,
    public_key: PublicKey,
    generated_at: DateTime<Utc>,
}

impl Identity {
    pub fn generate() -> Self {
        let secret_key = SecretKey::generate(&mut OsRng);
        let public_key = secret_key.public_key();
        Self {
            secret_key,
            public_key,
            generated_at: Utc::now(),
        }
    }

    fn from_stored(keys: &StoredKeys) -> Result<Self> {
        let raw = Zeroizing::new(
            BASE64
                .decode(keys.private_key.as_bytes())
                .map_err(|e| TorlineError::IdentityError(format!("Invalid key base64: {}", e)))?,
        );
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            TorlineError::IdentityError(format!("Invalid private key length: {}", raw.len()))
        })?;
        let secret_key = SecretKey::from(bytes);
        let public_key = secret_key.public_key();
        let generated_at = NaiveDateTime::parse_from_str(&keys.generated_at, GENERATED_AT_FORMAT)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            secret_key,
            public_key,
            generated_at,
        })
    }

    fn to_stored(&self) -> StoredKeys {
        let secret = Zeroizing::new(self.secret_key.to_bytes());
        StoredKeys {
            private_key: BASE64.encode(&*secret),
            public_key: hex::encode(self.public_key.as_bytes()),
            generated_at: self.generated_at.format(GENERATED_AT_FORMAT).to_string(),
        }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.as_bytes())
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }
}

/// Loads, creates and persists the local identity.
pub struct IdentityManager {
    identity: Identity,
    user_id: String,
}

impl IdentityManager {
    /// Load the identity for `user_id`, or create and persist a new one.
    ///
    /// A missing or unparseable key file is not fatal: a fresh identity is
    /// generated and overwrites whatever was on disk.
    pub fn load_or_create(key_store: &KeyStore, user_id: &str) -> Result<Self> {
        let loaded = match key_store.load_identity(user_id) {
            Ok(Some(keys)) => match Identity::from_stored(&keys) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    log::error!("Error loading keys: {}. Generating new ones.", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::error!("Error loading keys: {}. Generating new ones.", e);
                None
            }
        };

        if let Some(identity) = loaded {
            log::info!("Loaded existing identity for user {}", user_id);
            return Ok(Self {
                identity,
                user_id: user_id.to_string(),
            });
        }

        let mgr = Self {
            identity: Identity::generate(),
            user_id: user_id.to_string(),
        };
        mgr.persist(key_store)?;
        log::info!("Created new identity for user {}", user_id);
        Ok(mgr)
    }

    /// Write the identity to the key store in cleartext.
    pub fn persist(&self, key_store: &KeyStore) -> Result<()> {
        key_store.save_identity(&self.user_id, &self.identity.to_stored())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn into_identity(self) -> Identity {
        self.identity
    }

    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}
