//! Authenticated public-key encryption between this identity and one peer.
//!
//! NaCl `crypto_box` (X25519 + XSalsa20-Poly1305). Ciphertext on the wire is
//! hex of `nonce || tag || ciphertext`, the same layout PyNaCl's
//! `Box.encrypt(..., encoder=HexEncoder)` produces.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{PublicKey, SalsaBox};
use rand::rngs::OsRng;
use std::sync::Arc;

use super::identity::Identity;
use crate::error::{Result, TorlineError};

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Encrypts to and decrypts from named peer public keys.
///
/// Holds the identity behind an `Arc`; the keypair is read-only and shared
/// with every worker without locking.
#[derive(Clone)]
pub struct MessageCipher {
    identity: Arc<Identity>,
}

impl MessageCipher {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Seal `plaintext` for the holder of `recipient_public_key` (hex).
    pub fn encrypt(&self, plaintext: &str, recipient_public_key: &str) -> Result<String> {
        let recipient = parse_public_key(recipient_public_key)?;
        let salsa_box = SalsaBox::new(&recipient, self.identity.secret_key());
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = salsa_box
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| TorlineError::CryptoError("Encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    /// Open a hex ciphertext produced by `sender_public_key` (hex).
    pub fn decrypt(&self, ciphertext: &str, sender_public_key: &str) -> Result<String> {
        let sender = parse_public_key(sender_public_key)?;
        let data = hex::decode(ciphertext.trim())
            .map_err(|e| TorlineError::CryptoError(format!("Invalid ciphertext hex: {}", e)))?;
        if data.len() <= NONCE_LEN {
            return Err(TorlineError::CryptoError("Ciphertext too short".into()));
        }
        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let salsa_box = SalsaBox::new(&sender, self.identity.secret_key());
        let plaintext = salsa_box
            .decrypt(GenericArray::from_slice(nonce_bytes), sealed)
            .map_err(|_| TorlineError::CryptoError("Decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| TorlineError::CryptoError(format!("Plaintext is not UTF-8: {}", e)))
    }
}

/// Parse a hex-encoded 32-byte X25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| TorlineError::CryptoError(format!("Invalid public key hex: {}", e)))?;
    let bytes: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        TorlineError::CryptoError(format!("Invalid public key length: {}", bytes.len()))
    })?;
    Ok(PublicKey::from(bytes))
}
