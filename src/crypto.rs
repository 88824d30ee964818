//! Envelope encryption for bundle file payloads.
//!
//! Every file gets a fresh 256-bit data encryption key (DEK). The payload is
//! sealed under the DEK with AES-256-GCM, and the DEK is sealed under the
//! scope's master key with an independent nonce. Both opens fail closed.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{VaultError, VaultResult};
use crate::models::Scope;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// 96-bit GCM nonce.
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("nonce must be 12 bytes, got {0}")]
    InvalidNonceLength(usize),
    #[error("master key is not valid base64")]
    InvalidEncoding,
    #[error("random source unavailable")]
    Rng,
    #[error("seal failed")]
    Seal,
    #[error("authentication tag mismatch")]
    Authentication,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(raw.len()))?;
        Ok(Self { bytes })
    }

    /// Accepts standard base64, falling back to the unpadded alphabet.
    pub fn from_base64(raw: &str) -> Result<Self, CryptoError> {
        let trimmed = raw.trim();
        let decoded = Zeroizing::new(
            STANDARD
                .decode(trimmed)
                .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
                .map_err(|_| CryptoError::InvalidEncoding)?,
        );
        Self::from_bytes(&decoded)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Master keys available to this process: optional per-workspace keys with a default fallback.
#[derive(Clone, Default)]
pub struct Keyring {
    default_key: Option<MasterKey>,
    workspace_keys: HashMap<String, MasterKey>,
}

impl Keyring {
    pub fn new(default_key: Option<MasterKey>, workspace_keys: HashMap<String, MasterKey>) -> Self {
        Self {
            default_key,
            workspace_keys,
        }
    }

    pub fn single(key: MasterKey) -> Self {
        Self::new(Some(key), HashMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.default_key.is_none() && self.workspace_keys.is_empty()
    }

    pub fn key_for(&self, scope: &Scope) -> VaultResult<&MasterKey> {
        self.workspace_keys
            .get(&scope.workspace_id)
            .or(self.default_key.as_ref())
            .ok_or_else(|| {
                VaultError::FailedPrecondition("no master key configured for scope".into())
            })
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut workspaces: Vec<&String> = self.workspace_keys.keys().collect();
        workspaces.sort();
        f.debug_struct("Keyring")
            .field("has_default_key", &self.default_key.is_some())
            .field("workspaces", &workspaces)
            .finish()
    }
}

/// Persisted form of one encrypted file.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub ciphertext_nonce: Vec<u8>,
    pub wrapped_dek: Vec<u8>,
    pub dek_nonce: Vec<u8>,
    /// Hex SHA-256 of the plaintext; bookkeeping only, the GCM tag is the integrity check.
    pub checksum: String,
    pub byte_length: i64,
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("wrapped_dek_len", &self.wrapped_dek.len())
            .field("byte_length", &self.byte_length)
            .finish()
    }
}

pub fn encrypt(master_key: &MasterKey, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng
        .try_fill_bytes(&mut dek[..])
        .map_err(|_| CryptoError::Rng)?;

    let (ciphertext, ciphertext_nonce) = seal(&dek[..], plaintext)?;
    let (wrapped_dek, dek_nonce) = seal(master_key.as_bytes(), &dek[..])?;

    Ok(EncryptedPayload {
        ciphertext,
        ciphertext_nonce: ciphertext_nonce.to_vec(),
        wrapped_dek,
        dek_nonce: dek_nonce.to_vec(),
        checksum: checksum(plaintext),
        byte_length: plaintext.len() as i64,
    })
}

pub fn decrypt(master_key: &MasterKey, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
    let dek = Zeroizing::new(open(
        master_key.as_bytes(),
        &payload.dek_nonce,
        &payload.wrapped_dek,
    )?);
    if dek.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength(dek.len()));
    }
    open(&dek, &payload.ciphertext_nonce, &payload.ciphertext)
}

pub fn checksum(plaintext: &[u8]) -> String {
    hex::encode(Sha256::digest(plaintext))
}

fn seal(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::Rng)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;
    Ok((sealed, nonce))
}

fn open(key: &[u8], nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_bytes(&[byte; KEY_SIZE]).unwrap()
    }

    #[test]
    fn round_trips_plaintext() {
        let master = key(7);
        for plaintext in [&b""[..], &b"API_KEY=secret\n"[..], &[0u8, 159, 255, 10][..]] {
            let payload = encrypt(&master, plaintext).unwrap();
            assert_eq!(decrypt(&master, &payload).unwrap(), plaintext);
            assert_eq!(payload.byte_length, plaintext.len() as i64);
            assert_eq!(payload.checksum, checksum(plaintext));
        }
    }

    #[test]
    fn every_encryption_uses_fresh_key_material() {
        let master = key(1);
        let first = encrypt(&master, b"TOKEN=abc").unwrap();
        let second = encrypt(&master, b"TOKEN=abc").unwrap();
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(first.ciphertext_nonce, second.ciphertext_nonce);
        assert_ne!(first.wrapped_dek, second.wrapped_dek);
        assert_ne!(first.ciphertext_nonce, first.dek_nonce);
        assert_eq!(first.checksum, second.checksum);
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let plaintext = b"API_KEY=secret\n";
        let payload = encrypt(&key(3), plaintext).unwrap();
        assert_ne!(payload.ciphertext.as_slice(), plaintext.as_slice());
        assert!(!payload
            .ciphertext
            .windows(plaintext.len())
            .any(|window| window == plaintext));
    }

    #[test]
    fn wrong_master_key_fails_closed() {
        let payload = encrypt(&key(1), b"A=1").unwrap();
        assert_eq!(
            decrypt(&key(2), &payload).unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn tampering_fails_closed() {
        let master = key(9);
        let payload = encrypt(&master, b"DB_PASSWORD=hunter2").unwrap();

        let mut flipped = payload.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert_eq!(
            decrypt(&master, &flipped).unwrap_err(),
            CryptoError::Authentication
        );

        let mut flipped = payload.clone();
        flipped.wrapped_dek[0] ^= 0x01;
        assert_eq!(
            decrypt(&master, &flipped).unwrap_err(),
            CryptoError::Authentication
        );

        let mut truncated = payload;
        truncated.dek_nonce.pop();
        assert_eq!(
            decrypt(&master, &truncated).unwrap_err(),
            CryptoError::InvalidNonceLength(NONCE_SIZE - 1)
        );
    }

    #[test]
    fn master_key_parsing() {
        let padded = STANDARD.encode([5u8; KEY_SIZE]);
        let unpadded = STANDARD_NO_PAD.encode([5u8; KEY_SIZE]);
        assert!(padded.ends_with('='));
        assert!(MasterKey::from_base64(&padded).is_ok());
        assert!(MasterKey::from_base64(&unpadded).is_ok());
        assert_eq!(
            MasterKey::from_base64(&STANDARD.encode([5u8; 16])).unwrap_err(),
            CryptoError::InvalidKeyLength(16)
        );
        assert_eq!(
            MasterKey::from_base64("not base64!").unwrap_err(),
            CryptoError::InvalidEncoding
        );
        assert_eq!(format!("{:?}", key(1)), "MasterKey(<redacted>)");
    }

    #[test]
    fn keyring_prefers_workspace_key() {
        let mut workspace_keys = HashMap::new();
        workspace_keys.insert("ws-special".to_string(), key(2));
        let keyring = Keyring::new(Some(key(1)), workspace_keys);

        let payload = encrypt(
            keyring.key_for(&Scope::new("ws-special", "p", "e")).unwrap(),
            b"X=1",
        )
        .unwrap();
        assert!(decrypt(&key(2), &payload).is_ok());
        assert!(decrypt(
            keyring.key_for(&Scope::new("other", "p", "e")).unwrap(),
            &payload
        )
        .is_err());

        let empty = Keyring::default();
        assert!(empty.is_empty());
        assert!(matches!(
            empty.key_for(&Scope::new("ws", "p", "e")),
            Err(VaultError::FailedPrecondition(_))
        ));
    }
}
