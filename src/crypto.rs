//! Token encryption using AES-256-GCM.
//!
//! Ciphertexts are `version || nonce || ciphertext+tag`. The additional
//! authenticated data binds each ciphertext to its connection identity
//! (`tenant|provider|external_id`), so a token copied onto another row fails to
//! decrypt. Decrypted material is returned in [`Zeroizing`] buffers.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::models::connection::Model as ConnectionModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("decrypted token is not valid UTF-8")]
    InvalidUtf8,
}

/// Encryption key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(CryptoKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < MIN_ENCRYPTED_LEN || ciphertext[0] != VERSION_ENCRYPTED {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let sealed = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(nonce, Payload { msg: sealed, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// AAD binding a ciphertext to its connection.
pub fn connection_aad(connection: &ConnectionModel) -> String {
    format!(
        "{}|{}|{}",
        connection.tenant_id, connection.provider_slug, connection.external_id
    )
}

pub fn encrypt_token(
    key: &CryptoKey,
    connection: &ConnectionModel,
    token: &str,
) -> Result<Vec<u8>, CryptoError> {
    encrypt_bytes(key, connection_aad(connection).as_bytes(), token.as_bytes())
}

fn decrypt_token(
    key: &CryptoKey,
    aad: &str,
    ciphertext: &[u8],
) -> Result<Zeroizing<String>, CryptoError> {
    let mut bytes = decrypt_bytes(key, aad.as_bytes(), ciphertext)?;
    let owned = std::mem::take(&mut *bytes);
    match String::from_utf8(owned) {
        Ok(token) => Ok(Zeroizing::new(token)),
        Err(err) => {
            // Wipe the rejected bytes as well.
            let _ = Zeroizing::new(err.into_bytes());
            Err(CryptoError::InvalidUtf8)
        }
    }
}

/// Decrypted token pair of one connection.
pub struct DecryptedTokens {
    pub access_token: Option<Zeroizing<String>>,
    pub refresh_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for DecryptedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedTokens")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub fn decrypt_connection_tokens(
    key: &CryptoKey,
    connection: &ConnectionModel,
) -> Result<DecryptedTokens, CryptoError> {
    let aad = connection_aad(connection);

    let access_token = connection
        .access_token_ciphertext
        .as_deref()
        .map(|ct| decrypt_token(key, &aad, ct))
        .transpose()?;
    let refresh_token = connection
        .refresh_token_ciphertext
        .as_deref()
        .map(|ct| decrypt_token(key, &aad, ct))
        .transpose()?;

    Ok(DecryptedTokens {
        access_token,
        refresh_token,
    })
}
