//! At-rest encryption of target credentials.
//!
//! Secrets are stored as `iv_hex:ciphertext_hex` using AES-256-CBC with a
//! random IV per record.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Cipher error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("decryption failed")]
    Decrypt,
}

/// Symmetric cipher for credentials held in the target registry.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn new(key: &str) -> Result<Self, CryptoError> {
        let bytes = key.as_bytes();
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext`. Empty input is returned unchanged.
    pub fn encrypt(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    /// Decrypt a stored value.
    ///
    /// Values that were never encrypted (legacy plaintext rows, or rows
    /// written under a different key) come back unchanged.
    pub fn decrypt(&self, stored: &str) -> String {
        if stored.is_empty() {
            return String::new();
        }

        match self.try_decrypt(stored) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::debug!("Secret is not decryptable ({}), using it verbatim", e);
                stored.to_string()
            }
        }
    }

    fn try_decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let (iv_hex, body_hex) = stored
            .split_once(':')
            .ok_or_else(|| CryptoError::Malformed("missing iv separator".to_string()))?;

        let iv: [u8; IV_LEN] = hex::decode(iv_hex)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::Malformed("iv must be 16 bytes".to_string()))?;
        let body = hex::decode(body_hex).map_err(|e| CryptoError::Malformed(e.to_string()))?;

        let plain = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&body)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)
    }
}
