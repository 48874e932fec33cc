use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use thiserror::Error;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum GcmError {
    #[error("Invalid key or nonce size for AES-GCM")]
    InvalidSize,
    #[error("AES-GCM cipher operation failed")]
    CipherError,
}

type Result<T> = std::result::Result<T, GcmError>;

/// Prepares an AES-256-GCM cipher instance from a secret key.
pub fn prepare(secret_key: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(secret_key).map_err(|_| GcmError::InvalidSize)
}

/// Encrypts with an already prepared cipher. Output is `ciphertext ‖ tag`.
pub fn seal(
    cipher: &Aes256Gcm,
    iv: &[u8; NONCE_LEN],
    plaintext: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>> {
    let nonce = aes_gcm::Nonce::from_slice(iv);
    let payload = Payload {
        msg: plaintext,
        aad: additional_data,
    };
    cipher
        .encrypt(nonce, payload)
        .map_err(|_| GcmError::CipherError)
}

/// Decrypts `ciphertext ‖ tag` with an already prepared cipher.
pub fn open(
    cipher: &Aes256Gcm,
    iv: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(GcmError::InvalidSize);
    }
    let nonce = aes_gcm::Nonce::from_slice(iv);
    let payload = Payload {
        msg: ciphertext,
        aad: additional_data,
    };
    cipher
        .decrypt(nonce, payload)
        .map_err(|_| GcmError::CipherError)
}

/// Encrypts plaintext using AES-256-GCM.
pub fn encrypt(
    secret_key: &[u8],
    iv: &[u8; NONCE_LEN],
    plaintext: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = prepare(secret_key)?;
    seal(&cipher, iv, plaintext, additional_data)
}

/// Decrypts ciphertext using AES-256-GCM.
pub fn decrypt(
    secret_key: &[u8],
    iv: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = prepare(secret_key)?;
    open(&cipher, iv, ciphertext, additional_data)
}
