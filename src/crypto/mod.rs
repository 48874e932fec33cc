//! # Cryptography Utilities
//!
//! Thin wrappers over the AEAD and KDF primitives used by the call engine:
//! AES-256-GCM for media and signaling payloads, HKDF-SHA256 for deriving
//! signaling keys from a key-agreement secret.

pub mod gcm;
pub mod hkdf;
