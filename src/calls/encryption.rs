//! Call key material and signaling-channel encryption.
//!
//! Two independent keys protect a call:
//!
//! 1. A per-call [`SessionKeyMaterial`] (256-bit key + 4-byte salt) generated by
//!    the caller and carried inside the call-request. It protects media and is
//!    zeroed when the call ends.
//! 2. A per-peer [`SignalingKey`] supplied by a [`KeyAgreement`] collaborator.
//!    It protects the signaling envelope that carries the session key.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::CallError;
use super::media::packet::PacketType;
use super::signaling::SignalingError;
use super::types::PeerRef;
use crate::crypto::{gcm, hkdf};

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;
/// Nonce salt length in bytes.
pub const SALT_LEN: usize = 4;

/// HKDF info string for signaling keys.
const SIGNALING_KDF_INFO: &[u8] = b"call-signaling-v1";

/// Per-call media key and nonce salt.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    key: [u8; SESSION_KEY_LEN],
    salt: [u8; SALT_LEN],
}

impl SessionKeyMaterial {
    /// Generate fresh random key material for a new call.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut key = [0u8; SESSION_KEY_LEN];
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut salt);
        Self { key, salt }
    }

    pub fn from_parts(key: [u8; SESSION_KEY_LEN], salt: [u8; SALT_LEN]) -> Self {
        Self { key, salt }
    }

    pub fn key(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("key", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

/// Symmetric key protecting the signaling envelope for one peer.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SignalingKey([u8; SESSION_KEY_LEN]);

impl SignalingKey {
    pub fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Wrap a signaling packet: `[0x10][12-byte random nonce][ciphertext ‖ tag]`.
    ///
    /// The tag byte is bound as associated data.
    pub fn seal(&self, packet: &[u8]) -> Result<Vec<u8>, SignalingError> {
        let mut nonce = [0u8; gcm::NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let tag = [PacketType::Signaling as u8];
        let ciphertext =
            gcm::encrypt(&self.0, &nonce, packet, &tag).map_err(|_| SignalingError::Seal)?;

        let mut out = Vec::with_capacity(1 + gcm::NONCE_LEN + ciphertext.len());
        out.push(PacketType::Signaling as u8);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Unwrap an envelope produced by [`SignalingKey::seal`].
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, SignalingError> {
        if envelope.len() < 1 + gcm::NONCE_LEN + gcm::TAG_LEN {
            return Err(SignalingError::TooShort(envelope.len()));
        }
        if envelope[0] != PacketType::Signaling as u8 {
            return Err(SignalingError::UnknownType(envelope[0]));
        }
        let mut nonce = [0u8; gcm::NONCE_LEN];
        nonce.copy_from_slice(&envelope[1..1 + gcm::NONCE_LEN]);
        gcm::decrypt(
            &self.0,
            &nonce,
            &envelope[1 + gcm::NONCE_LEN..],
            &envelope[..1],
        )
        .map_err(|_| SignalingError::Open)
    }
}

impl fmt::Debug for SignalingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignalingKey([REDACTED])")
    }
}

/// Identity/key agreement collaborator.
///
/// Supplies, for a given peer, the key that protects the signaling channel.
/// Implementations must return the same key on both ends of a peer pair.
pub trait KeyAgreement: Send + Sync {
    fn signaling_key(&self, peer: &PeerRef) -> Result<SignalingKey, CallError>;
}

/// X25519 + HKDF-SHA256 key agreement against registered peer public keys.
pub struct X25519KeyAgreement {
    secret: StaticSecret,
    public: PublicKey,
    peers: RwLock<HashMap<PeerRef, PublicKey>>,
}

impl X25519KeyAgreement {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Create an identity with a random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let agreement = Self::from_secret(bytes);
        bytes.zeroize();
        agreement
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Remember a peer's public identity key.
    pub fn register_peer(&self, peer: PeerRef, public_key: &[u8]) -> Result<(), CallError> {
        let bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            CallError::InvalidPeerKey(format!("expected 32 bytes, got {}", public_key.len()))
        })?;
        let mut peers = self
            .peers
            .write()
            .map_err(|_| CallError::Encryption("peer table poisoned".into()))?;
        peers.insert(peer, PublicKey::from(bytes));
        Ok(())
    }
}

impl KeyAgreement for X25519KeyAgreement {
    fn signaling_key(&self, peer: &PeerRef) -> Result<SignalingKey, CallError> {
        let their_public = {
            let peers = self
                .peers
                .read()
                .map_err(|_| CallError::Encryption("peer table poisoned".into()))?;
            *peers
                .get(peer)
                .ok_or_else(|| CallError::InvalidPeerKey(format!("no identity key for {peer}")))?
        };

        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(CallError::InvalidPeerKey(format!(
                "low-order public key for {peer}"
            )));
        }

        // Both ends must use the same salt, so order the two public keys.
        let ours = self.public.to_bytes();
        let theirs = their_public.to_bytes();
        let (first, second) = if ours <= theirs {
            (ours, theirs)
        } else {
            (theirs, ours)
        };
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(&first);
        salt[32..].copy_from_slice(&second);

        let okm = hkdf::sha256::<SESSION_KEY_LEN>(shared.as_bytes(), Some(&salt), SIGNALING_KDF_INFO)
            .map_err(|e| CallError::Encryption(e.to_string()))?;
        Ok(SignalingKey::new(okm))
    }
}

/// Key agreement returning one pre-shared key for every peer.
pub struct PresharedKeyAgreement {
    key: SignalingKey,
}

impl PresharedKeyAgreement {
    pub fn new(key: [u8; SESSION_KEY_LEN]) -> Self {
        Self {
            key: SignalingKey::new(key),
        }
    }
}

impl KeyAgreement for PresharedKeyAgreement {
    fn signaling_key(&self, _peer: &PeerRef) -> Result<SignalingKey, CallError> {
        Ok(self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_generation() {
        let a = SessionKeyMaterial::generate();
        let b = SessionKeyMaterial::generate();
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().len(), 32);
        assert_eq!(a.salt().len(), 4);
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKeyMaterial::from_parts([0xAB; 32], [0xCD; 4]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn test_x25519_agreement_is_symmetric() {
        let alice = X25519KeyAgreement::generate();
        let bob = X25519KeyAgreement::generate();
        alice
            .register_peer(PeerRef::from("bob"), &bob.public_key())
            .unwrap();
        bob.register_peer(PeerRef::from("alice"), &alice.public_key())
            .unwrap();

        let k1 = alice.signaling_key(&PeerRef::from("bob")).unwrap();
        let k2 = bob.signaling_key(&PeerRef::from("alice")).unwrap();

        let sealed = k1.seal(b"call-request").unwrap();
        assert_eq!(k2.open(&sealed).unwrap(), b"call-request");
    }

    #[test]
    fn test_unknown_peer_is_invalid_key() {
        let alice = X25519KeyAgreement::generate();
        let err = alice.signaling_key(&PeerRef::from("mallory")).unwrap_err();
        assert!(matches!(err, CallError::InvalidPeerKey(_)));
    }

    #[test]
    fn test_register_rejects_wrong_length() {
        let alice = X25519KeyAgreement::generate();
        let err = alice
            .register_peer(PeerRef::from("bob"), &[1u8; 31])
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidPeerKey(_)));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = X25519KeyAgreement::generate();
        alice
            .register_peer(PeerRef::from("zero"), &[0u8; 32])
            .unwrap();
        assert!(matches!(
            alice.signaling_key(&PeerRef::from("zero")),
            Err(CallError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_envelope_rejects_tampering() {
        let key = SignalingKey::new([9u8; 32]);
        let mut sealed = key.seal(b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(key.open(&sealed), Err(SignalingError::Open)));
        assert!(matches!(
            key.open(&[0x10, 1, 2]),
            Err(SignalingError::TooShort(3))
        ));
    }
}
