//! Secure packet transport: per-packet AES-256-GCM with replay protection.
//!
//! Nonce layout is `salt (4) ‖ counter (8, big-endian)`. The send counter is
//! advanced with an atomic compare-and-swap before each encryption, so
//! concurrent senders never observe the same value. Both directions share the
//! call key; the responder flips the top bit of the salt so the two
//! directions draw from disjoint nonce spaces.
//!
//! Sealed payload layout: `[12-byte nonce][ciphertext ‖ 16-byte tag]`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::Aes256Gcm;
use log::{debug, trace};
use thiserror::Error;

use crate::calls::encryption::{SALT_LEN, SessionKeyMaterial};
use crate::calls::types::CallRole;
use crate::crypto::gcm;

/// Smallest sealed payload: nonce plus tag around an empty plaintext.
pub const MIN_SEALED_LEN: usize = gcm::NONCE_LEN + gcm::TAG_LEN;

/// Bits tracked by the replay bitmap.
const REPLAY_BITMAP_BITS: u64 = 128;

#[derive(Debug, Clone)]
pub struct SecureTransportConfig {
    /// How far behind the highest counter seen a packet may arrive and still
    /// be accepted. Capped at the bitmap width.
    pub replay_tolerance: u64,
}

impl Default for SecureTransportConfig {
    fn default() -> Self {
        Self {
            replay_tolerance: 100,
        }
    }
}

/// Contract violations on the send side.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no session key (transport closed)")]
    NoSessionKey,
    #[error("nonce counter exhausted")]
    CounterExhausted,
    #[error("cipher failure")]
    Cipher,
}

/// Output of [`SecurePacketTransport::seal`].
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub bytes: Vec<u8>,
    /// Counter embedded in the nonce.
    pub counter: u64,
}

/// Sliding anti-replay window over received nonce counters.
#[derive(Debug, Clone)]
pub(crate) struct ReplayWindow {
    highest: u64,
    /// Bit `i` set means counter `highest - i` was accepted.
    seen: u128,
    tolerance: u64,
}

impl ReplayWindow {
    pub(crate) fn new(tolerance: u64) -> Self {
        Self {
            highest: 0,
            seen: 0,
            tolerance: tolerance.min(REPLAY_BITMAP_BITS - 1),
        }
    }

    /// Whether `counter` may be accepted. Counter 0 is never issued.
    pub(crate) fn check(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        if counter > self.highest {
            return true;
        }
        let behind = self.highest - counter;
        if behind > self.tolerance {
            return false;
        }
        self.seen & (1u128 << behind) == 0
    }

    /// Record an authenticated counter.
    pub(crate) fn update(&mut self, counter: u64) {
        if counter > self.highest {
            let shift = counter - self.highest;
            self.seen = if shift >= REPLAY_BITMAP_BITS {
                0
            } else {
                self.seen << shift
            };
            self.seen |= 1;
            self.highest = counter;
        } else {
            self.seen |= 1u128 << (self.highest - counter);
        }
    }

    /// Check and record in one step. Returns `false` for a replay.
    pub(crate) fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }
        self.update(counter);
        true
    }

    pub(crate) fn highest(&self) -> u64 {
        self.highest
    }
}

/// Per-call AEAD transport for media payloads.
pub struct SecurePacketTransport {
    cipher: Mutex<Option<Aes256Gcm>>,
    send_salt: [u8; SALT_LEN],
    recv_salt: [u8; SALT_LEN],
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
}

impl SecurePacketTransport {
    pub fn new(
        material: &SessionKeyMaterial,
        role: CallRole,
        config: &SecureTransportConfig,
    ) -> Result<Self, CryptoError> {
        let cipher = gcm::prepare(material.key()).map_err(|_| CryptoError::Cipher)?;
        let initiator_salt = *material.salt();
        let mut responder_salt = initiator_salt;
        responder_salt[0] ^= 0x80;

        let (send_salt, recv_salt) = match role {
            CallRole::Initiator => (initiator_salt, responder_salt),
            CallRole::Responder => (responder_salt, initiator_salt),
        };

        Ok(Self {
            cipher: Mutex::new(Some(cipher)),
            send_salt,
            recv_salt,
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new(config.replay_tolerance)),
        })
    }

    /// Encrypt `plaintext`, binding `aad` (the packet header).
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedPayload, CryptoError> {
        let guard = self.cipher.lock().map_err(|_| CryptoError::NoSessionKey)?;
        let cipher = guard.as_ref().ok_or(CryptoError::NoSessionKey)?;

        let previous = self
            .send_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map_err(|_| CryptoError::CounterExhausted)?;
        let counter = previous + 1;

        let nonce = build_nonce(&self.send_salt, counter);
        let ciphertext = gcm::seal(cipher, &nonce, plaintext, aad).map_err(|_| CryptoError::Cipher)?;
        drop(guard);

        let mut bytes = Vec::with_capacity(gcm::NONCE_LEN + ciphertext.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&ciphertext);
        Ok(SealedPayload { bytes, counter })
    }

    /// Decrypt a sealed payload. Any failure (framing, wrong direction,
    /// replay, authentication, closed transport) yields `None`.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < MIN_SEALED_LEN {
            trace!("sealed payload too short ({} bytes)", sealed.len());
            return None;
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(gcm::NONCE_LEN);
        if nonce_bytes[..SALT_LEN] != self.recv_salt {
            trace!("nonce salt does not match peer direction");
            return None;
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&nonce_bytes[SALT_LEN..]);
        let counter = u64::from_be_bytes(counter_bytes);

        if !self.replay.lock().ok()?.check(counter) {
            debug!("rejecting replayed counter {counter}");
            return None;
        }

        let mut nonce = [0u8; gcm::NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let plaintext = {
            let guard = self.cipher.lock().ok()?;
            let cipher = guard.as_ref()?;
            gcm::open(cipher, &nonce, ciphertext, aad).ok()?
        };

        // Only authenticated packets move the window; a concurrent duplicate
        // that also decrypted loses here.
        if !self.replay.lock().ok()?.check_and_update(counter) {
            return None;
        }
        Some(plaintext)
    }

    /// Drop the cipher (zeroizing its key schedule). Later seals fail and
    /// opens return `None`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.cipher.lock() {
            guard.take();
        }
    }

    pub fn is_open(&self) -> bool {
        self.cipher.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Last counter issued for sending.
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::SeqCst)
    }

    /// Highest authenticated receive counter.
    pub fn highest_received(&self) -> u64 {
        self.replay.lock().map(|w| w.highest()).unwrap_or(0)
    }
}

impl std::fmt::Debug for SecurePacketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurePacketTransport")
            .field("key", &"[REDACTED]")
            .field("send_counter", &self.send_counter())
            .field("highest_received", &self.highest_received())
            .field("open", &self.is_open())
            .finish()
    }
}

fn build_nonce(salt: &[u8; SALT_LEN], counter: u64) -> [u8; gcm::NONCE_LEN] {
    let mut nonce = [0u8; gcm::NONCE_LEN];
    nonce[..SALT_LEN].copy_from_slice(salt);
    nonce[SALT_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
