use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("Invalid output length for HKDF expand")]
    InvalidLength,
}

/// Derives `N` bytes of key material using HKDF-SHA256.
///
/// # Arguments
///
/// * `key`: The input keying material (e.g. a Diffie-Hellman shared secret).
/// * `salt`: An optional salt.
/// * `info`: Context string binding the output to its use.
pub fn sha256<const N: usize>(
    key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<[u8; N], HkdfError> {
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_separates_outputs() {
        let a: [u8; 32] = sha256(b"secret", None, b"one").unwrap();
        let b: [u8; 32] = sha256(b"secret", None, b"two").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_oversized_output() {
        assert!(sha256::<{ 255 * 32 + 1 }>(b"secret", None, b"").is_err());
    }
}
