//! Symmetric sealing of protocol frames.
//!
//! Wire format: `[16-byte IV][AES-128-CTR ciphertext]`. The IV is the tail of
//! the plaintext's SHA-256 digest, so decryption doubles as an integrity check.

use aes::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};

use crate::error::{SparkError, SparkResult};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Length of a connection secret in bytes.
pub const SECRET_LEN: usize = 16;
const IV_LEN: usize = 16;

/// A per-connection symmetric secret and its stable hex form.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    bytes: [u8; SECRET_LEN],
    hex: String,
}

impl Secret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; SECRET_LEN] = rand::thread_rng().gen();
        Self::from_array(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> SparkResult<Self> {
        let bytes: [u8; SECRET_LEN] = bytes.try_into().map_err(|_| {
            SparkError::Encryption(format!(
                "secret must be {SECRET_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_array(bytes))
    }

    pub fn from_hex(hex_str: &str) -> SparkResult<Self> {
        let bytes = hex::decode(hex_str.trim())?;
        Self::from_bytes(&bytes)
    }

    fn from_array(bytes: [u8; SECRET_LEN]) -> Self {
        Self {
            hex: hex::encode(bytes),
            bytes,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Encrypt `data` with `secret`.
pub fn encrypt(data: &[u8], secret: &Secret) -> SparkResult<Vec<u8>> {
    let digest = Sha256::digest(data);
    let iv = &digest[digest.len() - IV_LEN..];
    let mut cipher = Aes128Ctr::new_from_slices(secret.as_bytes(), iv)
        .map_err(|e| SparkError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(IV_LEN + data.len());
    sealed.extend_from_slice(iv);
    sealed.extend_from_slice(data);
    cipher.apply_keystream(&mut sealed[IV_LEN..]);
    Ok(sealed)
}

/// Decrypt a frame produced by [`encrypt`], verifying its digest.
pub fn decrypt(sealed: &[u8], secret: &Secret) -> SparkResult<Vec<u8>> {
    if sealed.len() < IV_LEN {
        return Err(SparkError::Encryption(format!(
            "frame too short: {} bytes",
            sealed.len()
        )));
    }
    let (iv, body) = sealed.split_at(IV_LEN);
    let mut cipher = Aes128Ctr::new_from_slices(secret.as_bytes(), iv)
        .map_err(|e| SparkError::Encryption(e.to_string()))?;

    let mut data = body.to_vec();
    cipher.apply_keystream(&mut data);

    let digest = Sha256::digest(&data);
    if &digest[digest.len() - IV_LEN..] != iv {
        return Err(SparkError::Encryption("integrity check failed".into()));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let secret = Secret::generate();
        let sealed = encrypt(b"{\"act\":\"report\"}", &secret).unwrap();
        assert_eq!(sealed.len(), IV_LEN + 16);
        assert_ne!(&sealed[IV_LEN..], b"{\"act\":\"report\"}");
        assert_eq!(decrypt(&sealed, &secret).unwrap(), b"{\"act\":\"report\"}");
    }

    #[test]
    fn wrong_secret_fails_integrity() {
        let sealed = encrypt(b"hello world", &Secret::generate()).unwrap();
        assert!(matches!(
            decrypt(&sealed, &Secret::generate()),
            Err(SparkError::Encryption(_))
        ));
    }

    #[test]
    fn truncated_frame() {
        let secret = Secret::generate();
        assert!(decrypt(&[0u8; 4], &secret).is_err());
    }

    #[test]
    fn secret_hex_round_trip() {
        let secret = Secret::generate();
        let parsed = Secret::from_hex(secret.hex()).unwrap();
        assert_eq!(parsed, secret);
        assert_eq!(secret.hex().len(), SECRET_LEN * 2);
    }

    #[test]
    fn secret_rejects_bad_input() {
        assert!(Secret::from_hex("zz").is_err());
        assert!(Secret::from_hex("abcd").is_err());
        assert!(Secret::from_bytes(&[1u8; 32]).is_err());
    }
}
