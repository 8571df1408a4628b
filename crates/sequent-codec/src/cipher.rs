//! Authenticated encryption of serialized state payloads.
//!
//! The wire frame is `nonce(12) || tag(16) || ciphertext`. A fresh random
//! nonce is drawn for every encryption; the same key must be configured on
//! the decrypting side. Tag mismatch surfaces as a data-integrity error,
//! fatal for the affected record.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{aes::Aes192, Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::rngs::OsRng;
use rand::Rng;

use crate::CodecError;

/// Nonce length of the cipher frame.
pub const NONCE_LEN: usize = 12;

/// Authentication tag length of the cipher frame.
pub const TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// At-rest encryption of serialized payloads.
pub trait Cipher: Send + Sync {
    /// Encrypt plaintext into a self-contained frame.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decrypt and authenticate a frame produced by [`Cipher::encrypt`].
    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CodecError>;
}

enum Keyed {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// AES-GCM cipher keyed with a 128, 192 or 256-bit key.
pub struct AesGcmCipher {
    keyed: Keyed,
}

impl AesGcmCipher {
    /// Construct from raw key bytes; the key length selects the variant.
    pub fn from_key(key: &[u8]) -> Result<Self, CodecError> {
        let keyed = match key.len() {
            16 => Keyed::Aes128(Aes128Gcm::new_from_slice(key).map_err(key_error)?),
            24 => Keyed::Aes192(Aes192Gcm::new_from_slice(key).map_err(key_error)?),
            32 => Keyed::Aes256(Aes256Gcm::new_from_slice(key).map_err(key_error)?),
            n => {
                return Err(CodecError::Serialization(format!(
                    "cipher key must be 16, 24 or 32 bytes, got {n}"
                )))
            }
        };
        Ok(Self { keyed })
    }
}

fn key_error(e: aes_gcm::aes::cipher::InvalidLength) -> CodecError {
    CodecError::Serialization(format!("invalid cipher key: {e}"))
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // The aead crate emits ciphertext || tag; the frame wants the tag
        // up front, after the nonce.
        let mut sealed = match &self.keyed {
            Keyed::Aes128(c) => c.encrypt(nonce, plaintext),
            Keyed::Aes192(c) => c.encrypt(nonce, plaintext),
            Keyed::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| CodecError::Integrity("encryption failed".into()))?;

        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let mut frame = Vec::with_capacity(NONCE_LEN + TAG_LEN + sealed.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Integrity(format!(
                "cipher frame too short: {} bytes",
                frame.len()
            )));
        }
        let (nonce_bytes, rest) = frame.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        match &self.keyed {
            Keyed::Aes128(c) => c.decrypt(nonce, sealed.as_slice()),
            Keyed::Aes192(c) => c.decrypt(nonce, sealed.as_slice()),
            Keyed::Aes256(c) => c.decrypt(nonce, sealed.as_slice()),
        }
        .map_err(|_| CodecError::Integrity("decryption failed: tag mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY256: [u8; 32] = [7u8; 32];

    #[test]
    fn roundtrip_all_key_sizes() {
        for key in [&[1u8; 16][..], &[2u8; 24][..], &[3u8; 32][..]] {
            let cipher = AesGcmCipher::from_key(key).unwrap();
            let frame = cipher.encrypt(b"payload bytes").unwrap();
            assert_eq!(cipher.decrypt(&frame).unwrap(), b"payload bytes");
        }
    }

    #[test]
    fn frame_layout_and_fresh_nonces() {
        let cipher = AesGcmCipher::from_key(&KEY256).unwrap();
        let a = cipher.encrypt(b"x").unwrap();
        let b = cipher.encrypt(b"x").unwrap();
        assert_eq!(a.len(), NONCE_LEN + TAG_LEN + 1);
        // Fresh nonce per encryption means distinct frames for equal input.
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = AesGcmCipher::from_key(&KEY256).unwrap();
        let mut frame = cipher.encrypt(b"sensitive").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        match cipher.decrypt(&frame) {
            Err(CodecError::Integrity(_)) => {}
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let cipher = AesGcmCipher::from_key(&KEY256).unwrap();
        let other = AesGcmCipher::from_key(&[9u8; 32]).unwrap();
        let frame = cipher.encrypt(b"sensitive").unwrap();
        assert!(other.decrypt(&frame).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let cipher = AesGcmCipher::from_key(&KEY256).unwrap();
        match cipher.decrypt(&[0u8; 10]) {
            Err(CodecError::Integrity(_)) => {}
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn bad_key_length_is_rejected() {
        assert!(AesGcmCipher::from_key(&[0u8; 5]).is_err());
    }
}
