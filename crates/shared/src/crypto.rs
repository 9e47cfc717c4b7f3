//! Token encryption at rest
//!
//! Provider access/refresh tokens are encrypted with AES-256-GCM before they
//! reach the merchants table. Wire format is hex of `iv || tag || ciphertext`
//! with a random 16-byte IV and the 16-byte authentication tag prefixed, so a
//! stored value is self-contained and tamper-evident.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;

/// AES-256-GCM with a 16-byte nonce (matches the stored-token wire format).
type TokenAead = AesGcm<Aes256, U16>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes ({} hex chars)", KEY_LEN * 2)]
    InvalidKey,
    #[error("ciphertext is malformed")]
    InvalidCiphertext,
    #[error("ciphertext failed authentication")]
    Authentication,
}

/// Process-wide cipher for token fields.
///
/// Constructed once at startup from `ENCRYPTION_KEY`; a missing key is fatal
/// in production and falls back to an ephemeral random key in development.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LEN],
}

impl TokenCipher {
    /// Build a cipher from a 64-hex-char key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Ephemeral random key. Tokens encrypted with it do not survive a
    /// restart; development only.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher =
            TokenAead::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        // The aead crate appends the tag; the stored layout wants it between
        // the IV and the ciphertext body.
        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| CryptoError::Authentication)?;
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let raw = hex::decode(stored.trim()).map_err(|_| CryptoError::InvalidCiphertext)?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        let cipher =
            TokenAead::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)?;
        let plaintext = cipher
            .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_slice())
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidCiphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn round_trip() {
        let c = cipher();
        for input in ["", "sk_live_abc123", "refresh token with spaces ✓"] {
            let sealed = c.encrypt(input).unwrap();
            assert_eq!(c.decrypt(&sealed).unwrap(), input);
        }
    }

    #[test]
    fn unique_ivs_per_encryption() {
        let c = cipher();
        let a = c.encrypt("same plaintext").unwrap();
        let b = c.encrypt("same plaintext").unwrap();
        assert_ne!(a, b, "every encryption must draw a fresh IV");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let c = cipher();
        let sealed = c.encrypt("sk_live_abc123").unwrap();

        // Flip one nibble in the ciphertext body (past IV + tag).
        let mut chars: Vec<char> = sealed.chars().collect();
        let idx = (super::IV_LEN + super::TAG_LEN) * 2 + 1;
        chars[idx] = if chars[idx] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();

        assert!(matches!(
            c.decrypt(&tampered),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = cipher().encrypt("secret").unwrap();
        let other = TokenCipher::from_hex(&"cd".repeat(32)).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn rejects_bad_keys_and_ciphertexts() {
        assert!(TokenCipher::from_hex("deadbeef").is_err());
        assert!(TokenCipher::from_hex("not hex at all").is_err());

        let c = cipher();
        assert!(matches!(
            c.decrypt("00ff"),
            Err(CryptoError::InvalidCiphertext)
        ));
        assert!(c.decrypt("zzzz").is_err());
    }
}
