//! Credential encryption and request signing.
//!
//! Two primitives, both fixed by the broker's wire contract:
//!
//! - **Credential encryption**: AES-128-CBC with the key taken from the
//!   base64-decoded API key (the `API-` prefix is not part of the key
//!   material), a zero IV and PKCS#7 padding, output base64. The zero IV is
//!   the broker's contract, not a design choice; the primitive wraps only
//!   username, password, token and OTP for transport and must not be reused
//!   for general confidentiality.
//! - **Request signing**: `SHA-256(apiKey ‖ hostname ‖ endpoint ‖ body)`
//!   hex-encoded, sent in the `Checker` header. An absent payload
//!   contributes the empty string.

use aes::Aes128;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut as _, KeyIvInit as _};
use sha2::{Digest as _, Sha256};

use crate::Result;
use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// AES key size mandated by the broker.
const KEY_LEN: usize = 16;

/// Prefix the broker puts in front of the base64 key material.
const API_KEY_PREFIX: &str = "API-";

/// Derive the 16-byte AES key from the configured API key.
///
/// Fails with a validation error when the key material decodes to fewer
/// than 16 bytes; surplus bytes beyond 16 are ignored.
pub fn derive_key(api_key: &str) -> Result<[u8; KEY_LEN]> {
    let material = api_key.strip_prefix(API_KEY_PREFIX).unwrap_or(api_key);
    let decoded = BASE64
        .decode(material)
        .map_err(|e| Error::validation(format!("api key is not valid base64: {e}")))?;
    if decoded.len() < KEY_LEN {
        return Err(Error::validation(format!(
            "api key decodes to {} bytes, need at least {KEY_LEN}",
            decoded.len()
        )));
    }
    let mut key = [0_u8; KEY_LEN];
    key.copy_from_slice(&decoded[..KEY_LEN]);
    Ok(key)
}

/// Encrypt one credential field for transport, returning base64 ciphertext.
#[must_use]
pub fn encrypt_field(key: &[u8; KEY_LEN], plaintext: &str) -> String {
    let iv = [0_u8; KEY_LEN];
    let ciphertext = Aes128CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    BASE64.encode(ciphertext)
}

/// Compute the `Checker` integrity tag for a signed request.
///
/// `body` must be the exact compact-JSON string that goes on the wire; the
/// hash is sensitive to key order and whitespace.
#[must_use]
pub fn checker(api_key: &str, hostname: &str, endpoint: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(hostname.as_bytes());
    hasher.update(endpoint.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use cbc::cipher::BlockDecryptMut as _;

    use super::*;

    type Aes128CbcDec = cbc::Decryptor<Aes128>;

    fn test_key() -> [u8; KEY_LEN] {
        // "MDEyMzQ1Njc4OWFiY2RlZg==" is base64 for "0123456789abcdef".
        derive_key("API-MDEyMzQ1Njc4OWFiY2RlZg==").expect("valid key")
    }

    #[test]
    fn derive_key_strips_prefix_and_decodes() {
        assert_eq!(test_key(), *b"0123456789abcdef");
        // Same material without the prefix derives the same key.
        assert_eq!(
            derive_key("MDEyMzQ1Njc4OWFiY2RlZg==").expect("valid"),
            *b"0123456789abcdef"
        );
    }

    #[test]
    fn derive_key_rejects_short_material() {
        // "c2hvcnQ=" decodes to "short" (5 bytes).
        assert!(derive_key("API-c2hvcnQ=").is_err());
        assert!(derive_key("not base64 !!!").is_err());
    }

    #[test]
    fn encrypt_is_deterministic_and_block_aligned() {
        let key = test_key();
        let a = encrypt_field(&key, "tc11111111111");
        let b = encrypt_field(&key, "tc11111111111");
        // Zero IV means identical plaintexts produce identical ciphertexts.
        assert_eq!(a, b);
        assert_ne!(a, encrypt_field(&key, "tc22222222222"));

        let raw = BASE64.decode(a).expect("ciphertext is base64");
        assert_eq!(raw.len() % KEY_LEN, 0, "PKCS#7 output is block aligned");
    }

    #[test]
    fn encrypt_round_trips() {
        let key = test_key();
        let ciphertext = BASE64
            .decode(encrypt_field(&key, "P@ss"))
            .expect("valid base64");
        let iv = [0_u8; KEY_LEN];
        let plaintext = Aes128CbcDec::new((&key).into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .expect("valid padding");
        assert_eq!(plaintext, b"P@ss");
    }

    #[test]
    fn checker_concatenates_in_order() {
        // "a" + "b" + "c" + "" is "abc"; SHA-256("abc") is a published vector.
        assert_eq!(
            checker("a", "b", "c", ""),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        // Empty everything hashes the empty string.
        assert_eq!(
            checker("", "", "", ""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn checker_is_order_sensitive() {
        let a = checker("K", "https://broker.test", "/api/SendOrder", "{}");
        let b = checker("K", "https://broker.test", "/api/sendorder", "{}");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
