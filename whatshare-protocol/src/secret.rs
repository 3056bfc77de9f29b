//! Shared Secret Codec
//!
//! Generates the keying material exchanged during pairing and uses it to
//! seal and open forwarded payloads.
//!
//! ## Ciphertext Format
//!
//! ```text
//! +---------+----------------+----------------------+-------------+
//! | version | nonce (12 B)   | ciphertext           | tag (16 B)  |
//! +---------+----------------+----------------------+-------------+
//! ```
//!
//! - **Cipher**: ChaCha20-Poly1305 (`ring::aead`)
//! - **Key**: HKDF-SHA256 over the secret words (big-endian), fixed salt and label
//! - **Nonce**: 96 random bits per message
//! - **AAD**: the version byte
//!
//! The secret itself is never logged; [`SharedSecret`]'s `Debug` output only
//! shows the word count and a short fingerprint.

use crate::{ProtocolError, Result};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Number of 32-bit words in a generated secret (256 bits)
pub const SECRET_WORDS: usize = 8;

/// Current ciphertext format version
const CIPHERTEXT_VERSION: u8 = 1;

/// Version byte plus nonce
const HEADER_LEN: usize = 1 + NONCE_LEN;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// HKDF salt for message keys
const KEY_SALT: &[u8] = b"whatshare-shared-secret-v1";

/// HKDF info label for message keys
const KEY_INFO: &[u8] = b"forwarded-payload";

/// Raw keying material shared by two paired devices
///
/// Serialized as a JSON array of integers so it can travel inside a QR code
/// or a pairing descriptor unchanged.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedSecret(Vec<u32>);

impl SharedSecret {
    /// Generate a new random secret of [`SECRET_WORDS`] words
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Entropy` if the system random source fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use whatshare_protocol::secret::{SharedSecret, SECRET_WORDS};
    ///
    /// let secret = SharedSecret::generate().unwrap();
    /// assert_eq!(secret.words().len(), SECRET_WORDS);
    /// ```
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; SECRET_WORDS * 4];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| ProtocolError::Entropy)?;

        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self(words))
    }

    /// Wrap existing words (e.g. decoded from a descriptor)
    pub fn from_words(words: Vec<u32>) -> Self {
        Self(words)
    }

    /// The raw words of this secret
    pub fn words(&self) -> &[u32] {
        &self.0
    }

    /// Whether this secret has the length required for message keys
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == SECRET_WORDS
    }

    /// Short, non-reversible identifier for display and log correlation
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_bytes());
        hex::encode(&digest[..8])
    }

    /// Constant-time comparison of the key material
    pub fn matches(&self, other: &SharedSecret) -> bool {
        self.to_bytes()
            .as_slice()
            .ct_eq(other.to_bytes().as_slice())
            .into()
    }

    /// Seal `plaintext` under this secret, see [`encrypt`]
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        encrypt(self, plaintext)
    }

    /// Open `ciphertext` sealed under this secret, see [`decrypt`]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        decrypt(self, ciphertext)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|w| w.to_be_bytes()).collect()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("words", &self.0.len())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Authenticated encryption of `plaintext` under `secret`
///
/// A fresh random nonce is drawn for every call, so sealing the same payload
/// twice yields different ciphertexts.
///
/// # Errors
///
/// - `Encryption` if `secret` does not have [`SECRET_WORDS`] words
/// - `Entropy` if no nonce can be drawn
pub fn encrypt(secret: &SharedSecret, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = message_key(secret)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| ProtocolError::Entropy)?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from([CIPHERTEXT_VERSION]),
        &mut in_out,
    )
    .map_err(|_| ProtocolError::Encryption("Failed to seal payload".to_string()))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + in_out.len());
    sealed.push(CIPHERTEXT_VERSION);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Open a payload produced by [`encrypt`]
///
/// # Errors
///
/// - `Encryption` if `secret` is malformed
/// - `Decode` if `ciphertext` is truncated or carries an unknown version
/// - `Authentication` if the tag does not verify (tampered data or wrong key)
pub fn decrypt(secret: &SharedSecret, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let key = message_key(secret)?;

    if ciphertext.len() < HEADER_LEN + TAG_LEN {
        return Err(ProtocolError::Decode(format!(
            "Ciphertext too short: {} bytes",
            ciphertext.len()
        )));
    }

    if ciphertext[0] != CIPHERTEXT_VERSION {
        return Err(ProtocolError::Decode(format!(
            "Unsupported ciphertext version: {}",
            ciphertext[0]
        )));
    }

    let nonce = Nonce::try_assume_unique_for_key(&ciphertext[1..HEADER_LEN])
        .map_err(|_| ProtocolError::Decode("Invalid nonce".to_string()))?;

    let mut in_out = ciphertext[HEADER_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::from([CIPHERTEXT_VERSION]), &mut in_out)
        .map_err(|_| ProtocolError::Authentication)?;

    Ok(plaintext.to_vec())
}

/// Derive the ChaCha20-Poly1305 key for `secret`
fn message_key(secret: &SharedSecret) -> Result<LessSafeKey> {
    if !secret.is_well_formed() {
        return Err(ProtocolError::Encryption(format!(
            "Shared secret must have {} words, got {}",
            SECRET_WORDS,
            secret.words().len()
        )));
    }

    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, KEY_SALT).extract(&secret.to_bytes());
    let okm = prk
        .expand(&[KEY_INFO], &CHACHA20_POLY1305)
        .map_err(|_| ProtocolError::Encryption("Key derivation failed".to_string()))?;

    let key: UnboundKey = okm.into();
    Ok(aead::LessSafeKey::new(key))
}
