//! WireGuard key material
//!
//! Key pairs are Curve25519 (x25519-dalek), preshared keys are 32 random bytes.
//! Everything is handed around as standard base64, the encoding `wg` and the
//! config files use. Randomness comes from the OS; if it fails the error is
//! returned as-is and nothing falls back to a weaker source.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of every WireGuard key in bytes
pub const KEY_LEN: usize = 32;

/// WireGuard key pair
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String, // Base64
    pub public_key: String,  // Base64
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Symmetric preshared key
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey(String);

impl PresharedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

fn random_key() -> Result<[u8; KEY_LEN]> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Crypto(format!("OS randomness unavailable: {}", e)))?;
    Ok(bytes)
}

/// Generate a WireGuard keypair using x25519
pub fn generate_keypair() -> Result<KeyPair> {
    let mut private_key_bytes = random_key()?;

    // Curve25519 clamping, same as `wg genkey`
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    Ok(KeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

/// Generate a preshared key
pub fn generate_preshared_key() -> Result<PresharedKey> {
    Ok(PresharedKey(STANDARD.encode(random_key()?)))
}

/// Derive the public key for a base64 private key
pub fn public_key_for(private_key_b64: &str) -> Result<String> {
    let bytes = decode_key(private_key_b64)?;
    let public = PublicKey::from(&StaticSecret::from(bytes));
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Check that a base64 value decodes to exactly one key
pub fn validate_key_b64(b64: &str) -> Result<()> {
    decode_key(b64).map(|_| ())
}

fn decode_key(b64: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = STANDARD
        .decode(b64.trim())
        .map_err(|e| Error::Crypto(format!("Invalid key encoding: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid key length".to_string()))
}
