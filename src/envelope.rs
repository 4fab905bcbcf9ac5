//! # Payload Envelope
//!
//! Broker payloads travel encrypted between the server and each host's
//! traffic keypair. The envelope is an authenticated box:
//!
//! 1. X25519 Diffie-Hellman between the sender's static secret and the
//!    recipient's public key.
//! 2. The shared secret is run through a keyed BLAKE3 derivation (fixed
//!    context string) to produce the AES-256-GCM key.
//! 3. A random 96-bit nonce is prepended to the ciphertext.
//!
//! Either side can open a box sealed by the other with the mirrored key
//! pair, which is exactly the relationship between a host's traffic keys
//! and the server's. One-byte control signals (ACK/DONE) are sent in the
//! clear and never pass through here.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

use crate::keys::{PrivateKey, PublicKey};

/// Clear one-byte signal: acknowledge receipt.
pub const SIGNAL_ACK: u8 = 0x06;
/// Clear one-byte signal: operation complete, publish peers.
pub const SIGNAL_DONE: u8 = 0x04;

const NONCE_SIZE: usize = 12;

/// Key-derivation context. Versioned so a future envelope revision cannot
/// produce colliding keys.
const KDF_CONTEXT: &str = "wiremesh envelope v1";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("payload too short to carry a nonce")]
    Truncated,

    #[error("encryption failed")]
    Encrypt,

    #[error("payload could not be decrypted")]
    Decrypt,
}

fn derive_key(local: &PrivateKey, remote: &PublicKey) -> Key<Aes256Gcm> {
    let shared = local.as_static_secret().diffie_hellman(&remote.as_x25519());
    let derived = blake3::derive_key(KDF_CONTEXT, shared.as_bytes());
    Key::<Aes256Gcm>::from(derived)
}

/// Seal `plaintext` from `sender` to `recipient`. Output layout:
/// `nonce(12) || ciphertext`.
pub fn seal(
    sender: &PrivateKey,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let key = derive_key(sender, recipient);
    let cipher = Aes256Gcm::new(&key);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EnvelopeError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a box sealed to `recipient` by `sender`.
pub fn open(
    recipient: &PrivateKey,
    sender: &PublicKey,
    payload: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    if payload.len() < NONCE_SIZE {
        return Err(EnvelopeError::Truncated);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);

    let key = derive_key(recipient, sender);
    let cipher = Aes256Gcm::new(&key);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| EnvelopeError::Decrypt)
}
