//! Key exchange and envelope encryption primitives.
//!
//! Provides:
//! - secp256k1 key pair generation (33-byte compressed public keys)
//! - ECDH shared-secret derivation matching the wire format bit-exactly
//! - Deterministic per-session nonce derivation from the bridge id
//! - AES-256-GCM sealing/opening of envelope payloads
//!
//! **Nonce reuse caveat:** the nonce is `SHA-256(bridge_id)[..12]`, fixed
//! for the whole session. This is safe only because every session derives a
//! fresh shared secret from fresh ECDH keys, and message uniqueness is
//! enforced by the id-dedup layer rather than by nonce rotation. Reusing
//! one key pair together with one bridge id across sessions voids the AEAD
//! guarantees; callers must use fresh keys per session.

use crate::core::error::BridgeError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Size of a compressed secp256k1 public key.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of a secp256k1 secret key.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of the derived shared secret (AES-256-GCM key).
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of the AEAD nonce.
pub const NONCE_SIZE: usize = 12;

// ── Key pairs ────────────────────────────────────────────────────────────────

/// A secp256k1 key pair bound to one session.
///
/// Immutable once assigned to a session. The secret is exposed only through
/// [`KeyPair::secret_bytes`], for resumption persistence.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair from the CSPRNG.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut buf = [0u8; SECRET_KEY_SIZE];
        loop {
            rand::fill(&mut buf);
            // Rejection-sample until the scalar is a valid secret key;
            // failure probability per draw is ~2^-128.
            if let Ok(secret) = SecretKey::from_slice(&buf) {
                buf.zeroize();
                let public = PublicKey::from_secret_key(&secp, &secret);
                return Self { secret, public };
            }
        }
    }

    /// Reconstruct a key pair from a persisted 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, BridgeError> {
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self { secret, public })
    }

    /// The compressed 33-byte public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.serialize()
    }

    /// The public key as lowercase hex (the Creator's bridge id).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// The raw secret, for resumption persistence only.
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret.secret_bytes()
    }

    /// ECDH against a remote compressed public key.
    ///
    /// Returns the first 32 bytes of the *compressed* shared point: the
    /// parity prefix (`0x02`/`0x03`) followed by the first 31 bytes of the
    /// x-coordinate. Both peers derive the identical value, and it must be
    /// preserved bit-exactly — it is the AES-256-GCM key on the wire.
    pub fn derive_shared_secret(
        &self,
        remote_public: &[u8],
    ) -> Result<[u8; SHARED_SECRET_SIZE], BridgeError> {
        let remote = PublicKey::from_slice(remote_public)?;
        // x (32 bytes) || y (32 bytes), uncompressed coordinates.
        let mut point = shared_secret_point(&remote, &self.secret);
        let parity = if point[63] & 1 == 1 { 0x03 } else { 0x02 };

        let mut secret = [0u8; SHARED_SECRET_SIZE];
        secret[0] = parity;
        secret[1..].copy_from_slice(&point[..31]);
        point.zeroize();
        Ok(secret)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ── Nonce derivation ─────────────────────────────────────────────────────────

/// Derive the session nonce from the bridge id.
/// nonce = SHA-256(UTF-8(bridge_id))[0..12]
pub fn nonce_from(bridge_id: &str) -> [u8; NONCE_SIZE] {
    let digest = Sha256::digest(bridge_id.as_bytes());
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

// ── AEAD ─────────────────────────────────────────────────────────────────────

/// Encrypt a payload with AES-256-GCM under the session secret and the
/// bridge-id nonce. Returns ciphertext || tag.
pub fn encrypt(
    plaintext: &[u8],
    shared_secret: &[u8; SHARED_SECRET_SIZE],
    bridge_id: &str,
) -> Result<Vec<u8>, BridgeError> {
    let cipher = Aes256Gcm::new_from_slice(shared_secret)
        .map_err(|e| BridgeError::crypto(format!("invalid key: {e}")))?;
    let nonce_bytes = nonce_from(bridge_id);
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| BridgeError::crypto("encryption failed"))
}

/// Decrypt a payload produced by [`encrypt`]. Fails on tag mismatch.
pub fn decrypt(
    ciphertext: &[u8],
    shared_secret: &[u8; SHARED_SECRET_SIZE],
    bridge_id: &str,
) -> Result<Vec<u8>, BridgeError> {
    let cipher = Aes256Gcm::new_from_slice(shared_secret)
        .map_err(|e| BridgeError::crypto(format!("invalid key: {e}")))?;
    let nonce_bytes = nonce_from(bridge_id);
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| BridgeError::crypto("decryption failed: authentication tag mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecdh_symmetry() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret_a = alice.derive_shared_secret(&bob.public_key()).unwrap();
        let secret_b = bob.derive_shared_secret(&alice.public_key()).unwrap();
        assert_eq!(secret_a, secret_b, "ECDH must be commutative");
    }

    #[test]
    fn test_shared_secret_is_compressed_point_prefix() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret = alice.derive_shared_secret(&bob.public_key()).unwrap();
        assert!(
            secret[0] == 0x02 || secret[0] == 0x03,
            "first byte must be the compressed-point parity prefix"
        );
    }

    #[test]
    fn test_public_key_is_compressed_hex() {
        let kp = KeyPair::generate();
        let hex_pk = kp.public_key_hex();
        assert_eq!(hex_pk.len(), 66);
        assert!(hex_pk.starts_with("02") || hex_pk.starts_with("03"));
    }

    #[test]
    fn test_secret_roundtrip_through_persistence() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_from_secret_bytes_rejects_invalid_scalar() {
        assert!(KeyPair::from_secret_bytes(&[0u8; 32]).is_err());
        assert!(KeyPair::from_secret_bytes(&[1u8; 5]).is_err());
    }

    #[test]
    fn test_nonce_is_truncated_sha256() {
        // SHA-256("abc") = ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
        let nonce = nonce_from("abc");
        assert_eq!(hex::encode(nonce), "ba7816bf8f01cfea414140de");
    }

    #[test]
    fn test_nonce_deterministic_per_bridge_id() {
        assert_eq!(nonce_from("bridge-1"), nonce_from("bridge-1"));
        assert_ne!(nonce_from("bridge-1"), nonce_from("bridge-2"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret = alice.derive_shared_secret(&bob.public_key()).unwrap();

        let bridge_id = alice.public_key_hex();
        let plaintext = b"hello";
        let ciphertext = encrypt(plaintext, &secret, &bridge_id).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let decrypted = decrypt(&ciphertext, &secret, &bridge_id).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_rejects_tampered_ciphertext() {
        let kp = KeyPair::generate();
        let secret = kp
            .derive_shared_secret(&KeyPair::generate().public_key())
            .unwrap();
        let mut ciphertext = encrypt(b"payload", &secret, "bid").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(decrypt(&ciphertext, &secret, "bid").is_err());
    }

    #[test]
    fn test_decrypt_rejects_wrong_bridge_id() {
        let kp = KeyPair::generate();
        let secret = kp
            .derive_shared_secret(&KeyPair::generate().public_key())
            .unwrap();
        let ciphertext = encrypt(b"payload", &secret, "bid-a").unwrap();
        assert!(decrypt(&ciphertext, &secret, "bid-b").is_err());
    }
}
