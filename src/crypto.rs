//! Cryptographic primitives for Shroud.
//!
//! X25519 for session-key agreement and AES-128-GCM for packet sealing.
//! The first 16 bytes of the shared secret form the session key; the
//! remaining 16 bytes never leave this module.

use std::path::Path;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::payload::{NONCE_LENGTH, TAG_LENGTH};

/// X25519 keypair for this node
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load a keypair from a private key file (32 bytes, base64 encoded)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(content.trim())
            .map_err(|e| Error::Crypto(format!("invalid private key encoding: {}", e)))?;
        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("invalid private key length (expected 32 bytes)".into()))?;
        let secret = StaticSecret::from(key_bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Save the private key to a file with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, BASE64.encode(self.secret.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load the keypair from `path`, generating and persisting one on first start
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("Generating new keypair, saving to {:?}", path);
            let kp = Self::generate();
            kp.save(path)?;
            Ok(kp)
        }
    }

    /// Get the public key as a base64 string
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_base64())
            .finish()
    }
}

/// Parse a base64-encoded public key
pub fn parse_public_key(b64: &str) -> Result<PublicKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Crypto(format!("invalid public key encoding: {}", e)))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("invalid public key length (expected 32 bytes)".into()))?;
    Ok(PublicKey::from(arr))
}

/// Compute the X25519 shared secret between our static secret and a peer's
/// public key
pub fn shared_secret(peer_public: &PublicKey, local_secret: &StaticSecret) -> [u8; 32] {
    *local_secret.diffie_hellman(peer_public).as_bytes()
}

/// Fill the given nonce region with fresh CSPRNG bytes
pub fn fill_nonce(nonce: &mut [u8]) {
    debug_assert_eq!(nonce.len(), NONCE_LENGTH);
    OsRng.fill_bytes(nonce);
}

/// Session AEAD state for one peer mapping.
///
/// Built once when the mapping is ingested and reused for every packet.
/// The per-call nonce is passed explicitly, so one instance may be used
/// concurrently by the outgoing and incoming workers.
pub struct SessionAead {
    cipher: Aes128Gcm,
}

impl SessionAead {
    /// Build the AEAD from the first 16 bytes of an X25519 shared secret
    pub fn new(shared: &[u8; 32]) -> Self {
        let key = GenericArray::from_slice(&shared[..16]);
        Self {
            cipher: Aes128Gcm::new(key),
        }
    }

    /// Encrypt `body` in place and return the 16-byte tag
    pub fn seal_in_place(&self, nonce: &[u8], body: &mut [u8]) -> Result<[u8; TAG_LENGTH]> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), &[], body)
            .map_err(|_| Error::Crypto("seal failed".into()))?;
        Ok(tag.into())
    }

    /// Decrypt `buf` in place, verifying `tag`. Returns [`Error::AuthFailure`]
    /// when the tag does not validate; the buffer contents are then unspecified
    /// and must not be forwarded.
    pub fn open_in_place(&self, nonce: &[u8], buf: &mut [u8], tag: &[u8]) -> Result<()> {
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &[],
                buf,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| Error::AuthFailure)
    }
}
