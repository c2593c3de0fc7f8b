//! Key & identity utility (C1)
//!
//! Generates fresh X25519 keypairs for tunnels and deployments, and encodes
//! them as standard base64. Keys are never reused across tunnels or
//! deployments; callers are expected to call [`generate_keypair`] once per
//! tunnel and once per deployment's client identity.
//!
//! Also generates the emergency-access SSH keypair (spec.md §6) — a
//! separate identity from the X25519 tunnel keys above, since EC2's
//! `ImportKeyPair` expects real OpenSSH key material, not a WireGuard key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ssh_key::{rand_core::OsRng as SshOsRng, Algorithm, LineEnding, PrivateKey as SshPrivateKey};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// A base64-encoded X25519 keypair (44 characters including padding).
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a fresh X25519 keypair using the OS RNG.
///
/// Fails only if the OS RNG is unavailable; that failure is fatal to the
/// caller, per spec.
pub fn generate_keypair() -> Result<KeyPair, CryptoError> {
    let private = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&private);

    Ok(KeyPair {
        private_key: STANDARD.encode(private.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

/// Derive the base64 public key for a base64 private key.
pub fn derive_public_key(private_key_b64: &str) -> Result<String, CryptoError> {
    let bytes = STANDARD
        .decode(private_key_b64)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::Encoding("private key must be 32 bytes".into()))?;
    let private = StaticSecret::from(arr);
    let public = PublicKey::from(&private);
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Validate that a string is a well-formed base64-encoded 32-byte key.
pub fn is_valid_encoded_key(key: &str) -> bool {
    STANDARD
        .decode(key)
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// An OpenSSH ed25519 keypair, distinct from the X25519 tunnel identity
/// above. Used only for the emergency-access path: importing a real SSH
/// public key into the cloud driver's keypair and persisting the private
/// half locally (`config::write_emergency_key`).
pub struct SshKeyPair {
    pub private_key_pem: String,
    pub public_key_openssh: String,
}

/// Generate a fresh OpenSSH ed25519 keypair for emergency bridge access.
pub fn generate_ssh_keypair() -> Result<SshKeyPair, CryptoError> {
    let private = SshPrivateKey::random(SshOsRng, Algorithm::Ed25519)
        .map_err(|e| CryptoError::Ssh(e.to_string()))?;
    let private_key_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| CryptoError::Ssh(e.to_string()))?
        .to_string();
    let public_key_openssh = private
        .public_key()
        .to_openssh()
        .map_err(|e| CryptoError::Ssh(e.to_string()))?;

    Ok(SshKeyPair {
        private_key_pem,
        public_key_openssh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_valid_and_distinct() {
        let a = generate_keypair().unwrap();
        let b = generate_keypair().unwrap();

        assert!(is_valid_encoded_key(&a.private_key));
        assert!(is_valid_encoded_key(&a.public_key));
        assert_ne!(a.private_key, b.private_key, "keys must be fresh per call");
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn derive_public_key_matches_generated_pair() {
        let pair = generate_keypair().unwrap();
        let derived = derive_public_key(&pair.private_key).unwrap();
        assert_eq!(derived, pair.public_key);
    }

    #[test]
    fn rejects_malformed_key() {
        assert!(!is_valid_encoded_key("not-base64-!!!"));
        assert!(!is_valid_encoded_key(&base64::engine::general_purpose::STANDARD.encode(b"short")));
    }

    #[test]
    fn ssh_keypair_is_valid_openssh_and_distinct_from_tunnel_keys() {
        let ssh_keys = generate_ssh_keypair().unwrap();
        assert!(ssh_keys.private_key_pem.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert!(ssh_keys.public_key_openssh.starts_with("ssh-ed25519 "));

        let tunnel_keys = generate_keypair().unwrap();
        assert_ne!(ssh_keys.public_key_openssh, tunnel_keys.public_key);
    }
}
