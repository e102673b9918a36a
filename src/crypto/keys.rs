//! ECDSA key management for the wallet
//!
//! Provides key pair generation and transaction-input signing using
//! the secp256k1 elliptic curve.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::hash160;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed SEC1 public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// HASH160 of the compressed public key
    pub fn public_key_hash(&self) -> Vec<u8> {
        hash160(&self.public_key.serialize())
    }

    /// Sign a 32-byte digest, returning a DER signature.
    ///
    /// Nonces are derived per RFC6979, so the same digest always yields
    /// the same signature.
    pub fn sign_der(&self, digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest_slice(digest)?;
        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_der().to_vec())
    }
}

/// Parse a public key from its serialized bytes
pub fn public_key_from_slice(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::double_sha256;
    use secp256k1::ecdsa::Signature;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public_key_bytes().len(), 33);
        assert_eq!(kp.public_key_hash().len(), 20);
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_private_key_hex(&kp1.private_key_hex()).unwrap();
        assert_eq!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(KeyPair::from_private_key_hex("zz").is_err());
        assert!(KeyPair::from_private_key_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_sign_der_is_deterministic_and_verifies() {
        let kp = KeyPair::generate();
        let digest = double_sha256(b"spend");

        let sig1 = kp.sign_der(&digest).unwrap();
        let sig2 = kp.sign_der(&digest).unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(sig1[0], 0x30);

        let secp = Secp256k1::verification_only();
        let signature = Signature::from_der(&sig1).unwrap();
        let message = Message::from_digest_slice(&digest).unwrap();
        assert!(secp.verify_ecdsa(&message, &signature, &kp.public_key).is_ok());
    }

    #[test]
    fn test_public_key_from_slice() {
        let kp = KeyPair::generate();
        let parsed = public_key_from_slice(&kp.public_key_bytes()).unwrap();
        assert_eq!(parsed, kp.public_key);
        assert!(public_key_from_slice(&[1, 2, 3]).is_err());
    }
}
