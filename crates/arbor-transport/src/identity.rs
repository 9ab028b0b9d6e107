use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::TransportError;

/// Ed25519 keypair of a server.
///
/// Only the 32-byte seed is kept; the verifying key is derived on demand.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self::from_seed(&rand::random())
    }

    /// Rebuild a keypair from its 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// The 32-byte secret seed.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// 64-byte Ed25519 signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.seed())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key, displayed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Strict Ed25519 verification of `signature` over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), TransportError> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| TransportError::InvalidSignature)?;
        let key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| TransportError::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify_strict(msg, &signature)
            .map_err(|_| TransportError::InvalidSignature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &hex::encode(self.0)[..12])
    }
}

/// Identifier of a server: SHA-256 of its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId([u8; 32]);

impl ServerId {
    pub fn from_public(public: &PublicKey) -> Self {
        Self(Sha256::digest(public.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({}...)", &hex::encode(self.0)[..12])
    }
}

/// A participant: public key plus the addresses it can be reached on.
///
/// The id is always recomputed from the public key, also when decoding
/// from the wire, so a peer cannot announce a mismatching id.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "IdentityWire", into = "IdentityWire")]
pub struct ServerIdentity {
    public: PublicKey,
    addresses: Vec<String>,
    description: String,
    id: ServerId,
}

#[derive(Serialize, Deserialize)]
struct IdentityWire {
    public: PublicKey,
    addresses: Vec<String>,
    description: String,
}

impl From<IdentityWire> for ServerIdentity {
    fn from(wire: IdentityWire) -> Self {
        ServerIdentity::new(wire.public, wire.addresses).with_description(wire.description)
    }
}

impl From<ServerIdentity> for IdentityWire {
    fn from(si: ServerIdentity) -> Self {
        IdentityWire {
            public: si.public,
            addresses: si.addresses,
            description: si.description,
        }
    }
}

impl ServerIdentity {
    pub fn new(public: PublicKey, addresses: Vec<String>) -> Self {
        Self {
            id: ServerId::from_public(&public),
            public,
            addresses,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// First address, the one tried first when dialing.
    pub fn address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "{:?}", self.id),
        }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("id", &self.id)
            .field("addresses", &self.addresses)
            .finish()
    }
}
