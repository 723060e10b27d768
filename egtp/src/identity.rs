use blake2::digest::consts::U20;
use blake2::{Blake2b, Digest};
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::path::Path;
use thiserror::Error;

pub const ID_SIZE: usize = 20;
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

pub(crate) type Blake2b160 = Blake2b<U20>;

/// A 20-byte digest identifying a peer, a message or a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; ID_SIZE]);

/// Message ids and session ids share the representation of peer ids.
pub type MsgId = PeerId;

impl PeerId {
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        PeerId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_SIZE] = bytes.try_into().ok()?;
        Some(PeerId(arr))
    }

    /// The digest of arbitrary data.
    pub fn digest(data: &[u8]) -> Self {
        let hash = Blake2b160::digest(data);
        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(&hash);
        PeerId(bytes)
    }

    pub fn random() -> Self {
        PeerId(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// The first four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PeerId::from_hex(&encoded).ok_or_else(|| serde::de::Error::custom("invalid 20-byte hex id"))
    }
}

/// An RSA public key used for communication security. Its canonical encoding is the big-endian modulus; the public
/// exponent is fixed.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
    id: PeerId,
}

impl PublicKey {
    pub fn from_rsa(key: RsaPublicKey) -> Self {
        let id = PeerId::digest(&key.n().to_bytes_be());
        PublicKey { key, id }
    }

    pub fn from_bytes(modulus: &[u8]) -> Result<Self, IdentityError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(&RSA_PUBLIC_EXPONENT);
        let key = RsaPublicKey::new(n, e).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(Self::from_rsa(key))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.key.n().to_bytes_be()
    }

    /// Size of the modulus in bytes. Signatures and RSA ciphertexts have exactly this length.
    pub fn size(&self) -> usize {
        self.key.size()
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.id)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// The long-lived identity of a node: a nickname for humans and the RSA key pair that its [`PeerId`] derives from.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    nickname: String,
    #[serde(serialize_with = "serialize_key", deserialize_with = "deserialize_key")]
    key: RsaPrivateKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn random_with_nickname<S: Into<String>>(nickname: S, bits: usize) -> Result<Self, IdentityError> {
        let key = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let peer_id = PublicKey::from_rsa(key.to_public_key()).id();
        Ok(NodeIdentity { nickname: nickname.into(), key, peer_id })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_rsa(self.key.to_public_key())
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), IdentityError> {
        let text = self.to_yml()?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn to_yml(&self) -> Result<String, IdentityError> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path)?;
        let identity: NodeIdentity = serde_yml::from_str(&text)?;
        Ok(identity)
    }

    /// Return an internal consistency check, that the Peer Id corresponds to the public key.
    pub fn check(&self) -> bool {
        self.peer_id == self.public_key().id()
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.nickname, self.peer_id.to_hex())
    }
}

impl Debug for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeIdentity({self})")
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.nickname == other.nickname && self.peer_id == other.peer_id && self.key == other.key
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Error reading/writing identity: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de/encoding identity: {0}")]
    Serde(#[from] serde_yml::Error),
    #[error("Invalid RSA key: {0}")]
    InvalidKey(String),
}

fn serialize_key<S>(key: &RsaPrivateKey, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let der = key.to_pkcs1_der().map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&hex::encode(der.as_bytes()))
}

fn deserialize_key<'de, D>(deserializer: D) -> Result<RsaPrivateKey, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    let bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
    RsaPrivateKey::from_pkcs1_der(&bytes).map_err(serde::de::Error::custom)
}
