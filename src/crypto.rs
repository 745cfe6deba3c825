use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use blake2::digest::consts::U32;
use blake2::Blake2b;
use ed25519_dalek::{Keypair, PublicKey as Ed25519Public, SecretKey, Signature, Signer, Verifier};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};

use crate::errors::{ChainError, ChainResult};

type Blake2b256 = Blake2b<U32>;

/// Elliptic curve identifier carried as the first byte of every key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Curve {
    Ed25519,
    P256,
    Secp256k1,
}

impl Curve {
    pub fn as_byte(self) -> u8 {
        match self {
            Curve::Ed25519 => 0,
            Curve::P256 => 1,
            Curve::Secp256k1 => 2,
        }
    }

    pub fn from_byte(byte: u8) -> ChainResult<Self> {
        match byte {
            0 => Ok(Curve::Ed25519),
            1 => Ok(Curve::P256),
            2 => Ok(Curve::Secp256k1),
            other => Err(ChainError::Crypto(format!("unknown curve id {other}"))),
        }
    }

    pub fn key_length(self) -> usize {
        match self {
            Curve::Ed25519 => 32,
            Curve::P256 | Curve::Secp256k1 => 65,
        }
    }
}

/// Family of the device that generated a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyOrigin {
    Software,
    Tpm,
    Usb,
}

impl KeyOrigin {
    pub fn as_byte(self) -> u8 {
        match self {
            KeyOrigin::Software => 0,
            KeyOrigin::Tpm => 1,
            KeyOrigin::Usb => 2,
        }
    }

    pub fn from_byte(byte: u8) -> ChainResult<Self> {
        match byte {
            0 => Ok(KeyOrigin::Software),
            1 => Ok(KeyOrigin::Tpm),
            2 => Ok(KeyOrigin::Usb),
            other => Err(ChainError::Crypto(format!("unknown key origin id {other}"))),
        }
    }
}

/// Hash algorithm identifier carried inside addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Blake2b,
}

impl HashAlgorithm {
    pub fn as_byte(self) -> u8 {
        match self {
            HashAlgorithm::Sha256 => 0,
            HashAlgorithm::Sha512 => 1,
            HashAlgorithm::Blake2b => 2,
        }
    }

    pub fn from_byte(byte: u8) -> ChainResult<Self> {
        match byte {
            0 => Ok(HashAlgorithm::Sha256),
            1 => Ok(HashAlgorithm::Sha512),
            2 => Ok(HashAlgorithm::Blake2b),
            other => Err(ChainError::Crypto(format!("unknown hash algorithm id {other}"))),
        }
    }

    pub fn digest_length(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Blake2b => 32,
        }
    }
}

pub fn hash(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        HashAlgorithm::Blake2b => Blake2b256::digest(data).to_vec(),
    }
}

/// Wire form of a public key: curve id, origin id, raw key bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey {
    pub curve: Curve,
    pub origin: KeyOrigin,
    pub key: Vec<u8>,
}

impl PublicKey {
    pub fn from_ed25519(origin: KeyOrigin, public: &Ed25519Public) -> Self {
        Self {
            curve: Curve::Ed25519,
            origin,
            key: public.to_bytes().to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + self.key.len());
        data.push(self.curve.as_byte());
        data.push(self.origin.as_byte());
        data.extend_from_slice(&self.key);
        data
    }

    /// Decodes a key from the front of `data`, returning the remaining slice.
    pub fn from_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        if data.len() < 2 {
            return Err(ChainError::Crypto("truncated public key".into()));
        }
        let curve = Curve::from_byte(data[0])?;
        let origin = KeyOrigin::from_byte(data[1])?;
        let len = curve.key_length();
        if data.len() < 2 + len {
            return Err(ChainError::Crypto("truncated public key body".into()));
        }
        let key = data[2..2 + len].to_vec();
        Ok((Self { curve, origin, key }, &data[2 + len..]))
    }

    fn ed25519(&self) -> ChainResult<Ed25519Public> {
        if self.curve != Curve::Ed25519 {
            return Err(ChainError::Crypto(format!(
                "unsupported curve {:?} for software verification",
                self.curve
            )));
        }
        Ed25519Public::from_bytes(&self.key)
            .map_err(|err| ChainError::Crypto(format!("invalid ed25519 key bytes: {err}")))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> ChainResult<()> {
        let public = self.ed25519()?;
        let signature = Signature::from_bytes(signature)
            .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))?;
        public
            .verify(message, &signature)
            .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let bytes = hex::decode(&value).map_err(D::Error::custom)?;
        let (key, rest) = PublicKey::from_bytes(&bytes).map_err(D::Error::custom)?;
        if !rest.is_empty() {
            return Err(D::Error::custom("trailing bytes after public key"));
        }
        Ok(key)
    }
}

/// Address of a transaction chain: curve id, hash algorithm id, digest of the key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub curve: Curve,
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
}

impl Address {
    pub fn from_public_key(algorithm: HashAlgorithm, public_key: &PublicKey) -> Self {
        Self {
            curve: public_key.curve,
            algorithm,
            digest: hash(algorithm, &public_key.to_bytes()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + self.digest.len());
        data.push(self.curve.as_byte());
        data.push(self.algorithm.as_byte());
        data.extend_from_slice(&self.digest);
        data
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        if data.len() < 2 {
            return Err(ChainError::Crypto("truncated address".into()));
        }
        let curve = Curve::from_byte(data[0])?;
        let algorithm = HashAlgorithm::from_byte(data[1])?;
        let len = algorithm.digest_length();
        if data.len() < 2 + len {
            return Err(ChainError::Crypto("truncated address digest".into()));
        }
        let digest = data[2..2 + len].to_vec();
        Ok((
            Self {
                curve,
                algorithm,
                digest,
            },
            &data[2 + len..],
        ))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let bytes = hex::decode(&value).map_err(D::Error::custom)?;
        let (address, rest) = Address::from_bytes(&bytes).map_err(D::Error::custom)?;
        if !rest.is_empty() {
            return Err(D::Error::custom("trailing bytes after address"));
        }
        Ok(address)
    }
}

/// This node's signing identity: the ed25519 secret together with the wire
/// public key (curve and origin prefixed) that peers know it by.
///
/// Persisted as one hex blob of `secret || prefixed_public_key`, so the
/// origin family survives restarts and a secret that no longer matches its
/// declared key is refused on load.
pub struct NodeIdentity {
    keypair: Arc<Keypair>,
    public_key: PublicKey,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate(&mut OsRng))
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let public_key = PublicKey::from_ed25519(KeyOrigin::Software, &keypair.public);
        Self {
            keypair: Arc::new(keypair),
            public_key,
        }
    }

    pub fn load_or_generate(path: &Path) -> ChainResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let raw = fs::read_to_string(path)?;
        let blob = hex::decode(raw.trim())
            .map_err(|err| ChainError::Config(format!("invalid identity encoding: {err}")))?;
        if blob.len() < 32 {
            return Err(ChainError::Config("truncated identity file".into()));
        }
        let (secret_bytes, declared_bytes) = blob.split_at(32);
        let secret = SecretKey::from_bytes(secret_bytes)
            .map_err(|err| ChainError::Config(format!("invalid identity secret: {err}")))?;
        let public = Ed25519Public::from(&secret);
        let (declared, rest) = PublicKey::from_bytes(declared_bytes)?;
        if !rest.is_empty() {
            return Err(ChainError::Config("trailing bytes in identity file".into()));
        }
        if declared.curve != Curve::Ed25519 || declared.key != public.to_bytes() {
            return Err(ChainError::Config(
                "identity public key does not match its secret".into(),
            ));
        }
        Ok(Self {
            keypair: Arc::new(Keypair { secret, public }),
            public_key: declared,
        })
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let mut blob = self.keypair.secret.to_bytes().to_vec();
        blob.extend_from_slice(&self.public_key.to_bytes());
        fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
        fs::write(path, hex::encode(blob))?;
        Ok(())
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    pub fn keypair(&self) -> Arc<Keypair> {
        Arc::clone(&self.keypair)
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).to_bytes().to_vec()
    }
}

/// Fresh random keypair for tests.
#[cfg(test)]
pub(crate) fn random_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

/// Deterministic keypair derivation: the secret is a domain-tagged digest of
/// the seed and index, so every holder of the seed reaches the same key.
pub fn derive_keypair(seed: &[u8], index: u32) -> ChainResult<Keypair> {
    let mut hasher = Sha256::new();
    hasher.update(b"arch-key-derivation");
    hasher.update(seed);
    hasher.update(index.to_be_bytes());
    let digest = hasher.finalize();
    let secret = SecretKey::from_bytes(digest.as_slice())
        .map_err(|err| ChainError::Crypto(format!("derived secret rejected: {err}")))?;
    let public = Ed25519Public::from(&secret);
    Ok(Keypair { secret, public })
}

struct KeystoreInner {
    daily: Keypair,
    storage_nonce: [u8; 32],
}

/// Holds the rotating node-shared secrets. Secret bytes never leave the
/// handle; callers get signatures and public material only. Rotation swaps
/// the whole snapshot atomically so in-flight readers keep a coherent view.
pub struct SharedKeystore {
    inner: RwLock<Arc<KeystoreInner>>,
}

impl SharedKeystore {
    pub fn new(daily_seed: &[u8], storage_nonce: [u8; 32]) -> ChainResult<Self> {
        let daily = derive_keypair(daily_seed, 0)?;
        Ok(Self {
            inner: RwLock::new(Arc::new(KeystoreInner {
                daily,
                storage_nonce,
            })),
        })
    }

    pub fn daily_sign(&self, message: &[u8]) -> Vec<u8> {
        let inner = self.inner.read().clone();
        inner.daily.sign(message).to_bytes().to_vec()
    }

    pub fn daily_public_key(&self) -> PublicKey {
        let inner = self.inner.read().clone();
        PublicKey::from_ed25519(KeyOrigin::Software, &inner.daily.public)
    }

    pub fn storage_nonce(&self) -> [u8; 32] {
        self.inner.read().storage_nonce
    }

    /// Replaces the daily keypair after a node-shared-secrets renewal.
    pub fn rotate_daily(&self, daily_seed: &[u8]) -> ChainResult<()> {
        let daily = derive_keypair(daily_seed, 0)?;
        let storage_nonce = self.inner.read().storage_nonce;
        let next = Arc::new(KeystoreInner {
            daily,
            storage_nonce,
        });
        *self.inner.write() = next;
        Ok(())
    }
}

/// Globally known origin public keys, the proof-of-work candidate set.
/// Read-mostly; replaced wholesale when the origin chain grows.
pub struct OriginKeySet {
    keys: RwLock<Vec<PublicKey>>,
}

impl OriginKeySet {
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    pub fn snapshot(&self) -> Vec<PublicKey> {
        self.keys.read().clone()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.read().iter().any(|known| known == key)
    }

    pub fn replace(&self, keys: Vec<PublicKey>) {
        *self.keys.write() = keys;
    }
}
