use ed25519_dalek::{Keypair, Signer};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{self, Address, HashAlgorithm, KeyOrigin, PublicKey};
use crate::errors::{ChainError, ChainResult};
use crate::types::stamp::{CrossValidationStamp, ValidationStamp};

/// Closed set of transaction classes. Network types drive the protocol
/// itself; the rest are user chains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Transfer,
    Token,
    Node,
    NodeSharedSecrets,
    Oracle,
    OracleSummary,
    MintRewards,
    NodeRewards,
    CodeProposal,
    CodeApproval,
    Keychain,
    KeychainAccess,
    Beacon,
    Origin,
}

impl TransactionType {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionType::Transfer => 0,
            TransactionType::Token => 1,
            TransactionType::Node => 2,
            TransactionType::NodeSharedSecrets => 3,
            TransactionType::Oracle => 4,
            TransactionType::OracleSummary => 5,
            TransactionType::MintRewards => 6,
            TransactionType::NodeRewards => 7,
            TransactionType::CodeProposal => 8,
            TransactionType::CodeApproval => 9,
            TransactionType::Keychain => 10,
            TransactionType::KeychainAccess => 11,
            TransactionType::Beacon => 12,
            TransactionType::Origin => 13,
        }
    }

    pub fn from_byte(byte: u8) -> ChainResult<Self> {
        Ok(match byte {
            0 => TransactionType::Transfer,
            1 => TransactionType::Token,
            2 => TransactionType::Node,
            3 => TransactionType::NodeSharedSecrets,
            4 => TransactionType::Oracle,
            5 => TransactionType::OracleSummary,
            6 => TransactionType::MintRewards,
            7 => TransactionType::NodeRewards,
            8 => TransactionType::CodeProposal,
            9 => TransactionType::CodeApproval,
            10 => TransactionType::Keychain,
            11 => TransactionType::KeychainAccess,
            12 => TransactionType::Beacon,
            13 => TransactionType::Origin,
            other => {
                return Err(ChainError::Crypto(format!(
                    "unknown transaction type {other}"
                )));
            }
        })
    }

    /// Network chains are singletons rooted at a recognized genesis address.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            TransactionType::Node
                | TransactionType::NodeSharedSecrets
                | TransactionType::Oracle
                | TransactionType::OracleSummary
                | TransactionType::MintRewards
                | TransactionType::NodeRewards
                | TransactionType::CodeProposal
                | TransactionType::CodeApproval
                | TransactionType::Origin
        )
    }
}

/// Grants a set of public keys the ability to recover `secret`: each entry
/// carries the secret's AES key encrypted for that public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub secret: Vec<u8>,
    pub authorized_keys: Vec<AuthorizedKey>,
}

impl Ownership {
    pub fn authorizes(&self, public_key: &PublicKey) -> bool {
        self.authorized_keys
            .iter()
            .any(|entry| &entry.public_key == public_key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedKey {
    pub public_key: PublicKey,
    pub encrypted_secret_key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UcoTransfer {
    pub to: Address,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub to: Address,
    pub amount: u64,
    pub token_address: Address,
    pub token_id: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerContent {
    pub uco: Vec<UcoTransfer>,
    pub token: Vec<TokenTransfer>,
}

impl LedgerContent {
    pub fn movement_count(&self) -> usize {
        self.uco.len() + self.token.len()
    }

    pub fn uco_total(&self) -> u64 {
        self.uco
            .iter()
            .fold(0u64, |acc, transfer| acc.saturating_add(transfer.amount))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub content: Vec<u8>,
    pub code: String,
    pub ownerships: Vec<Ownership>,
    pub ledger: LedgerContent,
    pub recipients: Vec<Address>,
}

impl TransactionData {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        codec::put_bytes(out, &self.content);
        codec::put_bytes(out, self.code.as_bytes());
        codec::put_u8(out, self.ownerships.len() as u8);
        for ownership in &self.ownerships {
            codec::put_bytes(out, &ownership.secret);
            codec::put_u8(out, ownership.authorized_keys.len() as u8);
            for entry in &ownership.authorized_keys {
                out.extend_from_slice(&entry.public_key.to_bytes());
                codec::put_bytes(out, &entry.encrypted_secret_key);
            }
        }
        codec::put_u8(out, self.ledger.uco.len() as u8);
        for transfer in &self.ledger.uco {
            out.extend_from_slice(&transfer.to.to_bytes());
            codec::put_u64(out, transfer.amount);
        }
        codec::put_u8(out, self.ledger.token.len() as u8);
        for transfer in &self.ledger.token {
            out.extend_from_slice(&transfer.token_address.to_bytes());
            out.extend_from_slice(&transfer.to.to_bytes());
            codec::put_u64(out, transfer.amount);
            codec::put_u64(out, transfer.token_id);
        }
        codec::put_u8(out, self.recipients.len() as u8);
        for recipient in &self.recipients {
            out.extend_from_slice(&recipient.to_bytes());
        }
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (content, rest) = codec::take_bytes(data)?;
        let (code_bytes, rest) = codec::take_bytes(rest)?;
        let code = String::from_utf8(code_bytes)
            .map_err(|err| ChainError::Crypto(format!("invalid code encoding: {err}")))?;
        let (ownership_count, mut rest) = codec::take_u8(rest)?;
        let mut ownerships = Vec::with_capacity(ownership_count as usize);
        for _ in 0..ownership_count {
            let (secret, tail) = codec::take_bytes(rest)?;
            let (key_count, mut tail) = codec::take_u8(tail)?;
            let mut authorized_keys = Vec::with_capacity(key_count as usize);
            for _ in 0..key_count {
                let (public_key, next) = PublicKey::from_bytes(tail)?;
                let (encrypted_secret_key, next) = codec::take_bytes(next)?;
                authorized_keys.push(AuthorizedKey {
                    public_key,
                    encrypted_secret_key,
                });
                tail = next;
            }
            ownerships.push(Ownership {
                secret,
                authorized_keys,
            });
            rest = tail;
        }
        let (uco_count, mut rest) = codec::take_u8(rest)?;
        let mut uco = Vec::with_capacity(uco_count as usize);
        for _ in 0..uco_count {
            let (to, tail) = Address::from_bytes(rest)?;
            let (amount, tail) = codec::take_u64(tail)?;
            uco.push(UcoTransfer { to, amount });
            rest = tail;
        }
        let (token_count, mut rest) = codec::take_u8(rest)?;
        let mut token = Vec::with_capacity(token_count as usize);
        for _ in 0..token_count {
            let (token_address, tail) = Address::from_bytes(rest)?;
            let (to, tail) = Address::from_bytes(tail)?;
            let (amount, tail) = codec::take_u64(tail)?;
            let (token_id, tail) = codec::take_u64(tail)?;
            token.push(TokenTransfer {
                to,
                amount,
                token_address,
                token_id,
            });
            rest = tail;
        }
        let (recipient_count, mut rest) = codec::take_u8(rest)?;
        let mut recipients = Vec::with_capacity(recipient_count as usize);
        for _ in 0..recipient_count {
            let (recipient, tail) = Address::from_bytes(rest)?;
            recipients.push(recipient);
            rest = tail;
        }
        Ok((
            Self {
                content,
                code,
                ownerships,
                ledger: LedgerContent { uco, token },
                recipients,
            },
            rest,
        ))
    }
}

/// A transaction on a rotating-key chain. Immutable once origin-signed;
/// `validation_stamp` and `cross_validation_stamps` are attached by mining.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub address: Address,
    pub tx_type: TransactionType,
    pub data: TransactionData,
    pub timestamp: u64,
    pub previous_public_key: PublicKey,
    pub previous_signature: Vec<u8>,
    pub origin_signature: Vec<u8>,
    pub validation_stamp: Option<ValidationStamp>,
    pub cross_validation_stamps: Vec<CrossValidationStamp>,
}

impl Transaction {
    /// Builds and signs a transaction. The address commits to the chain's
    /// next rotation: it is the digest of `next_public_key`, so the successor
    /// transaction links back here by revealing that key as its
    /// `previous_public_key`.
    pub fn build(
        tx_type: TransactionType,
        data: TransactionData,
        timestamp: u64,
        previous_keypair: &Keypair,
        next_public_key: &PublicKey,
        origin_keypair: &Keypair,
    ) -> Self {
        let previous_public_key =
            PublicKey::from_ed25519(KeyOrigin::Software, &previous_keypair.public);
        let address = Address::from_public_key(HashAlgorithm::Sha256, next_public_key);
        let mut tx = Self {
            address,
            tx_type,
            data,
            timestamp,
            previous_public_key,
            previous_signature: Vec::new(),
            origin_signature: Vec::new(),
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        };
        tx.previous_signature = previous_keypair.sign(&tx.pending_bytes()).to_bytes().to_vec();
        tx.origin_signature = origin_keypair.sign(&tx.extended_bytes()).to_bytes().to_vec();
        tx
    }

    /// Stable binary form covered by `previous_signature`.
    pub fn pending_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.address.to_bytes());
        codec::put_u8(&mut out, self.tx_type.as_byte());
        codec::put_u64(&mut out, self.timestamp);
        self.data.write_bytes(&mut out);
        out.extend_from_slice(&self.previous_public_key.to_bytes());
        out
    }

    /// Pending form plus the previous signature, covered by `origin_signature`.
    pub fn extended_bytes(&self) -> Vec<u8> {
        let mut out = self.pending_bytes();
        out.extend_from_slice(&self.previous_signature);
        out
    }

    pub fn verify_previous_signature(&self) -> ChainResult<()> {
        self.previous_public_key
            .verify(&self.pending_bytes(), &self.previous_signature)
    }

    /// Address of the predecessor on the chain: the digest of the revealed
    /// previous public key, under the algorithm this address declares. At
    /// chain genesis no stored transaction carries it and lookups resolve it
    /// to itself.
    pub fn previous_address(&self) -> Address {
        Address::from_public_key(self.address.algorithm, &self.previous_public_key)
    }

    /// Chain integrity proof: digest of the pending form chained onto the
    /// predecessor's proof, or of the pending form alone at genesis.
    pub fn proof_of_integrity(&self, previous: Option<&[u8]>) -> Vec<u8> {
        let mut data = self.pending_bytes();
        if let Some(previous) = previous {
            data.extend_from_slice(previous);
        }
        crypto::hash(HashAlgorithm::Sha256, &data)
    }

    /// Full record codec, stamps included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.pending_bytes();
        codec::put_bytes(&mut out, &self.previous_signature);
        codec::put_bytes(&mut out, &self.origin_signature);
        match &self.validation_stamp {
            Some(stamp) => {
                codec::put_u8(&mut out, 1);
                let stamp_bytes = stamp.to_bytes();
                codec::put_bytes(&mut out, &stamp_bytes);
            }
            None => codec::put_u8(&mut out, 0),
        }
        codec::put_u8(&mut out, self.cross_validation_stamps.len() as u8);
        for stamp in &self.cross_validation_stamps {
            let stamp_bytes = stamp.to_bytes();
            codec::put_bytes(&mut out, &stamp_bytes);
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (address, rest) = Address::from_bytes(data)?;
        let (type_byte, rest) = codec::take_u8(rest)?;
        let tx_type = TransactionType::from_byte(type_byte)?;
        let (timestamp, rest) = codec::take_u64(rest)?;
        let (tx_data, rest) = TransactionData::read_bytes(rest)?;
        let (previous_public_key, rest) = PublicKey::from_bytes(rest)?;
        let (previous_signature, rest) = codec::take_bytes(rest)?;
        let (origin_signature, rest) = codec::take_bytes(rest)?;
        let (stamp_flag, rest) = codec::take_u8(rest)?;
        let (validation_stamp, rest) = if stamp_flag == 1 {
            let (stamp_bytes, rest) = codec::take_bytes(rest)?;
            let stamp = ValidationStamp::from_bytes(&stamp_bytes)?;
            (Some(stamp), rest)
        } else {
            (None, rest)
        };
        let (stamp_count, mut rest) = codec::take_u8(rest)?;
        let mut cross_validation_stamps = Vec::with_capacity(stamp_count as usize);
        for _ in 0..stamp_count {
            let (stamp_bytes, tail) = codec::take_bytes(rest)?;
            cross_validation_stamps.push(CrossValidationStamp::from_bytes(&stamp_bytes)?);
            rest = tail;
        }
        Ok((
            Self {
                address,
                tx_type,
                data: tx_data,
                timestamp,
                previous_public_key,
                previous_signature,
                origin_signature,
                validation_stamp,
                cross_validation_stamps,
            },
            rest,
        ))
    }
}

/// One-off transaction signed with fresh keys, for tests across the crate.
#[cfg(test)]
pub(crate) fn test_transaction(
    tx_type: TransactionType,
    data: TransactionData,
    timestamp: u64,
) -> Transaction {
    use crate::crypto::random_keypair;

    let previous = random_keypair();
    let next = random_keypair();
    let origin = random_keypair();
    Transaction::build(
        tx_type,
        data,
        timestamp,
        &previous,
        &PublicKey::from_ed25519(KeyOrigin::Software, &next.public),
        &origin,
    )
}

/// Rotating-key chain for tests: each call reveals the key committed by the
/// prior transaction's address.
#[cfg(test)]
pub(crate) struct TestChain {
    seed: Vec<u8>,
    index: u32,
}

#[cfg(test)]
impl TestChain {
    pub(crate) fn new(seed: &[u8]) -> Self {
        Self {
            seed: seed.to_vec(),
            index: 0,
        }
    }

    pub(crate) fn next_transaction(
        &mut self,
        tx_type: TransactionType,
        data: TransactionData,
        timestamp: u64,
        origin_keypair: &Keypair,
    ) -> Transaction {
        let previous = crate::crypto::derive_keypair(&self.seed, self.index).unwrap();
        let next = crate::crypto::derive_keypair(&self.seed, self.index + 1).unwrap();
        self.index += 1;
        Transaction::build(
            tx_type,
            data,
            timestamp,
            &previous,
            &PublicKey::from_ed25519(KeyOrigin::Software, &next.public),
            origin_keypair,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_keypair;

    fn transfer_data(to: Address, amount: u64) -> TransactionData {
        TransactionData {
            ledger: LedgerContent {
                uco: vec![UcoTransfer { to, amount }],
                token: Vec::new(),
            },
            ..TransactionData::default()
        }
    }

    fn some_address(tag: u8) -> Address {
        let keypair = derive_tagged(tag);
        let public = PublicKey::from_ed25519(KeyOrigin::Software, &keypair.public);
        Address::from_public_key(HashAlgorithm::Sha256, &public)
    }

    fn derive_tagged(tag: u8) -> Keypair {
        crate::crypto::derive_keypair(&[tag], 0).unwrap()
    }

    #[test]
    fn pending_signature_verifies() {
        let tx = test_transaction(
            TransactionType::Transfer,
            transfer_data(some_address(1), 1_000),
            1_700_000,
        );
        tx.verify_previous_signature().unwrap();
    }

    #[test]
    fn tampering_breaks_previous_signature() {
        let mut tx = test_transaction(
            TransactionType::Transfer,
            transfer_data(some_address(1), 1_000),
            1_700_000,
        );
        tx.data.ledger.uco[0].amount = 2_000;
        assert!(tx.verify_previous_signature().is_err());
    }

    #[test]
    fn chain_addresses_link_through_previous_keys() {
        let origin = random_keypair();
        let mut chain = TestChain::new(b"chain-seed");
        let first = chain.next_transaction(
            TransactionType::Transfer,
            TransactionData::default(),
            1_000,
            &origin,
        );
        let second = chain.next_transaction(
            TransactionType::Transfer,
            TransactionData::default(),
            2_000,
            &origin,
        );
        // The key revealed by the successor is the one the predecessor's
        // address committed to.
        assert_eq!(second.previous_address(), first.address);
        assert_ne!(second.address, first.address);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn record_round_trips_through_bytes() {
        let owner = random_keypair();
        let data = TransactionData {
            content: b"hello chain".to_vec(),
            code: String::new(),
            ownerships: vec![Ownership {
                secret: vec![1, 2, 3],
                authorized_keys: vec![AuthorizedKey {
                    public_key: PublicKey::from_ed25519(KeyOrigin::Software, &owner.public),
                    encrypted_secret_key: vec![9; 48],
                }],
            }],
            ledger: LedgerContent {
                uco: vec![UcoTransfer {
                    to: some_address(2),
                    amount: 42,
                }],
                token: vec![TokenTransfer {
                    to: some_address(3),
                    amount: 5,
                    token_address: some_address(4),
                    token_id: 1,
                }],
            },
            recipients: vec![some_address(5)],
        };
        let tx = test_transaction(TransactionType::Transfer, data, 1_700_000);
        let bytes = tx.to_bytes();
        let (decoded, rest) = Transaction::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, tx);
    }

    #[test]
    fn proof_of_integrity_chains() {
        let genesis =
            test_transaction(TransactionType::Transfer, TransactionData::default(), 1_000);
        let genesis_poi = genesis.proof_of_integrity(None);
        assert_eq!(
            genesis_poi,
            crypto::hash(HashAlgorithm::Sha256, &genesis.pending_bytes())
        );

        let next =
            test_transaction(TransactionType::Transfer, TransactionData::default(), 2_000);
        let chained = next.proof_of_integrity(Some(&genesis_poi));
        let mut expected_input = next.pending_bytes();
        expected_input.extend_from_slice(&genesis_poi);
        assert_eq!(
            chained,
            crypto::hash(HashAlgorithm::Sha256, &expected_input)
        );
    }
}
