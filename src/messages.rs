//! Wire messages exchanged during mining. Every frame is a `u32` big-endian
//! length, a one-byte type tag, then the declared payload. Encoding and
//! decoding are exact inverses for every variant.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{Address, PublicKey};
use crate::errors::{ChainError, ChainResult};
use crate::types::{BitVector, CrossValidationStamp, Transaction, ValidationStamp};

/// Availability context reported by one cross-validator to the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MiningContext {
    pub validation_node_public_key: PublicKey,
    pub previous_storage_nodes: Vec<PublicKey>,
    pub cross_validation_nodes_view: BitVector,
    pub chain_storage_nodes_view: BitVector,
    pub beacon_storage_nodes_view: BitVector,
    pub io_storage_nodes_view: BitVector,
}

impl MiningContext {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.validation_node_public_key.to_bytes());
        codec::put_u8(out, self.previous_storage_nodes.len() as u8);
        for key in &self.previous_storage_nodes {
            out.extend_from_slice(&key.to_bytes());
        }
        out.extend_from_slice(&self.cross_validation_nodes_view.to_bytes());
        out.extend_from_slice(&self.chain_storage_nodes_view.to_bytes());
        out.extend_from_slice(&self.beacon_storage_nodes_view.to_bytes());
        out.extend_from_slice(&self.io_storage_nodes_view.to_bytes());
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (validation_node_public_key, rest) = PublicKey::from_bytes(data)?;
        let (count, mut rest) = codec::take_u8(rest)?;
        let mut previous_storage_nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (key, tail) = PublicKey::from_bytes(rest)?;
            previous_storage_nodes.push(key);
            rest = tail;
        }
        let (cross_validation_nodes_view, rest) = BitVector::from_bytes(rest)?;
        let (chain_storage_nodes_view, rest) = BitVector::from_bytes(rest)?;
        let (beacon_storage_nodes_view, rest) = BitVector::from_bytes(rest)?;
        let (io_storage_nodes_view, rest) = BitVector::from_bytes(rest)?;
        Ok((
            Self {
                validation_node_public_key,
                previous_storage_nodes,
                cross_validation_nodes_view,
                chain_storage_nodes_view,
                beacon_storage_nodes_view,
                io_storage_nodes_view,
            },
            rest,
        ))
    }
}

/// One bit row per validator, for each storage domain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTrees {
    pub chain: Vec<BitVector>,
    pub beacon: Vec<BitVector>,
    pub io: Vec<BitVector>,
}

impl ReplicationTrees {
    fn write_rows(out: &mut Vec<u8>, rows: &[BitVector]) {
        codec::put_u8(out, rows.len() as u8);
        for row in rows {
            out.extend_from_slice(&row.to_bytes());
        }
    }

    fn read_rows(data: &[u8]) -> ChainResult<(Vec<BitVector>, &[u8])> {
        let (count, mut rest) = codec::take_u8(data)?;
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (row, tail) = BitVector::from_bytes(rest)?;
            rows.push(row);
            rest = tail;
        }
        Ok((rows, rest))
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        Self::write_rows(out, &self.chain);
        Self::write_rows(out, &self.beacon);
        Self::write_rows(out, &self.io);
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (chain, rest) = Self::read_rows(data)?;
        let (beacon, rest) = Self::read_rows(rest)?;
        let (io, rest) = Self::read_rows(rest)?;
        Ok((Self { chain, beacon, io }, rest))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    NetworkIssue,
    InvalidTransaction,
    TransactionAlreadyExists,
}

impl ErrorReason {
    fn as_byte(self) -> u8 {
        match self {
            ErrorReason::NetworkIssue => 0,
            ErrorReason::InvalidTransaction => 1,
            ErrorReason::TransactionAlreadyExists => 2,
        }
    }

    fn from_byte(byte: u8) -> ChainResult<Self> {
        Ok(match byte {
            0 => ErrorReason::NetworkIssue,
            1 => ErrorReason::InvalidTransaction,
            2 => ErrorReason::TransactionAlreadyExists,
            other => {
                return Err(ChainError::Crypto(format!("unknown error reason {other}")));
            }
        })
    }
}

/// The mining subset of the protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    StartMining {
        transaction: Transaction,
        welcome_node_public_key: PublicKey,
        validation_node_public_keys: Vec<PublicKey>,
    },
    AddMiningContext {
        address: Address,
        context: MiningContext,
    },
    CrossValidate {
        address: Address,
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTrees,
        confirmed_validation_nodes: BitVector,
    },
    CrossValidationDone {
        address: Address,
        cross_validation_stamp: CrossValidationStamp,
    },
    ReplicateTransactionChain {
        transaction: Transaction,
    },
    ReplicateTransaction {
        transaction: Transaction,
    },
    AcknowledgeStorage {
        address: Address,
        node_public_key: PublicKey,
        signature: Vec<u8>,
    },
    Error {
        reason: ErrorReason,
        address: Address,
    },
    Ok,
}

impl Message {
    fn type_tag(&self) -> u8 {
        match self {
            Message::StartMining { .. } => 0,
            Message::AddMiningContext { .. } => 1,
            Message::CrossValidate { .. } => 2,
            Message::CrossValidationDone { .. } => 3,
            Message::ReplicateTransactionChain { .. } => 4,
            Message::ReplicateTransaction { .. } => 5,
            Message::AcknowledgeStorage { .. } => 6,
            Message::Error { .. } => 7,
            Message::Ok => 8,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u8(&mut payload, self.type_tag());
        match self {
            Message::StartMining {
                transaction,
                welcome_node_public_key,
                validation_node_public_keys,
            } => {
                let tx_bytes = transaction.to_bytes();
                codec::put_bytes(&mut payload, &tx_bytes);
                payload.extend_from_slice(&welcome_node_public_key.to_bytes());
                codec::put_u8(&mut payload, validation_node_public_keys.len() as u8);
                for key in validation_node_public_keys {
                    payload.extend_from_slice(&key.to_bytes());
                }
            }
            Message::AddMiningContext { address, context } => {
                payload.extend_from_slice(&address.to_bytes());
                context.write_bytes(&mut payload);
            }
            Message::CrossValidate {
                address,
                validation_stamp,
                replication_tree,
                confirmed_validation_nodes,
            } => {
                payload.extend_from_slice(&address.to_bytes());
                let stamp_bytes = validation_stamp.to_bytes();
                codec::put_bytes(&mut payload, &stamp_bytes);
                replication_tree.write_bytes(&mut payload);
                payload.extend_from_slice(&confirmed_validation_nodes.to_bytes());
            }
            Message::CrossValidationDone {
                address,
                cross_validation_stamp,
            } => {
                payload.extend_from_slice(&address.to_bytes());
                let stamp_bytes = cross_validation_stamp.to_bytes();
                codec::put_bytes(&mut payload, &stamp_bytes);
            }
            Message::ReplicateTransactionChain { transaction }
            | Message::ReplicateTransaction { transaction } => {
                let tx_bytes = transaction.to_bytes();
                codec::put_bytes(&mut payload, &tx_bytes);
            }
            Message::AcknowledgeStorage {
                address,
                node_public_key,
                signature,
            } => {
                payload.extend_from_slice(&address.to_bytes());
                payload.extend_from_slice(&node_public_key.to_bytes());
                codec::put_bytes(&mut payload, signature);
            }
            Message::Error { reason, address } => {
                codec::put_u8(&mut payload, reason.as_byte());
                payload.extend_from_slice(&address.to_bytes());
            }
            Message::Ok => {}
        }
        let mut framed = Vec::with_capacity(4 + payload.len());
        codec::put_u32(&mut framed, payload.len() as u32);
        framed.extend_from_slice(&payload);
        framed
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let (payload, rest) = codec::take_bytes(data)?;
        if !rest.is_empty() {
            return Err(ChainError::Crypto("trailing bytes after message".into()));
        }
        let (tag, body) = codec::take_u8(&payload)?;
        let message = match tag {
            0 => {
                let (tx_bytes, rest) = codec::take_bytes(body)?;
                let (transaction, tail) = Transaction::from_bytes(&tx_bytes)?;
                if !tail.is_empty() {
                    return Err(ChainError::Crypto("trailing transaction bytes".into()));
                }
                let (welcome_node_public_key, rest) = PublicKey::from_bytes(rest)?;
                let (count, mut rest) = codec::take_u8(rest)?;
                let mut validation_node_public_keys = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (key, tail) = PublicKey::from_bytes(rest)?;
                    validation_node_public_keys.push(key);
                    rest = tail;
                }
                Self::ensure_drained(rest)?;
                Message::StartMining {
                    transaction,
                    welcome_node_public_key,
                    validation_node_public_keys,
                }
            }
            1 => {
                let (address, rest) = Address::from_bytes(body)?;
                let (context, rest) = MiningContext::read_bytes(rest)?;
                Self::ensure_drained(rest)?;
                Message::AddMiningContext { address, context }
            }
            2 => {
                let (address, rest) = Address::from_bytes(body)?;
                let (stamp_bytes, rest) = codec::take_bytes(rest)?;
                let validation_stamp = ValidationStamp::from_bytes(&stamp_bytes)?;
                let (replication_tree, rest) = ReplicationTrees::read_bytes(rest)?;
                let (confirmed_validation_nodes, rest) = BitVector::from_bytes(rest)?;
                Self::ensure_drained(rest)?;
                Message::CrossValidate {
                    address,
                    validation_stamp,
                    replication_tree,
                    confirmed_validation_nodes,
                }
            }
            3 => {
                let (address, rest) = Address::from_bytes(body)?;
                let (stamp_bytes, rest) = codec::take_bytes(rest)?;
                let cross_validation_stamp = CrossValidationStamp::from_bytes(&stamp_bytes)?;
                Self::ensure_drained(rest)?;
                Message::CrossValidationDone {
                    address,
                    cross_validation_stamp,
                }
            }
            4 | 5 => {
                let (tx_bytes, rest) = codec::take_bytes(body)?;
                let (transaction, tail) = Transaction::from_bytes(&tx_bytes)?;
                if !tail.is_empty() {
                    return Err(ChainError::Crypto("trailing transaction bytes".into()));
                }
                Self::ensure_drained(rest)?;
                if tag == 4 {
                    Message::ReplicateTransactionChain { transaction }
                } else {
                    Message::ReplicateTransaction { transaction }
                }
            }
            6 => {
                let (address, rest) = Address::from_bytes(body)?;
                let (node_public_key, rest) = PublicKey::from_bytes(rest)?;
                let (signature, rest) = codec::take_bytes(rest)?;
                Self::ensure_drained(rest)?;
                Message::AcknowledgeStorage {
                    address,
                    node_public_key,
                    signature,
                }
            }
            7 => {
                let (reason_byte, rest) = codec::take_u8(body)?;
                let reason = ErrorReason::from_byte(reason_byte)?;
                let (address, rest) = Address::from_bytes(rest)?;
                Self::ensure_drained(rest)?;
                Message::Error { reason, address }
            }
            8 => {
                Self::ensure_drained(body)?;
                Message::Ok
            }
            other => {
                return Err(ChainError::Crypto(format!("unknown message tag {other}")));
            }
        };
        Ok(message)
    }

    fn ensure_drained(rest: &[u8]) -> ChainResult<()> {
        if rest.is_empty() {
            Ok(())
        } else {
            Err(ChainError::Crypto("trailing bytes in message payload".into()))
        }
    }
}
