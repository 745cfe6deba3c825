use ed25519_dalek::{Keypair, Signer};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{Address, KeyOrigin, PublicKey, SharedKeystore};
use crate::errors::{ChainError, ChainResult};

pub const PROTOCOL_VERSION: u32 = 1;

/// Kind of value held by an unspent output or movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UtxoKind {
    Uco,
    Token { token_address: Address, token_id: u64 },
}

impl UtxoKind {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        match self {
            UtxoKind::Uco => codec::put_u8(out, 0),
            UtxoKind::Token {
                token_address,
                token_id,
            } => {
                codec::put_u8(out, 1);
                out.extend_from_slice(&token_address.to_bytes());
                codec::put_u64(out, *token_id);
            }
        }
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (tag, rest) = codec::take_u8(data)?;
        match tag {
            0 => Ok((UtxoKind::Uco, rest)),
            1 => {
                let (token_address, rest) = Address::from_bytes(rest)?;
                let (token_id, rest) = codec::take_u64(rest)?;
                Ok((
                    UtxoKind::Token {
                        token_address,
                        token_id,
                    },
                    rest,
                ))
            }
            other => Err(ChainError::Crypto(format!("unknown utxo kind {other}"))),
        }
    }
}

/// Value spendable by the chain at `from`, in 10^-8 units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub from: Address,
    pub amount: u64,
    pub kind: UtxoKind,
    pub timestamp: u64,
}

impl UnspentOutput {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.from.to_bytes());
        codec::put_u64(out, self.amount);
        self.kind.write_bytes(out);
        codec::put_u64(out, self.timestamp);
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (from, rest) = Address::from_bytes(data)?;
        let (amount, rest) = codec::take_u64(rest)?;
        let (kind, rest) = UtxoKind::read_bytes(rest)?;
        let (timestamp, rest) = codec::take_u64(rest)?;
        Ok((
            Self {
                from,
                amount,
                kind,
                timestamp,
            },
            rest,
        ))
    }
}

/// Post-validation movement towards a resolved recipient address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMovement {
    pub to: Address,
    pub amount: u64,
    pub kind: UtxoKind,
}

impl TransactionMovement {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to.to_bytes());
        codec::put_u64(out, self.amount);
        self.kind.write_bytes(out);
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (to, rest) = Address::from_bytes(data)?;
        let (amount, rest) = codec::take_u64(rest)?;
        let (kind, rest) = UtxoKind::read_bytes(rest)?;
        Ok((Self { to, amount, kind }, rest))
    }
}

/// Fee, movements and the successor UTXO set computed during validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOperations {
    pub fee: u64,
    pub transaction_movements: Vec<TransactionMovement>,
    pub unspent_outputs: Vec<UnspentOutput>,
}

impl LedgerOperations {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        codec::put_u64(out, self.fee);
        codec::put_u8(out, self.transaction_movements.len() as u8);
        for movement in &self.transaction_movements {
            movement.write_bytes(out);
        }
        codec::put_u8(out, self.unspent_outputs.len() as u8);
        for utxo in &self.unspent_outputs {
            utxo.write_bytes(out);
        }
    }

    fn read_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (fee, rest) = codec::take_u64(data)?;
        let (movement_count, mut rest) = codec::take_u8(rest)?;
        let mut transaction_movements = Vec::with_capacity(movement_count as usize);
        for _ in 0..movement_count {
            let (movement, tail) = TransactionMovement::read_bytes(rest)?;
            transaction_movements.push(movement);
            rest = tail;
        }
        let (utxo_count, mut rest) = codec::take_u8(rest)?;
        let mut unspent_outputs = Vec::with_capacity(utxo_count as usize);
        for _ in 0..utxo_count {
            let (utxo, tail) = UnspentOutput::read_bytes(rest)?;
            unspent_outputs.push(utxo);
            rest = tail;
        }
        Ok((
            Self {
                fee,
                transaction_movements,
                unspent_outputs,
            },
            rest,
        ))
    }
}

/// Seal produced by the coordinator. The signature is made with the daily
/// node-shared-secret key over every field but itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationStamp {
    pub timestamp: u64,
    pub protocol_version: u32,
    pub proof_of_work: Option<PublicKey>,
    pub proof_of_integrity: Vec<u8>,
    pub proof_of_election: Vec<u8>,
    pub ledger_operations: LedgerOperations,
    pub recipients: Vec<Address>,
    pub signature: Vec<u8>,
}

impl ValidationStamp {
    pub fn message_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::put_u64(&mut out, self.timestamp);
        codec::put_u32(&mut out, self.protocol_version);
        match &self.proof_of_work {
            Some(key) => {
                codec::put_u8(&mut out, 1);
                out.extend_from_slice(&key.to_bytes());
            }
            None => codec::put_u8(&mut out, 0),
        }
        codec::put_bytes(&mut out, &self.proof_of_integrity);
        codec::put_bytes(&mut out, &self.proof_of_election);
        self.ledger_operations.write_bytes(&mut out);
        codec::put_u8(&mut out, self.recipients.len() as u8);
        for recipient in &self.recipients {
            out.extend_from_slice(&recipient.to_bytes());
        }
        out
    }

    pub fn sign(&mut self, keystore: &SharedKeystore) {
        self.signature = keystore.daily_sign(&self.message_bytes());
    }

    pub fn verify(&self, coordinator_daily_key: &PublicKey) -> ChainResult<()> {
        coordinator_daily_key.verify(&self.message_bytes(), &self.signature)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.message_bytes();
        codec::put_bytes(&mut out, &self.signature);
        out
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let (timestamp, rest) = codec::take_u64(data)?;
        let (protocol_version, rest) = codec::take_u32(rest)?;
        let (pow_flag, rest) = codec::take_u8(rest)?;
        let (proof_of_work, rest) = if pow_flag == 1 {
            let (key, rest) = PublicKey::from_bytes(rest)?;
            (Some(key), rest)
        } else {
            (None, rest)
        };
        let (proof_of_integrity, rest) = codec::take_bytes(rest)?;
        let (proof_of_election, rest) = codec::take_bytes(rest)?;
        let (ledger_operations, rest) = LedgerOperations::read_bytes(rest)?;
        let (recipient_count, mut rest) = codec::take_u8(rest)?;
        let mut recipients = Vec::with_capacity(recipient_count as usize);
        for _ in 0..recipient_count {
            let (recipient, tail) = Address::from_bytes(rest)?;
            recipients.push(recipient);
            rest = tail;
        }
        let (signature, rest) = codec::take_bytes(rest)?;
        if !rest.is_empty() {
            return Err(ChainError::Crypto(
                "trailing bytes after validation stamp".into(),
            ));
        }
        Ok(Self {
            timestamp,
            protocol_version,
            proof_of_work,
            proof_of_integrity,
            proof_of_election,
            ledger_operations,
            recipients,
            signature,
        })
    }
}

/// Disagreement a cross-validator can report against a stamp field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconsistencyKind {
    Timestamp,
    ProofOfWork,
    ProofOfIntegrity,
    TransactionFee,
    TransactionMovements,
    UnspentOutputs,
    Signature,
    ReplicationTree,
}

impl InconsistencyKind {
    pub fn as_byte(self) -> u8 {
        match self {
            InconsistencyKind::Timestamp => 0,
            InconsistencyKind::ProofOfWork => 1,
            InconsistencyKind::ProofOfIntegrity => 2,
            InconsistencyKind::TransactionFee => 3,
            InconsistencyKind::TransactionMovements => 4,
            InconsistencyKind::UnspentOutputs => 5,
            InconsistencyKind::Signature => 6,
            InconsistencyKind::ReplicationTree => 7,
        }
    }

    pub fn from_byte(byte: u8) -> ChainResult<Self> {
        Ok(match byte {
            0 => InconsistencyKind::Timestamp,
            1 => InconsistencyKind::ProofOfWork,
            2 => InconsistencyKind::ProofOfIntegrity,
            3 => InconsistencyKind::TransactionFee,
            4 => InconsistencyKind::TransactionMovements,
            5 => InconsistencyKind::UnspentOutputs,
            6 => InconsistencyKind::Signature,
            7 => InconsistencyKind::ReplicationTree,
            other => {
                return Err(ChainError::Crypto(format!(
                    "unknown inconsistency kind {other}"
                )));
            }
        })
    }
}

/// Counter-signature of a committee member over the coordinator's stamp and
/// the member's own findings. Empty findings mean agreement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationStamp {
    pub node_public_key: PublicKey,
    pub signature: Vec<u8>,
    pub inconsistencies: Vec<InconsistencyKind>,
}

impl CrossValidationStamp {
    pub fn signed_payload(
        stamp: &ValidationStamp,
        inconsistencies: &[InconsistencyKind],
    ) -> Vec<u8> {
        let mut out = stamp.to_bytes();
        for kind in inconsistencies {
            out.push(kind.as_byte());
        }
        out
    }

    /// Counter-signs with the validator's own node key, so each committee
    /// member's stamp stays attributable.
    pub fn create(
        stamp: &ValidationStamp,
        inconsistencies: Vec<InconsistencyKind>,
        node_keypair: &Keypair,
    ) -> Self {
        let signature = node_keypair
            .sign(&Self::signed_payload(stamp, &inconsistencies))
            .to_bytes()
            .to_vec();
        Self {
            node_public_key: PublicKey::from_ed25519(KeyOrigin::Software, &node_keypair.public),
            signature,
            inconsistencies,
        }
    }

    pub fn verify(&self, stamp: &ValidationStamp) -> ChainResult<()> {
        self.node_public_key.verify(
            &Self::signed_payload(stamp, &self.inconsistencies),
            &self.signature,
        )
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistencies.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.node_public_key.to_bytes());
        codec::put_bytes(&mut out, &self.signature);
        codec::put_u8(&mut out, self.inconsistencies.len() as u8);
        for kind in &self.inconsistencies {
            codec::put_u8(&mut out, kind.as_byte());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let (node_public_key, rest) = PublicKey::from_bytes(data)?;
        let (signature, rest) = codec::take_bytes(rest)?;
        let (count, mut rest) = codec::take_u8(rest)?;
        let mut inconsistencies = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (byte, tail) = codec::take_u8(rest)?;
            inconsistencies.push(InconsistencyKind::from_byte(byte)?);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(ChainError::Crypto(
                "trailing bytes after cross-validation stamp".into(),
            ));
        }
        Ok(Self {
            node_public_key,
            signature,
            inconsistencies,
        })
    }
}
