pub mod node;
pub mod stamp;
pub mod transaction;

pub use node::{Node, NodeContent, NodeTransport};
pub use stamp::{
    CrossValidationStamp, InconsistencyKind, LedgerOperations, TransactionMovement,
    UnspentOutput, UtxoKind, ValidationStamp, PROTOCOL_VERSION,
};
pub use transaction::{
    AuthorizedKey, LedgerContent, Ownership, TokenTransfer, Transaction, TransactionData,
    TransactionType, UcoTransfer,
};

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::errors::ChainResult;

/// Fixed-width bit vector indexed by the canonical ordering of a node set.
/// Bit `i` refers to the i-th node of the sorted roster slice it was built
/// against; length and ordering are reproducible on every node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitVector {
    bits: Vec<bool>,
}

impl BitVector {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn filled(len: usize) -> Self {
        Self {
            bits: vec![true; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index < self.bits.len() {
            self.bits[index] = value;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(index, bit)| bit.then_some(index))
    }

    /// Conservative merge: a node is available only if every view agrees.
    pub fn intersect(&mut self, other: &BitVector) {
        for (index, bit) in self.bits.iter_mut().enumerate() {
            *bit = *bit && other.get(index);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.bits.len() / 8 + 1);
        codec::put_u16(&mut out, self.bits.len() as u16);
        let mut packed = vec![0u8; (self.bits.len() + 7) / 8];
        for (index, bit) in self.bits.iter().enumerate() {
            if *bit {
                packed[index / 8] |= 1 << (index % 8);
            }
        }
        out.extend_from_slice(&packed);
        out
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<(Self, &[u8])> {
        let (len, rest) = codec::take_u16(data)?;
        let len = len as usize;
        let byte_len = (len + 7) / 8;
        if rest.len() < byte_len {
            return Err(crate::errors::ChainError::Crypto(
                "truncated bit vector".into(),
            ));
        }
        let (packed, rest) = rest.split_at(byte_len);
        let mut bits = vec![false; len];
        for (index, bit) in bits.iter_mut().enumerate() {
            *bit = packed[index / 8] & (1 << (index % 8)) != 0;
        }
        Ok((Self { bits }, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_vector_round_trips() {
        let mut view = BitVector::new(11);
        view.set(0, true);
        view.set(7, true);
        view.set(10, true);
        let bytes = view.to_bytes();
        let (decoded, rest) = BitVector::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, view);
        assert_eq!(decoded.count_ones(), 3);
    }

    #[test]
    fn intersect_is_conservative() {
        let mut a = BitVector::filled(4);
        let mut b = BitVector::filled(4);
        b.set(2, false);
        a.intersect(&b);
        assert_eq!(a.ones().collect::<Vec<_>>(), vec![0, 1, 3]);
    }

    #[test]
    fn out_of_range_reads_are_false() {
        let view = BitVector::new(2);
        assert!(!view.get(5));
    }
}
