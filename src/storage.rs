//! Chain store contract consumed by mining, plus an in-memory
//! implementation. The persistent engine lives outside this subsystem; the
//! trait is the narrow surface mining relies on.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::crypto::Address;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Transaction, TransactionType, UnspentOutput};

pub trait ChainStore: Send + Sync {
    fn get_transaction(&self, address: &Address) -> ChainResult<Option<Transaction>>;
    /// Persists a validated transaction, linking it into its chain.
    fn write_transaction(&self, tx: &Transaction) -> ChainResult<()>;
    fn chain_size(&self, address: &Address) -> ChainResult<usize>;
    fn list_addresses_by_type(&self, tx_type: TransactionType) -> ChainResult<Vec<Address>>;
    /// Newest address of the chain containing `address`; the address itself
    /// when no chain is known.
    fn get_last_chain_address(&self, address: &Address) -> ChainResult<Address>;
    /// Genesis address of the chain containing `address`; the address itself
    /// when no chain is known.
    fn get_first_chain_address(&self, address: &Address) -> ChainResult<Address>;
    /// Unspent outputs currently spendable by `address`.
    fn unspent_outputs(&self, address: &Address) -> ChainResult<Vec<UnspentOutput>>;
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Vec<u8>, Vec<u8>>,
    chain_of: HashMap<Vec<u8>, Vec<u8>>,
    chains: HashMap<Vec<u8>, Vec<Address>>,
    by_type: HashMap<u8, Vec<Address>>,
    utxos: HashMap<Vec<u8>, Vec<UnspentOutput>>,
}

pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Genesis allocation: seeds an address with spendable value outside of
    /// any mined transaction.
    pub fn credit(&self, address: &Address, utxo: UnspentOutput) {
        let mut inner = self.inner.write();
        inner
            .utxos
            .entry(address.to_bytes())
            .or_default()
            .push(utxo);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryStore {
    fn get_transaction(&self, address: &Address) -> ChainResult<Option<Transaction>> {
        let inner = self.inner.read();
        match inner.records.get(&address.to_bytes()) {
            Some(record) => {
                let tx: Transaction = bincode::deserialize(record)?;
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }

    fn write_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        let key = tx.address.to_bytes();
        let mut inner = self.inner.write();
        if inner.records.contains_key(&key) {
            return Err(ChainError::AlreadyExists);
        }
        let record = bincode::serialize(tx)?;

        let previous = tx.previous_address();
        let previous_key = previous.to_bytes();
        let linked_genesis = inner.chain_of.get(&previous_key).cloned();
        let genesis_key = match linked_genesis {
            Some(genesis) if previous_key != key => {
                let chain = inner.chains.get_mut(&genesis).ok_or_else(|| {
                    ChainError::Transaction("chain index missing for genesis".into())
                })?;
                match chain.last() {
                    Some(last) if last == &previous => chain.push(tx.address.clone()),
                    _ => {
                        return Err(ChainError::Transaction(
                            "transaction forks an already extended chain".into(),
                        ));
                    }
                }
                genesis
            }
            _ => {
                inner.chains.insert(key.clone(), vec![tx.address.clone()]);
                key.clone()
            }
        };
        inner.chain_of.insert(key.clone(), genesis_key);

        inner
            .by_type
            .entry(tx.tx_type.as_byte())
            .or_default()
            .push(tx.address.clone());

        if let Some(stamp) = &tx.validation_stamp {
            for movement in &stamp.ledger_operations.transaction_movements {
                inner
                    .utxos
                    .entry(movement.to.to_bytes())
                    .or_default()
                    .push(UnspentOutput {
                        from: tx.address.clone(),
                        amount: movement.amount,
                        kind: movement.kind.clone(),
                        timestamp: stamp.timestamp,
                    });
            }
            // The chain's spendable set moves to the new address.
            inner
                .utxos
                .insert(key.clone(), stamp.ledger_operations.unspent_outputs.clone());
            if previous_key != key {
                inner.utxos.remove(&previous_key);
            }
        }

        inner.records.insert(key, record);
        Ok(())
    }

    fn chain_size(&self, address: &Address) -> ChainResult<usize> {
        let inner = self.inner.read();
        let size = inner
            .chain_of
            .get(&address.to_bytes())
            .and_then(|genesis| inner.chains.get(genesis))
            .map(|chain| chain.len())
            .unwrap_or(0);
        Ok(size)
    }

    fn list_addresses_by_type(&self, tx_type: TransactionType) -> ChainResult<Vec<Address>> {
        let inner = self.inner.read();
        Ok(inner
            .by_type
            .get(&tx_type.as_byte())
            .cloned()
            .unwrap_or_default())
    }

    fn get_last_chain_address(&self, address: &Address) -> ChainResult<Address> {
        let inner = self.inner.read();
        let last = inner
            .chain_of
            .get(&address.to_bytes())
            .and_then(|genesis| inner.chains.get(genesis))
            .and_then(|chain| chain.last().cloned())
            .unwrap_or_else(|| address.clone());
        Ok(last)
    }

    fn get_first_chain_address(&self, address: &Address) -> ChainResult<Address> {
        let inner = self.inner.read();
        let first = inner
            .chain_of
            .get(&address.to_bytes())
            .and_then(|genesis| inner.chains.get(genesis))
            .and_then(|chain| chain.first().cloned())
            .unwrap_or_else(|| address.clone());
        Ok(first)
    }

    fn unspent_outputs(&self, address: &Address) -> ChainResult<Vec<UnspentOutput>> {
        let inner = self.inner.read();
        Ok(inner
            .utxos
            .get(&address.to_bytes())
            .cloned()
            .unwrap_or_default())
    }
}
