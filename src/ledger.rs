//! Fee computation and UTXO consumption. Everything here is pure: callers
//! supply the prior unspent outputs and the oracle price, and get back the
//! ledger operations that go into the validation stamp.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::errors::{ChainError, ChainResult, RejectionKind};
use crate::types::{
    LedgerOperations, Transaction, TransactionMovement, UnspentOutput, UtxoKind,
};

/// Smallest-unit scale: 10^8 units per UCO.
pub const UCO_UNIT: u64 = 100_000_000;

const BASE_FEE_USD: f64 = 0.01;
const FEE_PER_10KB_USD: f64 = 0.001;
const FEE_PER_MOVEMENT_USD: f64 = 0.001;
const CONTRACT_FEE_USD: f64 = 0.01;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct UcoPrice {
    pub eur: f64,
    pub usd: f64,
}

/// Oracle contract: returns the UCO price effective at a timestamp.
pub trait PriceProvider: Send + Sync {
    fn uco_price(&self, timestamp: u64) -> UcoPrice;
}

pub struct FixedPrice(pub UcoPrice);

impl PriceProvider for FixedPrice {
    fn uco_price(&self, _timestamp: u64) -> UcoPrice {
        self.0
    }
}

/// Fee in 10^-8 UCO units. Fees track a USD target, so the UCO amount
/// scales inversely with the oracle price. Network chains are fee-free.
pub fn transaction_fee(tx: &Transaction, usd_price: f64) -> u64 {
    if tx.tx_type.is_network() {
        return 0;
    }
    let price = if usd_price > 0.0 { usd_price } else { 1.0 };
    let byte_len = tx.pending_bytes().len() as f64;
    let movements = tx.data.ledger.movement_count() as f64;
    let contract = if tx.data.code.is_empty() {
        0.0
    } else {
        CONTRACT_FEE_USD
    };
    let fee_usd =
        BASE_FEE_USD + byte_len / 10_000.0 * FEE_PER_10KB_USD + movements * FEE_PER_MOVEMENT_USD
            + contract;
    (fee_usd / price * UCO_UNIT as f64).round() as u64
}

fn token_group(kind: &UtxoKind) -> Option<(Address, u64)> {
    match kind {
        UtxoKind::Uco => None,
        UtxoKind::Token {
            token_address,
            token_id,
        } => Some((token_address.clone(), *token_id)),
    }
}

/// Consumes inputs to cover `needed`, last-in-first-out over the
/// (amount, timestamp)-sorted list. Returns the change and the untouched
/// remainder, or the shortfall.
fn consume(
    mut inputs: Vec<UnspentOutput>,
    needed: u64,
) -> Result<(u64, Vec<UnspentOutput>), u64> {
    inputs.sort_by(|a, b| {
        a.amount
            .cmp(&b.amount)
            .then(a.timestamp.cmp(&b.timestamp))
    });
    let mut gathered: u64 = 0;
    while gathered < needed {
        match inputs.pop() {
            Some(input) => gathered = gathered.saturating_add(input.amount),
            None => return Err(needed - gathered),
        }
    }
    Ok((gathered - needed, inputs))
}

/// Computes the full ledger operations for a transaction: fee, resolved
/// movements, and the successor UTXO set. `resolve` maps a declared
/// recipient address to its last chain address at validation time.
pub fn ledger_operations(
    tx: &Transaction,
    inputs: &[UnspentOutput],
    usd_price: f64,
    stamp_timestamp: u64,
    resolve: &dyn Fn(&Address) -> Address,
) -> ChainResult<LedgerOperations> {
    let fee = transaction_fee(tx, usd_price);

    let mut movements = Vec::with_capacity(tx.data.ledger.movement_count());
    for transfer in &tx.data.ledger.uco {
        movements.push(TransactionMovement {
            to: resolve(&transfer.to),
            amount: transfer.amount,
            kind: UtxoKind::Uco,
        });
    }
    for transfer in &tx.data.ledger.token {
        movements.push(TransactionMovement {
            to: resolve(&transfer.to),
            amount: transfer.amount,
            kind: UtxoKind::Token {
                token_address: transfer.token_address.clone(),
                token_id: transfer.token_id,
            },
        });
    }

    let uco_inputs: Vec<UnspentOutput> = inputs
        .iter()
        .filter(|utxo| utxo.kind == UtxoKind::Uco)
        .cloned()
        .collect();
    // Reward emissions draw on the network pool, not on chain inputs.
    let mints_supply = matches!(
        tx.tx_type,
        crate::types::TransactionType::MintRewards | crate::types::TransactionType::NodeRewards
    );
    let uco_needed = if mints_supply {
        0
    } else {
        tx.data
            .ledger
            .uco_total()
            .checked_add(fee)
            .ok_or_else(|| ChainError::Transaction("uco amount overflow".into()))?
    };
    let (uco_change, mut unspent_outputs) = consume(uco_inputs, uco_needed).map_err(|missing| {
        ChainError::rejected(
            RejectionKind::InsufficientFunds,
            format!("missing {missing} uco units to fund transaction"),
        )
    })?;
    if uco_change > 0 {
        unspent_outputs.push(UnspentOutput {
            from: tx.address.clone(),
            amount: uco_change,
            kind: UtxoKind::Uco,
            timestamp: stamp_timestamp,
        });
    }

    let mut token_needed: BTreeMap<(Address, u64), u64> = BTreeMap::new();
    for transfer in &tx.data.ledger.token {
        let entry = token_needed
            .entry((transfer.token_address.clone(), transfer.token_id))
            .or_insert(0);
        *entry = entry.saturating_add(transfer.amount);
    }
    for ((token_address, token_id), needed) in token_needed {
        let group_inputs: Vec<UnspentOutput> = inputs
            .iter()
            .filter(|utxo| token_group(&utxo.kind) == Some((token_address.clone(), token_id)))
            .cloned()
            .collect();
        let (change, remainder) = consume(group_inputs, needed).map_err(|missing| {
            ChainError::rejected(
                RejectionKind::InsufficientFunds,
                format!("missing {missing} units of token {token_address}"),
            )
        })?;
        unspent_outputs.extend(remainder);
        if change > 0 {
            unspent_outputs.push(UnspentOutput {
                from: tx.address.clone(),
                amount: change,
                kind: UtxoKind::Token {
                    token_address,
                    token_id,
                },
                timestamp: stamp_timestamp,
            });
        }
    }

    Ok(LedgerOperations {
        fee,
        transaction_movements: movements,
        unspent_outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::test_transaction;
    use crate::types::{
        LedgerContent, TransactionData, TransactionType, UcoTransfer,
    };

    fn address(tag: u8) -> Address {
        use crate::crypto::{HashAlgorithm, KeyOrigin, PublicKey};
        let keypair = crate::crypto::derive_keypair(&[tag], 0).unwrap();
        let public = PublicKey::from_ed25519(KeyOrigin::Software, &keypair.public);
        Address::from_public_key(HashAlgorithm::Sha256, &public)
    }

    fn transfer_tx(amount: u64, recipients: usize, content_len: usize) -> Transaction {
        let uco = (0..recipients)
            .map(|index| UcoTransfer {
                to: address(index as u8 + 1),
                amount,
            })
            .collect();
        test_transaction(
            TransactionType::Transfer,
            TransactionData {
                content: vec![0; content_len],
                ledger: LedgerContent {
                    uco,
                    token: Vec::new(),
                },
                ..TransactionData::default()
            },
            1_700_000,
        )
    }

    fn uco_input(amount: u64, timestamp: u64) -> UnspentOutput {
        UnspentOutput {
            from: address(9),
            amount,
            kind: UtxoKind::Uco,
            timestamp,
        }
    }

    #[test]
    fn fee_is_monotonic_in_size_and_movements() {
        let price = 0.5;
        let small = transfer_tx(1_000, 1, 0);
        let bigger_content = transfer_tx(1_000, 1, 4_096);
        let more_movements = transfer_tx(1_000, 3, 0);
        assert!(transaction_fee(&bigger_content, price) >= transaction_fee(&small, price));
        assert!(transaction_fee(&more_movements, price) > transaction_fee(&small, price));
    }

    #[test]
    fn fee_scales_inversely_with_price() {
        let tx = transfer_tx(1_000, 1, 0);
        let cheap_uco = transaction_fee(&tx, 0.1);
        let pricey_uco = transaction_fee(&tx, 10.0);
        assert!(cheap_uco > pricey_uco);
    }

    #[test]
    fn consumption_covers_amount_plus_fee_and_returns_change() {
        let tx = transfer_tx(1_000_000, 1, 0);
        let fee = transaction_fee(&tx, 1.0);
        let funds = 10 * UCO_UNIT;
        let ops = ledger_operations(
            &tx,
            &[uco_input(funds, 100)],
            1.0,
            2_000_000,
            &|addr| addr.clone(),
        )
        .unwrap();
        assert_eq!(ops.fee, fee);
        assert_eq!(ops.transaction_movements.len(), 1);
        let change: u64 = ops
            .unspent_outputs
            .iter()
            .filter(|utxo| utxo.kind == UtxoKind::Uco)
            .map(|utxo| utxo.amount)
            .sum();
        assert_eq!(change, funds - 1_000_000 - fee);
        assert!(ops
            .unspent_outputs
            .iter()
            .all(|utxo| utxo.from == tx.address));
    }

    #[test]
    fn insufficient_funds_are_rejected() {
        let tx = transfer_tx(5 * UCO_UNIT, 1, 0);
        let err = ledger_operations(
            &tx,
            &[uco_input(UCO_UNIT, 100)],
            1.0,
            2_000_000,
            &|addr| addr.clone(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ChainError::Rejected {
                kind: RejectionKind::InsufficientFunds,
                ..
            }
        ));
    }

    #[test]
    fn consumption_is_lifo_over_sorted_inputs() {
        // Three inputs; the largest should be drawn first, leaving the small
        // ones untouched when one input covers the spend.
        let tx = transfer_tx(UCO_UNIT, 1, 0);
        let inputs = vec![
            uco_input(10 * UCO_UNIT, 10),
            uco_input(UCO_UNIT / 2, 20),
            uco_input(UCO_UNIT / 4, 30),
        ];
        let ops =
            ledger_operations(&tx, &inputs, 1.0, 2_000_000, &|addr| addr.clone()).unwrap();
        let untouched: Vec<u64> = ops
            .unspent_outputs
            .iter()
            .filter(|utxo| utxo.from != tx.address)
            .map(|utxo| utxo.amount)
            .collect();
        assert_eq!(untouched, vec![UCO_UNIT / 4, UCO_UNIT / 2]);
    }

    #[test]
    fn network_chains_are_fee_free_and_rewards_mint_supply() {
        let renewal = test_transaction(
            TransactionType::NodeSharedSecrets,
            TransactionData {
                content: b"renewal".to_vec(),
                ..TransactionData::default()
            },
            86_400,
        );
        assert_eq!(transaction_fee(&renewal, 1.0), 0);
        // No inputs, no fee: the stamp computation still succeeds.
        let ops = ledger_operations(&renewal, &[], 1.0, 90_000, &|addr| addr.clone()).unwrap();
        assert_eq!(ops.fee, 0);
        assert!(ops.unspent_outputs.is_empty());

        let mint = test_transaction(
            TransactionType::MintRewards,
            TransactionData {
                ledger: LedgerContent {
                    uco: vec![UcoTransfer {
                        to: address(6),
                        amount: 5_000,
                    }],
                    token: Vec::new(),
                },
                ..TransactionData::default()
            },
            1_000,
        );
        let ops = ledger_operations(&mint, &[], 1.0, 2_000, &|addr| addr.clone()).unwrap();
        assert_eq!(ops.transaction_movements[0].amount, 5_000);
    }

    #[test]
    fn movements_are_resolved() {
        let tx = transfer_tx(1_000, 1, 0);
        let resolved = address(42);
        let resolved_clone = resolved.clone();
        let ops = ledger_operations(
            &tx,
            &[uco_input(10 * UCO_UNIT, 100)],
            1.0,
            2_000_000,
            &move |_| resolved_clone.clone(),
        )
        .unwrap();
        assert_eq!(ops.transaction_movements[0].to, resolved);
    }
}
