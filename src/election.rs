//! Deterministic validator and storage elections.
//!
//! Committee selection is a hash rendezvous: each candidate scores
//! `hash(first_public_key || sorting_seed)` and the lowest scores win. The
//! sorting seed for validation committees is the daily-nonce signature over a
//! digest of the transaction, so the committee cannot be pre-computed without
//! the shared secret. Storage elections use the storage nonce instead, so any
//! node can locate storage sets without validator secrets.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, HashAlgorithm, PublicKey, SharedKeystore};
use crate::errors::{ChainError, ChainResult};
use crate::types::node::{authorized_nodes, Node};
use crate::types::Transaction;

pub const DEFAULT_MIN_VALIDATORS: usize = 3;
pub const DEFAULT_REPLICATION_FACTOR: usize = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ElectionConstraints {
    pub min_validators: usize,
    pub replication_factor: usize,
}

impl Default for ElectionConstraints {
    fn default() -> Self {
        Self {
            min_validators: DEFAULT_MIN_VALIDATORS,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

/// Outcome of a full election: the ordered committee (coordinator first) and
/// the three storage sets.
#[derive(Clone, Debug)]
pub struct Election {
    pub validation_committee: Vec<Node>,
    pub chain_storage: Vec<Node>,
    pub beacon_storage: Vec<Node>,
    pub io_storage: Vec<Node>,
}

/// `min(max(ceil(log2(n)), min_validators), n)`, never below 1 for a
/// non-empty roster.
pub fn committee_size(authorized_count: usize, min_validators: usize) -> usize {
    if authorized_count == 0 {
        return 0;
    }
    let log = (usize::BITS - (authorized_count - 1).leading_zeros()) as usize;
    log.max(min_validators).min(authorized_count).max(1)
}

fn election_digest(tx: &Transaction) -> Vec<u8> {
    let mut data = tx.address.to_bytes();
    data.extend_from_slice(&tx.timestamp.to_be_bytes());
    crypto::hash(HashAlgorithm::Sha256, &data)
}

/// The proof of election: daily-nonce signature binding the committee seed
/// to the transaction.
pub fn proof_of_election(keystore: &SharedKeystore, tx: &Transaction) -> Vec<u8> {
    keystore.daily_sign(&election_digest(tx))
}

pub fn verify_proof_of_election(
    daily_public_key: &PublicKey,
    tx: &Transaction,
    proof: &[u8],
) -> ChainResult<()> {
    daily_public_key.verify(&election_digest(tx), proof)
}

fn node_score(node: &Node, seed: &[u8]) -> Vec<u8> {
    let mut data = node.first_public_key.to_bytes();
    data.extend_from_slice(seed);
    crypto::hash(HashAlgorithm::Sha256, &data)
}

/// Ranks candidates by score, then picks `count` of them preferring unseen
/// geo patches; remaining slots are filled in rank order.
fn select_diversified(mut ranked: Vec<Node>, seed: &[u8], count: usize) -> Vec<Node> {
    ranked.sort_by_key(|node| node_score(node, seed));
    let mut selected: Vec<Node> = Vec::with_capacity(count);
    for node in &ranked {
        if selected.len() >= count {
            break;
        }
        let patch_seen = selected.iter().any(|chosen| chosen.geo_patch == node.geo_patch);
        if !patch_seen {
            selected.push(node.clone());
        }
    }
    for node in &ranked {
        if selected.len() >= count {
            break;
        }
        if !selected
            .iter()
            .any(|chosen| chosen.first_public_key == node.first_public_key)
        {
            selected.push(node.clone());
        }
    }
    selected
}

/// Elects the ordered validation committee for `tx`. The first element is
/// the coordinator. Total: degenerate rosters yield a committee of one.
pub fn elect_validation_committee(
    tx: &Transaction,
    roster: &[Node],
    proof: &[u8],
    constraints: &ElectionConstraints,
) -> Vec<Node> {
    let authorized = authorized_nodes(roster, tx.timestamp);
    let count = committee_size(authorized.len(), constraints.min_validators);
    select_diversified(authorized, proof, count)
}

/// Elects the storage set for an address under a domain label. Keyed by the
/// storage nonce so the set is computable by every node.
pub fn elect_storage_nodes(
    address: &crypto::Address,
    roster: &[Node],
    storage_nonce: &[u8; 32],
    constraints: &ElectionConstraints,
    domain: &[u8],
) -> Vec<Node> {
    let candidates: Vec<Node> = roster.iter().filter(|node| node.authorized).cloned().collect();
    let mut data = address.to_bytes();
    data.extend_from_slice(domain);
    data.extend_from_slice(storage_nonce);
    let seed = crypto::hash(HashAlgorithm::Sha256, &data);
    let count = constraints.replication_factor.min(candidates.len());
    select_diversified(candidates, &seed, count)
}

/// Runs the full election for a transaction.
pub fn elect(
    tx: &Transaction,
    roster: &[Node],
    keystore: &SharedKeystore,
    constraints: &ElectionConstraints,
) -> Election {
    let proof = proof_of_election(keystore, tx);
    elect_with_proof(tx, roster, &proof, keystore.storage_nonce(), constraints)
}

/// Election from an already-computed proof, as done when re-checking a
/// coordinator's choice.
pub fn elect_with_proof(
    tx: &Transaction,
    roster: &[Node],
    proof: &[u8],
    storage_nonce: [u8; 32],
    constraints: &ElectionConstraints,
) -> Election {
    Election {
        validation_committee: elect_validation_committee(tx, roster, proof, constraints),
        chain_storage: elect_storage_nodes(&tx.address, roster, &storage_nonce, constraints, b"chain"),
        beacon_storage: elect_storage_nodes(
            &tx.address,
            roster,
            &storage_nonce,
            constraints,
            b"beacon",
        ),
        io_storage: elect_storage_nodes(&tx.address, roster, &storage_nonce, constraints, b"io"),
    }
}

/// Checks that an announced committee matches the deterministic election.
pub fn valid_election(
    tx: &Transaction,
    announced: &[PublicKey],
    roster: &[Node],
    daily_public_key: &PublicKey,
    proof: &[u8],
    constraints: &ElectionConstraints,
) -> ChainResult<()> {
    verify_proof_of_election(daily_public_key, tx, proof)
        .map_err(|_| ChainError::InvalidElection("proof of election does not verify".into()))?;
    let expected: Vec<PublicKey> = elect_validation_committee(tx, roster, proof, constraints)
        .into_iter()
        .map(|node| node.first_public_key)
        .collect();
    if expected.as_slice() != announced {
        return Err(ChainError::InvalidElection(
            "announced committee does not match deterministic election".into(),
        ));
    }
    Ok(())
}
