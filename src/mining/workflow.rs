//! Distributed mining workflow: the coordinator / cross-validator state
//! machine run by every committee member for one transaction.
//!
//! States: Init -> PendingValidated -> ContextCollected -> Validated
//! (coordinator) -> Replicated -> Done, with Aborted reachable from any
//! suspension point on timeout or inconsistency.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::crypto::{Address, HashAlgorithm, OriginKeySet, PublicKey, SharedKeystore};
use crate::election::{elect_storage_nodes, Election, ElectionConstraints};
use crate::errors::{ChainError, ChainResult};
use crate::ledger::{self, PriceProvider};
use crate::messages::{ErrorReason, Message, MiningContext, ReplicationTrees};
use crate::network::{broadcast, Transport};
use crate::replication::{ack_quorum, assigned_nodes, replication_tree, AckTracker};
use crate::storage::ChainStore;
use crate::types::node::Node;
use crate::types::{
    BitVector, CrossValidationStamp, InconsistencyKind, Transaction, ValidationStamp,
    PROTOCOL_VERSION,
};

use super::pow::find_proof_of_work;
use super::{WorkflowEvent, WorkflowRegistry};

#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    pub context_timeout: Duration,
    pub cross_validation_timeout: Duration,
    pub replication_timeout: Duration,
    /// Spacing of the rank-based responsiveness fallback.
    pub fallback_interval: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            context_timeout: Duration::from_secs(2),
            cross_validation_timeout: Duration::from_secs(3),
            replication_timeout: Duration::from_secs(5),
            fallback_interval: Duration::from_millis(500),
        }
    }
}

/// Shared collaborators handed to every workflow.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn ChainStore>,
    pub keystore: Arc<SharedKeystore>,
    /// This node's own identity key, used for counter-signatures.
    pub node_keypair: Arc<Keypair>,
    pub origin_keys: Arc<OriginKeySet>,
    pub price: Arc<dyn PriceProvider>,
    pub registry: Arc<WorkflowRegistry>,
    pub constraints: ElectionConstraints,
    pub config: WorkflowConfig,
}

/// Everything decided at workflow entry for one transaction.
#[derive(Clone)]
pub struct MiningJob {
    pub tx: Transaction,
    pub welcome_node: PublicKey,
    pub election: Election,
    pub proof_of_election: Vec<u8>,
    pub roster: Vec<Node>,
    /// Position of this node in the committee; 0 is the coordinator.
    pub rank: usize,
    pub node_public_key: PublicKey,
}

impl MiningJob {
    pub fn committee_keys(&self) -> Vec<PublicKey> {
        self.election
            .validation_committee
            .iter()
            .map(|node| node.first_public_key.clone())
            .collect()
    }

    fn peer_keys(&self) -> Vec<PublicKey> {
        self.committee_keys()
            .into_iter()
            .filter(|key| key != &self.node_public_key)
            .collect()
    }

    fn coordinator_key(&self) -> PublicKey {
        self.election.validation_committee[0].first_public_key.clone()
    }

    fn committee_position(&self, key: &PublicKey) -> Option<usize> {
        self.election
            .validation_committee
            .iter()
            .position(|node| &node.first_public_key == key)
    }
}

/// Workflow task body. Terminal states release the registry entry; failures
/// are surfaced to the welcome node with the rank-based fallback delay.
pub async fn run(
    deps: WorkflowDeps,
    job: MiningJob,
    events: mpsc::UnboundedReceiver<WorkflowEvent>,
) {
    let address = job.tx.address.clone();
    let result = if job.election.validation_committee.len() <= 1 {
        super::standalone::run_standalone(&deps, &job, events).await
    } else if job.rank == 0 {
        run_coordinator(&deps, &job, events).await
    } else {
        run_cross_validator(&deps, &job, events).await
    };
    match result {
        Ok(()) => info!(%address, rank = job.rank, "mining workflow done"),
        Err(err) => {
            warn!(%address, rank = job.rank, %err, "mining workflow aborted");
            notify_welcome_error(&deps, &job, &err).await;
        }
    }
    deps.registry.remove(&address);
}

async fn notify_welcome_error(deps: &WorkflowDeps, job: &MiningJob, err: &ChainError) {
    let reason = match err {
        ChainError::ReplicationTimeout { .. } | ChainError::NetworkIssue(_) => {
            ErrorReason::NetworkIssue
        }
        ChainError::AlreadyExists => ErrorReason::TransactionAlreadyExists,
        _ => ErrorReason::InvalidTransaction,
    };
    // Responsiveness fallback: lower-ranked validators report first; the
    // welcome node keeps whichever arrives first.
    sleep(deps.config.fallback_interval * job.rank as u32).await;
    let message = Message::Error {
        reason,
        address: job.tx.address.clone(),
    };
    if let Err(send_err) = deps.transport.send(&job.welcome_node, message).await {
        debug!(%send_err, "welcome node unreachable for error report");
    }
}

/// Observes peer availability for one node set, in the set's order.
async fn availability_view(transport: &Arc<dyn Transport>, nodes: &[Node]) -> BitVector {
    let mut view = BitVector::new(nodes.len());
    for (index, node) in nodes.iter().enumerate() {
        view.set(index, transport.is_available(&node.first_public_key).await);
    }
    view
}

/// This validator's own mining context.
pub(super) async fn build_context(deps: &WorkflowDeps, job: &MiningJob) -> MiningContext {
    let previous_last = deps
        .store
        .get_last_chain_address(&job.tx.previous_address())
        .unwrap_or_else(|_| job.tx.previous_address());
    let previous_storage_nodes = elect_storage_nodes(
        &previous_last,
        &job.roster,
        &deps.keystore.storage_nonce(),
        &deps.constraints,
        b"chain",
    )
    .into_iter()
    .map(|node| node.first_public_key)
    .collect();
    MiningContext {
        validation_node_public_key: job.node_public_key.clone(),
        previous_storage_nodes,
        cross_validation_nodes_view: availability_view(
            &deps.transport,
            &job.election.validation_committee,
        )
        .await,
        chain_storage_nodes_view: availability_view(&deps.transport, &job.election.chain_storage)
            .await,
        beacon_storage_nodes_view: availability_view(
            &deps.transport,
            &job.election.beacon_storage,
        )
        .await,
        io_storage_nodes_view: availability_view(&deps.transport, &job.election.io_storage).await,
    }
}

/// Assembles and signs the validation stamp from this node's view of the
/// chain. Coordinator and cross-validators run the identical computation.
pub(super) fn assemble_stamp(deps: &WorkflowDeps, job: &MiningJob) -> ChainResult<ValidationStamp> {
    let tx = &job.tx;
    let previous_last = deps.store.get_last_chain_address(&tx.previous_address())?;
    let previous_tx = deps.store.get_transaction(&previous_last)?;
    let previous_poi = previous_tx
        .as_ref()
        .and_then(|previous| previous.validation_stamp.as_ref())
        .map(|stamp| stamp.proof_of_integrity.clone());
    let proof_of_integrity = tx.proof_of_integrity(previous_poi.as_deref());
    let proof_of_work = find_proof_of_work(tx, &deps.origin_keys.snapshot());
    let price = deps.price.uco_price(tx.timestamp).usd;
    let inputs = deps.store.unspent_outputs(&previous_last)?;
    let store = Arc::clone(&deps.store);
    let resolve = move |address: &Address| {
        store
            .get_last_chain_address(address)
            .unwrap_or_else(|_| address.clone())
    };
    let ledger_operations =
        ledger::ledger_operations(tx, &inputs, price, tx.timestamp, &resolve)?;
    let recipients = tx.data.recipients.iter().map(|r| resolve(r)).collect();
    let mut stamp = ValidationStamp {
        timestamp: tx.timestamp,
        protocol_version: PROTOCOL_VERSION,
        proof_of_work,
        proof_of_integrity,
        proof_of_election: job.proof_of_election.clone(),
        ledger_operations,
        recipients,
        signature: Vec::new(),
    };
    stamp.sign(&deps.keystore);
    Ok(stamp)
}

pub(super) fn build_trees(job: &MiningJob) -> ReplicationTrees {
    let committee = &job.election.validation_committee;
    ReplicationTrees {
        chain: replication_tree(committee, &job.election.chain_storage),
        beacon: replication_tree(committee, &job.election.beacon_storage),
        io: replication_tree(committee, &job.election.io_storage),
    }
}

async fn run_coordinator(
    deps: &WorkflowDeps,
    job: &MiningJob,
    mut events: mpsc::UnboundedReceiver<WorkflowEvent>,
) -> ChainResult<()> {
    let committee_len = job.election.validation_committee.len();
    info!(address = %job.tx.address, committee = committee_len, "coordinating validation");

    let own_context = build_context(deps, job).await;
    let mut confirmed = BitVector::new(committee_len);
    confirmed.set(job.rank, true);
    let mut chain_view = own_context.chain_storage_nodes_view.clone();
    let mut beacon_view = own_context.beacon_storage_nodes_view.clone();
    let mut io_view = own_context.io_storage_nodes_view.clone();

    let deadline = Instant::now() + deps.config.context_timeout;
    let mut collected = 1usize;
    let mut stashed = Vec::new();
    while collected < committee_len {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(WorkflowEvent::Context(context))) => {
                let Some(position) = job.committee_position(&context.validation_node_public_key)
                else {
                    debug!("context from a non-committee node ignored");
                    continue;
                };
                if confirmed.get(position) {
                    continue;
                }
                confirmed.set(position, true);
                collected += 1;
                // Conservative merge: a storage node unreachable to any
                // validator is treated as unavailable.
                chain_view.intersect(&context.chain_storage_nodes_view);
                beacon_view.intersect(&context.beacon_storage_nodes_view);
                io_view.intersect(&context.io_storage_nodes_view);
            }
            Ok(Some(other)) => stashed.push(other),
            Ok(None) => {
                return Err(ChainError::NetworkIssue("workflow mailbox closed".into()));
            }
            Err(_) => {
                warn!(
                    collected,
                    committee = committee_len,
                    "context collection deadline reached"
                );
                break;
            }
        }
    }
    debug!(
        collected,
        chain_available = chain_view.count_ones(),
        beacon_available = beacon_view.count_ones(),
        io_available = io_view.count_ones(),
        "mining contexts aggregated"
    );

    let stamp = assemble_stamp(deps, job)?;
    let trees = build_trees(job);
    let message = Message::CrossValidate {
        address: job.tx.address.clone(),
        validation_stamp: stamp.clone(),
        replication_tree: trees.clone(),
        confirmed_validation_nodes: confirmed,
    };
    broadcast(&deps.transport, &job.peer_keys(), &message).await;

    let (cross_stamps, pending_acks) =
        collect_cross_stamps(deps, job, &stamp, &mut events, committee_len - 1, stashed).await?;
    ensure_atomic_commitment(&job.tx.address, &cross_stamps)?;
    replicate(deps, job, stamp, cross_stamps, &trees, pending_acks, &mut events).await
}

async fn run_cross_validator(
    deps: &WorkflowDeps,
    job: &MiningJob,
    mut events: mpsc::UnboundedReceiver<WorkflowEvent>,
) -> ChainResult<()> {
    info!(address = %job.tx.address, rank = job.rank, "cross validating");
    let context = build_context(deps, job).await;
    let message = Message::AddMiningContext {
        address: job.tx.address.clone(),
        context,
    };
    if let Err(err) = deps.transport.send(&job.coordinator_key(), message).await {
        warn!(%err, "failed to deliver mining context to coordinator");
    }

    // Await the coordinator's stamp; counter-signatures from faster peers may
    // arrive first and are replayed afterwards.
    let deadline = Instant::now() + deps.config.cross_validation_timeout;
    let mut stashed = Vec::new();
    let (stamp, trees) = loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(WorkflowEvent::CrossValidate {
                validation_stamp,
                replication_tree,
                ..
            })) => break (validation_stamp, replication_tree),
            Ok(Some(other)) => stashed.push(other),
            Ok(None) => {
                return Err(ChainError::NetworkIssue("workflow mailbox closed".into()));
            }
            Err(_) => {
                return Err(ChainError::NetworkIssue(
                    "coordinator did not publish a validation stamp".into(),
                ));
            }
        }
    };

    let inconsistencies = check_stamp(deps, job, &stamp, &trees);
    if !inconsistencies.is_empty() {
        warn!(address = %job.tx.address, ?inconsistencies, "stamp disagreement detected");
    }
    let own_stamp =
        CrossValidationStamp::create(&stamp, inconsistencies, &deps.node_keypair);
    let done = Message::CrossValidationDone {
        address: job.tx.address.clone(),
        cross_validation_stamp: own_stamp.clone(),
    };
    broadcast(&deps.transport, &job.peer_keys(), &done).await;

    let (mut cross_stamps, pending_acks) = collect_cross_stamps(
        deps,
        job,
        &stamp,
        &mut events,
        job.election.validation_committee.len() - 2,
        stashed,
    )
    .await?;
    cross_stamps.push(own_stamp);
    ensure_atomic_commitment(&job.tx.address, &cross_stamps)?;
    replicate(deps, job, stamp, cross_stamps, &trees, pending_acks, &mut events).await
}

/// Gathers counter-signatures until `expected` distinct committee members
/// have answered or the deadline passes; whatever was collected is returned.
/// Storage acknowledgments overtaking this phase are handed back so the
/// replication tally does not lose them.
async fn collect_cross_stamps(
    deps: &WorkflowDeps,
    job: &MiningJob,
    stamp: &ValidationStamp,
    events: &mut mpsc::UnboundedReceiver<WorkflowEvent>,
    expected: usize,
    stashed: Vec<WorkflowEvent>,
) -> ChainResult<(Vec<CrossValidationStamp>, Vec<WorkflowEvent>)> {
    let committee = job.committee_keys();
    let mut stamps: Vec<CrossValidationStamp> = Vec::with_capacity(expected);
    let mut leftovers: Vec<WorkflowEvent> = Vec::new();
    let register = |candidate: CrossValidationStamp,
                    stamps: &mut Vec<CrossValidationStamp>| {
        if !committee.contains(&candidate.node_public_key) {
            warn!("cross-validation stamp from a non-committee node dropped");
            return;
        }
        if candidate.verify(stamp).is_err() {
            warn!("cross-validation stamp with invalid signature dropped");
            return;
        }
        if stamps
            .iter()
            .any(|existing| existing.node_public_key == candidate.node_public_key)
        {
            return;
        }
        stamps.push(candidate);
    };
    for event in stashed {
        match event {
            WorkflowEvent::CrossValidationDone(candidate) => register(candidate, &mut stamps),
            other => leftovers.push(other),
        }
    }
    let deadline = Instant::now() + deps.config.cross_validation_timeout;
    while stamps.len() < expected {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(WorkflowEvent::CrossValidationDone(candidate))) => {
                register(candidate, &mut stamps);
            }
            Ok(Some(other)) => leftovers.push(other),
            Ok(None) => {
                return Err(ChainError::NetworkIssue("workflow mailbox closed".into()));
            }
            Err(_) => break,
        }
    }
    if stamps.is_empty() && expected > 0 {
        return Err(ChainError::NetworkIssue(
            "no cross-validation stamp collected".into(),
        ));
    }
    Ok((stamps, leftovers))
}

/// Atomic commitment: commit iff every collected stamp is free of
/// inconsistencies. On abort the divergent stamps are surfaced so the
/// dishonest subset can be reported.
fn ensure_atomic_commitment(
    address: &Address,
    stamps: &[CrossValidationStamp],
) -> ChainResult<()> {
    let divergent: Vec<&CrossValidationStamp> = stamps
        .iter()
        .filter(|stamp| !stamp.is_consistent())
        .collect();
    if divergent.is_empty() {
        return Ok(());
    }
    for stamp in &divergent {
        warn!(
            %address,
            validator = %stamp.node_public_key,
            inconsistencies = ?stamp.inconsistencies,
            "validator refused the stamp"
        );
    }
    Err(ChainError::Transaction(format!(
        "{} validator(s) reported inconsistencies",
        divergent.len()
    )))
}

/// Independent re-computation of every stamp field a cross-validator vouches
/// for.
fn check_stamp(
    deps: &WorkflowDeps,
    job: &MiningJob,
    stamp: &ValidationStamp,
    trees: &ReplicationTrees,
) -> Vec<InconsistencyKind> {
    let mut inconsistencies = Vec::new();
    let tx = &job.tx;
    if stamp.timestamp < tx.timestamp {
        inconsistencies.push(InconsistencyKind::Timestamp);
    }
    if stamp.verify(&deps.keystore.daily_public_key()).is_err() {
        inconsistencies.push(InconsistencyKind::Signature);
    }
    if stamp.proof_of_work != find_proof_of_work(tx, &deps.origin_keys.snapshot()) {
        inconsistencies.push(InconsistencyKind::ProofOfWork);
    }
    match recompute_ledger(deps, job, stamp) {
        Ok((proof_of_integrity, operations)) => {
            if proof_of_integrity != stamp.proof_of_integrity {
                inconsistencies.push(InconsistencyKind::ProofOfIntegrity);
            }
            if operations.fee != stamp.ledger_operations.fee {
                inconsistencies.push(InconsistencyKind::TransactionFee);
            }
            if operations.transaction_movements != stamp.ledger_operations.transaction_movements
            {
                inconsistencies.push(InconsistencyKind::TransactionMovements);
            }
            if operations.unspent_outputs != stamp.ledger_operations.unspent_outputs {
                inconsistencies.push(InconsistencyKind::UnspentOutputs);
            }
        }
        Err(_) => {
            inconsistencies.push(InconsistencyKind::UnspentOutputs);
        }
    }
    if trees != &build_trees(job) {
        inconsistencies.push(InconsistencyKind::ReplicationTree);
    }
    inconsistencies
}

fn recompute_ledger(
    deps: &WorkflowDeps,
    job: &MiningJob,
    stamp: &ValidationStamp,
) -> ChainResult<(Vec<u8>, crate::types::LedgerOperations)> {
    let tx = &job.tx;
    let previous_last = deps.store.get_last_chain_address(&tx.previous_address())?;
    let previous_tx = deps.store.get_transaction(&previous_last)?;
    let previous_poi = previous_tx
        .as_ref()
        .and_then(|previous| previous.validation_stamp.as_ref())
        .map(|previous_stamp| previous_stamp.proof_of_integrity.clone());
    let proof_of_integrity = tx.proof_of_integrity(previous_poi.as_deref());
    let price = deps.price.uco_price(tx.timestamp).usd;
    let inputs = deps.store.unspent_outputs(&previous_last)?;
    let store = Arc::clone(&deps.store);
    let resolve = move |address: &Address| {
        store
            .get_last_chain_address(address)
            .unwrap_or_else(|_| address.clone())
    };
    let operations =
        ledger::ledger_operations(tx, &inputs, price, stamp.timestamp, &resolve)?;
    Ok((proof_of_integrity, operations))
}

/// Drives this validator's replication sub-tree and tallies storage
/// acknowledgments against the chain-set quorum.
pub(super) async fn replicate(
    deps: &WorkflowDeps,
    job: &MiningJob,
    stamp: ValidationStamp,
    mut cross_stamps: Vec<CrossValidationStamp>,
    trees: &ReplicationTrees,
    pending_events: Vec<WorkflowEvent>,
    events: &mut mpsc::UnboundedReceiver<WorkflowEvent>,
) -> ChainResult<()> {
    cross_stamps.sort_by(|a, b| a.node_public_key.cmp(&b.node_public_key));
    let mut validated = job.tx.clone();
    validated.validation_stamp = Some(stamp);
    validated.cross_validation_stamps = cross_stamps;
    let record_digest = crate::crypto::hash(HashAlgorithm::Sha256, &validated.to_bytes());

    let empty = BitVector::new(0);
    let chain_slice = assigned_nodes(
        &job.election.chain_storage,
        trees.chain.get(job.rank).unwrap_or(&empty),
    );
    let beacon_slice = assigned_nodes(
        &job.election.beacon_storage,
        trees.beacon.get(job.rank).unwrap_or(&empty),
    );
    let io_slice = assigned_nodes(
        &job.election.io_storage,
        trees.io.get(job.rank).unwrap_or(&empty),
    );

    let mut tracker = AckTracker::new(ack_quorum(job.election.chain_storage.len()));
    for event in pending_events {
        if let WorkflowEvent::StorageAck {
            node_public_key,
            signature,
        } = event
        {
            if accept_ack(job, &record_digest, &node_public_key, &signature) {
                tracker.record(&node_public_key);
            }
        }
    }
    let chain_keys: Vec<PublicKey> = chain_slice
        .iter()
        .map(|node| node.first_public_key.clone())
        .collect();
    let chain_message = Message::ReplicateTransactionChain {
        transaction: validated.clone(),
    };
    let replies = broadcast(&deps.transport, &chain_keys, &chain_message).await;
    let mut gathered = Vec::new();
    for reply in replies.into_iter().flatten() {
        if let Message::AcknowledgeStorage {
            node_public_key,
            signature,
            ..
        } = reply
        {
            if accept_ack(job, &record_digest, &node_public_key, &signature) {
                tracker.record(&node_public_key);
                gathered.push((node_public_key, signature));
            }
        }
    }

    let summary_message = Message::ReplicateTransaction {
        transaction: validated.clone(),
    };
    let summary_keys: Vec<PublicKey> = beacon_slice
        .iter()
        .chain(io_slice.iter())
        .map(|node| node.first_public_key.clone())
        .collect();
    broadcast(&deps.transport, &summary_keys, &summary_message).await;

    // Share the acknowledgments we collected with the rest of the committee
    // so every validator can observe the quorum.
    for (node_public_key, signature) in &gathered {
        let forward = Message::AcknowledgeStorage {
            address: job.tx.address.clone(),
            node_public_key: node_public_key.clone(),
            signature: signature.clone(),
        };
        broadcast(&deps.transport, &job.peer_keys(), &forward).await;
    }

    let deadline = Instant::now() + deps.config.replication_timeout;
    while !tracker.reached() {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(WorkflowEvent::StorageAck {
                node_public_key,
                signature,
            })) => {
                if accept_ack(job, &record_digest, &node_public_key, &signature) {
                    tracker.record(&node_public_key);
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(ChainError::NetworkIssue("workflow mailbox closed".into()));
            }
            Err(_) => {
                return Err(ChainError::ReplicationTimeout {
                    received: tracker.received(),
                    required: tracker.required(),
                });
            }
        }
    }
    info!(
        address = %job.tx.address,
        acknowledged = tracker.received(),
        "replication quorum reached"
    );

    // Rank-based fallback for the client-facing confirmation: the
    // coordinator reports first, the next rank steps in if it did not.
    sleep(deps.config.fallback_interval * job.rank as u32).await;
    let confirmation = Message::AcknowledgeStorage {
        address: job.tx.address.clone(),
        node_public_key: job.node_public_key.clone(),
        signature: deps
            .keystore
            .daily_sign(&storage_confirmation_digest(&job.tx.address)),
    };
    if let Err(err) = deps.transport.send(&job.welcome_node, confirmation).await {
        debug!(%err, "welcome node unreachable for storage confirmation");
    }
    Ok(())
}

/// Digest signed with the daily key when a validator confirms storage to the
/// welcome node. Distinct from storage acknowledgments, which sign the
/// stored record with the storage node's own key.
pub fn storage_confirmation_digest(address: &Address) -> Vec<u8> {
    let mut data = b"storage-confirmed".to_vec();
    data.extend_from_slice(&address.to_bytes());
    crate::crypto::hash(HashAlgorithm::Sha256, &data)
}

/// An acknowledgment counts when it comes from an elected chain storage node
/// and its signature covers the stored record.
fn accept_ack(
    job: &MiningJob,
    record_digest: &[u8],
    node_public_key: &PublicKey,
    signature: &[u8],
) -> bool {
    let member = job
        .election
        .chain_storage
        .iter()
        .any(|node| &node.first_public_key == node_public_key);
    if !member {
        return false;
    }
    node_public_key.verify(record_digest, signature).is_ok()
}
