//! Node service: dispatches the mining message set, spawns workflows keyed
//! by transaction address, and runs the welcome-node path that carries a
//! client transaction from admission to storage confirmation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::crypto::{
    self, Address, HashAlgorithm, KeyOrigin, NodeIdentity, OriginKeySet, PublicKey,
    SharedKeystore,
};
use crate::election::{self, ElectionConstraints};
use crate::errors::{ChainError, ChainResult};
use crate::ledger::{FixedPrice, PriceProvider, UcoPrice};
use crate::messages::{ErrorReason, Message};
use crate::mining::workflow::{self, storage_confirmation_digest};
use crate::mining::{
    MiningJob, WorkflowConfig, WorkflowDeps, WorkflowEvent, WorkflowHandle, WorkflowRegistry,
};
use crate::network::{broadcast, Delivery, MemoryTransport, Transport};
use crate::storage::{ChainStore, MemoryStore};
use crate::types::node::Node as RosterNode;
use crate::types::node::NodeTransport;
use crate::types::{Transaction, UnspentOutput, UtxoKind};
use crate::validation::{validate_pending, ValidationContext};

/// Wiring for a [`NodeService`]. Collaborators are injected so tests can run
/// whole clusters over the in-memory transport.
pub struct NodeServiceParams {
    pub identity: NodeIdentity,
    pub keystore: Arc<SharedKeystore>,
    pub origin_keys: Arc<OriginKeySet>,
    pub roster: Vec<RosterNode>,
    pub store: Arc<dyn ChainStore>,
    pub transport: Arc<dyn Transport>,
    pub price: Arc<dyn PriceProvider>,
    pub constraints: ElectionConstraints,
    pub workflow_config: WorkflowConfig,
    pub root_ca_keys: Vec<(KeyOrigin, PublicKey)>,
    pub technical_council: Vec<PublicKey>,
    pub shared_secrets_interval: u64,
    pub oracle_interval: u64,
    pub max_content_size: usize,
}

struct ServiceInner {
    identity: NodeIdentity,
    node_public_key: PublicKey,
    keystore: Arc<SharedKeystore>,
    origin_keys: Arc<OriginKeySet>,
    roster: RwLock<Vec<RosterNode>>,
    store: Arc<dyn ChainStore>,
    transport: Arc<dyn Transport>,
    price: Arc<dyn PriceProvider>,
    registry: Arc<WorkflowRegistry>,
    constraints: ElectionConstraints,
    workflow_config: WorkflowConfig,
    root_ca_keys: Vec<(KeyOrigin, PublicKey)>,
    technical_council: Vec<PublicKey>,
    shared_secrets_interval: u64,
    oracle_interval: u64,
    max_content_size: usize,
    pending_clients: RwLock<HashMap<Vec<u8>, oneshot::Sender<Message>>>,
}

#[derive(Clone)]
pub struct NodeService {
    inner: Arc<ServiceInner>,
}

impl NodeService {
    pub fn new(params: NodeServiceParams) -> Self {
        let node_public_key = params.identity.public_key();
        Self {
            inner: Arc::new(ServiceInner {
                identity: params.identity,
                node_public_key,
                keystore: params.keystore,
                origin_keys: params.origin_keys,
                roster: RwLock::new(params.roster),
                store: params.store,
                transport: params.transport,
                price: params.price,
                registry: Arc::new(WorkflowRegistry::new()),
                constraints: params.constraints,
                workflow_config: params.workflow_config,
                root_ca_keys: params.root_ca_keys,
                technical_council: params.technical_council,
                shared_secrets_interval: params.shared_secrets_interval,
                oracle_interval: params.oracle_interval,
                max_content_size: params.max_content_size,
                pending_clients: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn node_public_key(&self) -> PublicKey {
        self.inner.node_public_key.clone()
    }

    pub fn store(&self) -> Arc<dyn ChainStore> {
        Arc::clone(&self.inner.store)
    }

    /// Replaces the roster snapshot on a network event.
    pub fn update_roster(&self, roster: Vec<RosterNode>) {
        *self.inner.roster.write() = roster;
    }

    /// Installs the next daily key after a node-shared-secrets renewal has
    /// been unwrapped by the shared-secrets subsystem.
    pub fn rotate_daily(&self, daily_seed: &[u8]) -> ChainResult<()> {
        self.inner.keystore.rotate_daily(daily_seed)
    }

    /// Drains transport deliveries into the protocol handler.
    pub fn spawn_message_loop(
        &self,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let reply = service.handle_message(delivery.message).await;
                let _ = delivery.reply.send(Ok(reply));
            }
        })
    }

    /// Protocol dispatch. Always produces a reply message; failures are
    /// reported as `Error` frames, never dropped.
    pub async fn handle_message(&self, message: Message) -> Message {
        match message {
            Message::StartMining {
                transaction,
                welcome_node_public_key,
                validation_node_public_keys,
            } => {
                let address = transaction.address.clone();
                match self
                    .start_mining(
                        transaction,
                        welcome_node_public_key,
                        validation_node_public_keys,
                    )
                    .await
                {
                    Ok(()) => Message::Ok,
                    Err(ChainError::AlreadyExists) => Message::Error {
                        reason: ErrorReason::TransactionAlreadyExists,
                        address,
                    },
                    Err(err) => {
                        warn!(%address, %err, "refusing to mine transaction");
                        Message::Error {
                            reason: ErrorReason::InvalidTransaction,
                            address,
                        }
                    }
                }
            }
            Message::AddMiningContext { address, context } => {
                if !self
                    .inner
                    .registry
                    .deliver(&address, WorkflowEvent::Context(context))
                {
                    debug!(%address, "mining context for an unknown workflow");
                }
                Message::Ok
            }
            Message::CrossValidate {
                address,
                validation_stamp,
                replication_tree,
                confirmed_validation_nodes,
            } => {
                self.inner.registry.deliver(
                    &address,
                    WorkflowEvent::CrossValidate {
                        validation_stamp,
                        replication_tree,
                        confirmed_validation_nodes,
                    },
                );
                Message::Ok
            }
            Message::CrossValidationDone {
                address,
                cross_validation_stamp,
            } => {
                self.inner.registry.deliver(
                    &address,
                    WorkflowEvent::CrossValidationDone(cross_validation_stamp),
                );
                Message::Ok
            }
            Message::ReplicateTransactionChain { transaction }
            | Message::ReplicateTransaction { transaction } => {
                self.replicate_transaction(transaction)
            }
            Message::AcknowledgeStorage {
                address,
                node_public_key,
                signature,
            } => {
                let confirmation = self
                    .inner
                    .keystore
                    .daily_public_key()
                    .verify(&storage_confirmation_digest(&address), &signature)
                    .is_ok();
                if confirmation {
                    if let Some(client) =
                        self.inner.pending_clients.write().remove(&address.to_bytes())
                    {
                        let _ = client.send(Message::AcknowledgeStorage {
                            address,
                            node_public_key,
                            signature,
                        });
                    }
                } else {
                    self.inner.registry.deliver(
                        &address,
                        WorkflowEvent::StorageAck {
                            node_public_key,
                            signature,
                        },
                    );
                }
                Message::Ok
            }
            Message::Error { reason, address } => {
                if let Some(client) =
                    self.inner.pending_clients.write().remove(&address.to_bytes())
                {
                    let _ = client.send(Message::Error { reason, address });
                }
                Message::Ok
            }
            Message::Ok => Message::Ok,
        }
    }

    /// Welcome-node path: admit, elect, broadcast `StartMining`, then hold
    /// the client until storage is confirmed or the workflow reports failure.
    pub async fn submit_transaction(
        &self,
        tx: Transaction,
        deadline: Duration,
    ) -> ChainResult<Address> {
        if self.inner.store.get_transaction(&tx.address)?.is_some() {
            return Err(ChainError::AlreadyExists);
        }
        let roster = self.inner.roster.read().clone();
        let ctx = self.validation_context(&roster);
        validate_pending(&tx, &ctx)?;

        let proof = election::proof_of_election(&self.inner.keystore, &tx);
        let election = election::elect_with_proof(
            &tx,
            &roster,
            &proof,
            self.inner.keystore.storage_nonce(),
            &self.inner.constraints,
        );
        let committee_keys: Vec<PublicKey> = election
            .validation_committee
            .iter()
            .map(|node| node.first_public_key.clone())
            .collect();
        if committee_keys.is_empty() {
            return Err(ChainError::InvalidElection(
                "no authorized validator available".into(),
            ));
        }

        let (sender, receiver) = oneshot::channel();
        self.inner
            .pending_clients
            .write()
            .insert(tx.address.to_bytes(), sender);
        let address = tx.address.clone();
        info!(%address, committee = committee_keys.len(), "starting mining");
        let message = Message::StartMining {
            transaction: tx,
            welcome_node_public_key: self.inner.node_public_key.clone(),
            validation_node_public_keys: committee_keys.clone(),
        };
        broadcast(&self.inner.transport, &committee_keys, &message).await;

        let outcome = timeout(deadline, receiver).await;
        self.inner
            .pending_clients
            .write()
            .remove(&address.to_bytes());
        match outcome {
            Ok(Ok(Message::AcknowledgeStorage { .. })) => Ok(address),
            Ok(Ok(Message::Error { reason, .. })) => Err(match reason {
                ErrorReason::NetworkIssue => {
                    ChainError::NetworkIssue("replication did not complete".into())
                }
                ErrorReason::InvalidTransaction => {
                    ChainError::Transaction("rejected during validation".into())
                }
                ErrorReason::TransactionAlreadyExists => ChainError::AlreadyExists,
            }),
            Ok(Ok(_)) | Ok(Err(_)) => {
                Err(ChainError::NetworkIssue("confirmation channel closed".into()))
            }
            Err(_) => Err(ChainError::NetworkIssue(
                "no confirmation before the deadline".into(),
            )),
        }
    }

    async fn start_mining(
        &self,
        tx: Transaction,
        welcome_node: PublicKey,
        announced: Vec<PublicKey>,
    ) -> ChainResult<()> {
        if self.inner.store.get_transaction(&tx.address)?.is_some() {
            return Err(ChainError::AlreadyExists);
        }
        let proof = election::proof_of_election(&self.inner.keystore, &tx);
        // A conflicting start for a live address only wins with a newer
        // election: a later trigger time, or a rotated daily key at the same
        // slot. The stale workflow is torn down once the newcomer passes the
        // same checks it did.
        let supersede = match self.inner.registry.election_of(&tx.address) {
            Some((live_timestamp, live_proof)) => {
                let newer = tx.timestamp > live_timestamp
                    || (tx.timestamp == live_timestamp && proof != live_proof);
                if !newer {
                    return Err(ChainError::AlreadyExists);
                }
                true
            }
            None => false,
        };
        let roster = self.inner.roster.read().clone();
        election::valid_election(
            &tx,
            &announced,
            &roster,
            &self.inner.keystore.daily_public_key(),
            &proof,
            &self.inner.constraints,
        )?;
        let ctx = self.validation_context(&roster);
        validate_pending(&tx, &ctx)?;

        if supersede {
            warn!(address = %tx.address, "newer election supersedes live workflow");
            self.inner.registry.cancel(&tx.address);
        }

        let election = election::elect_with_proof(
            &tx,
            &roster,
            &proof,
            self.inner.keystore.storage_nonce(),
            &self.inner.constraints,
        );
        let Some(rank) = election
            .validation_committee
            .iter()
            .position(|node| node.first_public_key == self.inner.node_public_key)
        else {
            // Not a committee member; nothing to run.
            return Ok(());
        };

        let (mailbox, events) = mpsc::unbounded_channel();
        let deps = WorkflowDeps {
            transport: Arc::clone(&self.inner.transport),
            store: Arc::clone(&self.inner.store),
            keystore: Arc::clone(&self.inner.keystore),
            node_keypair: self.inner.identity.keypair(),
            origin_keys: Arc::clone(&self.inner.origin_keys),
            price: Arc::clone(&self.inner.price),
            registry: Arc::clone(&self.inner.registry),
            constraints: self.inner.constraints,
            config: self.inner.workflow_config.clone(),
        };
        let job = MiningJob {
            tx: tx.clone(),
            welcome_node,
            election,
            proof_of_election: proof.clone(),
            roster,
            rank,
            node_public_key: self.inner.node_public_key.clone(),
        };
        let task = tokio::spawn(workflow::run(deps, job, events));
        self.inner.registry.register(
            &tx.address,
            WorkflowHandle::new(mailbox, task, tx.timestamp, proof),
        )?;
        Ok(())
    }

    /// Storage-node duty: verify the sealed record and persist it, replying
    /// with a signed acknowledgment. Replays acknowledge idempotently.
    fn replicate_transaction(&self, tx: Transaction) -> Message {
        let address = tx.address.clone();
        match self.persist_replica(&tx) {
            Ok(()) | Err(ChainError::AlreadyExists) => {
                let digest = crypto::hash(HashAlgorithm::Sha256, &tx.to_bytes());
                Message::AcknowledgeStorage {
                    address,
                    node_public_key: self.inner.node_public_key.clone(),
                    signature: self.inner.identity.sign(&digest),
                }
            }
            Err(err) => {
                warn!(%address, %err, "refusing replica");
                Message::Error {
                    reason: ErrorReason::InvalidTransaction,
                    address,
                }
            }
        }
    }

    fn persist_replica(&self, tx: &Transaction) -> ChainResult<()> {
        let stamp = tx
            .validation_stamp
            .as_ref()
            .ok_or_else(|| ChainError::Transaction("replica carries no validation stamp".into()))?;
        stamp.verify(&self.inner.keystore.daily_public_key())?;
        for cross in &tx.cross_validation_stamps {
            cross.verify(stamp)?;
            if !cross.is_consistent() {
                return Err(ChainError::Transaction(
                    "replica carries inconsistent cross-validation stamps".into(),
                ));
            }
        }
        self.inner.store.write_transaction(tx)
    }

    fn validation_context<'a>(&'a self, roster: &'a [RosterNode]) -> ValidationContext<'a> {
        let mut ctx = ValidationContext::new(self.inner.store.as_ref(), roster);
        ctx.root_ca_keys = self.inner.root_ca_keys.clone();
        ctx.technical_council = self.inner.technical_council.clone();
        ctx.known_origin_keys = self.inner.origin_keys.snapshot();
        ctx.shared_secrets_interval = self.inner.shared_secrets_interval;
        ctx.oracle_interval = self.inner.oracle_interval;
        ctx.max_content_size = self.inner.max_content_size;
        ctx
    }
}

/// Bootstrap node for the CLI: single-member roster, in-memory store and
/// transport, genesis allocations from the configuration.
pub struct Node {
    service: NodeService,
    message_loop: JoinHandle<()>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let identity = NodeIdentity::load_or_generate(&config.key_path)?;
        let node_public_key = identity.public_key();
        let keystore = Arc::new(SharedKeystore::new(
            config.daily_seed.as_bytes(),
            config.storage_nonce(),
        )?);

        let store = Arc::new(MemoryStore::new());
        for allocation in &config.genesis.allocations {
            let bytes = hex::decode(&allocation.address).map_err(|err| {
                ChainError::Config(format!("invalid genesis address encoding: {err}"))
            })?;
            let (address, rest) = Address::from_bytes(&bytes)?;
            if !rest.is_empty() {
                return Err(ChainError::Config("invalid genesis address".into()));
            }
            store.credit(
                &address,
                UnspentOutput {
                    from: address.clone(),
                    amount: allocation.amount,
                    kind: UtxoKind::Uco,
                    timestamp: 0,
                },
            );
        }

        let ip = match config.listen.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return Err(ChainError::Config("listen address must be ipv4".into()));
            }
        };
        let roster_entry = RosterNode {
            first_public_key: node_public_key.clone(),
            last_public_key: node_public_key.clone(),
            ip,
            port: config.listen.port(),
            http_port: config.listen.port().saturating_add(1),
            transport: NodeTransport::Tcp,
            geo_patch: config.geo_patch.clone(),
            authorized: true,
            authorization_date: 0,
            reward_address: Address::from_public_key(HashAlgorithm::Sha256, &node_public_key),
            origin_public_key: node_public_key.clone(),
            enrollment_certificate: Vec::new(),
        };

        let transport = MemoryTransport::new(config.reply_timeout());
        let deliveries = transport.register(&node_public_key);
        let service = NodeService::new(NodeServiceParams {
            identity,
            keystore,
            origin_keys: Arc::new(OriginKeySet::new(vec![node_public_key.clone()])),
            roster: vec![roster_entry],
            store,
            transport,
            price: Arc::new(FixedPrice(UcoPrice {
                eur: config.genesis.uco_price_usd,
                usd: config.genesis.uco_price_usd,
            })),
            constraints: config.constraints(),
            workflow_config: config.workflow_config(),
            root_ca_keys: vec![(KeyOrigin::Software, node_public_key.clone())],
            technical_council: Vec::new(),
            shared_secrets_interval: config.shared_secrets_interval,
            oracle_interval: config.oracle_interval,
            max_content_size: config.max_content_size,
        });
        let message_loop = service.spawn_message_loop(deliveries);
        info!(node = %node_public_key, "node bootstrapped");
        Ok(Self {
            service,
            message_loop,
        })
    }

    pub fn service(&self) -> NodeService {
        self.service.clone()
    }

    pub async fn start(self) -> ChainResult<()> {
        self.message_loop
            .await
            .map_err(|err| ChainError::NetworkIssue(format!("message loop failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_keypair;
    use crate::ledger::{transaction_fee, UCO_UNIT};
    use crate::network::MemoryTransport;
    use crate::types::transaction::TestChain;
    use crate::types::{LedgerContent, TransactionData, TransactionType, UcoTransfer};
    use ed25519_dalek::Keypair;

    const PRICE_USD: f64 = 0.05;

    fn test_workflow_config() -> WorkflowConfig {
        WorkflowConfig {
            context_timeout: Duration::from_millis(300),
            cross_validation_timeout: Duration::from_millis(600),
            replication_timeout: Duration::from_millis(800),
            fallback_interval: Duration::from_millis(50),
        }
    }

    struct Cluster {
        transport: Arc<MemoryTransport>,
        services: Vec<NodeService>,
        stores: Vec<Arc<MemoryStore>>,
        roster: Vec<RosterNode>,
        keystore: Arc<SharedKeystore>,
        origin: Keypair,
    }

    fn node_keypair(index: usize) -> Keypair {
        derive_keypair(&[200, index as u8], 0).unwrap()
    }

    fn roster_entry(index: usize) -> RosterNode {
        let keypair = node_keypair(index);
        let key = PublicKey::from_ed25519(KeyOrigin::Software, &keypair.public);
        RosterNode {
            first_public_key: key.clone(),
            last_public_key: key.clone(),
            ip: std::net::Ipv4Addr::new(127, 0, 0, index as u8 + 1),
            port: 3_000 + index as u16,
            http_port: 4_000 + index as u16,
            transport: NodeTransport::Tcp,
            geo_patch: format!("{:03X}", index * 7 + 1),
            authorized: true,
            authorization_date: 0,
            reward_address: Address::from_public_key(HashAlgorithm::Sha256, &key),
            origin_public_key: key,
            enrollment_certificate: Vec::new(),
        }
    }

    fn cluster_with_prices(count: usize, prices: Vec<f64>) -> Cluster {
        let transport = MemoryTransport::new(Duration::from_millis(400));
        let keystore =
            Arc::new(SharedKeystore::new(b"cluster-daily", [5u8; 32]).unwrap());
        let origin = derive_keypair(b"cluster-origin", 0).unwrap();
        let origin_key = PublicKey::from_ed25519(KeyOrigin::Software, &origin.public);
        let roster: Vec<RosterNode> = (0..count).map(roster_entry).collect();

        let mut services = Vec::with_capacity(count);
        let mut stores = Vec::with_capacity(count);
        for index in 0..count {
            let identity = NodeIdentity::from_keypair(node_keypair(index));
            let node_key = identity.public_key();
            let deliveries = transport.register(&node_key);
            let store = Arc::new(MemoryStore::new());
            stores.push(Arc::clone(&store));
            let service = NodeService::new(NodeServiceParams {
                identity,
                keystore: Arc::clone(&keystore),
                origin_keys: Arc::new(OriginKeySet::new(vec![origin_key.clone()])),
                roster: roster.clone(),
                store,
                transport: transport.clone(),
                price: Arc::new(FixedPrice(UcoPrice {
                    eur: prices[index],
                    usd: prices[index],
                })),
                constraints: ElectionConstraints::default(),
                workflow_config: test_workflow_config(),
                root_ca_keys: Vec::new(),
                technical_council: Vec::new(),
                shared_secrets_interval: 86_400,
                oracle_interval: 600,
                max_content_size: 1024 * 1024,
            });
            service.spawn_message_loop(deliveries);
            services.push(service);
        }
        Cluster {
            transport,
            services,
            stores,
            roster,
            keystore,
            origin,
        }
    }

    fn cluster(count: usize) -> Cluster {
        cluster_with_prices(count, vec![PRICE_USD; count])
    }

    fn transfer_to(recipient: &Address, amount: u64, cluster: &Cluster) -> Transaction {
        let mut chain = TestChain::new(b"client-chain");
        chain.next_transaction(
            TransactionType::Transfer,
            TransactionData {
                ledger: LedgerContent {
                    uco: vec![UcoTransfer {
                        to: recipient.clone(),
                        amount,
                    }],
                    token: Vec::new(),
                },
                ..TransactionData::default()
            },
            1_700_000,
            &cluster.origin,
        )
    }

    fn recipient_address(tag: u8) -> Address {
        let keypair = derive_keypair(&[210, tag], 0).unwrap();
        let key = PublicKey::from_ed25519(KeyOrigin::Software, &keypair.public);
        Address::from_public_key(HashAlgorithm::Sha256, &key)
    }

    impl Cluster {
        fn credit_everywhere(&self, address: &Address, amount: u64) {
            for store in &self.stores {
                store.credit(
                    address,
                    UnspentOutput {
                        from: address.clone(),
                        amount,
                        kind: UtxoKind::Uco,
                        timestamp: 1,
                    },
                );
            }
        }

        fn committee_for(&self, tx: &Transaction) -> Vec<PublicKey> {
            let proof = election::proof_of_election(&self.keystore, tx);
            election::elect_validation_committee(
                tx,
                &self.roster,
                &proof,
                &ElectionConstraints::default(),
            )
            .into_iter()
            .map(|node| node.first_public_key)
            .collect()
        }

        fn service_for(&self, key: &PublicKey) -> &NodeService {
            self.services
                .iter()
                .find(|service| &service.node_public_key() == key)
                .expect("service for key")
        }
    }

    #[tokio::test]
    async fn standalone_transfer_validates_and_settles() {
        let cluster = cluster(1);
        let service = &cluster.services[0];
        let recipient = recipient_address(1);
        let tx = transfer_to(&recipient, 1_000_000, &cluster);
        let funds = 10 * UCO_UNIT;

        // Seed the client's balance at its previous chain address.
        cluster.credit_everywhere(&tx.previous_address(), funds);
        let store = service.store();

        let address = service
            .submit_transaction(tx.clone(), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(address, tx.address);

        let stored = store.get_transaction(&tx.address).unwrap().unwrap();
        let stamp = stored.validation_stamp.as_ref().unwrap();
        assert!(stored.cross_validation_stamps.is_empty());
        let fee = transaction_fee(&tx, PRICE_USD);
        assert_eq!(stamp.ledger_operations.fee, fee);

        let remaining: u64 = store
            .unspent_outputs(&tx.address)
            .unwrap()
            .iter()
            .map(|utxo| utxo.amount)
            .sum();
        assert_eq!(remaining, funds - 1_000_000 - fee);
        let received: u64 = store
            .unspent_outputs(&recipient)
            .unwrap()
            .iter()
            .map(|utxo| utxo.amount)
            .sum();
        assert_eq!(received, 1_000_000);
    }

    #[tokio::test]
    async fn distributed_commit_stores_counter_signed_record() {
        let cluster = cluster(5);
        let recipient = recipient_address(2);
        let tx = transfer_to(&recipient, 1_000_000, &cluster);
        cluster.credit_everywhere(&tx.previous_address(), 10 * UCO_UNIT);
        let committee = cluster.committee_for(&tx);
        assert_eq!(committee.len(), 3);

        let welcome = &cluster.services[0];
        welcome
            .submit_transaction(tx.clone(), Duration::from_secs(5))
            .await
            .unwrap();

        // Every chain storage node holds the sealed record with both
        // counter-signatures, all of them clean.
        let mut replicas = 0;
        for service in &cluster.services {
            if let Some(stored) = service.store().get_transaction(&tx.address).unwrap() {
                replicas += 1;
                assert_eq!(stored.cross_validation_stamps.len(), 2);
                assert!(stored
                    .cross_validation_stamps
                    .iter()
                    .all(|stamp| stamp.is_consistent()));
            }
        }
        assert!(replicas >= 2, "expected a replicated record, got {replicas}");
    }

    #[tokio::test]
    async fn fee_disagreement_aborts_the_transaction() {
        let probe = cluster(5);
        let recipient = recipient_address(3);
        let tx = transfer_to(&recipient, 1_000_000, &probe);
        let committee = probe.committee_for(&tx);

        // Rebuild the cluster with the first cross-validator priced apart.
        let skewed_index = probe
            .services
            .iter()
            .position(|service| service.node_public_key() == committee[1])
            .expect("cross validator in cluster");
        let mut prices = vec![PRICE_USD; 5];
        prices[skewed_index] = PRICE_USD * 10.0;
        let cluster = cluster_with_prices(5, prices);
        cluster.credit_everywhere(&tx.previous_address(), 10 * UCO_UNIT);

        let err = cluster.services[0]
            .submit_transaction(tx.clone(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)), "got {err:?}");
        for service in &cluster.services {
            assert!(service.store().get_transaction(&tx.address).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn replication_timeout_aborts_with_network_issue() {
        let cluster = cluster(5);
        let recipient = recipient_address(4);
        let tx = transfer_to(&recipient, 1_000_000, &cluster);
        cluster.credit_everywhere(&tx.previous_address(), 10 * UCO_UNIT);
        let committee = cluster.committee_for(&tx);

        // Silence two storage-only nodes: the 4-of-5 write quorum becomes
        // unreachable while the committee itself stays healthy.
        let mut silenced = 0;
        for service in &cluster.services {
            let key = service.node_public_key();
            if !committee.contains(&key) && silenced < 2 {
                cluster.transport.set_offline(&key, true);
                silenced += 1;
            }
        }
        assert_eq!(silenced, 2);

        let welcome = cluster.service_for(&committee[0]);
        let err = welcome
            .submit_transaction(tx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NetworkIssue(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn committed_addresses_refuse_new_workflows() {
        let cluster = cluster(5);
        let recipient = recipient_address(5);
        let tx = transfer_to(&recipient, 1_000_000, &cluster);
        cluster.credit_everywhere(&tx.previous_address(), 10 * UCO_UNIT);
        let committee = cluster.committee_for(&tx);
        let welcome = &cluster.services[0];
        welcome
            .submit_transaction(tx.clone(), Duration::from_secs(5))
            .await
            .unwrap();

        // Resubmission through the welcome path is refused outright.
        let err = welcome
            .submit_transaction(tx.clone(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::AlreadyExists));

        // A replayed StartMining is answered without spawning a workflow.
        let validator = cluster.service_for(&committee[0]);
        let reply = validator
            .handle_message(Message::StartMining {
                transaction: tx.clone(),
                welcome_node_public_key: welcome.node_public_key(),
                validation_node_public_keys: committee.clone(),
            })
            .await;
        assert!(matches!(
            reply,
            Message::Error {
                reason: ErrorReason::TransactionAlreadyExists,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn newer_election_supersedes_live_workflow() {
        let cluster = cluster(5);
        let welcome_key = cluster.services[0].node_public_key();

        // Two pending transactions for the same address: same chain keys,
        // a fresher trigger time on the second.
        let previous = derive_keypair(b"conflict-chain", 0).unwrap();
        let next = derive_keypair(b"conflict-chain", 1).unwrap();
        let next_key = PublicKey::from_ed25519(KeyOrigin::Software, &next.public);
        let stale = Transaction::build(
            TransactionType::Transfer,
            TransactionData::default(),
            1_700_000,
            &previous,
            &next_key,
            &cluster.origin,
        );
        let fresh = Transaction::build(
            TransactionType::Transfer,
            TransactionData::default(),
            1_700_600,
            &previous,
            &next_key,
            &cluster.origin,
        );
        assert_eq!(stale.address, fresh.address);
        cluster.credit_everywhere(&stale.previous_address(), 10 * UCO_UNIT);

        let stale_committee = cluster.committee_for(&stale);
        let fresh_committee = cluster.committee_for(&fresh);
        // Two committees of three over five nodes always share a member.
        let common = stale_committee
            .iter()
            .find(|key| fresh_committee.contains(key))
            .expect("overlapping committee member")
            .clone();
        let validator = cluster.service_for(&common);

        let reply = validator
            .handle_message(Message::StartMining {
                transaction: stale.clone(),
                welcome_node_public_key: welcome_key.clone(),
                validation_node_public_keys: stale_committee.clone(),
            })
            .await;
        assert_eq!(reply, Message::Ok);

        // The same election again is a duplicate while the workflow lives.
        let reply = validator
            .handle_message(Message::StartMining {
                transaction: stale.clone(),
                welcome_node_public_key: welcome_key.clone(),
                validation_node_public_keys: stale_committee.clone(),
            })
            .await;
        assert!(matches!(
            reply,
            Message::Error {
                reason: ErrorReason::TransactionAlreadyExists,
                ..
            }
        ));

        // A newer election for the same address cancels the stale workflow
        // and takes its registry slot.
        let reply = validator
            .handle_message(Message::StartMining {
                transaction: fresh,
                welcome_node_public_key: welcome_key.clone(),
                validation_node_public_keys: fresh_committee,
            })
            .await;
        assert_eq!(reply, Message::Ok);

        // The displaced election cannot reclaim the address.
        let reply = validator
            .handle_message(Message::StartMining {
                transaction: stale,
                welcome_node_public_key: welcome_key,
                validation_node_public_keys: stale_committee,
            })
            .await;
        assert!(matches!(
            reply,
            Message::Error {
                reason: ErrorReason::TransactionAlreadyExists,
                ..
            }
        ));
    }
}
