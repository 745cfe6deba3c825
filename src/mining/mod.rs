//! Mining workers. One workflow task exists per in-flight transaction
//! address; the registry routes incoming protocol messages to it and tears
//! the entry down on terminal states.

pub mod pow;
pub mod standalone;
pub mod workflow;

pub use workflow::{MiningJob, WorkflowConfig, WorkflowDeps};

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::{Address, PublicKey};
use crate::errors::{ChainError, ChainResult};
use crate::messages::{MiningContext, ReplicationTrees};
use crate::types::{BitVector, CrossValidationStamp, ValidationStamp};

/// Protocol input routed into a live workflow.
#[derive(Debug)]
pub enum WorkflowEvent {
    Context(MiningContext),
    CrossValidate {
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTrees,
        confirmed_validation_nodes: BitVector,
    },
    CrossValidationDone(CrossValidationStamp),
    StorageAck {
        node_public_key: PublicKey,
        signature: Vec<u8>,
    },
}

pub struct WorkflowHandle {
    mailbox: mpsc::UnboundedSender<WorkflowEvent>,
    task: JoinHandle<()>,
    /// Election the workflow was started under, for freshness comparison
    /// against conflicting `StartMining` requests.
    timestamp: u64,
    proof_of_election: Vec<u8>,
}

impl WorkflowHandle {
    pub fn new(
        mailbox: mpsc::UnboundedSender<WorkflowEvent>,
        task: JoinHandle<()>,
        timestamp: u64,
        proof_of_election: Vec<u8>,
    ) -> Self {
        Self {
            mailbox,
            task,
            timestamp,
            proof_of_election,
        }
    }
}

/// Address-keyed map of live workflows. A conflicting `StartMining` for a
/// live address only wins with a fresher election (the stale workflow is
/// cancelled); terminal workflows unregister themselves.
pub struct WorkflowRegistry {
    active: RwLock<HashMap<Vec<u8>, WorkflowHandle>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, address: &Address, handle: WorkflowHandle) -> ChainResult<()> {
        let mut active = self.active.write();
        if active.contains_key(&address.to_bytes()) {
            return Err(ChainError::AlreadyExists);
        }
        active.insert(address.to_bytes(), handle);
        Ok(())
    }

    /// Routes an event to the workflow owning `address`. Returns false when
    /// no workflow is live for it.
    pub fn deliver(&self, address: &Address, event: WorkflowEvent) -> bool {
        let active = self.active.read();
        match active.get(&address.to_bytes()) {
            Some(handle) => handle.mailbox.send(event).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.active.read().contains_key(&address.to_bytes())
    }

    /// Election the live workflow for `address` was started under.
    pub fn election_of(&self, address: &Address) -> Option<(u64, Vec<u8>)> {
        self.active
            .read()
            .get(&address.to_bytes())
            .map(|handle| (handle.timestamp, handle.proof_of_election.clone()))
    }

    /// Drops the registry entry. Called by the workflow itself on terminal
    /// states; the task handle is dropped, not aborted.
    pub fn remove(&self, address: &Address) {
        self.active.write().remove(&address.to_bytes());
    }

    /// Tears down a stale workflow, cancelling its task.
    pub fn cancel(&self, address: &Address) {
        if let Some(handle) = self.active.write().remove(&address.to_bytes()) {
            handle.task.abort();
        }
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::test_transaction;
    use crate::types::{TransactionData, TransactionType};

    fn sample_address() -> Address {
        test_transaction(TransactionType::Transfer, TransactionData::default(), 1).address
    }

    #[tokio::test]
    async fn registry_routes_and_releases() {
        let registry = WorkflowRegistry::new();
        let address = sample_address();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(async {});
        registry
            .register(&address, WorkflowHandle::new(sender, task, 1, Vec::new()))
            .unwrap();
        assert!(registry.contains(&address));

        let delivered = registry.deliver(
            &address,
            WorkflowEvent::StorageAck {
                node_public_key: crate::crypto::PublicKey {
                    curve: crate::crypto::Curve::Ed25519,
                    origin: crate::crypto::KeyOrigin::Software,
                    key: vec![0; 32],
                },
                signature: Vec::new(),
            },
        );
        assert!(delivered);
        assert!(receiver.recv().await.is_some());

        registry.remove(&address);
        assert!(!registry.contains(&address));
        assert!(!registry.deliver(
            &address,
            WorkflowEvent::StorageAck {
                node_public_key: crate::crypto::PublicKey {
                    curve: crate::crypto::Curve::Ed25519,
                    origin: crate::crypto::KeyOrigin::Software,
                    key: vec![0; 32],
                },
                signature: Vec::new(),
            }
        ));
    }

    #[tokio::test]
    async fn double_registration_is_refused() {
        let registry = WorkflowRegistry::new();
        let address = sample_address();
        let (sender, _receiver) = mpsc::unbounded_channel();
        registry
            .register(
                &address,
                WorkflowHandle::new(sender, tokio::spawn(async {}), 1, Vec::new()),
            )
            .unwrap();
        let (sender, _receiver) = mpsc::unbounded_channel();
        let err = registry
            .register(
                &address,
                WorkflowHandle::new(sender, tokio::spawn(async {}), 1, Vec::new()),
            )
            .unwrap_err();
        assert!(matches!(err, ChainError::AlreadyExists));
    }

    #[tokio::test]
    async fn cancel_tears_down_the_live_workflow() {
        let registry = WorkflowRegistry::new();
        let address = sample_address();
        let (sender, _receiver) = mpsc::unbounded_channel();
        registry
            .register(
                &address,
                WorkflowHandle::new(sender, tokio::spawn(async {}), 42, vec![7, 7]),
            )
            .unwrap();
        assert_eq!(registry.election_of(&address), Some((42, vec![7, 7])));

        registry.cancel(&address);
        assert!(!registry.contains(&address));
        assert!(registry.election_of(&address).is_none());
    }
}
