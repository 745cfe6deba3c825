//! Transport seam used by mining. The real swarm lives outside this
//! subsystem; workflows see `send`/`broadcast` plus one availability probe.
//! An in-process transport backs the tests and local simulations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::crypto::PublicKey;
use crate::errors::{ChainError, ChainResult};
use crate::messages::Message;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a message and awaits the peer's reply.
    async fn send(&self, to: &PublicKey, message: Message) -> ChainResult<Message>;

    /// Cheap liveness probe feeding the availability views.
    async fn is_available(&self, node: &PublicKey) -> bool;
}

/// Fans a message out to every node, collecting each outcome.
pub async fn broadcast(
    transport: &Arc<dyn Transport>,
    nodes: &[PublicKey],
    message: &Message,
) -> Vec<ChainResult<Message>> {
    let mut tasks = JoinSet::new();
    for node in nodes {
        let transport = Arc::clone(transport);
        let node = node.clone();
        let message = message.clone();
        tasks.spawn(async move { transport.send(&node, message).await });
    }
    let mut replies = Vec::with_capacity(nodes.len());
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(reply) => replies.push(reply),
            Err(err) => replies.push(Err(ChainError::NetworkIssue(format!(
                "broadcast task failed: {err}"
            )))),
        }
    }
    replies
}

/// Queries `nodes` in parallel and returns as soon as a majority
/// (`n/2 + 1`) agree on a byte-identical reply; in-flight requests are
/// cancelled at that point. When every reply arrives without a majority the
/// caller's resolver breaks the tie.
pub async fn quorum_read<R>(
    transport: &Arc<dyn Transport>,
    nodes: &[PublicKey],
    message: &Message,
    resolver: R,
) -> ChainResult<Message>
where
    R: Fn(Vec<Message>) -> Option<Message>,
{
    if nodes.is_empty() {
        return Err(ChainError::NetworkIssue("no nodes to query".into()));
    }
    let threshold = nodes.len() / 2 + 1;
    let mut tasks = JoinSet::new();
    for node in nodes {
        let transport = Arc::clone(transport);
        let node = node.clone();
        let message = message.clone();
        tasks.spawn(async move { transport.send(&node, message).await });
    }
    let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut replies = Vec::new();
    while let Some(result) = tasks.join_next().await {
        let Ok(Ok(reply)) = result else {
            continue;
        };
        let count = counts.entry(reply.to_bytes()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            return Ok(reply);
        }
        replies.push(reply);
    }
    resolver(replies).ok_or_else(|| ChainError::NetworkIssue("no quorum reached".into()))
}

/// A delivery the in-memory transport hands to a registered peer: the
/// message and the channel its reply must go back on.
pub struct Delivery {
    pub message: Message,
    pub reply: oneshot::Sender<ChainResult<Message>>,
}

type Mailbox = mpsc::UnboundedSender<Delivery>;

/// In-process transport: peers register a mailbox keyed by their first
/// public key; sends are channel round-trips with a reply deadline. Nodes
/// can be taken offline to simulate partitions.
pub struct MemoryTransport {
    peers: RwLock<HashMap<Vec<u8>, Mailbox>>,
    offline: RwLock<HashSet<Vec<u8>>>,
    reply_timeout: Duration,
}

impl MemoryTransport {
    pub fn new(reply_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            offline: RwLock::new(HashSet::new()),
            reply_timeout,
        })
    }

    pub fn register(&self, key: &PublicKey) -> mpsc::UnboundedReceiver<Delivery> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.write().insert(key.to_bytes(), sender);
        receiver
    }

    pub fn set_offline(&self, key: &PublicKey, offline: bool) {
        if offline {
            self.offline.write().insert(key.to_bytes());
        } else {
            self.offline.write().remove(&key.to_bytes());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &PublicKey, message: Message) -> ChainResult<Message> {
        if self.offline.read().contains(&to.to_bytes()) {
            return Err(ChainError::NetworkIssue(format!("node {to} unreachable")));
        }
        let mailbox = self
            .peers
            .read()
            .get(&to.to_bytes())
            .cloned()
            .ok_or_else(|| ChainError::NetworkIssue(format!("node {to} not registered")))?;
        let (reply_sender, reply_receiver) = oneshot::channel();
        mailbox
            .send(Delivery {
                message,
                reply: reply_sender,
            })
            .map_err(|_| ChainError::NetworkIssue(format!("node {to} mailbox closed")))?;
        match timeout(self.reply_timeout, reply_receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ChainError::NetworkIssue(format!(
                "node {to} dropped the reply"
            ))),
            Err(_) => Err(ChainError::NetworkIssue(format!("node {to} reply timeout"))),
        }
    }

    async fn is_available(&self, node: &PublicKey) -> bool {
        !self.offline.read().contains(&node.to_bytes())
            && self.peers.read().contains_key(&node.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_keypair, KeyOrigin};
    use crate::messages::ErrorReason;
    use crate::types::transaction::test_transaction;
    use crate::types::{TransactionData, TransactionType};

    fn key(tag: u8) -> PublicKey {
        let keypair = derive_keypair(&[tag], 0).unwrap();
        PublicKey::from_ed25519(KeyOrigin::Software, &keypair.public)
    }

    fn spawn_echo(transport: &Arc<MemoryTransport>, key: &PublicKey, reply: Message) {
        let mut receiver = transport.register(key);
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let _ = delivery.reply.send(Ok(reply.clone()));
            }
        });
    }

    #[tokio::test]
    async fn send_round_trips_through_the_hub() {
        let transport = MemoryTransport::new(Duration::from_millis(200));
        spawn_echo(&transport, &key(1), Message::Ok);
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let reply = transport_dyn.send(&key(1), Message::Ok).await.unwrap();
        assert_eq!(reply, Message::Ok);
    }

    #[tokio::test]
    async fn offline_nodes_are_network_issues() {
        let transport = MemoryTransport::new(Duration::from_millis(200));
        spawn_echo(&transport, &key(1), Message::Ok);
        transport.set_offline(&key(1), true);
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        assert!(transport_dyn.send(&key(1), Message::Ok).await.is_err());
        assert!(!transport_dyn.is_available(&key(1)).await);
    }

    #[tokio::test]
    async fn broadcast_collects_every_outcome() {
        let transport = MemoryTransport::new(Duration::from_millis(200));
        spawn_echo(&transport, &key(1), Message::Ok);
        spawn_echo(&transport, &key(2), Message::Ok);
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let replies = broadcast(&transport_dyn, &[key(1), key(2), key(3)], &Message::Ok).await;
        let successes = replies.iter().filter(|reply| reply.is_ok()).count();
        assert_eq!(successes, 2);
        assert_eq!(replies.len(), 3);
    }

    #[tokio::test]
    async fn quorum_read_returns_majority_reply() {
        let transport = MemoryTransport::new(Duration::from_millis(200));
        let tx = test_transaction(TransactionType::Transfer, TransactionData::default(), 1);
        let majority = Message::Ok;
        let minority = Message::Error {
            reason: ErrorReason::NetworkIssue,
            address: tx.address.clone(),
        };
        spawn_echo(&transport, &key(1), majority.clone());
        spawn_echo(&transport, &key(2), majority.clone());
        spawn_echo(&transport, &key(3), minority);
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let reply = quorum_read(
            &transport_dyn,
            &[key(1), key(2), key(3)],
            &Message::Ok,
            |_| None,
        )
        .await
        .unwrap();
        assert_eq!(reply, majority);
    }

    #[tokio::test]
    async fn quorum_read_falls_back_to_resolver() {
        let transport = MemoryTransport::new(Duration::from_millis(200));
        let tx = test_transaction(TransactionType::Transfer, TransactionData::default(), 1);
        spawn_echo(&transport, &key(1), Message::Ok);
        spawn_echo(
            &transport,
            &key(2),
            Message::Error {
                reason: ErrorReason::NetworkIssue,
                address: tx.address.clone(),
            },
        );
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let reply = quorum_read(
            &transport_dyn,
            &[key(1), key(2)],
            &Message::Ok,
            |replies| replies.into_iter().find(|reply| reply == &Message::Ok),
        )
        .await
        .unwrap();
        assert_eq!(reply, Message::Ok);
    }
}
