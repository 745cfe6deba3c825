use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{Address, PublicKey};
use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeTransport {
    Tcp,
}

impl NodeTransport {
    pub fn as_byte(self) -> u8 {
        match self {
            NodeTransport::Tcp => 0,
        }
    }

    pub fn from_byte(byte: u8) -> ChainResult<Self> {
        match byte {
            0 => Ok(NodeTransport::Tcp),
            other => Err(ChainError::Crypto(format!("unknown transport id {other}"))),
        }
    }
}

/// Roster entry for a network peer. `first_public_key` identifies the node
/// chain; `last_public_key` is its current rotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub first_public_key: PublicKey,
    pub last_public_key: PublicKey,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub http_port: u16,
    pub transport: NodeTransport,
    pub geo_patch: String,
    pub authorized: bool,
    pub authorization_date: u64,
    pub reward_address: Address,
    pub origin_public_key: PublicKey,
    pub enrollment_certificate: Vec<u8>,
}

impl Node {
    /// A node may validate a transaction only if it was authorized strictly
    /// before the transaction's timestamp.
    pub fn authorized_at(&self, timestamp: u64) -> bool {
        self.authorized && self.authorization_date < timestamp
    }
}

/// Returns the authorized subset of the roster at `timestamp`, in canonical
/// order. Every honest node derives the same list for the same inputs.
pub fn authorized_nodes(roster: &[Node], timestamp: u64) -> Vec<Node> {
    let mut nodes: Vec<Node> = roster
        .iter()
        .filter(|node| node.authorized_at(timestamp))
        .cloned()
        .collect();
    sort_canonical(&mut nodes);
    nodes
}

/// Canonical roster ordering: ascending first public key bytes. Bit views
/// and replication trees index into this ordering.
pub fn sort_canonical(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| a.first_public_key.cmp(&b.first_public_key));
}

/// Declared content of a `Node` transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeContent {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub http_port: u16,
    pub transport: NodeTransport,
    pub reward_address: Address,
    pub origin_public_key: PublicKey,
    pub certificate: Vec<u8>,
}

impl NodeContent {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.ip.octets());
        codec::put_u16(&mut out, self.port);
        codec::put_u16(&mut out, self.http_port);
        codec::put_u8(&mut out, self.transport.as_byte());
        out.extend_from_slice(&self.reward_address.to_bytes());
        out.extend_from_slice(&self.origin_public_key.to_bytes());
        codec::put_bytes(&mut out, &self.certificate);
        out
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        if data.len() < 4 {
            return Err(ChainError::Crypto("truncated node content".into()));
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let rest = &data[4..];
        let (port, rest) = codec::take_u16(rest)?;
        let (http_port, rest) = codec::take_u16(rest)?;
        let (transport_byte, rest) = codec::take_u8(rest)?;
        let transport = NodeTransport::from_byte(transport_byte)?;
        let (reward_address, rest) = Address::from_bytes(rest)?;
        let (origin_public_key, rest) = PublicKey::from_bytes(rest)?;
        let (certificate, rest) = codec::take_bytes(rest)?;
        if !rest.is_empty() {
            return Err(ChainError::Crypto(
                "trailing bytes after node content".into(),
            ));
        }
        Ok(Self {
            ip,
            port,
            http_port,
            transport,
            reward_address,
            origin_public_key,
            certificate,
        })
    }
}

/// Deterministic roster entry for tests across the crate.
#[cfg(test)]
pub(crate) fn test_node(tag: u8, authorization_date: u64) -> Node {
    use crate::crypto::{derive_keypair, HashAlgorithm, KeyOrigin};

    let first = derive_keypair(&[tag], 0).unwrap();
    let last = derive_keypair(&[tag], 1).unwrap();
    let origin = derive_keypair(&[tag], 2).unwrap();
    let first_public_key = PublicKey::from_ed25519(KeyOrigin::Software, &first.public);
    let reward_address = Address::from_public_key(HashAlgorithm::Sha256, &first_public_key);
    Node {
        first_public_key,
        last_public_key: PublicKey::from_ed25519(KeyOrigin::Software, &last.public),
        ip: Ipv4Addr::new(127, 0, 0, tag.max(1)),
        port: 3000 + tag as u16,
        http_port: 4000 + tag as u16,
        transport: NodeTransport::Tcp,
        geo_patch: format!("{:03X}", tag as u16 % 0xFFF),
        authorized: true,
        authorization_date,
        reward_address,
        origin_public_key: PublicKey::from_ed25519(KeyOrigin::Software, &origin.public),
        enrollment_certificate: Vec::new(),
    }
}
