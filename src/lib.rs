//! Consensus mining core for a transaction-chain based distributed ledger.
//!
//! A small elected committee validates each pending transaction: the
//! coordinator assembles and signs a [`types::ValidationStamp`], the
//! cross-validators recompute every field and counter-sign, and the sealed
//! record is replicated to deterministically elected storage nodes.
//!
//! The crate splits along those lines: [`election`] picks committees and
//! storage sets, [`validation`] is the per-class admission filter,
//! [`mining`] runs the coordinator / cross-validator state machine,
//! [`ledger`] computes fees and UTXO consumption, and [`replication`]
//! partitions storage nodes among validators. [`node::NodeService`] wires
//! the pieces to the [`network`] transport and the [`storage`] chain store;
//! [`node::Node`] bootstraps a standalone instance from
//! [`config::NodeConfig`].

pub mod codec;
pub mod config;
pub mod crypto;
pub mod election;
pub mod errors;
pub mod ledger;
pub mod messages;
pub mod mining;
pub mod network;
pub mod node;
pub mod replication;
pub mod storage;
pub mod types;
pub mod validation;
