//! Pending-transaction admission. Every class carries its own acceptance
//! rule; a transaction that fails here never reaches the mining workflow.

use serde_json::Value;

use crate::crypto::{Address, KeyOrigin, PublicKey};
use crate::errors::{ChainError, ChainResult, RejectionKind};
use crate::ledger::UCO_UNIT;
use crate::storage::ChainStore;
use crate::types::node::{Node, NodeContent};
use crate::types::{Transaction, TransactionType, UcoTransfer};

pub const DEFAULT_MAX_CONTENT_SIZE: usize = 3 * 1024 * 1024;
pub const DEFAULT_SHARED_SECRETS_INTERVAL: u64 = 86_400;
pub const DEFAULT_ORACLE_INTERVAL: u64 = 600;

/// Everything the admission rules consult besides the transaction itself.
pub struct ValidationContext<'a> {
    pub store: &'a dyn ChainStore,
    pub roster: &'a [Node],
    /// Root certificate key per origin family.
    pub root_ca_keys: Vec<(KeyOrigin, PublicKey)>,
    pub technical_council: Vec<PublicKey>,
    pub known_origin_keys: Vec<PublicKey>,
    pub reward_token_address: Option<Address>,
    /// Engine-computed distribution the current node-rewards cycle must match.
    pub expected_node_rewards: Vec<UcoTransfer>,
    /// Burned fees reported by the last oracle summary.
    pub burned_fees_last_summary: u64,
    pub shared_secrets_interval: u64,
    pub oracle_interval: u64,
    pub max_content_size: usize,
}

impl<'a> ValidationContext<'a> {
    pub fn new(store: &'a dyn ChainStore, roster: &'a [Node]) -> Self {
        Self {
            store,
            roster,
            root_ca_keys: Vec::new(),
            technical_council: Vec::new(),
            known_origin_keys: Vec::new(),
            reward_token_address: None,
            expected_node_rewards: Vec::new(),
            burned_fees_last_summary: 0,
            shared_secrets_interval: DEFAULT_SHARED_SECRETS_INTERVAL,
            oracle_interval: DEFAULT_ORACLE_INTERVAL,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
        }
    }

    fn root_ca(&self, origin: KeyOrigin) -> Option<&PublicKey> {
        self.root_ca_keys
            .iter()
            .find(|(family, _)| *family == origin)
            .map(|(_, key)| key)
    }
}

/// The admission filter. Returns the first rule violation, none on success.
pub fn validate_pending(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if tx.data.content.len() > ctx.max_content_size {
        return Err(ChainError::rejected(
            RejectionKind::ContentTooLarge,
            format!(
                "content is {} bytes, limit {}",
                tx.data.content.len(),
                ctx.max_content_size
            ),
        ));
    }
    tx.verify_previous_signature().map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidPreviousSignature, err.to_string())
    })?;
    if !tx.data.code.is_empty() {
        parse_contract(&tx.data.code)?;
    }
    if tx.tx_type.is_network() {
        check_network_chain(tx, ctx)?;
    }
    match tx.tx_type {
        TransactionType::Node => accept_node(tx, ctx),
        TransactionType::NodeSharedSecrets => accept_node_shared_secrets(tx, ctx),
        TransactionType::Origin => accept_origin(tx, ctx),
        TransactionType::Oracle => accept_oracle(tx, ctx),
        TransactionType::OracleSummary => accept_oracle_summary(tx, ctx),
        TransactionType::CodeProposal => accept_code_proposal(tx),
        TransactionType::CodeApproval => accept_code_approval(tx, ctx),
        TransactionType::MintRewards => accept_mint_rewards(tx, ctx),
        TransactionType::NodeRewards => accept_node_rewards(tx, ctx),
        TransactionType::Token => accept_token(tx),
        TransactionType::Keychain => accept_keychain(tx),
        TransactionType::KeychainAccess => accept_keychain_access(tx),
        TransactionType::Transfer | TransactionType::Beacon => Ok(()),
    }
}

/// Contract hook: the interpreter is external, but malformed code is turned
/// away before mining. The code must be a balanced set of
/// `condition`/`actions` blocks.
fn parse_contract(code: &str) -> ChainResult<()> {
    let opens = code
        .split_whitespace()
        .filter(|word| *word == "do" || word.ends_with("do"))
        .count();
    let closes = code
        .split_whitespace()
        .filter(|word| *word == "end")
        .count();
    let has_block = code.contains("actions") || code.contains("condition");
    if !has_block || opens != closes || opens == 0 {
        return Err(ChainError::rejected(
            RejectionKind::ContractParse,
            "code does not parse as condition/actions blocks",
        ));
    }
    Ok(())
}

/// Network chains are singletons: a new link must extend the chain rooted at
/// the recognized genesis for its type.
fn check_network_chain(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    let prior = ctx.store.list_addresses_by_type(tx.tx_type)?;
    let Some(genesis_like) = prior.first() else {
        // Bootstrap: the first transaction of this type founds the chain.
        return Ok(());
    };
    let recognized_genesis = ctx.store.get_first_chain_address(genesis_like)?;
    let claimed_genesis = ctx.store.get_first_chain_address(&tx.previous_address())?;
    if claimed_genesis != recognized_genesis {
        return Err(ChainError::rejected(
            RejectionKind::InvalidNetworkChain,
            format!(
                "previous address resolves to {claimed_genesis}, expected genesis {recognized_genesis}"
            ),
        ));
    }
    Ok(())
}

fn accept_node(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    let content = NodeContent::from_bytes(&tx.data.content).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidContent, err.to_string())
    })?;
    let ca = ctx.root_ca(content.origin_public_key.origin).ok_or_else(|| {
        ChainError::rejected(
            RejectionKind::InvalidOrigin,
            format!(
                "no root certificate authority for origin family {:?}",
                content.origin_public_key.origin
            ),
        )
    })?;
    ca.verify(&content.origin_public_key.to_bytes(), &content.certificate)
        .map_err(|_| {
            ChainError::rejected(
                RejectionKind::InvalidOrigin,
                "certificate does not verify under the family root",
            )
        })?;
    let duplicate = ctx.roster.iter().any(|node| {
        node.ip == content.ip
            && node.port == content.port
            && node.last_public_key != tx.previous_public_key
    });
    if duplicate {
        return Err(ChainError::rejected(
            RejectionKind::DuplicateNode,
            format!("{}:{} already announced by another node", content.ip, content.port),
        ));
    }
    if !tx.data.ledger.token.is_empty() {
        let reward_token = ctx.reward_token_address.as_ref();
        let only_rewards = tx
            .data
            .ledger
            .token
            .iter()
            .all(|transfer| Some(&transfer.token_address) == reward_token);
        if !only_rewards {
            return Err(ChainError::rejected(
                RejectionKind::InvalidContent,
                "node transactions may only move reward tokens",
            ));
        }
    }
    Ok(())
}

fn accept_node_shared_secrets(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if tx.data.ownerships.len() != 1 {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            format!("expected one ownership, found {}", tx.data.ownerships.len()),
        ));
    }
    if ctx.shared_secrets_interval == 0 || tx.timestamp % ctx.shared_secrets_interval != 0 {
        return Err(ChainError::rejected(
            RejectionKind::InvalidSchedule,
            "trigger time is not the scheduled renewal slot",
        ));
    }
    let ownership = &tx.data.ownerships[0];
    if ownership.authorized_keys.is_empty() {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "no authorized keys in the renewal ownership",
        ));
    }
    for entry in &ownership.authorized_keys {
        let known = ctx.roster.iter().any(|node| {
            node.last_public_key == entry.public_key || node.first_public_key == entry.public_key
        });
        if !known {
            return Err(ChainError::rejected(
                RejectionKind::InvalidContent,
                format!("{} is not a renewal candidate", entry.public_key),
            ));
        }
    }
    if tx.data.content.is_empty() {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "missing renewal content",
        ));
    }
    Ok(())
}

fn accept_origin(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    let (origin_key, rest) = PublicKey::from_bytes(&tx.data.content).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidContent, err.to_string())
    })?;
    let (certificate, rest) = crate::codec::take_bytes(rest).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidContent, err.to_string())
    })?;
    if !rest.is_empty() {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "trailing bytes after origin declaration",
        ));
    }
    if ctx.known_origin_keys.contains(&origin_key) {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "origin key already registered",
        ));
    }
    let ca = ctx.root_ca(origin_key.origin).ok_or_else(|| {
        ChainError::rejected(
            RejectionKind::InvalidOrigin,
            format!("no root certificate authority for origin family {:?}", origin_key.origin),
        )
    })?;
    ca.verify(&origin_key.to_bytes(), &certificate).map_err(|_| {
        ChainError::rejected(
            RejectionKind::InvalidOrigin,
            "certificate does not verify under the family root",
        )
    })
}

fn oracle_services(value: &Value) -> ChainResult<Vec<String>> {
    let object = value.as_object().ok_or_else(|| {
        ChainError::rejected(RejectionKind::InvalidContent, "oracle content is not an object")
    })?;
    for (service, entry) in object {
        if service != "uco" {
            return Err(ChainError::rejected(
                RejectionKind::InvalidContent,
                format!("unknown oracle service {service}"),
            ));
        }
        let prices = entry.as_object().ok_or_else(|| {
            ChainError::rejected(RejectionKind::InvalidContent, "oracle entry is not an object")
        })?;
        for currency in ["eur", "usd"] {
            let price = prices.get(currency).and_then(Value::as_f64).unwrap_or(0.0);
            if price <= 0.0 {
                return Err(ChainError::rejected(
                    RejectionKind::InvalidContent,
                    format!("oracle {currency} price must be positive"),
                ));
            }
        }
    }
    Ok(object.keys().cloned().collect())
}

fn accept_oracle(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if ctx.oracle_interval == 0 || tx.timestamp % ctx.oracle_interval != 0 {
        return Err(ChainError::rejected(
            RejectionKind::InvalidSchedule,
            "trigger time is not an oracle polling slot",
        ));
    }
    let value: Value = serde_json::from_slice(&tx.data.content).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidContent, err.to_string())
    })?;
    let services = oracle_services(&value)?;
    // The service set must stay consistent along the chain.
    let last = ctx.store.get_last_chain_address(&tx.previous_address())?;
    if let Some(previous) = ctx.store.get_transaction(&last)? {
        if let Ok(previous_value) = serde_json::from_slice::<Value>(&previous.data.content) {
            let previous_services = oracle_services(&previous_value)?;
            if previous_services != services {
                return Err(ChainError::rejected(
                    RejectionKind::InvalidContent,
                    "oracle services diverge from the chain's prior content",
                ));
            }
        }
    }
    Ok(())
}

fn accept_oracle_summary(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if ctx.oracle_interval == 0 || tx.timestamp % ctx.oracle_interval != 0 {
        return Err(ChainError::rejected(
            RejectionKind::InvalidSchedule,
            "trigger time is not a summary slot",
        ));
    }
    let value: Value = serde_json::from_slice(&tx.data.content).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidContent, err.to_string())
    })?;
    let object = value.as_object().ok_or_else(|| {
        ChainError::rejected(RejectionKind::InvalidContent, "summary content is not an object")
    })?;
    for (slot, snapshot) in object {
        if slot.parse::<u64>().is_err() {
            return Err(ChainError::rejected(
                RejectionKind::InvalidContent,
                format!("summary slot {slot} is not a timestamp"),
            ));
        }
        oracle_services(snapshot)?;
    }
    Ok(())
}

fn accept_code_proposal(tx: &Transaction) -> ChainResult<()> {
    let content = std::str::from_utf8(&tx.data.content).map_err(|_| {
        ChainError::rejected(RejectionKind::InvalidContent, "proposal is not utf-8")
    })?;
    let has_version = content.lines().any(|line| line.starts_with("Version:"));
    let changes = content
        .split_once("Changes:")
        .map(|(_, diff)| !diff.trim().is_empty())
        .unwrap_or(false);
    if !has_version || !changes {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "proposal must declare a version and a non-empty diff",
        ));
    }
    Ok(())
}

fn accept_code_approval(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if !ctx.technical_council.contains(&tx.previous_public_key) {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "signer is not a technical council member",
        ));
    }
    let proposal_address = tx.data.recipients.first().ok_or_else(|| {
        ChainError::rejected(RejectionKind::InvalidContent, "approval names no proposal")
    })?;
    let proposal = ctx
        .store
        .get_transaction(proposal_address)?
        .ok_or_else(|| {
            ChainError::rejected(RejectionKind::InvalidContent, "target proposal not found")
        })?;
    if proposal.tx_type != TransactionType::CodeProposal {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "approval target is not a code proposal",
        ));
    }
    let signer_previous = tx.previous_address();
    for address in ctx.store.list_addresses_by_type(TransactionType::CodeApproval)? {
        let Some(existing) = ctx.store.get_transaction(&address)? else {
            continue;
        };
        if existing.data.recipients.first() == Some(proposal_address)
            && existing.previous_address() == signer_previous
        {
            return Err(ChainError::rejected(
                RejectionKind::InvalidContent,
                "proposal already signed by this member",
            ));
        }
    }
    Ok(())
}

fn accept_mint_rewards(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if tx.data.ledger.uco_total() != ctx.burned_fees_last_summary {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            format!(
                "minted {} does not equal burned fees {}",
                tx.data.ledger.uco_total(),
                ctx.burned_fees_last_summary
            ),
        ));
    }
    let interval = ctx.oracle_interval.max(1);
    let slot_start = tx.timestamp - tx.timestamp % interval;
    for address in ctx.store.list_addresses_by_type(TransactionType::MintRewards)? {
        let Some(existing) = ctx.store.get_transaction(&address)? else {
            continue;
        };
        if existing.timestamp >= slot_start {
            return Err(ChainError::rejected(
                RejectionKind::InvalidSchedule,
                "rewards already minted since the last schedule",
            ));
        }
    }
    Ok(())
}

fn accept_node_rewards(tx: &Transaction, ctx: &ValidationContext<'_>) -> ChainResult<()> {
    if tx.data.ledger.uco != ctx.expected_node_rewards {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "transfer list does not match the computed reward distribution",
        ));
    }
    Ok(())
}

fn accept_token(tx: &Transaction) -> ChainResult<()> {
    let value: Value = serde_json::from_slice(&tx.data.content).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidTokenSpecification, err.to_string())
    })?;
    let object = value.as_object().ok_or_else(|| {
        ChainError::rejected(
            RejectionKind::InvalidTokenSpecification,
            "token document is not an object",
        )
    })?;
    let token_type = object.get("type").and_then(Value::as_str).ok_or_else(|| {
        ChainError::rejected(RejectionKind::InvalidTokenSpecification, "missing token type")
    })?;
    let supply = object.get("supply").and_then(Value::as_u64).unwrap_or(0);
    if supply == 0 {
        return Err(ChainError::rejected(
            RejectionKind::InvalidTokenSpecification,
            "supply must be a positive integer",
        ));
    }
    match token_type {
        "fungible" => {
            if object.contains_key("collection") {
                return Err(ChainError::rejected(
                    RejectionKind::InvalidTokenSpecification,
                    "fungible tokens cannot declare a collection",
                ));
            }
            Ok(())
        }
        "non-fungible" => {
            let collection = object
                .get("collection")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ChainError::rejected(
                        RejectionKind::InvalidTokenSpecification,
                        "non-fungible tokens require a collection",
                    )
                })?;
            let expected_supply = collection.len() as u64 * UCO_UNIT;
            if supply != expected_supply {
                return Err(ChainError::rejected(
                    RejectionKind::InvalidTokenSpecification,
                    format!("supply {supply} does not equal collection size x 10^8"),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for item in collection {
                let id = item.get("id").and_then(Value::as_u64).ok_or_else(|| {
                    ChainError::rejected(
                        RejectionKind::InvalidTokenSpecification,
                        "collection item is missing an id",
                    )
                })?;
                if !seen.insert(id) {
                    return Err(ChainError::rejected(
                        RejectionKind::InvalidTokenSpecification,
                        format!("duplicate collection id {id}"),
                    ));
                }
            }
            if let Some(decimals) = object.get("decimals").and_then(Value::as_u64) {
                if decimals != 8 {
                    return Err(ChainError::rejected(
                        RejectionKind::InvalidTokenSpecification,
                        "non-fungible collections use 8 decimals",
                    ));
                }
            }
            Ok(())
        }
        other => Err(ChainError::rejected(
            RejectionKind::InvalidTokenSpecification,
            format!("unknown token type {other}"),
        )),
    }
}

fn accept_keychain(tx: &Transaction) -> ChainResult<()> {
    if tx.data.ownerships.is_empty() {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "keychain carries no ownerships",
        ));
    }
    let value: Value = serde_json::from_slice(&tx.data.content).map_err(|err| {
        ChainError::rejected(RejectionKind::InvalidContent, err.to_string())
    })?;
    let object = value.as_object().ok_or_else(|| {
        ChainError::rejected(RejectionKind::InvalidContent, "did document is not an object")
    })?;
    if !object.contains_key("@context") || !object.contains_key("verificationMethod") {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "did document is missing @context or verificationMethod",
        ));
    }
    Ok(())
}

fn accept_keychain_access(tx: &Transaction) -> ChainResult<()> {
    if tx.data.ownerships.len() != 1 {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            format!("expected one ownership, found {}", tx.data.ownerships.len()),
        ));
    }
    if !tx.data.ownerships[0].authorizes(&tx.previous_public_key) {
        return Err(ChainError::rejected(
            RejectionKind::InvalidContent,
            "ownership does not authorize the previous public key",
        ));
    }
    Ok(())
}
