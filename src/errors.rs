use std::io;

use thiserror::Error;

/// Reason a pending transaction was refused admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionKind {
    InvalidPreviousSignature,
    InvalidContent,
    InvalidSchedule,
    DuplicateNode,
    InvalidTokenSpecification,
    InvalidNetworkChain,
    ContractParse,
    ContentTooLarge,
    InvalidOrigin,
    InsufficientFunds,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionKind::InvalidPreviousSignature => "invalid previous signature",
            RejectionKind::InvalidContent => "invalid content",
            RejectionKind::InvalidSchedule => "invalid schedule",
            RejectionKind::DuplicateNode => "duplicate node",
            RejectionKind::InvalidTokenSpecification => "invalid token specification",
            RejectionKind::InvalidNetworkChain => "invalid network chain",
            RejectionKind::ContractParse => "contract parse error",
            RejectionKind::ContentTooLarge => "content too large",
            RejectionKind::InvalidOrigin => "invalid origin",
            RejectionKind::InsufficientFunds => "insufficient funds",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {kind}: {detail}")]
    Rejected { kind: RejectionKind, detail: String },
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("invalid election: {0}")]
    InvalidElection(String),
    #[error("replication timeout: {received} of {required} storage acknowledgments")]
    ReplicationTimeout { received: usize, required: usize },
    #[error("network issue: {0}")]
    NetworkIssue(String),
    #[error("transaction seed decryption failed")]
    TransactionSeedDecryption,
    #[error("transaction already exists")]
    AlreadyExists,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ChainError {
    pub fn rejected(kind: RejectionKind, detail: impl Into<String>) -> Self {
        ChainError::Rejected {
            kind,
            detail: detail.into(),
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
