// Ledger error types

use crate::core::Hash256;
use thiserror::Error;

/// Errors surfaced by the ledger core
#[derive(Debug, Error)]
pub enum Error {
    /// Block hash does not satisfy the proof-of-work target
    #[error("Block {0} fails proof-of-work validation")]
    ConsensusFailure(Hash256),

    /// A transaction signature failed verification
    #[error("Invalid signature in transaction {0}")]
    SignatureInvalid(Hash256),

    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Block not found: {0}")]
    BlockNotFound(Hash256),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Hash256),

    /// An input references a transaction that is not part of the supplied history.
    /// This is an integrity fault, not a lookup miss.
    #[error("Input references unknown transaction {0}")]
    MissingReference(Hash256),

    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Cannot mine a block without transactions")]
    EmptyBlock,

    #[error("Nonce space exhausted without meeting the target")]
    NonceSpaceExhausted,

    #[error("No blockchain found, create one first")]
    NoChain,

    #[error("Blockchain already exists")]
    ChainExists,

    /// The tip moved while a block was being mined on top of it
    #[error("Chain tip changed from {expected} while mining")]
    StaleTip { expected: Hash256 },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(inner) => Error::Store(inner),
        }
    }
}

impl Error {
    /// Whether the error leaves the process able to continue serving requests
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BlockNotFound(_)
                | Error::TransactionNotFound(_)
                | Error::PeerUnreachable { .. }
                | Error::InsufficientFunds { .. }
                | Error::SignatureInvalid(_)
                | Error::ConsensusFailure(_)
                | Error::StaleTip { .. }
        )
    }
}
