// Minimal proof-of-work ledger
// UTXO model, ECDSA-signed transactions, sled-backed chain and peer block sync

pub mod core;
pub mod consensus;
pub mod storage;
pub mod network;
pub mod wallet;
pub mod config;
pub mod error;
pub mod cli;

// Re-exports for convenience
pub use core::{Block, BlockHeader, Hash256, Transaction, TxInput, TxOutput};
pub use consensus::{BlockValidator, ProofOfWork, ValidationError};
pub use storage::{Blockchain, UtxoSet};
pub use network::{Message, Node, PeerRegistry};
pub use wallet::{KeyPair, Wallets};
pub use config::{ChainConfig, NodeConfig};
pub use error::{Error, Result};
pub use cli::{Cli, CliHandler};
