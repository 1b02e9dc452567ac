// Storage layer for the chain and the UTXO index

mod chain;
mod utxo_set;

pub use chain::{BLOCKS_TREE, Blockchain, BlockchainIterator, GENESIS_NOTE};
pub use utxo_set::{CHAINSTATE_TREE, UnspentOutputs, UtxoSet};
