// Core ledger data structures

mod types;
mod transaction;
mod block;
mod serialize;
mod hash;
mod merkle;

pub use types::*;
pub use transaction::*;
pub use block::*;
pub use serialize::*;
pub use hash::*;
pub use merkle::{MerkleNode, MerkleTree, merkle_root};
