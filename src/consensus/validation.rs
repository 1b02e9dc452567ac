// Block validation

use crate::core::Block;
use crate::consensus::pow::ProofOfWork;

/// Validation error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Stored hash differs from the recomputed header hash
    HashMismatch,
    /// Block hash doesn't meet PoW target
    InvalidProofOfWork,
    /// Merkle root doesn't match calculated value
    InvalidMerkleRoot,
    /// Block has no transactions
    NoTransactions,
    /// Coinbase transaction in non-first position
    CoinbaseNotFirst,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ValidationError::HashMismatch => write!(f, "Block hash does not match header"),
            ValidationError::InvalidProofOfWork => write!(f, "Invalid proof of work"),
            ValidationError::InvalidMerkleRoot => write!(f, "Invalid merkle root"),
            ValidationError::NoTransactions => write!(f, "Block has no transactions"),
            ValidationError::CoinbaseNotFirst => write!(f, "Coinbase not in first position"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Stateless block checks (no chain context, no signatures)
pub struct BlockValidator {
    pow: ProofOfWork,
}

impl BlockValidator {
    pub fn new(bits: u32) -> Self {
        Self {
            pow: ProofOfWork::new(bits),
        }
    }

    /// Proof-of-work and identity: the stored hash must be the header's hash and below the target
    pub fn validate_header(&self, block: &Block) -> Result<(), ValidationError> {
        if block.header.hash() != block.hash {
            return Err(ValidationError::HashMismatch);
        }
        if !self.pow.validate(&block.header) {
            return Err(ValidationError::InvalidProofOfWork);
        }
        Ok(())
    }

    /// Header checks plus transaction structure and merkle commitment
    pub fn validate_block(&self, block: &Block) -> Result<(), ValidationError> {
        self.validate_header(block)?;

        let Some(merkle_root) = Block::calculate_merkle_root(&block.transactions) else {
            return Err(ValidationError::NoTransactions);
        };

        for tx in block.transactions.iter().skip(1) {
            if tx.is_coinbase() {
                return Err(ValidationError::CoinbaseNotFirst);
            }
        }

        if merkle_root != block.header.merkle_root {
            return Err(ValidationError::InvalidMerkleRoot);
        }

        Ok(())
    }
}
