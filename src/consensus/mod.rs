// Consensus and validation logic

pub mod pow;
pub mod validation;

pub use pow::{ProofOfWork, Target, MiningResult};
pub use validation::{BlockValidator, ValidationError};
