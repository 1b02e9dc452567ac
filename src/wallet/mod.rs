// Wallet and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{
    ADDRESS_VERSION, KeyPair, Wallets, address_from_pubkey_hash, decode_address, validate_address,
};
pub use tx_builder::new_utxo_transaction;
