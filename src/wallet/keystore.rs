// Key management and addresses

use crate::core::{PubkeyHash, hash160, hash256, public_key_bytes};
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use secp256k1::{Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Version byte prepended to the pubkey hash
pub const ADDRESS_VERSION: u8 = 0x00;

/// Length of the double-SHA256 checksum appended to an address payload
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Base58Check address for a pubkey hash: version ‖ hash ‖ checksum
pub fn address_from_pubkey_hash(pubkey_hash: &PubkeyHash) -> String {
    let mut payload = Vec::with_capacity(1 + 20 + ADDRESS_CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey_hash);
    let checksum = checksum(&payload);
    payload.extend_from_slice(&checksum);
    bs58::encode(payload).into_string()
}

/// Extract the pubkey hash from an address, checking length and checksum
pub fn decode_address(address: &str) -> Result<PubkeyHash> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;

    if bytes.len() != 1 + 20 + ADDRESS_CHECKSUM_LEN {
        return Err(Error::InvalidAddress(format!(
            "{}: expected 25 bytes, got {}",
            address,
            bytes.len()
        )));
    }

    let (payload, actual) = bytes.split_at(bytes.len() - ADDRESS_CHECKSUM_LEN);
    if checksum(payload).as_slice() != actual {
        return Err(Error::InvalidAddress(format!("{}: checksum mismatch", address)));
    }

    let mut pubkey_hash = [0u8; 20];
    pubkey_hash.copy_from_slice(&payload[1..]);
    Ok(pubkey_hash)
}

pub fn validate_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

fn checksum(payload: &[u8]) -> [u8; ADDRESS_CHECKSUM_LEN] {
    let digest = hash256(payload);
    let mut out = [0u8; ADDRESS_CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..ADDRESS_CHECKSUM_LEN]);
    out
}

/// On-disk form of a key pair
#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    secret_key: String,
}

/// Key pair
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    /// Uncompressed point without its prefix byte (x ‖ y)
    pub public_key: Vec<u8>,
    pub address: String,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(bytes)?;
        Ok(Self::from_secret_key(secret_key))
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = public_key_bytes(&secret_key.public_key(&secp));
        let address = address_from_pubkey_hash(&hash160(&public_key));
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        hash160(&self.public_key)
    }

    fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            secret_key: hex::encode(self.secret_key.secret_bytes()),
        }
    }
}

/// Wallet collection keyed by address
#[derive(Default)]
pub struct Wallets {
    keys: BTreeMap<String, KeyPair>,
}

impl Wallets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; a missing file is an empty collection
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }

        let json = fs::read_to_string(path)?;
        let stored: BTreeMap<String, StoredKeyPair> = serde_json::from_str(&json)
            .map_err(|e| Error::Wallet(format!("Failed to parse {}: {}", path.display(), e)))?;

        let mut keys = BTreeMap::new();
        for (address, entry) in stored {
            let secret = hex::decode(&entry.secret_key)
                .map_err(|e| Error::Wallet(format!("Bad secret key for {}: {}", address, e)))?;
            let keypair = KeyPair::from_secret_bytes(&secret)?;
            if keypair.address != address {
                return Err(Error::Wallet(format!(
                    "Key stored under {} derives {}",
                    address, keypair.address
                )));
            }
            keys.insert(address, keypair);
        }

        Ok(Self { keys })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let stored: BTreeMap<&String, StoredKeyPair> = self
            .keys
            .iter()
            .map(|(address, kp)| (address, kp.to_stored()))
            .collect();

        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| Error::Wallet(format!("Failed to serialize wallets: {}", e)))?;

        if let Some(dir) = path.as_ref().parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// Generate a key pair and return its address
    pub fn create_wallet(&mut self) -> String {
        let keypair = KeyPair::generate();
        let address = keypair.address.clone();
        self.keys.insert(address.clone(), keypair);
        address
    }

    pub fn get_wallet(&self, address: &str) -> Result<&KeyPair> {
        self.keys
            .get(address)
            .ok_or_else(|| Error::Wallet(format!("No key for address {}", address)))
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.keys.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public_key.len(), 64);
        assert_eq!(kp.pubkey_hash(), hash160(&kp.public_key));
        assert!(validate_address(&kp.address));
    }

    #[test]
    fn test_address_roundtrip() {
        let hash = [0x12; 20];
        let address = address_from_pubkey_hash(&hash);
        assert!(address.starts_with('1'));
        assert_eq!(decode_address(&address).unwrap(), hash);
    }

    #[test]
    fn test_corrupted_address_rejected() {
        let address = address_from_pubkey_hash(&[7; 20]);

        let mut chars: Vec<char> = address.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let corrupted: String = chars.into_iter().collect();

        assert!(!validate_address(&corrupted));
        assert!(!validate_address("0OIl"));
        assert!(!validate_address(""));
        assert!(matches!(
            decode_address(&address[..address.len() - 2]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_secret_key_restores_same_address() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&kp.secret_key.secret_bytes()).unwrap();
        assert_eq!(restored.address, kp.address);
        assert_eq!(restored.public_key, kp.public_key);
    }

    #[test]
    fn test_wallets_save_and_load() {
        let dir = std::env::temp_dir().join(format!("tinyledger-wallet-{}", rand::random::<u64>()));
        let path = dir.join("wallet.json");

        let mut wallets = Wallets::new();
        let a = wallets.create_wallet();
        let b = wallets.create_wallet();
        wallets.save(&path).unwrap();

        let loaded = Wallets::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get_wallet(&a).unwrap().public_key,
            wallets.get_wallet(&a).unwrap().public_key
        );
        assert!(loaded.get_wallet(&b).is_ok());
        assert!(loaded.get_wallet("missing").is_err());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_wallet_file_is_empty() {
        let path = std::env::temp_dir().join("tinyledger-no-such-wallet.json");
        assert!(Wallets::load(path).unwrap().is_empty());
    }
}
