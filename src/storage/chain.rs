// Block and chain store on sled

use crate::config::ChainConfig;
use crate::consensus::{BlockValidator, ProofOfWork};
use crate::core::{Block, Hash256, Serializable, Transaction};
use crate::error::{Error, Result};
use crate::storage::UtxoSet;
use secp256k1::SecretKey;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;

/// Tree holding `hash -> block` plus the tip sentinel
pub const BLOCKS_TREE: &str = "blocks";

/// Sentinel key holding the current tip hash
const TIP_KEY: &[u8] = b"l";

/// Coinbase note of the genesis block
pub const GENESIS_NOTE: &str = "Genesis";

/// Append-only chain of blocks linked by `prev_block_hash`
#[derive(Clone)]
pub struct Blockchain {
    db: Db,
    blocks: Tree,
    config: ChainConfig,
    pow: ProofOfWork,
}

impl Blockchain {
    /// Attach to a store; an empty store is an empty chain
    pub fn open(db: Db, config: ChainConfig) -> Result<Self> {
        config.validate()?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        Ok(Self {
            db,
            blocks,
            pow: ProofOfWork::new(config.target_bits),
            config,
        })
    }

    /// Open the store at `path`
    pub fn open_path<P: AsRef<Path>>(path: P, config: ChainConfig) -> Result<Self> {
        let db = sled::open(path)?;
        Self::open(db, config)
    }

    /// Mine a genesis block paying the subsidy to `genesis_address` and index it
    pub fn create(db: Db, genesis_address: &str, config: ChainConfig) -> Result<Self> {
        let chain = Self::open(db, config)?;
        if chain.tip()?.is_some() {
            return Err(Error::ChainExists);
        }

        let coinbase = Transaction::new_coinbase(genesis_address, GENESIS_NOTE, config.subsidy)?;
        let genesis = Block::genesis(coinbase, &chain.pow)?;
        let encoded = genesis.serialize();

        chain
            .blocks
            .transaction(|tx| -> ConflictableTransactionResult<(), Error> {
                if tx.get(TIP_KEY)?.is_some() {
                    return abort(Error::ChainExists);
                }
                tx.insert(&genesis.hash.as_bytes()[..], encoded.as_slice())?;
                tx.insert(TIP_KEY, &genesis.hash.as_bytes()[..])?;
                Ok(())
            })?;

        log::info!("Created blockchain with genesis {}", genesis.hash);

        UtxoSet::new(&chain)?.reindex()?;
        Ok(chain)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn pow(&self) -> &ProofOfWork {
        &self.pow
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    /// Current tip hash, `None` for an empty chain
    pub fn tip(&self) -> Result<Option<Hash256>> {
        match self.blocks.get(TIP_KEY)? {
            Some(bytes) => Ok(Some(Hash256::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Verify, mine, validate and persist a block on top of the current tip
    pub fn append(&self, transactions: Vec<Transaction>) -> Result<Block> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(Error::SignatureInvalid(tx.id));
            }
        }

        let tip_hash = self.tip()?.ok_or(Error::NoChain)?;
        let tip = self.get_block(&tip_hash)?;

        let block = Block::mine(transactions, Some(tip_hash), tip.height + 1, &self.pow)?;
        self.validate(&block)?;
        self.commit(&block, tip_hash)?;

        log::info!("Appended block {} at height {}", block.hash, block.height);
        Ok(block)
    }

    /// Persist `block` as the new tip if the tip is still `expected_tip`
    fn commit(&self, block: &Block, expected_tip: Hash256) -> Result<()> {
        let encoded = block.serialize();
        self.blocks
            .transaction(|tx| -> ConflictableTransactionResult<(), Error> {
                let current = tx.get(TIP_KEY)?;
                if current.as_deref() != Some(&expected_tip.as_bytes()[..]) {
                    return abort(Error::StaleTip { expected: expected_tip });
                }
                tx.insert(&block.hash.as_bytes()[..], encoded.as_slice())?;
                tx.insert(TIP_KEY, &block.hash.as_bytes()[..])?;
                Ok(())
            })?;
        Ok(())
    }

    /// Store a block received from a peer. Returns `false` if it was already known.
    ///
    /// Proof-of-work, the stored hash and the merkle commitment are checked;
    /// the parent link is not, so a block whose parent is unknown is still stored.
    pub fn add_external_block(&self, block: &Block) -> Result<bool> {
        self.validate(block)?;

        let encoded = block.serialize();
        let stored = self
            .blocks
            .transaction(|tx| -> ConflictableTransactionResult<bool, Error> {
                let key = &block.hash.as_bytes()[..];
                if tx.get(key)?.is_some() {
                    return Ok(false);
                }
                tx.insert(key, encoded.as_slice())?;

                let advance = match tx.get(TIP_KEY)? {
                    None => true,
                    Some(tip_hash) => block.height > tip_height(tx, &tip_hash)?,
                };
                if advance {
                    tx.insert(TIP_KEY, key)?;
                }
                Ok(true)
            })?;

        if stored {
            log::info!("Added block {} at height {}", block.hash, block.height);
        }
        Ok(stored)
    }

    /// Structure and proof-of-work checks shared by local and peer blocks
    fn validate(&self, block: &Block) -> Result<()> {
        let validator = BlockValidator::new(self.config.target_bits);
        if let Err(e) = validator.validate_block(block) {
            log::warn!("Rejecting block {}: {}", block.hash, e);
            return Err(Error::ConsensusFailure(block.hash));
        }
        Ok(())
    }

    /// Walk from the tip back to genesis
    pub fn iter(&self) -> Result<BlockchainIterator> {
        Ok(BlockchainIterator {
            blocks: self.blocks.clone(),
            next: self.tip()?,
        })
    }

    /// Height of the tip, `None` for an empty chain
    pub fn best_height(&self) -> Result<Option<u32>> {
        match self.tip()? {
            Some(hash) => Ok(Some(self.get_block(&hash)?.height)),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Block> {
        load_block(&self.blocks, hash)
    }

    /// Every block hash, tip first
    pub fn block_hashes(&self) -> Result<Vec<Hash256>> {
        self.iter()?.map(|block| block.map(|b| b.hash)).collect()
    }

    /// Hashes of blocks with `low <= height <= high`, lowest height first
    pub fn block_hashes_in_range(&self, low: u32, high: u32) -> Result<Vec<Hash256>> {
        let mut hashes = Vec::new();
        for block in self.iter()? {
            let block = block?;
            if block.height < low {
                break;
            }
            if block.height <= high {
                hashes.push(block.hash);
            }
        }
        hashes.reverse();
        Ok(hashes)
    }

    pub fn find_transaction(&self, id: &Hash256) -> Result<Transaction> {
        for block in self.iter()? {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == *id) {
                return Ok(tx);
            }
        }
        Err(Error::TransactionNotFound(*id))
    }

    /// Sign every input of `tx`, looking up the transactions it spends
    pub fn sign_transaction(&self, tx: &mut Transaction, secret_key: &SecretKey) -> Result<()> {
        let prev_txs = self.referenced_transactions(tx)?;
        tx.sign(secret_key, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.referenced_transactions(tx)?;
        tx.verify(&prev_txs)
    }

    /// An input pointing outside the chain is an integrity fault
    fn referenced_transactions(&self, tx: &Transaction) -> Result<HashMap<Hash256, Transaction>> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            let Some(txid) = input.prev_txid else {
                continue;
            };
            if prev_txs.contains_key(&txid) {
                continue;
            }
            let prev = self.find_transaction(&txid).map_err(|e| match e {
                Error::TransactionNotFound(id) => Error::MissingReference(id),
                other => other,
            })?;
            prev_txs.insert(txid, prev);
        }
        Ok(prev_txs)
    }
}

fn load_block(blocks: &Tree, hash: &Hash256) -> Result<Block> {
    match blocks.get(hash.as_bytes())? {
        Some(bytes) => Block::deserialize(&bytes),
        None => Err(Error::BlockNotFound(*hash)),
    }
}

fn tip_height(tx: &TransactionalTree, tip_hash: &[u8]) -> ConflictableTransactionResult<u32, Error> {
    let Some(bytes) = tx.get(tip_hash)? else {
        return abort(Error::Decode("Tip points at a missing block".to_string()));
    };
    match Block::deserialize(&bytes) {
        Ok(block) => Ok(block.height),
        Err(e) => abort(e),
    }
}

/// Lazy walk from a tip back to genesis
pub struct BlockchainIterator {
    blocks: Tree,
    next: Option<Hash256>,
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match load_block(&self.blocks, &hash) {
            Ok(block) => {
                self.next = block.header.prev_block_hash;
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{TxInput, TxOutput};
    use crate::wallet::KeyPair;

    pub(crate) fn temp_db() -> Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    pub(crate) fn test_config() -> ChainConfig {
        ChainConfig::new(8, 100).unwrap()
    }

    pub(crate) fn test_chain(owner: &KeyPair) -> Blockchain {
        Blockchain::create(temp_db(), &owner.address, test_config()).unwrap()
    }

    fn reward(to: &KeyPair) -> Transaction {
        Transaction::new_coinbase(&to.address, "", 100).unwrap()
    }

    #[test]
    fn test_create_genesis() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);

        assert_eq!(chain.best_height().unwrap(), Some(0));
        let genesis = chain.get_block(&chain.tip().unwrap().unwrap()).unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.transactions.len(), 1);
        assert_eq!(genesis.transactions[0].inputs[0].public_key, GENESIS_NOTE.as_bytes());
        assert_eq!(genesis.transactions[0].outputs[0].pubkey_hash, owner.pubkey_hash());
    }

    #[test]
    fn test_create_twice_fails() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        assert!(matches!(
            Blockchain::create(chain.db().clone(), &owner.address, test_config()),
            Err(Error::ChainExists)
        ));
    }

    #[test]
    fn test_empty_chain() {
        let chain = Blockchain::open(temp_db(), test_config()).unwrap();
        assert_eq!(chain.best_height().unwrap(), None);
        assert_eq!(chain.iter().unwrap().count(), 0);
        assert!(matches!(chain.append(vec![]), Err(Error::NoChain)));
    }

    #[test]
    fn test_append_and_iterate() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);

        let first = chain.append(vec![reward(&owner)]).unwrap();
        let second = chain.append(vec![reward(&owner)]).unwrap();

        assert_eq!(first.height, 1);
        assert_eq!(second.height, 2);
        assert_eq!(second.header.prev_block_hash, Some(first.hash));
        assert_eq!(chain.best_height().unwrap(), Some(2));

        let heights: Vec<u32> = chain.iter().unwrap().map(|b| b.unwrap().height).collect();
        assert_eq!(heights, vec![2, 1, 0]);

        // Iteration restarts from the tip
        assert_eq!(chain.iter().unwrap().count(), 3);
        assert_eq!(chain.block_hashes().unwrap()[0], second.hash);
    }

    #[test]
    fn test_hashes_in_range_ascending() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let b1 = chain.append(vec![reward(&owner)]).unwrap();
        let b2 = chain.append(vec![reward(&owner)]).unwrap();
        let b3 = chain.append(vec![reward(&owner)]).unwrap();

        assert_eq!(chain.block_hashes_in_range(1, 2).unwrap(), vec![b1.hash, b2.hash]);
        assert_eq!(chain.block_hashes_in_range(2, 10).unwrap(), vec![b2.hash, b3.hash]);
        assert_eq!(chain.block_hashes_in_range(0, 3).unwrap().len(), 4);
        assert!(chain.block_hashes_in_range(4, 9).unwrap().is_empty());
    }

    #[test]
    fn test_lookups_not_found() {
        let chain = test_chain(&KeyPair::generate());
        let missing = Hash256::new([9; 32]);
        assert!(matches!(chain.get_block(&missing), Err(Error::BlockNotFound(_))));
        assert!(matches!(
            chain.find_transaction(&missing),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_find_transaction() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let tx = reward(&owner);
        chain.append(vec![tx.clone()]).unwrap();
        assert_eq!(chain.find_transaction(&tx.id).unwrap(), tx);
    }

    #[test]
    fn test_append_rejects_bad_signature() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let genesis = chain.get_block(&chain.tip().unwrap().unwrap()).unwrap();
        let funding = &genesis.transactions[0];

        let mut tx = Transaction::new(
            vec![TxInput::new(funding.id, 0, owner.public_key.clone())],
            vec![TxOutput::new(100, [5; 20])],
        );
        chain.sign_transaction(&mut tx, &owner.secret_key).unwrap();
        assert!(chain.verify_transaction(&tx).unwrap());

        tx.inputs[0].signature[10] ^= 0xff;
        assert!(matches!(chain.append(vec![tx]), Err(Error::SignatureInvalid(_))));
        assert_eq!(chain.best_height().unwrap(), Some(0));
    }

    #[test]
    fn test_unknown_reference_is_integrity_fault() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let tx = Transaction::new(
            vec![TxInput::new(Hash256::new([4; 32]), 0, owner.public_key.clone())],
            vec![TxOutput::new(1, [5; 20])],
        );
        assert!(matches!(chain.append(vec![tx]), Err(Error::MissingReference(_))));
    }

    #[test]
    fn test_add_external_block() {
        let owner = KeyPair::generate();
        let source = test_chain(&owner);
        let block = source.append(vec![reward(&owner)]).unwrap();

        let target = Blockchain::open(temp_db(), test_config()).unwrap();
        let genesis = source.get_block(&block.header.prev_block_hash.unwrap()).unwrap();

        assert!(target.add_external_block(&genesis).unwrap());
        assert_eq!(target.best_height().unwrap(), Some(0));
        assert!(target.add_external_block(&block).unwrap());
        assert_eq!(target.best_height().unwrap(), Some(1));

        // Known block is a no-op
        assert!(!target.add_external_block(&block).unwrap());

        // Lower block does not move the tip back
        let other = test_chain(&KeyPair::generate());
        let other_genesis = other.get_block(&other.tip().unwrap().unwrap()).unwrap();
        assert!(target.add_external_block(&other_genesis).unwrap());
        assert_eq!(target.tip().unwrap(), Some(block.hash));
    }

    #[test]
    fn test_external_block_with_bad_work_rejected() {
        let owner = KeyPair::generate();
        let source = test_chain(&owner);
        let mut block = source.append(vec![reward(&owner)]).unwrap();
        block.header.nonce = block.header.nonce.wrapping_add(1);
        block.hash = block.header.hash();

        let target = Blockchain::open(temp_db(), test_config()).unwrap();
        // The re-hashed header meets 8 bits with probability 1/256
        if !source.pow().validate(&block.header) {
            assert!(matches!(
                target.add_external_block(&block),
                Err(Error::ConsensusFailure(_))
            ));
            assert_eq!(target.best_height().unwrap(), None);
        }
    }

    #[test]
    fn test_external_block_with_forged_hash_rejected() {
        let owner = KeyPair::generate();
        let source = test_chain(&owner);
        let mut block = source.append(vec![reward(&owner)]).unwrap();
        block.hash = Hash256::zero();

        let target = Blockchain::open(temp_db(), test_config()).unwrap();
        assert!(matches!(
            target.add_external_block(&block),
            Err(Error::ConsensusFailure(_))
        ));
    }

    #[test]
    fn test_external_block_with_unknown_parent_is_accepted() {
        let owner = KeyPair::generate();
        let source = test_chain(&owner);
        source.append(vec![reward(&owner)]).unwrap();
        let orphan = source.append(vec![reward(&owner)]).unwrap();

        // Parent linkage is not checked: the block lands and becomes the tip
        let target = test_chain(&owner);
        assert!(target.add_external_block(&orphan).unwrap());
        assert_eq!(target.tip().unwrap(), Some(orphan.hash));

        // Walking back then hits the missing parent
        let walked: Vec<_> = target.iter().unwrap().collect();
        assert_eq!(walked.len(), 2);
        assert!(matches!(walked[1], Err(Error::BlockNotFound(_))));
    }

    #[test]
    fn test_append_rejects_misplaced_coinbase() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let tip = chain.tip().unwrap();

        let result = chain.append(vec![reward(&owner), reward(&owner)]);
        assert!(matches!(result, Err(Error::ConsensusFailure(_))));
        assert_eq!(chain.tip().unwrap(), tip);
        assert_eq!(chain.best_height().unwrap(), Some(0));
    }

    #[test]
    fn test_appended_block_accepted_by_peer() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let block = chain.append(vec![reward(&owner)]).unwrap();

        let peer = Blockchain::open(temp_db(), test_config()).unwrap();
        let genesis = chain.get_block(&block.header.prev_block_hash.unwrap()).unwrap();
        assert!(peer.add_external_block(&genesis).unwrap());
        assert!(peer.add_external_block(&block).unwrap());
        assert_eq!(peer.tip().unwrap(), Some(block.hash));
    }

    #[test]
    fn test_stale_tip_detected() {
        let owner = KeyPair::generate();
        let chain = test_chain(&owner);
        let source = test_chain(&owner);
        let genesis_hash = chain.tip().unwrap().unwrap();

        // A competing block moves the tip between mining and commit
        let competing = source.append(vec![reward(&owner)]).unwrap();
        let mined = Block::mine(vec![reward(&owner)], Some(genesis_hash), 1, chain.pow()).unwrap();
        chain.add_external_block(&competing).unwrap();

        assert!(matches!(
            chain.commit(&mined, genesis_hash),
            Err(Error::StaleTip { expected }) if expected == genesis_hash
        ));
        assert_eq!(chain.tip().unwrap(), Some(competing.hash));
    }
}
