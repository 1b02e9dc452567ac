// UTXO (Unspent Transaction Output) index

use crate::core::{Block, Hash256, PubkeyHash, TxOutput};
use crate::core::{decode_error, ensure_consumed, read_u32, read_varint, write_varint};
use crate::error::{Error, Result};
use crate::storage::Blockchain;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, abort};
use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Write};

/// Tree holding `txid -> unspent outputs`
pub const CHAINSTATE_TREE: &str = "chainstate";

/// Unspent outputs of one transaction, each with its original output index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnspentOutputs {
    pub outputs: Vec<(u32, TxOutput)>,
}

impl UnspentOutputs {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Drop the output at original index `index`
    pub fn remove(&mut self, index: u32) -> bool {
        let before = self.outputs.len();
        self.outputs.retain(|(i, _)| *i != index);
        self.outputs.len() != before
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        write_varint(buf, self.outputs.len() as u64)?;
        for (index, output) in &self.outputs {
            buf.write_all(&index.to_le_bytes())?;
            output.write_to(buf)?;
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = read_varint(&mut cursor).map_err(decode_error)?;
        let mut outputs = Vec::new();
        for _ in 0..count {
            let index = read_u32(&mut cursor).map_err(decode_error)?;
            let output = TxOutput::read_from(&mut cursor).map_err(decode_error)?;
            outputs.push((index, output));
        }
        ensure_consumed(bytes, cursor.position())?;
        Ok(Self { outputs })
    }
}

/// Index of unspent outputs, derived from the chain
pub struct UtxoSet {
    chain: Blockchain,
    tree: Tree,
}

impl UtxoSet {
    pub fn new(chain: &Blockchain) -> Result<Self> {
        let tree = chain.db().open_tree(CHAINSTATE_TREE)?;
        Ok(Self {
            chain: chain.clone(),
            tree,
        })
    }

    /// Rebuild the index from the whole chain. Returns the number of indexed transactions.
    pub fn reindex(&self) -> Result<usize> {
        let mut created: BTreeMap<Hash256, Vec<TxOutput>> = BTreeMap::new();
        let mut spent: HashSet<(Hash256, u32)> = HashSet::new();

        for block in self.chain.iter()? {
            for tx in block?.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        if let (Some(txid), Ok(index)) =
                            (input.prev_txid, u32::try_from(input.prev_index))
                        {
                            spent.insert((txid, index));
                        }
                    }
                }
                created.insert(tx.id, tx.outputs);
            }
        }

        let mut batch = sled::Batch::default();
        for key in self.tree.iter().keys() {
            batch.remove(key?);
        }

        let mut indexed = 0;
        for (txid, outputs) in created {
            let unspent = UnspentOutputs {
                outputs: outputs
                    .into_iter()
                    .enumerate()
                    .map(|(i, out)| (i as u32, out))
                    .filter(|(i, _)| !spent.contains(&(txid, *i)))
                    .collect(),
            };
            if !unspent.is_empty() {
                batch.insert(&txid.as_bytes()[..], unspent.to_bytes());
                indexed += 1;
            }
        }

        self.tree.apply_batch(batch)?;
        log::info!("Reindexed UTXO set: {} transactions with unspent outputs", indexed);
        Ok(indexed)
    }

    /// Apply one block on top of the index
    pub fn update(&self, block: &Block) -> Result<()> {
        self.tree
            .transaction(|tree| -> ConflictableTransactionResult<(), Error> {
                for tx in &block.transactions {
                    if !tx.is_coinbase() {
                        for input in &tx.inputs {
                            let (Some(txid), Ok(index)) =
                                (input.prev_txid, u32::try_from(input.prev_index))
                            else {
                                continue;
                            };
                            let key = &txid.as_bytes()[..];
                            let Some(bytes) = tree.get(key)? else {
                                log::debug!("Input spends {}:{} which is not indexed", txid, index);
                                continue;
                            };
                            let mut entry = match UnspentOutputs::from_bytes(&bytes) {
                                Ok(entry) => entry,
                                Err(e) => return abort(e),
                            };
                            entry.remove(index);
                            if entry.is_empty() {
                                tree.remove(key)?;
                            } else {
                                tree.insert(key, entry.to_bytes())?;
                            }
                        }
                    }

                    let fresh = UnspentOutputs {
                        outputs: tx
                            .outputs
                            .iter()
                            .enumerate()
                            .map(|(i, out)| (i as u32, *out))
                            .collect(),
                    };
                    tree.insert(&tx.id.as_bytes()[..], fresh.to_bytes())?;
                }
                Ok(())
            })?;

        log::debug!("Updated UTXO set with block {}", block.hash);
        Ok(())
    }

    /// Every unspent output locked to `pubkey_hash`
    pub fn find_by_pubkey_hash(&self, pubkey_hash: &PubkeyHash) -> Result<Vec<TxOutput>> {
        let mut found = Vec::new();
        for entry in self.entries() {
            let (_, unspent) = entry?;
            found.extend(
                unspent
                    .outputs
                    .into_iter()
                    .map(|(_, out)| out)
                    .filter(|out| out.is_locked_with(pubkey_hash)),
            );
        }
        Ok(found)
    }

    pub fn balance(&self, pubkey_hash: &PubkeyHash) -> Result<u64> {
        Ok(self
            .find_by_pubkey_hash(pubkey_hash)?
            .iter()
            .map(|out| out.value)
            .sum())
    }

    /// First-fit selection in index order until `amount` is covered.
    /// Returns the accumulated value, which is below `amount` when funds are short.
    pub fn find_spendable(
        &self,
        pubkey_hash: &PubkeyHash,
        amount: u64,
    ) -> Result<(u64, BTreeMap<Hash256, Vec<u32>>)> {
        let mut accumulated = 0u64;
        let mut selected: BTreeMap<Hash256, Vec<u32>> = BTreeMap::new();

        'scan: for entry in self.entries() {
            let (txid, unspent) = entry?;
            for (index, output) in unspent.outputs {
                if accumulated >= amount {
                    break 'scan;
                }
                if output.is_locked_with(pubkey_hash) {
                    accumulated += output.value;
                    selected.entry(txid).or_default().push(index);
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// Number of transactions with at least one unspent output
    pub fn count_transactions(&self) -> usize {
        self.tree.len()
    }

    /// The whole index in key order
    pub fn snapshot(&self) -> Result<BTreeMap<Hash256, UnspentOutputs>> {
        self.entries().collect()
    }

    fn entries(&self) -> impl Iterator<Item = Result<(Hash256, UnspentOutputs)>> + '_ {
        self.tree.iter().map(|item| {
            let (key, value) = item?;
            Ok((Hash256::from_slice(&key)?, UnspentOutputs::from_bytes(&value)?))
        })
    }
}
