// Block data structures

use crate::consensus::ProofOfWork;
use crate::core::{Hash256, Transaction, Serializable, hash256, merkle_root};
use crate::error::{Error, Result};
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use super::serialize::{
    decode_error, ensure_consumed, read_hash, read_opt_hash, read_u32, read_varint,
    write_opt_hash, write_varint,
};

pub const BLOCK_VERSION: u32 = 1;

/// Block header - the fields covered by proof-of-work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block; `None` for genesis
    pub prev_block_hash: Option<Hash256>,
    /// Merkle root of the block's transaction ids
    pub merkle_root: Hash256,
    /// Unix seconds
    pub timestamp: u32,
    /// Leading zero bits the block was mined against
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(
        version: u32,
        prev_block_hash: Option<Hash256>,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    /// Bytes hashed for proof-of-work:
    /// version ‖ prev hash (absent for genesis) ‖ merkle root ‖ timestamp ‖ bits ‖ nonce,
    /// integers as 4-byte little-endian. The nonce is always the last 4 bytes.
    pub fn hashing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(80);
        buf.extend_from_slice(&self.version.to_le_bytes());
        if let Some(prev) = &self.prev_block_hash {
            buf.extend_from_slice(prev.as_bytes());
        }
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Double SHA256 of the hashing bytes
    pub fn hash(&self) -> Hash256 {
        hash256(&self.hashing_bytes())
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_all(&self.version.to_le_bytes())?;
        write_opt_hash(buf, self.prev_block_hash.as_ref())?;
        buf.write_all(self.merkle_root.as_bytes())?;
        buf.write_all(&self.timestamp.to_le_bytes())?;
        buf.write_all(&self.bits.to_le_bytes())?;
        buf.write_all(&self.nonce.to_le_bytes())?;
        Ok(())
    }

    fn read_from(reader: &mut dyn Read) -> std::io::Result<Self> {
        Ok(Self {
            version: read_u32(reader)?,
            prev_block_hash: read_opt_hash(reader)?,
            merkle_root: read_hash(reader)?,
            timestamp: read_u32(reader)?,
            bits: read_u32(reader)?,
            nonce: read_u32(reader)?,
        })
    }
}

/// Block - header, transactions, and chain position.
/// Never mutated once mined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Proof-of-work hash of the header
    pub hash: Hash256,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Distance from genesis (genesis is 0)
    pub height: u32,
}

impl Block {
    /// Assemble a header over `transactions` and search for a valid nonce
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_block_hash: Option<Hash256>,
        height: u32,
        pow: &ProofOfWork,
    ) -> Result<Self> {
        let merkle_root = Self::calculate_merkle_root(&transactions).ok_or(Error::EmptyBlock)?;

        let mut header = BlockHeader::new(
            BLOCK_VERSION,
            prev_block_hash,
            merkle_root,
            unix_time(),
            pow.target_bits(),
            0,
        );

        let result = pow.search(&header)?;
        header.nonce = result.nonce;

        log::info!(
            "Mined block {} at height {} ({} attempts in {:.2?}, {:.1} KH/s)",
            result.hash,
            height,
            result.attempts,
            result.duration,
            result.hash_rate() / 1000.0
        );

        Ok(Self {
            hash: result.hash,
            header,
            transactions,
            height,
        })
    }

    /// Genesis block: a single coinbase, no parent, height 0
    pub fn genesis(coinbase: Transaction, pow: &ProofOfWork) -> Result<Self> {
        Self::mine(vec![coinbase], None, 0, pow)
    }

    /// Merkle root over transaction ids, `None` for an empty list
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Option<Hash256> {
        let ids: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&ids)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash.is_none()
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_all(self.hash.as_bytes())?;
        self.header.write_to(buf)?;
        write_varint(buf, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            tx.write_into(buf)?;
        }
        buf.write_all(&self.height.to_le_bytes())?;
        Ok(())
    }
}

impl Serializable for Block {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let hash = read_hash(&mut cursor).map_err(decode_error)?;
        let header = BlockHeader::read_from(&mut cursor).map_err(decode_error)?;

        let tx_count = read_varint(&mut cursor).map_err(decode_error)?;
        let mut transactions = Vec::new();
        for _ in 0..tx_count {
            transactions.push(Transaction::from_reader(&mut cursor)?);
        }

        let height = read_u32(&mut cursor).map_err(decode_error)?;
        ensure_consumed(data, cursor.position())?;

        Ok(Self {
            hash,
            header,
            transactions,
            height,
        })
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block #{}", self.height)?;
        writeln!(f, "  Hash:        {}", self.hash)?;
        writeln!(f, "  Version:     {}", self.header.version)?;
        match &self.header.prev_block_hash {
            Some(prev) => writeln!(f, "  Previous:    {}", prev)?,
            None => writeln!(f, "  Previous:    (genesis)")?,
        }
        writeln!(f, "  Merkle root: {}", self.header.merkle_root)?;
        writeln!(f, "  Timestamp:   {}", self.header.timestamp)?;
        writeln!(f, "  Bits:        {}", self.header.bits)?;
        writeln!(f, "  Nonce:       {}", self.header.nonce)?;
        write!(f, "  Transactions: {}", self.transactions.len())?;
        for tx in &self.transactions {
            write!(f, "\n{}", tx)?;
        }
        Ok(())
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}
