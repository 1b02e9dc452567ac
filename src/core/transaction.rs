// Transaction data structures

use crate::core::{Hash256, PubkeyHash, Serializable, hash160, sha256};
use crate::error::{Error, Result};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, ecdsa::Signature};
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read, Write};
use super::serialize::{
    decode_error, ensure_consumed, read_i32, read_opt_hash, read_u64, read_var_bytes, read_varint,
    write_opt_hash, write_var_bytes, write_varint,
};

/// Output index carried by a coinbase input
pub const COINBASE_INDEX: i32 = -1;

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Id of the transaction holding the spent output; `None` for coinbase
    pub prev_txid: Option<Hash256>,
    /// Index of the spent output, `COINBASE_INDEX` for coinbase
    pub prev_index: i32,
    /// Compact ECDSA signature (r ‖ s)
    pub signature: Vec<u8>,
    /// Spender's public key (x ‖ y); a coinbase stores its note here
    pub public_key: Vec<u8>,
}

impl TxInput {
    /// Create a new unsigned input
    pub fn new(prev_txid: Hash256, prev_index: i32, public_key: Vec<u8>) -> Self {
        Self {
            prev_txid: Some(prev_txid),
            prev_index,
            signature: Vec::new(),
            public_key,
        }
    }

    /// Create a coinbase input carrying an opaque note
    pub fn coinbase(note: Vec<u8>) -> Self {
        Self {
            prev_txid: None,
            prev_index: COINBASE_INDEX,
            signature: Vec::new(),
            public_key: note,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_none() && self.prev_index == COINBASE_INDEX
    }

    /// Whether this input was made with the key locking `pubkey_hash`
    pub fn uses_key(&self, pubkey_hash: &PubkeyHash) -> bool {
        hash160(&self.public_key) == *pubkey_hash
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        write_opt_hash(buf, self.prev_txid.as_ref())?;
        buf.write_all(&self.prev_index.to_le_bytes())?;
        write_var_bytes(buf, &self.signature)?;
        write_var_bytes(buf, &self.public_key)?;
        Ok(())
    }

    fn read_from(reader: &mut dyn Read) -> std::io::Result<Self> {
        Ok(Self {
            prev_txid: read_opt_hash(reader)?,
            prev_index: read_i32(reader)?,
            signature: read_var_bytes(reader)?,
            public_key: read_var_bytes(reader)?,
        })
    }
}

/// Transaction output - an amount locked to a public key hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub pubkey_hash: PubkeyHash,
}

impl TxOutput {
    pub fn new(value: u64, pubkey_hash: PubkeyHash) -> Self {
        Self { value, pubkey_hash }
    }

    /// Output locked to a Base58Check address
    pub fn to_address(value: u64, address: &str) -> Result<Self> {
        let pubkey_hash = crate::wallet::decode_address(address)?;
        Ok(Self::new(value, pubkey_hash))
    }

    pub fn is_locked_with(&self, pubkey_hash: &PubkeyHash) -> bool {
        self.pubkey_hash == *pubkey_hash
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_all(&self.value.to_le_bytes())?;
        buf.write_all(&self.pubkey_hash)?;
        Ok(())
    }

    pub(crate) fn read_from(reader: &mut dyn Read) -> std::io::Result<Self> {
        let value = read_u64(reader)?;
        let mut pubkey_hash = [0u8; 20];
        reader.read_exact(&mut pubkey_hash)?;
        Ok(Self { value, pubkey_hash })
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// SHA256 of the transaction encoded with this field cleared
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a transaction and compute its id
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: Hash256::zero(),
            inputs,
            outputs,
        };
        tx.id = tx.hash();
        tx
    }

    /// Mining reward paying `subsidy` to `to`.
    /// An empty note is replaced with random data so coinbase ids stay unique.
    pub fn new_coinbase(to: &str, note: &str, subsidy: u64) -> Result<Self> {
        let note = if note.is_empty() {
            hex::encode(rand::random::<[u8; 20]>())
        } else {
            note.to_string()
        };
        let output = TxOutput::to_address(subsidy, to)?;
        Ok(Self::new(vec![TxInput::coinbase(note.into_bytes())], vec![output]))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// SHA256 of the encoding with `id` cleared
    pub fn hash(&self) -> Hash256 {
        sha256(&self.encode(false))
    }

    /// Copy with every input's signature and public key cleared
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_txid: input.prev_txid,
                prev_index: input.prev_index,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Sign every input with `secret_key`.
    /// `prev_txs` must hold every transaction referenced by an input.
    pub fn sign(
        &mut self,
        secret_key: &SecretKey,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        self.check_references(prev_txs)?;

        let secp = Secp256k1::signing_only();
        let mut scratch = self.trimmed_copy();

        for index in 0..self.inputs.len() {
            let digest = scratch.signing_digest(index, prev_txs)?;
            let message = Message::from_digest(digest.0);
            let signature = secp.sign_ecdsa(&message, secret_key);
            self.inputs[index].signature = signature.serialize_compact().to_vec();
        }

        Ok(())
    }

    /// Check every input's signature and key ownership.
    /// Returns `Ok(false)` on the first failing input.
    pub fn verify(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        self.check_references(prev_txs)?;

        let secp = Secp256k1::verification_only();
        let mut scratch = self.trimmed_copy();

        for (index, input) in self.inputs.iter().enumerate() {
            let locked_to = referenced_output(input, prev_txs)?.pubkey_hash;
            if !input.uses_key(&locked_to) {
                return Ok(false);
            }

            let digest = scratch.signing_digest(index, prev_txs)?;

            let Ok(signature) = Signature::from_compact(&input.signature) else {
                return Ok(false);
            };
            let Ok(public_key) = parse_public_key(&input.public_key) else {
                return Ok(false);
            };

            let message = Message::from_digest(digest.0);
            if secp.verify_ecdsa(&message, &signature, &public_key).is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Digest signed for input `index`: only that input carries a key field,
    /// set to the pubkey hash of the output it spends.
    fn signing_digest(
        &mut self,
        index: usize,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<Hash256> {
        let locked_to = referenced_output(&self.inputs[index], prev_txs)?.pubkey_hash;

        self.inputs[index].signature.clear();
        self.inputs[index].public_key = locked_to.to_vec();
        self.id = self.hash();
        self.inputs[index].public_key.clear();

        Ok(self.id)
    }

    fn check_references(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<()> {
        for input in &self.inputs {
            referenced_output(input, prev_txs)?;
        }
        Ok(())
    }

    fn encode(&self, with_id: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf, with_id)
            .expect("writing to a Vec cannot fail");
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>, with_id: bool) -> std::io::Result<()> {
        let id = with_id.then_some(&self.id);
        write_opt_hash(buf, id)?;

        write_varint(buf, self.inputs.len() as u64)?;
        for input in &self.inputs {
            input.write_to(buf)?;
        }

        write_varint(buf, self.outputs.len() as u64)?;
        for output in &self.outputs {
            output.write_to(buf)?;
        }

        Ok(())
    }

    /// Deserialize from a reader (used when transactions are embedded in blocks)
    pub fn from_reader(reader: &mut dyn Read) -> Result<Self> {
        let id = read_opt_hash(reader).map_err(decode_error)?.unwrap_or_default();

        let input_count = read_varint(reader).map_err(decode_error)?;
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            inputs.push(TxInput::read_from(reader).map_err(decode_error)?);
        }

        let output_count = read_varint(reader).map_err(decode_error)?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            outputs.push(TxOutput::read_from(reader).map_err(decode_error)?);
        }

        Ok(Self { id, inputs, outputs })
    }

    pub(crate) fn write_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        self.write_to(buf, true)
    }
}

impl Serializable for Transaction {
    fn serialize(&self) -> Vec<u8> {
        self.encode(true)
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let tx = Self::from_reader(&mut cursor)?;
        ensure_consumed(data, cursor.position())?;
        Ok(tx)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.id)?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "   Input {}:", i)?;
            match &input.prev_txid {
                Some(txid) => writeln!(f, "       TXID:      {}", txid)?,
                None => writeln!(f, "       TXID:      (coinbase)")?,
            }
            writeln!(f, "       Out:       {}", input.prev_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.public_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "   Output {}:", i)?;
            writeln!(f, "       Value:     {}", output.value)?;
            write!(f, "       PubKeyHash: {}", hex::encode(output.pubkey_hash))?;
            if i + 1 < self.outputs.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Output spent by `input`, looked up in `prev_txs`
fn referenced_output<'a>(
    input: &TxInput,
    prev_txs: &'a HashMap<Hash256, Transaction>,
) -> Result<&'a TxOutput> {
    let txid = input.prev_txid.unwrap_or_default();
    let prev_tx = prev_txs.get(&txid).ok_or(Error::MissingReference(txid))?;
    usize::try_from(input.prev_index)
        .ok()
        .and_then(|index| prev_tx.outputs.get(index))
        .ok_or(Error::MissingReference(txid))
}

/// Encode a public key as the 64-byte x ‖ y pair
pub fn public_key_bytes(public_key: &PublicKey) -> Vec<u8> {
    public_key.serialize_uncompressed()[1..].to_vec()
}

/// Rebuild a public key from its x ‖ y halves
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != 64 {
        return Err(Error::Crypto(format!("Invalid public key length: {}", bytes.len())));
    }
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(bytes);
    Ok(PublicKey::from_slice(&uncompressed)?)
}
