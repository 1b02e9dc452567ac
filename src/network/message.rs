// Network protocol messages

use crate::core::{Block, Hash256, Serializable};
use crate::core::{
    decode_error, ensure_consumed, read_hash, read_string, read_u32, read_var_bytes, read_varint,
    write_string, write_var_bytes, write_varint,
};
use crate::error::{Error, Result};
use std::fmt;
use std::io::{self, Cursor, Read, Write};

/// Length of the null-padded ASCII command tag that starts every message
pub const COMMAND_LENGTH: usize = 12;

/// Protocol version announced in `version`
pub const PROTOCOL_VERSION: u32 = 1;

/// Network message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Version,
    GetBlocks,
    Inv,
    GetData,
    BlockData,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::GetBlocks => "getblocks",
            MessageType::Inv => "inv",
            MessageType::GetData => "getdata",
            MessageType::BlockData => "blockdata",
        }
    }

    pub fn from_command(s: &str) -> Option<Self> {
        match s {
            "version" => Some(MessageType::Version),
            "getblocks" => Some(MessageType::GetBlocks),
            "inv" => Some(MessageType::Inv),
            "getdata" => Some(MessageType::GetData),
            "blockdata" => Some(MessageType::BlockData),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Null-padded command tag
pub fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut tag = [0u8; COMMAND_LENGTH];
    let len = command.len().min(COMMAND_LENGTH);
    tag[..len].copy_from_slice(&command.as_bytes()[..len]);
    tag
}

pub fn bytes_to_command(tag: &[u8]) -> String {
    tag.iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

/// Inventory type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Block,
    Tx,
}

impl InvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvType::Block => "block",
            InvType::Tx => "tx",
        }
    }

    fn parse(s: &str) -> io::Result<Self> {
        match s {
            "block" => Ok(InvType::Block),
            "tx" => Ok(InvType::Tx),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown inventory kind: {}", other),
            )),
        }
    }
}

/// Height announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    /// `None` when the sender has no chain yet
    pub best_height: Option<u32>,
    pub addr_from: String,
}

impl VersionMessage {
    pub fn new(best_height: Option<u32>, addr_from: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            best_height,
            addr_from: addr_from.into(),
        }
    }
}

/// Request for the hashes of blocks with `low <= height <= high`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub addr_from: String,
    pub low: u32,
    pub high: u32,
}

/// Inventory message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvMessage {
    pub addr_from: String,
    pub kind: InvType,
    pub items: Vec<Hash256>,
}

/// Request for a single item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataMessage {
    pub addr_from: String,
    pub kind: InvType,
    pub id: Hash256,
}

/// A serialized block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMessage {
    pub addr_from: String,
    pub block: Vec<u8>,
}

impl BlockMessage {
    pub fn new(addr_from: impl Into<String>, block: &Block) -> Self {
        Self {
            addr_from: addr_from.into(),
            block: block.serialize(),
        }
    }

    pub fn decode_block(&self) -> Result<Block> {
        Block::deserialize(&self.block)
    }
}

/// Network message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    GetBlocks(GetBlocksMessage),
    Inv(InvMessage),
    GetData(GetDataMessage),
    BlockData(BlockMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Version(_) => MessageType::Version,
            Message::GetBlocks(_) => MessageType::GetBlocks,
            Message::Inv(_) => MessageType::Inv,
            Message::GetData(_) => MessageType::GetData,
            Message::BlockData(_) => MessageType::BlockData,
        }
    }

    /// Address the sender listens on
    pub fn addr_from(&self) -> &str {
        match self {
            Message::Version(m) => &m.addr_from,
            Message::GetBlocks(m) => &m.addr_from,
            Message::Inv(m) => &m.addr_from,
            Message::GetData(m) => &m.addr_from,
            Message::BlockData(m) => &m.addr_from,
        }
    }

    /// Command tag followed by the payload
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = command_to_bytes(self.message_type().as_str()).to_vec();
        self.write_payload(&mut bytes)
            .expect("writing to a Vec cannot fail");
        bytes
    }

    fn write_payload(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Message::Version(v) => {
                buf.write_all(&v.version.to_le_bytes())?;
                match v.best_height {
                    Some(height) => {
                        buf.write_all(&[1])?;
                        buf.write_all(&height.to_le_bytes())?;
                    }
                    None => buf.write_all(&[0])?,
                }
                write_string(buf, &v.addr_from)?;
            }
            Message::GetBlocks(m) => {
                write_string(buf, &m.addr_from)?;
                buf.write_all(&m.low.to_le_bytes())?;
                buf.write_all(&m.high.to_le_bytes())?;
            }
            Message::Inv(m) => {
                write_string(buf, &m.addr_from)?;
                write_string(buf, m.kind.as_str())?;
                write_varint(buf, m.items.len() as u64)?;
                for item in &m.items {
                    buf.write_all(item.as_bytes())?;
                }
            }
            Message::GetData(m) => {
                write_string(buf, &m.addr_from)?;
                write_string(buf, m.kind.as_str())?;
                buf.write_all(m.id.as_bytes())?;
            }
            Message::BlockData(m) => {
                write_string(buf, &m.addr_from)?;
                write_var_bytes(buf, &m.block)?;
            }
        }
        Ok(())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < COMMAND_LENGTH {
            return Err(Error::Decode(format!("Message too short: {} bytes", data.len())));
        }

        let command = bytes_to_command(&data[..COMMAND_LENGTH]);
        let msg_type = MessageType::from_command(&command)
            .ok_or_else(|| Error::Protocol(format!("Unknown command: {:?}", command)))?;

        let payload = &data[COMMAND_LENGTH..];
        let mut cursor = Cursor::new(payload);
        let message = Self::read_payload(msg_type, &mut cursor).map_err(decode_error)?;
        ensure_consumed(payload, cursor.position())?;
        Ok(message)
    }

    fn read_payload(msg_type: MessageType, reader: &mut dyn Read) -> io::Result<Self> {
        let message = match msg_type {
            MessageType::Version => {
                let version = read_u32(reader)?;
                let mut flag = [0u8; 1];
                reader.read_exact(&mut flag)?;
                let best_height = match flag[0] {
                    0 => None,
                    1 => Some(read_u32(reader)?),
                    other => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("Invalid height flag: {}", other),
                        ));
                    }
                };
                Message::Version(VersionMessage {
                    version,
                    best_height,
                    addr_from: read_string(reader)?,
                })
            }
            MessageType::GetBlocks => Message::GetBlocks(GetBlocksMessage {
                addr_from: read_string(reader)?,
                low: read_u32(reader)?,
                high: read_u32(reader)?,
            }),
            MessageType::Inv => {
                let addr_from = read_string(reader)?;
                let kind = InvType::parse(&read_string(reader)?)?;
                let count = read_varint(reader)?;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(read_hash(reader)?);
                }
                Message::Inv(InvMessage { addr_from, kind, items })
            }
            MessageType::GetData => Message::GetData(GetDataMessage {
                addr_from: read_string(reader)?,
                kind: InvType::parse(&read_string(reader)?)?,
                id: read_hash(reader)?,
            }),
            MessageType::BlockData => Message::BlockData(BlockMessage {
                addr_from: read_string(reader)?,
                block: read_var_bytes(reader)?,
            }),
        };
        Ok(message)
    }
}
