// Serialization utilities for ledger data structures

use crate::core::Hash256;
use crate::error::{Error, Result};
use std::io::{self, Read, Write};

/// Trait for types with a stable binary encoding
pub trait Serializable {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(data: &[u8]) -> Result<Self> where Self: Sized;
}

/// Map a reader failure into a decode error
pub fn decode_error(e: io::Error) -> Error {
    Error::Decode(e.to_string())
}

/// Write a variable-length integer (VarInt)
pub fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    match value {
        0..=0xfc => {
            writer.write_all(&[value as u8])?;
        }
        0xfd..=0xffff => {
            writer.write_all(&[0xfd])?;
            writer.write_all(&(value as u16).to_le_bytes())?;
        }
        0x10000..=0xffffffff => {
            writer.write_all(&[0xfe])?;
            writer.write_all(&(value as u32).to_le_bytes())?;
        }
        _ => {
            writer.write_all(&[0xff])?;
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Read a variable-length integer (VarInt)
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let mut first_byte = [0u8; 1];
    reader.read_exact(&mut first_byte)?;

    match first_byte[0] {
        0..=0xfc => Ok(first_byte[0] as u64),
        0xfd => {
            let mut bytes = [0u8; 2];
            reader.read_exact(&mut bytes)?;
            Ok(u16::from_le_bytes(bytes) as u64)
        }
        0xfe => {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            Ok(u32::from_le_bytes(bytes) as u64)
        }
        0xff => {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes)?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    write_varint(writer, data.len() as u64)?;
    writer.write_all(data)?;
    Ok(())
}

/// Read bytes with length prefix.
/// The length is checked against what the reader can still supply before allocating.
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_varint(reader)?;
    let mut data = Vec::new();
    reader.take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated byte string"));
    }
    Ok(data)
}

pub fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_var_bytes(writer, value.as_bytes())
}

pub fn read_string<R: Read + ?Sized>(reader: &mut R) -> io::Result<String> {
    let bytes = read_var_bytes(reader)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Optional hash: empty byte string for `None`, 32 bytes otherwise
pub fn write_opt_hash<W: Write>(writer: &mut W, hash: Option<&Hash256>) -> io::Result<()> {
    match hash {
        Some(h) => write_var_bytes(writer, h.as_bytes()),
        None => write_varint(writer, 0),
    }
}

pub fn read_opt_hash<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Hash256>> {
    let bytes = read_var_bytes(reader)?;
    match bytes.len() {
        0 => Ok(None),
        32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            Ok(Some(Hash256::new(hash)))
        }
        n => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid hash length: {}", n),
        )),
    }
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> io::Result<Hash256> {
    let mut bytes = [0u8; 32];
    reader.read_exact(&mut bytes)?;
    Ok(Hash256::new(bytes))
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Fail if a decoder left bytes behind
pub fn ensure_consumed(data: &[u8], position: u64) -> Result<()> {
    if position as usize != data.len() {
        return Err(Error::Decode(format!(
            "{} trailing bytes",
            data.len() - position as usize
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_varint_sizes() {
        for (value, len) in [(100u64, 1usize), (1000, 3), (100_000, 5), (u64::MAX, 9)] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            assert_eq!(buf.len(), len);
            assert_eq!(read_varint(&mut Cursor::new(buf)).unwrap(), value);
        }
    }

    #[test]
    fn test_var_bytes_truncated() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 10).unwrap();
        buf.extend_from_slice(b"abc");
        assert!(read_var_bytes(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_huge_length_prefix_does_not_allocate() {
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX).unwrap();
        assert!(read_var_bytes(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_opt_hash() {
        let mut buf = Vec::new();
        write_opt_hash(&mut buf, None).unwrap();
        write_opt_hash(&mut buf, Some(&Hash256::new([7; 32]))).unwrap();
        assert_eq!(buf.len(), 1 + 1 + 32);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_opt_hash(&mut cursor).unwrap(), None);
        assert_eq!(read_opt_hash(&mut cursor).unwrap(), Some(Hash256::new([7; 32])));
    }

    #[test]
    fn test_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "localhost:3000").unwrap();
        assert_eq!(read_string(&mut Cursor::new(buf)).unwrap(), "localhost:3000");
    }
}
