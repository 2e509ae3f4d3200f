//! Wire framing for the control protocol
//!
//! A connection starts with the 6-byte magic `RASCSI`, followed by
//! length-prefixed protobuf messages: a 4-byte little-endian i32 size and
//! the serialized payload. The magic is only sent with the initial request;
//! responses are plain length-prefixed messages.

use std::io::{Read, Write};

use prost::Message;
use thiserror::Error;

pub const MAGIC: &[u8; 6] = b"RASCSI";

/// Default TCP port of the control service
pub const DEFAULT_PORT: u16 = 6868;

/// Upper bound for a single message, as a safeguard against garbage headers
const MAX_MESSAGE_SIZE: i32 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid magic")]
    InvalidMagic,
    #[error("Invalid message header")]
    InvalidHeader,
    #[error("Decoding message failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Reads and verifies the connection magic
pub fn read_magic(reader: &mut impl Read) -> Result<(), FramingError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;

    if &magic != MAGIC {
        return Err(FramingError::InvalidMagic);
    }

    Ok(())
}

pub fn write_magic(writer: &mut impl Write) -> Result<(), FramingError> {
    writer.write_all(MAGIC)?;
    Ok(())
}

/// Writes one length-prefixed message
pub fn write_message<M: Message>(writer: &mut impl Write, message: &M) -> Result<(), FramingError> {
    let data = message.encode_to_vec();

    let size = data.len() as i32;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(&data)?;
    writer.flush()?;

    Ok(())
}

/// Reads one length-prefixed message
pub fn read_message<M: Message + Default>(reader: &mut impl Read) -> Result<M, FramingError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;

    let size = i32::from_le_bytes(header);
    if !(0..=MAX_MESSAGE_SIZE).contains(&size) {
        return Err(FramingError::InvalidHeader);
    }

    let mut data = vec![0u8; size as usize];
    reader.read_exact(&mut data)?;

    Ok(M::decode(data.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::proto::{PbCommand, PbOperation};
    use std::io::Cursor;

    #[test]
    fn message_roundtrip_is_identity() {
        let mut command = PbCommand::new(PbOperation::ServerInfo);
        command
            .params
            .insert("folder_pattern".to_string(), "test".to_string());

        let mut wire = Vec::new();
        write_magic(&mut wire).unwrap();
        write_message(&mut wire, &command).unwrap();

        let mut cursor = Cursor::new(wire);
        read_magic(&mut cursor).unwrap();
        let decoded: PbCommand = read_message(&mut cursor).unwrap();

        assert_eq!(command, decoded);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut cursor = Cursor::new(b"RASCS\x00".to_vec());
        assert!(matches!(
            read_magic(&mut cursor),
            Err(FramingError::InvalidMagic)
        ));
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(-1i32).to_le_bytes());

        let result: Result<PbCommand, _> = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(FramingError::InvalidHeader)));
    }

    #[test]
    fn truncated_payload_is_an_io_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&100i32.to_le_bytes());
        wire.extend_from_slice(&[0u8; 10]);

        let result: Result<PbCommand, _> = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(FramingError::Io(_))));
    }
}
