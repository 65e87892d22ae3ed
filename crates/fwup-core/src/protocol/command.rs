//! Control point command encoding.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Write too large: {len} bytes, characteristic limit {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Empty write")]
    Empty,
    #[error("Unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("Opcode 0x{opcode:02X} operand too short: {len} bytes")]
    ShortOperand { opcode: u8, len: usize },
}

/// 16-bit session token issued by a successful staging-area erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessKey(u16);

impl AccessKey {
    /// Zero means "no session" and is never issued.
    pub fn new(raw: u16) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Random non-zero key for a new erase request.
    pub fn generate() -> Self {
        Self(rand::random::<u16>().max(1))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Command written to the control point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    EraseStagingArea {
        key: AccessKey,
    },
    StoreCodeBlock {
        key: AccessKey,
        index: u16,
        data: Vec<u8>,
    },
    ReadCodeBlockCrc {
        index: u16,
    },
    InitiateFirmwareUpdate {
        key: AccessKey,
    },
}

impl ControlCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::EraseStagingArea { .. } => OP_ERASE_STAGING_AREA,
            Self::StoreCodeBlock { .. } => OP_STORE_CODE_BLOCK,
            Self::ReadCodeBlockCrc { .. } => OP_READ_CODE_BLOCK_CRC,
            Self::InitiateFirmwareUpdate { .. } => OP_INITIATE_FIRMWARE_UPDATE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::EraseStagingArea { .. } => "EraseStagingArea",
            Self::StoreCodeBlock { .. } => "StoreCodeBlock",
            Self::ReadCodeBlockCrc { .. } => "ReadCodeBlockCRC",
            Self::InitiateFirmwareUpdate { .. } => "InitiateFirmwareUpdate",
        }
    }

    /// Block index this command addresses, if any.
    pub fn block_index(&self) -> Option<u16> {
        match self {
            Self::StoreCodeBlock { index, .. } | Self::ReadCodeBlockCrc { index } => Some(*index),
            _ => None,
        }
    }

    /// Access key carried on the wire, if any.
    pub fn access_key(&self) -> Option<AccessKey> {
        match self {
            Self::EraseStagingArea { key }
            | Self::StoreCodeBlock { key, .. }
            | Self::InitiateFirmwareUpdate { key } => Some(*key),
            Self::ReadCodeBlockCrc { .. } => None,
        }
    }

    /// Encoded length without allocating.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::StoreCodeBlock { data, .. } => 5 + data.len(),
            _ => 3,
        }
    }

    /// Encode for a characteristic accepting at most `max_len` bytes per write.
    pub fn encode(&self, max_len: usize) -> Result<Vec<u8>, EncodeError> {
        let len = self.encoded_len();
        if len > max_len {
            return Err(EncodeError::PayloadTooLarge { len, max: max_len });
        }
        let mut buf = Vec::with_capacity(len);
        buf.write_u8(self.opcode())?;
        match self {
            Self::EraseStagingArea { key } | Self::InitiateFirmwareUpdate { key } => {
                buf.write_u16::<LittleEndian>(key.value())?;
            }
            Self::StoreCodeBlock { key, index, data } => {
                buf.write_u16::<LittleEndian>(key.value())?;
                buf.write_u16::<LittleEndian>(*index)?;
                buf.extend_from_slice(data);
            }
            Self::ReadCodeBlockCrc { index } => {
                buf.write_u16::<LittleEndian>(*index)?;
            }
        }
        Ok(buf)
    }

    /// Parse a control point write. Device side of the codec.
    ///
    /// Keys are taken as written, including zero, so the device can reject
    /// them itself.
    pub fn parse(data: &[u8]) -> Result<Self, CommandParseError> {
        let (&opcode, operand) = data.split_first().ok_or(CommandParseError::Empty)?;
        let short = || CommandParseError::ShortOperand {
            opcode,
            len: operand.len(),
        };
        let mut cursor = Cursor::new(operand);

        match opcode {
            OP_ERASE_STAGING_AREA => Ok(Self::EraseStagingArea {
                key: AccessKey(cursor.read_u16::<LittleEndian>().map_err(|_| short())?),
            }),
            OP_INITIATE_FIRMWARE_UPDATE => Ok(Self::InitiateFirmwareUpdate {
                key: AccessKey(cursor.read_u16::<LittleEndian>().map_err(|_| short())?),
            }),
            OP_STORE_CODE_BLOCK => {
                let key = AccessKey(cursor.read_u16::<LittleEndian>().map_err(|_| short())?);
                let index = cursor.read_u16::<LittleEndian>().map_err(|_| short())?;
                let mut data = Vec::new();
                cursor.read_to_end(&mut data).map_err(|_| short())?;
                Ok(Self::StoreCodeBlock { key, index, data })
            }
            OP_READ_CODE_BLOCK_CRC => Ok(Self::ReadCodeBlockCrc {
                index: cursor.read_u16::<LittleEndian>().map_err(|_| short())?,
            }),
            other => Err(CommandParseError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreCodeBlock { index, data, .. } => {
                write!(f, "{}[{}] ({} bytes)", self.name(), index, data.len())
            }
            Self::ReadCodeBlockCrc { index } => write!(f, "{}[{}]", self.name(), index),
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: u16) -> AccessKey {
        AccessKey::new(raw).unwrap()
    }

    #[test]
    fn test_erase_fixture() {
        let bytes = ControlCommand::EraseStagingArea { key: key(0xBEEF) }
            .encode(MAX_WRITE_LEN)
            .unwrap();
        assert_eq!(bytes, vec![0x01, 0xEF, 0xBE]);
    }

    #[test]
    fn test_store_fixture() {
        let cmd = ControlCommand::StoreCodeBlock {
            key: key(0x0102),
            index: 7,
            data: vec![0xAA, 0xBB, 0xCC],
        };
        assert_eq!(
            cmd.encode(MAX_WRITE_LEN).unwrap(),
            vec![0x02, 0x02, 0x01, 0x07, 0x00, 0xAA, 0xBB, 0xCC]
        );
        assert_eq!(cmd.encoded_len(), 8);
    }

    #[test]
    fn test_crc_read_carries_only_index() {
        let bytes = ControlCommand::ReadCodeBlockCrc { index: 0x0203 }
            .encode(MAX_WRITE_LEN)
            .unwrap();
        assert_eq!(bytes, vec![0x03, 0x03, 0x02]);
    }

    #[test]
    fn test_initiate_fixture() {
        let bytes = ControlCommand::InitiateFirmwareUpdate { key: key(0x00FF) }
            .encode(MAX_WRITE_LEN)
            .unwrap();
        assert_eq!(bytes, vec![0x04, 0xFF, 0x00]);
    }

    #[test]
    fn test_payload_too_large() {
        let cmd = ControlCommand::StoreCodeBlock {
            key: key(1),
            index: 0,
            data: vec![0; 20],
        };
        match cmd.encode(20) {
            Err(EncodeError::PayloadTooLarge { len, max }) => {
                assert_eq!(len, 25);
                assert_eq!(max, 20);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_store() {
        let cmd = ControlCommand::parse(&[0x02, 0x02, 0x01, 0x05, 0x00, 0x10, 0x20]).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::StoreCodeBlock {
                key: key(0x0102),
                index: 5,
                data: vec![0x10, 0x20],
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(ControlCommand::parse(&[]), Err(CommandParseError::Empty));
        assert_eq!(
            ControlCommand::parse(&[0x09, 0, 0]),
            Err(CommandParseError::UnknownOpcode(0x09))
        );
        assert!(matches!(
            ControlCommand::parse(&[0x02, 0x01]),
            Err(CommandParseError::ShortOperand { opcode: 0x02, .. })
        ));
    }

    #[test]
    fn test_parse_zero_key() {
        let cmd = ControlCommand::parse(&[0x01, 0x00, 0x00]).unwrap();
        assert_eq!(cmd.access_key().map(|k| k.value()), Some(0));
    }

    #[test]
    fn test_generated_key_nonzero() {
        for _ in 0..64 {
            assert_ne!(AccessKey::generate().value(), 0);
        }
    }
}
