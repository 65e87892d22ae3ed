//! Control point response parsing.
//!
//! Every command is answered by exactly one notification of the form
//! `[code, value_lo, value_hi]`. The meaning of the value depends on the
//! command being answered (new access key, block CRC, or zero).

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed response: unknown code 0x{code:02X}")]
    Malformed { code: u8 },
    #[error("Truncated response: {len} bytes, expected {expected}")]
    Truncated { len: usize, expected: usize },
}

/// Response code reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    NotSupported,
    InvalidOperator,
    InvalidCrc,
    InvalidCodeBlock,
    StagingAreaValidationFailure,
    NotConnectedToCharger,
    DeviceDisconnected,
}

impl ResponseCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            RSP_SUCCESS => Self::Success,
            RSP_NOT_SUPPORTED => Self::NotSupported,
            RSP_INVALID_OPERATOR => Self::InvalidOperator,
            RSP_INVALID_CRC => Self::InvalidCrc,
            RSP_INVALID_CODE_BLOCK => Self::InvalidCodeBlock,
            RSP_STAGING_AREA_VALIDATION_FAILURE => Self::StagingAreaValidationFailure,
            RSP_NOT_CONNECTED_TO_CHARGER => Self::NotConnectedToCharger,
            RSP_DEVICE_DISCONNECTED => Self::DeviceDisconnected,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Success => RSP_SUCCESS,
            Self::NotSupported => RSP_NOT_SUPPORTED,
            Self::InvalidOperator => RSP_INVALID_OPERATOR,
            Self::InvalidCrc => RSP_INVALID_CRC,
            Self::InvalidCodeBlock => RSP_INVALID_CODE_BLOCK,
            Self::StagingAreaValidationFailure => RSP_STAGING_AREA_VALIDATION_FAILURE,
            Self::NotConnectedToCharger => RSP_NOT_CONNECTED_TO_CHARGER,
            Self::DeviceDisconnected => RSP_DEVICE_DISCONNECTED,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Per-block failures that are retried in place.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InvalidCrc | Self::InvalidCodeBlock)
    }

    /// Link or power conditions that suspend rather than cancel.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::NotConnectedToCharger | Self::DeviceDisconnected)
    }

    /// Failures that end the session without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotSupported | Self::InvalidOperator | Self::StagingAreaValidationFailure
        )
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::NotSupported => "Not Supported",
            Self::InvalidOperator => "Invalid Operator",
            Self::InvalidCrc => "Invalid CRC",
            Self::InvalidCodeBlock => "Invalid Code Block",
            Self::StagingAreaValidationFailure => "Staging Area Validation Failure",
            Self::NotConnectedToCharger => "Not Connected To Charger",
            Self::DeviceDisconnected => "Device Disconnected",
        };
        f.write_str(name)
    }
}

/// Decoded response notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    pub code: ResponseCode,
    pub value: u16,
}

impl ControlResponse {
    pub const fn new(code: ResponseCode, value: u16) -> Self {
        Self { code, value }
    }

    pub const fn success(value: u16) -> Self {
        Self::new(ResponseCode::Success, value)
    }

    pub fn to_bytes(&self) -> [u8; RESPONSE_LEN] {
        let [lo, hi] = self.value.to_le_bytes();
        [self.code.as_u8(), lo, hi]
    }

    /// Decode a notification payload.
    ///
    /// An unknown code is reported before a short payload, so a single stray
    /// byte still identifies itself as malformed.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let Some(&first) = data.first() else {
            return Err(DecodeError::Truncated {
                len: 0,
                expected: RESPONSE_LEN,
            });
        };
        let code = ResponseCode::from_u8(first).ok_or(DecodeError::Malformed { code: first })?;
        if data.len() < RESPONSE_LEN {
            return Err(DecodeError::Truncated {
                len: data.len(),
                expected: RESPONSE_LEN,
            });
        }
        let mut cursor = Cursor::new(&data[1..RESPONSE_LEN]);
        let value = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated {
                len: data.len(),
                expected: RESPONSE_LEN,
            })?;
        Ok(Self { code, value })
    }
}

impl fmt::Display for ControlResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.code, self.value)
    }
}
