//! Firmware-update control point constants.

/// Control point characteristic UUID.
pub const CONTROL_POINT_UUID: &str = "1761d84e-542a-481d-90e8-6db098bdbb60";

// Request opcodes
pub const OP_ERASE_STAGING_AREA: u8 = 0x01;
pub const OP_STORE_CODE_BLOCK: u8 = 0x02;
pub const OP_READ_CODE_BLOCK_CRC: u8 = 0x03;
pub const OP_INITIATE_FIRMWARE_UPDATE: u8 = 0x04;

// Response codes
pub const RSP_SUCCESS: u8 = 0x01;
pub const RSP_NOT_SUPPORTED: u8 = 0x02;
pub const RSP_INVALID_OPERATOR: u8 = 0x03;
pub const RSP_INVALID_CRC: u8 = 0x04;
pub const RSP_INVALID_CODE_BLOCK: u8 = 0x05;
pub const RSP_STAGING_AREA_VALIDATION_FAILURE: u8 = 0x06;
pub const RSP_NOT_CONNECTED_TO_CHARGER: u8 = 0x07;
pub const RSP_DEVICE_DISCONNECTED: u8 = 0x08;

/// Response notification: code byte + u16 value.
pub const RESPONSE_LEN: usize = 3;

/// Store write overhead: opcode + key + index.
pub const STORE_HEADER_LEN: usize = 5;

/// Largest single ATT attribute write.
pub const MAX_WRITE_LEN: usize = 512;

/// Default code block size (one device flash page).
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Value used to pad the last code block.
pub const ERASED_BYTE: u8 = 0xFF;

pub const DEFAULT_MAX_RETRIES: u8 = 3;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;
