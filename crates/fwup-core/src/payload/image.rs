//! Firmware image chunking.
//!
//! The image is split into fixed-size code blocks, one device flash page
//! each. The final block is padded with the erased-flash value so every
//! store write has the same length.

use crc::{CRC_16_IBM_3740, CRC_32_ISO_HDLC, Crc};
use thiserror::Error;

use crate::protocol::constants::{ERASED_BYTE, MAX_WRITE_LEN, STORE_HEADER_LEN};

/// Per-block CRC (CRC-16/CCITT-FALSE).
pub const BLOCK_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Whole-image fingerprint.
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Firmware image is empty")]
    Empty,
    #[error("Block size {0} is not usable")]
    InvalidBlockSize(usize),
    #[error("Block size {block_size} does not fit a {max_write}-byte write")]
    BlockTooLarge { block_size: usize, max_write: usize },
    #[error("Image needs {blocks} blocks, protocol limit is {max}")]
    TooManyBlocks { blocks: usize, max: usize },
    #[error("Image size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Image fingerprint mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    FingerprintMismatch { expected: u32, actual: u32 },
}

/// CRC of a single code block's data.
pub fn block_crc(data: &[u8]) -> u16 {
    BLOCK_CRC.checksum(data)
}

/// One fixed-size unit of the store/verify exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlock<'a> {
    pub index: u16,
    pub data: &'a [u8],
}

impl CodeBlock<'_> {
    pub fn crc(&self) -> u16 {
        block_crc(self.data)
    }
}

/// Ordered source of fixed-size code blocks.
pub trait CodeBlockSource {
    /// Number of blocks.
    fn total_blocks(&self) -> usize;

    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Block at `index`, or `None` past the end.
    fn block(&self, index: u16) -> Option<CodeBlock<'_>>;

    /// Fingerprint used to match persisted sessions to an image.
    fn fingerprint(&self) -> u32;
}

/// Firmware image split into code blocks.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// Padded image bytes.
    data: Vec<u8>,
    /// Unpadded length.
    original_len: usize,
    block_size: usize,
    fingerprint: u32,
}

impl FirmwareImage {
    /// Split raw image bytes into `block_size` blocks.
    pub fn from_bytes(mut data: Vec<u8>, block_size: usize) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty);
        }
        if block_size == 0 {
            return Err(ImageError::InvalidBlockSize(block_size));
        }
        if block_size + STORE_HEADER_LEN > MAX_WRITE_LEN {
            return Err(ImageError::BlockTooLarge {
                block_size,
                max_write: MAX_WRITE_LEN,
            });
        }
        let blocks = data.len().div_ceil(block_size);
        if blocks > u16::MAX as usize + 1 {
            return Err(ImageError::TooManyBlocks {
                blocks,
                max: u16::MAX as usize + 1,
            });
        }

        let original_len = data.len();
        let fingerprint = IMAGE_CRC.checksum(&data);
        data.resize(blocks * block_size, ERASED_BYTE);

        Ok(Self {
            data,
            original_len,
            block_size,
            fingerprint,
        })
    }

    /// Check a downloaded image against its advertised size and fingerprint.
    pub fn verify(&self, expected_len: usize, expected_crc: Option<u32>) -> Result<(), ImageError> {
        if self.original_len != expected_len {
            return Err(ImageError::SizeMismatch {
                expected: expected_len,
                actual: self.original_len,
            });
        }
        if let Some(expected) = expected_crc
            && expected != self.fingerprint
        {
            return Err(ImageError::FingerprintMismatch {
                expected,
                actual: self.fingerprint,
            });
        }
        Ok(())
    }

    /// Iterate over all blocks in order.
    pub fn blocks(&self) -> impl Iterator<Item = CodeBlock<'_>> {
        self.data
            .chunks(self.block_size)
            .enumerate()
            .map(|(i, data)| CodeBlock {
                index: i as u16,
                data,
            })
    }

    /// Unpadded image length.
    pub fn len(&self) -> usize {
        self.original_len
    }

    pub fn is_empty(&self) -> bool {
        self.original_len == 0
    }
}

impl CodeBlockSource for FirmwareImage {
    fn total_blocks(&self) -> usize {
        self.data.len() / self.block_size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block(&self, index: u16) -> Option<CodeBlock<'_>> {
        let start = index as usize * self.block_size;
        let data = self.data.get(start..start + self.block_size)?;
        Some(CodeBlock { index, data })
    }

    fn fingerprint(&self) -> u32 {
        self.fingerprint
    }
}
