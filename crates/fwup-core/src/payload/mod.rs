//! Payload handling module.
//!
//! Provides chunking of firmware images into code blocks.

pub mod image;

pub use image::{
    BLOCK_CRC, CodeBlock, CodeBlockSource, FirmwareImage, IMAGE_CRC, ImageError, block_crc,
};
