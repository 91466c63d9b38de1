//! Binary module format
//!
//! A module is one linear byte image:
//!
//! ```text
//! [u32 data_segment_offset][code bytes ...][data bytes ...]
//! ```
//!
//! Little-endian throughout. Execution starts right after the header. The data
//! segment holds string constants and type metadata records:
//! `i32 constructor_count` followed by `constructor_count + 1` NUL-terminated
//! names (the type name, then each constructor in ordinal order).

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::opcodes::{read_cstr, read_i32};
use crate::error::{EncodingError, LoadError};

/// Size of the data-segment-offset header; also the entry point.
pub const HEADER_SIZE: usize = 4;

/// A linked, immutable bytecode module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    bytes: Vec<u8>,
    data_offset: usize,
}

/// Names recorded for an algebraic data type, used only for printing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    pub type_name: String,
    pub constructors: Vec<String>,
}

impl TypeMetadata {
    pub fn constructor(&self, ordinal: i32) -> Option<&str> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| self.constructors.get(i))
            .map(String::as_str)
    }
}

impl Module {
    /// Validate the header of a raw image and wrap it.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_SIZE {
            return Err(LoadError::TooShort(bytes.len()));
        }
        let offset = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let data_offset = offset as usize;
        if data_offset < HEADER_SIZE || data_offset > bytes.len() {
            return Err(LoadError::BadHeader {
                offset,
                len: bytes.len(),
            });
        }
        Ok(Self { bytes, data_offset })
    }

    /// Wrap an image produced by the linker or assembler, whose header is known good.
    pub(crate) fn from_linked(bytes: Vec<u8>, data_offset: usize) -> Self {
        debug_assert!(data_offset >= HEADER_SIZE && data_offset <= bytes.len());
        Self { bytes, data_offset }
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), size = bytes.len(), "loaded module");
        Self::from_bytes(bytes)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, &self.bytes)?;
        debug!(path = %path.display(), size = self.bytes.len(), "wrote module");
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() == HEADER_SIZE
    }

    /// Absolute offset of the first data byte (one past the last code byte).
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn code(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..self.data_offset]
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[self.data_offset..]
    }

    pub fn in_code(&self, offset: usize) -> bool {
        (HEADER_SIZE..self.data_offset).contains(&offset)
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32, EncodingError> {
        let mut pos = offset;
        read_i32(&self.bytes, &mut pos)
    }

    pub fn read_str(&self, offset: usize) -> Result<&[u8], EncodingError> {
        let mut pos = offset;
        read_cstr(&self.bytes, &mut pos)
    }

    /// Read the type metadata record at absolute offset `meta`.
    pub fn type_metadata(&self, meta: i32) -> Result<TypeMetadata, EncodingError> {
        let mut pos = usize::try_from(meta).map_err(|_| EncodingError::Truncated { offset: 0 })?;
        let count = read_i32(&self.bytes, &mut pos)?;
        if count < 0 {
            return Err(EncodingError::NegativeTableLength {
                length: count,
                offset: meta as usize,
            });
        }
        let type_name = String::from_utf8_lossy(read_cstr(&self.bytes, &mut pos)?).into_owned();
        let mut constructors = Vec::new();
        for _ in 0..count {
            constructors.push(String::from_utf8_lossy(read_cstr(&self.bytes, &mut pos)?).into_owned());
        }
        Ok(TypeMetadata {
            type_name,
            constructors,
        })
    }

    /// SHA-256 of the whole image, lowercase hex.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }
}
