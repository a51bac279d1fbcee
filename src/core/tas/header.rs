use crate::core::tas::compression::Compression;
use crate::core::tas::types::ElementType;
use crate::error::{Result, SumsError};
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 8] = *b"DRMS TAS";
pub const VERSION: i32 = 1;

/// Maximum number of axes a TAS file can describe
pub const MAX_RANK: usize = 16;

/// Size of the fixed on-disk header
pub const HEADER_SIZE: usize = 8 + 4 * 4 + 2 * 4 * MAX_RANK;

/// Size of one packed index entry
pub const INDEX_ENTRY_SIZE: usize = 20;

/// TAS file header
///
/// ```text
/// magic[8]="DRMS TAS" | version:i32 | type:i32 | compress:i32 | naxis:u32
/// axis[16]:i32 | blksz[16]:i32          (unused slots zero)
/// ```
///
/// All multi-byte fields are little-endian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasHeader {
    pub version: i32,
    pub element_type: ElementType,
    pub compression: Compression,
    pub axis: Vec<usize>,
    pub blksz: Vec<usize>,
}

impl TasHeader {
    /// Create a header, validating rank and block sizes.
    pub fn new(
        element_type: ElementType,
        compression: Compression,
        axis: Vec<usize>,
        blksz: Vec<usize>,
    ) -> Result<Self> {
        let header = TasHeader {
            version: VERSION,
            element_type,
            compression,
            axis,
            blksz,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn naxis(&self) -> usize {
        self.axis.len()
    }

    /// Validate rank, axis lengths and block sizes
    pub fn validate(&self) -> Result<()> {
        let naxis = self.axis.len();
        if naxis > MAX_RANK {
            return Err(SumsError::InvalidRank {
                naxis,
                max: MAX_RANK,
            });
        }
        if self.blksz.len() != naxis {
            return Err(SumsError::DimensionMismatch {
                expected: naxis,
                found: self.blksz.len(),
            });
        }
        for i in 0..naxis {
            if self.blksz[i] == 0 || self.blksz[i] > self.axis[i] {
                return Err(SumsError::InvalidBlockSize {
                    axis: i,
                    blksz: self.blksz[i] as i64,
                    len: self.axis[i] as i64,
                });
            }
            if self.axis[i] == 0 {
                return Err(SumsError::InvalidAxis { axis: i, len: 0 });
            }
        }
        if self.element_type.size().is_none() {
            return Err(SumsError::InvalidType(self.element_type as i32));
        }
        Ok(())
    }

    /// Number of blocks along each axis
    pub fn block_axes(&self) -> Vec<usize> {
        self.axis
            .iter()
            .zip(&self.blksz)
            .map(|(&a, &b)| a.div_ceil(b))
            .collect()
    }

    /// Total number of blocks (index entries)
    pub fn block_count(&self) -> usize {
        self.block_axes().iter().product()
    }

    /// Elements in a full block
    pub fn block_elements(&self) -> usize {
        self.blksz.iter().product()
    }

    /// File offset where the heap starts
    pub fn heap_start(&self) -> u64 {
        (HEADER_SIZE + self.block_count() * INDEX_ENTRY_SIZE) as u64
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(self.element_type as i32).to_le_bytes());
        bytes.extend_from_slice(&(self.compression as i32).to_le_bytes());
        bytes.extend_from_slice(&(self.axis.len() as u32).to_le_bytes());
        for i in 0..MAX_RANK {
            let v = self.axis.get(i).copied().unwrap_or(0) as i32;
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for i in 0..MAX_RANK {
            let v = self.blksz.get(i).copied().unwrap_or(0) as i32;
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SumsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for TAS header",
            )));
        }
        if bytes[..8] != MAGIC {
            return Err(SumsError::BadMagic);
        }

        let read_i32 = |offset: usize| {
            i32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        let version = read_i32(8);
        if version != VERSION {
            return Err(SumsError::UnsupportedVersion(version));
        }
        let type_code = read_i32(12);
        let element_type =
            ElementType::from_i32(type_code).ok_or(SumsError::InvalidType(type_code))?;
        let comp_code = read_i32(16);
        let compression =
            Compression::from_i32(comp_code).ok_or(SumsError::InvalidCompression(comp_code))?;
        let naxis = read_i32(20) as u32 as usize;
        if naxis > MAX_RANK {
            return Err(SumsError::InvalidRank {
                naxis,
                max: MAX_RANK,
            });
        }

        let mut axis = Vec::with_capacity(naxis);
        let mut blksz = Vec::with_capacity(naxis);
        for i in 0..naxis {
            let a = read_i32(24 + 4 * i);
            let b = read_i32(24 + 4 * MAX_RANK + 4 * i);
            if b <= 0 || b > a {
                return Err(SumsError::InvalidBlockSize {
                    axis: i,
                    blksz: b as i64,
                    len: a as i64,
                });
            }
            if a <= 0 {
                return Err(SumsError::InvalidAxis {
                    axis: i,
                    len: a as i64,
                });
            }
            axis.push(a as usize);
            blksz.push(b as usize);
        }

        let header = TasHeader {
            version,
            element_type,
            compression,
            axis,
            blksz,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Location, length and checksum of one compressed block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
    pub adler32: u32,
}

impl IndexEntry {
    /// A zero-length entry marks a sparse block read back as MISSING.
    pub fn is_sparse(&self) -> bool {
        self.length == 0
    }

    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        bytes[0..8].copy_from_slice(&self.offset.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.length.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.adler32.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INDEX_ENTRY_SIZE {
            return Err(SumsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for TAS index entry",
            )));
        }
        let mut offset = [0u8; 8];
        let mut length = [0u8; 8];
        let mut adler = [0u8; 4];
        offset.copy_from_slice(&bytes[0..8]);
        length.copy_from_slice(&bytes[8..16]);
        adler.copy_from_slice(&bytes[16..20]);
        Ok(IndexEntry {
            offset: u64::from_le_bytes(offset),
            length: u64::from_le_bytes(length),
            adler32: u32::from_le_bytes(adler),
        })
    }
}

/// Serialize a run of index entries
pub fn index_to_bytes(entries: &[IndexEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE);
    for entry in entries {
        bytes.extend_from_slice(&entry.to_bytes());
    }
    bytes
}

/// Parse a run of index entries
pub fn index_from_bytes(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    bytes
        .chunks_exact(INDEX_ENTRY_SIZE)
        .map(IndexEntry::from_bytes)
        .collect()
}
