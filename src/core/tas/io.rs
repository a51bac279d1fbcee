//! Disk I/O for TAS files

use crate::core::tas::header::{
    index_from_bytes, index_to_bytes, IndexEntry, TasHeader, HEADER_SIZE, INDEX_ENTRY_SIZE,
};
use crate::error::{Result, SumsError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed TAS file
pub struct TasFile {
    file: File,
    path: PathBuf,
    /// Current file position, when known
    pos: Option<u64>,
}

impl TasFile {
    /// Create a new TAS file holding the header and a zero-filled index
    pub fn create<P: AsRef<Path>>(path: P, header: &TasHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        file.write_all(&vec![0u8; header.block_count() * INDEX_ENTRY_SIZE])?;
        file.flush()?;

        Ok(TasFile {
            file,
            path: path.as_ref().to_path_buf(),
            pos: Some(header.heap_start()),
        })
    }

    /// Open an existing TAS file for update
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(TasFile {
            file,
            path: path.as_ref().to_path_buf(),
            pos: None,
        })
    }

    /// Open an existing TAS file for reading only
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;

        Ok(TasFile {
            file,
            path: path.as_ref().to_path_buf(),
            pos: None,
        })
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if self.pos != Some(offset) {
            self.file.seek(SeekFrom::Start(offset))?;
            self.pos = Some(offset);
        }
        Ok(())
    }

    /// Read the header
    pub fn read_header(&mut self) -> Result<TasHeader> {
        self.seek(0)?;
        let mut buffer = vec![0u8; HEADER_SIZE];
        self.file.read_exact(&mut buffer)?;
        self.pos = Some(HEADER_SIZE as u64);
        TasHeader::from_bytes(&buffer)
    }

    /// Write the header
    pub fn write_header(&mut self, header: &TasHeader) -> Result<()> {
        self.seek(0)?;
        self.file.write_all(&header.to_bytes())?;
        self.pos = Some(HEADER_SIZE as u64);
        Ok(())
    }

    /// Read the whole block index
    pub fn read_index(&mut self, header: &TasHeader) -> Result<Vec<IndexEntry>> {
        let nblk = header.block_count();
        self.seek(HEADER_SIZE as u64)?;
        let mut buffer = vec![0u8; nblk * INDEX_ENTRY_SIZE];
        self.file.read_exact(&mut buffer)?;
        self.pos = Some(header.heap_start());
        index_from_bytes(&buffer)
    }

    /// Write a run of consecutive index entries starting at block `first`
    pub fn write_index_entries(&mut self, first: usize, entries: &[IndexEntry]) -> Result<()> {
        let offset = (HEADER_SIZE + first * INDEX_ENTRY_SIZE) as u64;
        self.seek(offset)?;
        self.file.write_all(&index_to_bytes(entries))?;
        self.pos = Some(offset + (entries.len() * INDEX_ENTRY_SIZE) as u64);
        Ok(())
    }

    /// Read the compressed payload of one block
    ///
    /// Consecutive blocks laid out back to back are read without seeking.
    pub fn read_block(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let file_len = self.len()?;
        let past_end = entry
            .offset
            .checked_add(entry.length)
            .map_or(true, |end| end > file_len);
        if past_end {
            return Err(SumsError::BlockOutOfBounds {
                offset: entry.offset,
                length: entry.length,
                file_len,
            });
        }
        self.seek(entry.offset)?;
        let mut buffer = vec![0u8; entry.length as usize];
        self.file.read_exact(&mut buffer)?;
        self.pos = Some(entry.offset + entry.length);
        Ok(buffer)
    }

    /// Write `data` at `offset`
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.seek(offset)?;
        self.file.write_all(data)?;
        self.pos = Some(offset + data.len() as u64);
        Ok(())
    }

    /// Append `data` at end of file, returning its offset
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.pos = Some(offset + data.len() as u64);
        Ok(offset)
    }

    /// Current file length
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the file holds no bytes at all
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read header and index, rejecting files too short to hold them
    pub fn read_layout(&mut self) -> Result<(TasHeader, Vec<IndexEntry>)> {
        if self.len()? < HEADER_SIZE as u64 {
            return Err(SumsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} is too short to be a TAS file", self.path.display()),
            )));
        }
        let header = self.read_header()?;
        let index = self.read_index(&header)?;
        Ok((header, index))
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
