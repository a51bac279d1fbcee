//! Tiled Array Storage (TAS)
//!
//! A TAS file holds one N-dimensional array cut into equally sized blocks,
//! each compressed on its own and guarded by an Adler-32 checksum:
//!
//! ```text
//! header (152 bytes) | index: nblk x {offset, length, adler32} | heap
//! ```
//!
//! Blocks are numbered in raster order with the first axis fastest. An index
//! entry of length zero marks a sparse block, which reads back as MISSING.

pub mod compression;
pub mod header;
pub mod io;
pub mod types;

pub use compression::{Compression, CompressionConfig};
pub use header::{IndexEntry, TasHeader, HEADER_SIZE, INDEX_ENTRY_SIZE, MAX_RANK};
pub use io::TasFile;
pub use types::{convert, Array, Element, ElementType, MISSING_TIME};

use crate::core::codec::{adler32, ndim};
use crate::error::{Result, SumsError};
use std::path::Path;
use types::needs_conversion;

/// Target size of an uncompressed block
pub const GOAL_SIZE: usize = 1 << 20;

/// Linear scaling applied as `dst = bscale * src + bzero`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    pub bzero: f64,
    pub bscale: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Scaling {
            bzero: 0.0,
            bscale: 1.0,
        }
    }
}

impl Scaling {
    pub fn new(bzero: f64, bscale: f64) -> Self {
        Scaling { bzero, bscale }
    }

    /// No scaling
    pub fn identity() -> Self {
        Self::default()
    }
}

/// Pick block sizes so that one block holds about [`GOAL_SIZE`] bytes.
///
/// Uncompressed files split every axis by the same factor. Compressed files
/// keep leading axes whole until the running block size reaches the goal and
/// cut every axis after that to a single element.
pub fn choose_block_sizes(
    compression: Compression,
    element_type: ElementType,
    axis: &[usize],
) -> Result<Vec<usize>> {
    let sz = element_type.storage_size()?;

    if compression == Compression::None {
        let n: usize = axis.iter().product();
        let b = ((n * sz) as f32 / GOAL_SIZE as f32).powf(1.0 / axis.len() as f32);
        Ok(axis
            .iter()
            .map(|&a| {
                if b <= 1.0 {
                    a
                } else if b >= a as f32 {
                    1
                } else {
                    (a as f32 / b).ceil() as usize
                }
            })
            .collect())
    } else {
        let mut n = sz;
        Ok(axis
            .iter()
            .map(|&a| {
                n *= a;
                if n >= GOAL_SIZE {
                    1
                } else {
                    a
                }
            })
            .collect())
    }
}

/// Block coordinates of linear block number `idx`
fn block_coords(mut idx: usize, baxis: &[usize]) -> Vec<usize> {
    baxis
        .iter()
        .map(|&n| {
            let c = idx % n;
            idx /= n;
            c
        })
        .collect()
}

/// Linear block number of block coordinates `bidx`
fn block_number(bidx: &[usize], baxis: &[usize]) -> usize {
    let mut idx = 0;
    let mut stride = 1;
    for (&b, &n) in bidx.iter().zip(baxis) {
        idx += b * stride;
        stride *= n;
    }
    idx
}

/// First and last element covered by block `bidx`
fn block_extent(header: &TasHeader, bidx: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let start: Vec<usize> = bidx
        .iter()
        .zip(&header.blksz)
        .map(|(&b, &sz)| b * sz)
        .collect();
    let end = start
        .iter()
        .zip(&header.blksz)
        .zip(&header.axis)
        .map(|((&s, &sz), &a)| (s + sz - 1).min(a - 1))
        .collect();
    (start, end)
}

/// Visit the blocks with coordinates in `lo..=hi` in raster order.
fn for_each_block_in<F>(lo: &[usize], hi: &[usize], mut visit: F) -> Result<()>
where
    F: FnMut(&[usize]) -> Result<()>,
{
    let mut bidx = lo.to_vec();
    loop {
        visit(&bidx)?;

        let mut i = 0;
        loop {
            if i == bidx.len() {
                return Ok(());
            }
            if bidx[i] < hi[i] {
                bidx[i] += 1;
                break;
            }
            bidx[i] = lo[i];
            i += 1;
        }
    }
}

fn check_rank(naxis: usize) -> Result<()> {
    if naxis == 0 {
        return Err(SumsError::InvalidRequest("zero-dimensional array".into()));
    }
    if naxis > MAX_RANK {
        return Err(SumsError::InvalidRank {
            naxis,
            max: MAX_RANK,
        });
    }
    Ok(())
}

/// Compress one block and append it, returning its index entry.
fn append_block(
    file: &mut TasFile,
    config: &CompressionConfig,
    stored: ElementType,
    data: &[u8],
) -> Result<IndexEntry> {
    let packed = compression::compress(config, stored, data)?;
    let checksum = adler32(1, &packed);
    let offset = file.append(&packed)?;
    Ok(IndexEntry {
        offset,
        length: packed.len() as u64,
        adler32: checksum,
    })
}

/// Read, verify and decompress block `block`.
fn load_block(
    file: &mut TasFile,
    header: &TasHeader,
    config: &CompressionConfig,
    block: usize,
    entry: &IndexEntry,
    count: usize,
) -> Result<Vec<u8>> {
    let raw = file.read_block(entry)?;
    let found = adler32(1, &raw);
    if found != entry.adler32 {
        return Err(SumsError::ChecksumMismatch {
            block,
            expected: entry.adler32,
            found,
        });
    }
    compression::decompress(config, header.element_type, &raw, count)
}

/// Create a TAS file with a zero-filled index.
///
/// When `blksz` is `None` block sizes come from [`choose_block_sizes`].
pub fn create<P: AsRef<Path>>(
    path: P,
    compression: Compression,
    element_type: ElementType,
    axis: &[usize],
    blksz: Option<&[usize]>,
) -> Result<TasHeader> {
    check_rank(axis.len())?;
    if !compression.supports(element_type) {
        return Err(SumsError::UnsupportedCodec {
            method: compression.to_string(),
            element_type: element_type.to_string(),
        });
    }
    let blksz = match blksz {
        Some(b) => b.to_vec(),
        None => choose_block_sizes(compression, element_type, axis)?,
    };
    let header = TasHeader::new(element_type, compression, axis.to_vec(), blksz)?;
    TasFile::create(&path, &header)?;

    tracing::debug!(
        "Created TAS file {}: {} blocks of {:?}",
        path.as_ref().display(),
        header.block_count(),
        header.blksz
    );
    Ok(header)
}

/// Write `array` as a new TAS file, storing elements as `element_type`.
///
/// `ElementType::Raw` stores the array's own type.
pub fn write<P: AsRef<Path>>(
    path: P,
    element_type: ElementType,
    scaling: Scaling,
    compression: Compression,
    blksz: Option<&[usize]>,
    array: &Array,
) -> Result<TasHeader> {
    let stored = if element_type == ElementType::Raw {
        array.element_type
    } else {
        element_type
    };
    let header = create(&path, compression, stored, &array.axis, blksz)?;
    let config = CompressionConfig::for_method(compression);
    let convert_blocks = needs_conversion(array.element_type, stored, scaling.bzero, scaling.bscale);
    let sz = array.element_type.storage_size()?;

    let mut file = TasFile::open(&path)?;
    let baxis = header.block_axes();
    let nblk = header.block_count();
    let mut index = Vec::with_capacity(nblk);

    for block in 0..nblk {
        let bidx = block_coords(block, &baxis);
        let (bstart, bend) = block_extent(&header, &bidx);
        let mut buf = vec![0u8; sz * ndim::region_count(&bstart, &bend)];
        ndim::pack(sz, &array.axis, &bstart, &bend, &array.data, &mut buf)?;
        if convert_blocks {
            buf = convert(array.element_type, stored, scaling.bzero, scaling.bscale, &buf)?;
        }
        index.push(append_block(&mut file, &config, stored, &buf)?);
    }

    file.write_index_entries(0, &index)?;
    file.sync()?;

    tracing::debug!(
        "Wrote {} blocks to {}",
        nblk,
        path.as_ref().display()
    );
    Ok(header)
}

/// Read a whole TAS file as `element_type` (`Raw` keeps the stored type).
pub fn read<P: AsRef<Path>>(path: P, element_type: ElementType, scaling: Scaling) -> Result<Array> {
    let mut file = TasFile::open_read_only(&path)?;
    let (header, index) = file.read_layout()?;
    let config = CompressionConfig::for_method(header.compression);

    let out_type = if element_type == ElementType::Raw {
        header.element_type
    } else {
        element_type
    };
    let convert_blocks =
        needs_conversion(header.element_type, element_type, scaling.bzero, scaling.bscale);
    let sz = out_type.storage_size()?;
    let mut out = Array::missing(out_type, header.axis.clone())?;

    let baxis = header.block_axes();
    for (block, entry) in index.iter().enumerate() {
        if entry.is_sparse() {
            continue;
        }
        let bidx = block_coords(block, &baxis);
        let (bstart, bend) = block_extent(&header, &bidx);
        let count = ndim::region_count(&bstart, &bend);

        let mut data = load_block(&mut file, &header, &config, block, entry, count)?;
        if convert_blocks {
            data = convert(header.element_type, out_type, scaling.bzero, scaling.bscale, &data)?;
        }
        ndim::unpack(sz, &header.axis, &bstart, &bend, &data, &mut out.data)?;
    }

    Ok(out)
}

/// Read the inclusive region `start..=end` of a TAS file.
pub fn read_slice<P: AsRef<Path>>(
    path: P,
    element_type: ElementType,
    scaling: Scaling,
    start: &[usize],
    end: &[usize],
) -> Result<Array> {
    let mut file = TasFile::open_read_only(&path)?;
    let (header, index) = file.read_layout()?;
    let config = CompressionConfig::for_method(header.compression);
    let naxis = header.naxis();

    for found in [start.len(), end.len()] {
        if found != naxis {
            return Err(SumsError::DimensionMismatch {
                expected: naxis,
                found,
            });
        }
    }
    for i in 0..naxis {
        if start[i] > end[i] {
            return Err(SumsError::EmptySlice {
                axis: i,
                start: start[i],
                end: end[i],
            });
        }
        if end[i] >= header.axis[i] {
            return Err(SumsError::SliceOutOfBounds {
                axis: i,
                start: start[i],
                end: end[i],
                len: header.axis[i],
            });
        }
    }

    let out_type = if element_type == ElementType::Raw {
        header.element_type
    } else {
        element_type
    };
    let convert_blocks =
        needs_conversion(header.element_type, element_type, scaling.bzero, scaling.bscale);
    let sz = out_type.storage_size()?;
    let out_axis: Vec<usize> = (0..naxis).map(|i| end[i] - start[i] + 1).collect();
    let mut out = Array::missing(out_type, out_axis.clone())?;

    let baxis = header.block_axes();
    let lo: Vec<usize> = (0..naxis).map(|i| start[i] / header.blksz[i]).collect();
    let hi: Vec<usize> = (0..naxis).map(|i| end[i] / header.blksz[i]).collect();

    for_each_block_in(&lo, &hi, |bidx| {
        let block = block_number(bidx, &baxis);
        let entry = &index[block];
        if entry.is_sparse() {
            return Ok(());
        }
        let (bstart, bend) = block_extent(&header, bidx);
        let bsize: Vec<usize> = (0..naxis).map(|i| bend[i] - bstart[i] + 1).collect();
        let count = bsize.iter().product();

        let mut data = load_block(&mut file, &header, &config, block, entry, count)?;
        if convert_blocks {
            data = convert(header.element_type, out_type, scaling.bzero, scaling.bscale, &data)?;
        }

        let contained = (0..naxis).all(|i| bstart[i] >= start[i] && bend[i] <= end[i]);
        if contained {
            let ostart: Vec<usize> = (0..naxis).map(|i| bstart[i] - start[i]).collect();
            let oend: Vec<usize> = (0..naxis).map(|i| bend[i] - start[i]).collect();
            return ndim::unpack(sz, &out_axis, &ostart, &oend, &data, &mut out.data);
        }

        // Cut the overlapping part out of the block first
        let sstart: Vec<usize> = (0..naxis)
            .map(|i| start[i].max(bstart[i]) - bstart[i])
            .collect();
        let send: Vec<usize> = (0..naxis).map(|i| end[i].min(bend[i]) - bstart[i]).collect();
        let mut part = vec![0u8; sz * ndim::region_count(&sstart, &send)];
        ndim::pack(sz, &bsize, &sstart, &send, &data, &mut part)?;

        let ostart: Vec<usize> = (0..naxis)
            .map(|i| bstart[i].max(start[i]) - start[i])
            .collect();
        let oend: Vec<usize> = (0..naxis).map(|i| bend[i].min(end[i]) - start[i]).collect();
        ndim::unpack(sz, &out_axis, &ostart, &oend, &part, &mut out.data)
    })?;

    Ok(out)
}

/// Replace the whole blocks covered by `array` placed at `start`.
///
/// The slice must start on a block boundary and end on one or at the edge
/// of the array. New block data is appended at end of file; the old payload
/// stays behind until [`defragment`] runs.
pub fn write_slice<P: AsRef<Path>>(
    path: P,
    scaling: Scaling,
    start: &[usize],
    array: &Array,
) -> Result<()> {
    let mut file = TasFile::open(&path)?;
    if file.len()? <= HEADER_SIZE as u64 {
        return Err(SumsError::InvalidRequest(format!(
            "{} holds no TAS index",
            path.as_ref().display()
        )));
    }
    let (header, mut index) = file.read_layout()?;
    let naxis = header.naxis();

    if array.naxis() != naxis {
        return Err(SumsError::DimensionMismatch {
            expected: naxis,
            found: array.naxis(),
        });
    }
    if start.len() != naxis {
        return Err(SumsError::DimensionMismatch {
            expected: naxis,
            found: start.len(),
        });
    }
    if array.count() == 0 {
        return Err(SumsError::InvalidRequest("empty slice".into()));
    }

    let end: Vec<usize> = (0..naxis).map(|i| start[i] + array.axis[i] - 1).collect();
    for i in 0..naxis {
        if end[i] >= header.axis[i] {
            return Err(SumsError::SliceOutOfBounds {
                axis: i,
                start: start[i],
                end: end[i],
                len: header.axis[i],
            });
        }
        let aligned_start = start[i] % header.blksz[i] == 0;
        let aligned_end = (end[i] + 1) % header.blksz[i] == 0 || end[i] + 1 >= header.axis[i];
        if !aligned_start || !aligned_end {
            return Err(SumsError::MisalignedSlice {
                axis: i,
                start: start[i],
                end: end[i],
                blksz: header.blksz[i],
            });
        }
    }

    let config = CompressionConfig::for_method(header.compression);
    let stored = header.element_type;
    let convert_blocks = needs_conversion(array.element_type, stored, scaling.bzero, scaling.bscale);
    let sz = array.element_type.storage_size()?;

    let baxis = header.block_axes();
    let lo: Vec<usize> = (0..naxis).map(|i| start[i] / header.blksz[i]).collect();
    let hi: Vec<usize> = (0..naxis).map(|i| end[i] / header.blksz[i]).collect();
    let mut changed = Vec::new();

    for_each_block_in(&lo, &hi, |bidx| {
        let (bstart, bend) = block_extent(&header, bidx);
        let sstart: Vec<usize> = (0..naxis).map(|i| bstart[i] - start[i]).collect();
        let send: Vec<usize> = (0..naxis).map(|i| bend[i] - start[i]).collect();

        let mut buf = vec![0u8; sz * ndim::region_count(&sstart, &send)];
        ndim::pack(sz, &array.axis, &sstart, &send, &array.data, &mut buf)?;
        if convert_blocks {
            buf = convert(array.element_type, stored, scaling.bzero, scaling.bscale, &buf)?;
        }

        let block = block_number(bidx, &baxis);
        index[block] = append_block(&mut file, &config, stored, &buf)?;
        changed.push(block);
        Ok(())
    })?;

    // Rewrite changed entries in runs of consecutive block numbers
    changed.sort_unstable();
    let mut run_start = 0;
    while run_start < changed.len() {
        let mut run_end = run_start + 1;
        while run_end < changed.len() && changed[run_end] == changed[run_end - 1] + 1 {
            run_end += 1;
        }
        let first = changed[run_start];
        let last = changed[run_end - 1];
        file.write_index_entries(first, &index[first..=last])?;
        run_start = run_end;
    }
    file.sync()?;

    tracing::debug!(
        "Replaced {} blocks in {}",
        changed.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Whether the heap holds every block back to back in index order
fn is_contiguous(index: &[IndexEntry]) -> bool {
    index
        .windows(2)
        .all(|w| w[1].offset == w[0].offset + w[0].length)
}

/// Rewrite a TAS file so its blocks are contiguous and in index order.
///
/// The copy is built in `scratch_dir` (default: the file's own directory)
/// and renamed over the original only once complete. Returns `false` when
/// the file was already contiguous.
pub fn defragment<P: AsRef<Path>>(path: P, scratch_dir: Option<&Path>) -> Result<bool> {
    let path = path.as_ref();
    let mut file = TasFile::open_read_only(path)?;
    let (header, index) = file.read_layout()?;

    if is_contiguous(&index) {
        tracing::debug!("{} is already contiguous", path.display());
        return Ok(false);
    }

    let dir = match scratch_dir {
        Some(dir) => dir.to_path_buf(),
        None => match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        },
    };
    let temp = tempfile::NamedTempFile::new_in(&dir)?;

    let mut offset = header.heap_start();
    let new_index: Vec<IndexEntry> = index
        .iter()
        .map(|entry| {
            let moved = IndexEntry {
                offset,
                ..*entry
            };
            offset += entry.length;
            moved
        })
        .collect();

    {
        let mut out = TasFile::open(temp.path())?;
        out.write_header(&header)?;
        out.write_index_entries(0, &new_index)?;
        for (old, new) in index.iter().zip(&new_index) {
            if old.is_sparse() {
                continue;
            }
            let data = file.read_block(old)?;
            out.write_at(new.offset, &data)?;
        }
        out.sync()?;
    }

    temp.persist(path).map_err(|e| SumsError::Io(e.error))?;

    tracing::info!(
        "Defragmented {}: {} blocks, {} bytes",
        path.display(),
        index.len(),
        offset
    );
    Ok(true)
}

/// Header and index of a TAS file
pub fn info<P: AsRef<Path>>(path: P) -> Result<(TasHeader, Vec<IndexEntry>)> {
    TasFile::open_read_only(path)?.read_layout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp(axis: &[usize]) -> Array {
        let n: usize = axis.iter().product();
        let values: Vec<i32> = (0..n as i32).map(|v| v * 7 - 300).collect();
        Array::from_values(axis.to_vec(), &values).unwrap()
    }

    #[test]
    fn test_block_sizes_uncompressed() {
        // 4 MiB of ints: split each axis by 2
        let b = choose_block_sizes(Compression::None, ElementType::Int, &[1024, 1024]).unwrap();
        assert_eq!(b, vec![512, 512]);

        // Small arrays stay in one block
        let b = choose_block_sizes(Compression::None, ElementType::Short, &[100, 20]).unwrap();
        assert_eq!(b, vec![100, 20]);
    }

    #[test]
    fn test_block_sizes_compressed() {
        let b = choose_block_sizes(Compression::Rice, ElementType::Short, &[1024, 1024, 4])
            .unwrap();
        assert_eq!(b, vec![1024, 1, 1]);

        let b = choose_block_sizes(Compression::Gzip, ElementType::Double, &[64, 64]).unwrap();
        assert_eq!(b, vec![64, 64]);
    }

    #[test]
    fn test_block_order_first_axis_fastest() {
        let baxis = [3, 2];
        assert_eq!(block_coords(0, &baxis), vec![0, 0]);
        assert_eq!(block_coords(1, &baxis), vec![1, 0]);
        assert_eq!(block_coords(3, &baxis), vec![0, 1]);
        assert_eq!(block_number(&[2, 1], &baxis), 5);
    }

    #[test]
    fn test_create_rejects_high_rank() {
        let dir = TempDir::new().unwrap();
        let result = create(
            dir.path().join("big.tas"),
            Compression::None,
            ElementType::Char,
            &[1; 17],
            None,
        );
        assert!(matches!(result, Err(SumsError::InvalidRank { .. })));
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.tas");
        let array = ramp(&[13, 7, 3]);

        write(
            &path,
            ElementType::Raw,
            Scaling::identity(),
            Compression::Rice,
            Some(&[4, 3, 2]),
            &array,
        )
        .unwrap();

        let back = read(&path, ElementType::Raw, Scaling::identity()).unwrap();
        assert_eq!(back, array);

        let (header, index) = info(&path).unwrap();
        assert_eq!(header.block_axes(), vec![4, 3, 2]);
        assert_eq!(index.len(), 24);
        assert!(is_contiguous(&index));
    }

    #[test]
    fn test_read_with_conversion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.tas");
        let values: Vec<i16> = vec![1, 2, 3, i16::MIN];
        let array = Array::from_values(vec![4], &values).unwrap();

        write(
            &path,
            ElementType::Short,
            Scaling::identity(),
            Compression::None,
            None,
            &array,
        )
        .unwrap();

        let back = read(&path, ElementType::Double, Scaling::new(0.5, 2.0)).unwrap();
        let doubles: Vec<f64> = back.to_vec().unwrap();
        assert_eq!(&doubles[..3], &[2.5, 4.5, 6.5]);
        assert!(doubles[3].is_nan());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.tas");
        write(
            &path,
            ElementType::Raw,
            Scaling::identity(),
            Compression::None,
            Some(&[8, 8]),
            &ramp(&[16, 16]),
        )
        .unwrap();

        let (header, _) = info(&path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let victim = header.heap_start() as usize + 3;
        bytes[victim] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read(&path, ElementType::Raw, Scaling::identity()),
            Err(SumsError::ChecksumMismatch { block: 0, .. })
        ));
    }

    #[test]
    fn test_sparse_blocks_read_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sparse.tas");
        create(&path, Compression::Zstd, ElementType::Int, &[6, 4], Some(&[3, 2])).unwrap();

        let patch = Array::from_values(vec![3, 2], &[1i32, 2, 3, 4, 5, 6]).unwrap();
        write_slice(&path, Scaling::identity(), &[3, 2], &patch).unwrap();

        let back: Vec<i32> = read(&path, ElementType::Raw, Scaling::identity())
            .unwrap()
            .to_vec()
            .unwrap();
        assert_eq!(back[0], i32::MIN);
        assert_eq!(back[3 + 6 * 2], 1);
        assert_eq!(back[5 + 6 * 3], 6);
    }

    #[test]
    fn test_read_slice_matches_full_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slice.tas");
        let array = ramp(&[11, 9]);
        write(
            &path,
            ElementType::Raw,
            Scaling::identity(),
            Compression::Gzip,
            Some(&[4, 4]),
            &array,
        )
        .unwrap();

        let slice = read_slice(&path, ElementType::Raw, Scaling::identity(), &[2, 3], &[9, 5])
            .unwrap();
        assert_eq!(slice.axis, vec![8, 3]);

        let full: Vec<i32> = array.to_vec().unwrap();
        let got: Vec<i32> = slice.to_vec().unwrap();
        for y in 0..3 {
            for x in 0..8 {
                assert_eq!(got[x + 8 * y], full[(x + 2) + 11 * (y + 3)]);
            }
        }
    }

    #[test]
    fn test_read_slice_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slice.tas");
        write(
            &path,
            ElementType::Raw,
            Scaling::identity(),
            Compression::None,
            None,
            &ramp(&[5, 5]),
        )
        .unwrap();

        assert!(matches!(
            read_slice(&path, ElementType::Raw, Scaling::identity(), &[3, 0], &[2, 4]),
            Err(SumsError::EmptySlice { axis: 0, .. })
        ));
        assert!(matches!(
            read_slice(&path, ElementType::Raw, Scaling::identity(), &[0, 0], &[4, 5]),
            Err(SumsError::SliceOutOfBounds { axis: 1, .. })
        ));
        assert!(matches!(
            read_slice(&path, ElementType::Raw, Scaling::identity(), &[0], &[4]),
            Err(SumsError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_write_slice_alignment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aligned.tas");
        create(&path, Compression::None, ElementType::Int, &[10, 10], Some(&[4, 4])).unwrap();

        let misaligned = ramp(&[4, 4]);
        assert!(matches!(
            write_slice(&path, Scaling::identity(), &[2, 0], &misaligned),
            Err(SumsError::MisalignedSlice { axis: 0, .. })
        ));

        // The trailing partial block may be written on its own
        let edge = ramp(&[2, 4]);
        write_slice(&path, Scaling::identity(), &[8, 4], &edge).unwrap();
        let back = read_slice(&path, ElementType::Raw, Scaling::identity(), &[8, 4], &[9, 7])
            .unwrap();
        assert_eq!(back, edge);
    }

    #[test]
    fn test_write_slice_then_defragment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frag.tas");
        let array = ramp(&[8, 8]);
        write(
            &path,
            ElementType::Raw,
            Scaling::identity(),
            Compression::Rice,
            Some(&[4, 4]),
            &array,
        )
        .unwrap();

        let patch = Array::from_values(vec![4, 4], &[9i32; 16]).unwrap();
        write_slice(&path, Scaling::identity(), &[0, 4], &patch).unwrap();

        let (_, index) = info(&path).unwrap();
        assert!(!is_contiguous(&index));
        let before = read(&path, ElementType::Raw, Scaling::identity()).unwrap();
        let size_before = std::fs::metadata(&path).unwrap().len();

        assert!(defragment(&path, None).unwrap());
        let (header, index) = info(&path).unwrap();
        assert!(is_contiguous(&index));
        assert_eq!(index[0].offset, header.heap_start());
        assert!(std::fs::metadata(&path).unwrap().len() < size_before);
        assert_eq!(read(&path, ElementType::Raw, Scaling::identity()).unwrap(), before);

        assert!(!defragment(&path, Some(dir.path())).unwrap());
    }
}
