//! Rice entropy coder for 8, 16 and 32-bit integer samples
//!
//! Stream layout (bit-compatible with the legacy SUMS/DRMS encoder):
//!
//! ```text
//! [first sample, big-endian, raw]
//! per block of `blksz` samples:
//!     [KBITS code][payload]
//!     code 0          -> all differences zero, no payload
//!     code 1          -> k = 0, differences as unary fundamental sequences
//!     code k+1        -> split coding: unary(d >> k) then k low bits
//!     code KMAX+2     -> differences stored raw at full sample width
//! ```
//!
//! Differences are folded to unsigned values (`d >= 0 -> 2d`, `d < 0 -> ~(2d)`)
//! and bits are packed MSB-first. The final partial byte is zero padded.

use thiserror::Error;

/// Errors produced by the Rice encoder and decoder
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiceError {
    #[error("Out of memory while encoding")]
    OutOfMemory,

    #[error("Encoded stream exceeds output buffer")]
    EncodeOverrun,

    #[error("Decoded sample count exceeds output buffer")]
    DecodeOverrun,

    #[error("Input ended before all samples were decoded")]
    TruncatedInput,

    #[error("Input contains bytes beyond the encoded stream")]
    TrailingGarbage,

    #[error("Invalid block code: k = {0}")]
    InvalidCode(i32),

    #[error("Block size must be positive")]
    InvalidBlockSize,
}

/// Block size used by the TAS container for Rice-coded blocks
pub const DEFAULT_BLOCK_SIZE: usize = 32;

mod sealed {
    pub trait Sealed {}
    impl Sealed for i8 {}
    impl Sealed for i16 {}
    impl Sealed for i32 {}
}

/// Integer sample types the Rice coder understands
pub trait RiceSample: Copy + Default + sealed::Sealed {
    /// Sample width in bytes
    const BYTES: usize;
    /// Largest k stored with split coding
    const KMAX: u32;
    /// Width of the per-block k code
    const KBITS: u32;

    /// Two's complement bits of the sample, zero-extended
    fn to_bits(self) -> u32;

    /// Sample from the low `BYTES * 8` bits
    fn from_bits(bits: u32) -> Self;

    /// Sample width in bits
    fn width() -> u32 {
        (Self::BYTES * 8) as u32
    }

    /// Mask covering one sample
    fn mask() -> u32 {
        u32::MAX >> (32 - Self::width())
    }
}

impl RiceSample for i8 {
    const BYTES: usize = 1;
    const KMAX: u32 = 5;
    const KBITS: u32 = 3;

    fn to_bits(self) -> u32 {
        self as u8 as u32
    }

    fn from_bits(bits: u32) -> Self {
        bits as u8 as i8
    }
}

impl RiceSample for i16 {
    const BYTES: usize = 2;
    const KMAX: u32 = 13;
    const KBITS: u32 = 4;

    fn to_bits(self) -> u32 {
        self as u16 as u32
    }

    fn from_bits(bits: u32) -> Self {
        bits as u16 as i16
    }
}

impl RiceSample for i32 {
    const BYTES: usize = 4;
    const KMAX: u32 = 25;
    const KBITS: u32 = 5;

    fn to_bits(self) -> u32 {
        self as u32
    }

    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

#[inline]
fn low_mask(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// MSB-first bit packer with a hard output limit
struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    nbits: u32,
    limit: usize,
}

impl BitWriter {
    fn new(limit: usize) -> Self {
        BitWriter {
            out: Vec::new(),
            acc: 0,
            nbits: 0,
            limit,
        }
    }

    fn push_byte(&mut self, byte: u8) -> Result<(), RiceError> {
        if self.out.len() >= self.limit {
            return Err(RiceError::EncodeOverrun);
        }
        if self.out.len() == self.out.capacity() {
            self.out
                .try_reserve(self.out.len().max(64))
                .map_err(|_| RiceError::OutOfMemory)?;
        }
        self.out.push(byte);
        Ok(())
    }

    /// Append the low `n` bits of `val` (n <= 32).
    fn put(&mut self, n: u32, val: u32) -> Result<(), RiceError> {
        if n == 0 {
            return Ok(());
        }
        self.acc = (self.acc << n) | (u64::from(val) & low_mask(n));
        self.nbits += n;
        while self.nbits >= 8 {
            self.nbits -= 8;
            let byte = (self.acc >> self.nbits) as u8;
            self.push_byte(byte)?;
        }
        self.acc &= low_mask(self.nbits);
        Ok(())
    }

    /// Append `n` zero bits followed by a single one bit.
    fn put_fs(&mut self, mut n: u64) -> Result<(), RiceError> {
        while n >= 32 {
            self.put(32, 0)?;
            n -= 32;
        }
        self.put(n as u32, 0)?;
        self.put(1, 1)
    }

    fn finish(mut self) -> Result<Vec<u8>, RiceError> {
        if self.nbits > 0 {
            let byte = (self.acc << (8 - self.nbits)) as u8;
            self.push_byte(byte)?;
        }
        Ok(self.out)
    }
}

/// MSB-first bit reader that fetches input bytes only when bits are needed
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u64,
    nbits: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        BitReader {
            data,
            pos,
            acc: 0,
            nbits: 0,
        }
    }

    fn fetch(&mut self) -> Result<(), RiceError> {
        let byte = *self.data.get(self.pos).ok_or(RiceError::TruncatedInput)?;
        self.pos += 1;
        self.acc = (self.acc << 8) | u64::from(byte);
        self.nbits += 8;
        Ok(())
    }

    /// Read `n` bits (n <= 32).
    fn read(&mut self, n: u32) -> Result<u32, RiceError> {
        while self.nbits < n {
            self.fetch()?;
        }
        self.nbits -= n;
        let val = (self.acc >> self.nbits) & low_mask(n);
        self.acc &= low_mask(self.nbits);
        Ok(val as u32)
    }

    /// Count zero bits up to and including the next one bit.
    fn read_fs(&mut self) -> Result<u64, RiceError> {
        let mut fs = 0u64;
        loop {
            if self.nbits == 0 {
                self.fetch()?;
            }
            if self.acc == 0 {
                fs += u64::from(self.nbits);
                self.nbits = 0;
                continue;
            }
            let significant = 64 - self.acc.leading_zeros();
            fs += u64::from(self.nbits - significant);
            self.nbits = significant - 1;
            self.acc &= low_mask(self.nbits);
            return Ok(fs);
        }
    }

    fn consumed(&self) -> usize {
        self.pos
    }
}

/// Fold a signed difference into an unsigned code.
#[inline]
fn fold<T: RiceSample>(curr: u32, last: u32) -> u32 {
    let mask = T::mask();
    let width = T::width();
    let delta = curr.wrapping_sub(last) & mask;
    let negative = (delta >> (width - 1)) & 1 == 1;
    let doubled = (delta << 1) & mask;
    if negative {
        !doubled & mask
    } else {
        doubled
    }
}

/// Undo [`fold`].
#[inline]
fn unfold<T: RiceSample>(diff: u32) -> u32 {
    let mask = T::mask();
    if diff & 1 == 1 {
        !(diff >> 1) & mask
    } else {
        diff >> 1
    }
}

/// Encode `input` into at most `max_out` bytes.
pub fn encode<T: RiceSample>(
    input: &[T],
    blksz: usize,
    max_out: usize,
) -> Result<Vec<u8>, RiceError> {
    if blksz == 0 {
        return Err(RiceError::InvalidBlockSize);
    }
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut w = BitWriter::new(max_out);
    let mut diffs: Vec<u32> = Vec::new();
    diffs
        .try_reserve(blksz.min(input.len()))
        .map_err(|_| RiceError::OutOfMemory)?;

    // First sample raw, most significant byte first
    let mut last = input[0].to_bits();
    for shift in (0..T::BYTES).rev() {
        w.put(8, (last >> (shift * 8)) & 0xff)?;
    }

    for block in input.chunks(blksz) {
        diffs.clear();
        let mut pixsum = 0.0f64;
        for sample in block {
            let curr = sample.to_bits();
            let d = fold::<T>(curr, last);
            last = curr;
            pixsum += f64::from(d);
            diffs.push(d);
        }

        if pixsum == 0.0 {
            w.put(T::KBITS, 0)?;
            continue;
        }

        let mean = (0.5 * pixsum / block.len() as f64) as u64;
        let k = 64 - mean.leading_zeros();

        if k == 0 {
            w.put(T::KBITS, 1)?;
            for &d in &diffs {
                w.put_fs(u64::from(d))?;
            }
        } else if k <= T::KMAX {
            w.put(T::KBITS, k + 1)?;
            let kmask = (1u32 << k) - 1;
            for &d in &diffs {
                w.put_fs(u64::from(d >> k))?;
                w.put(k, d & kmask)?;
            }
        } else {
            w.put(T::KBITS, T::KMAX + 2)?;
            for &d in &diffs {
                w.put(T::width(), d)?;
            }
        }
    }

    w.finish()
}

/// Decode exactly `nout` samples from `input`.
pub fn decode<T: RiceSample>(input: &[u8], nout: usize, blksz: usize) -> Result<Vec<T>, RiceError> {
    let mut out = vec![T::default(); nout];
    decode_into(input, &mut out, nout, blksz)?;
    Ok(out)
}

/// Decode `nout` samples from `input` into the front of `out`.
pub fn decode_into<T: RiceSample>(
    input: &[u8],
    out: &mut [T],
    nout: usize,
    blksz: usize,
) -> Result<(), RiceError> {
    if blksz == 0 {
        return Err(RiceError::InvalidBlockSize);
    }
    if nout > out.len() {
        return Err(RiceError::DecodeOverrun);
    }
    if nout == 0 {
        return if input.is_empty() {
            Ok(())
        } else {
            Err(RiceError::TrailingGarbage)
        };
    }
    if input.len() < T::BYTES {
        return Err(RiceError::TruncatedInput);
    }

    let mask = T::mask();
    let mut lastpix = input[..T::BYTES]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let mut r = BitReader::new(input, T::BYTES);

    let mut i = 0;
    while i < nout {
        let k = r.read(T::KBITS)? as i32 - 1;
        let imax = (i + blksz).min(nout);

        if k < 0 {
            let value = T::from_bits(lastpix);
            out[i..imax].iter_mut().for_each(|o| *o = value);
            i = imax;
        } else if k as u32 <= T::KMAX {
            let k = k as u32;
            while i < imax {
                let fs = r.read_fs()?;
                let low = r.read(k)?;
                let diff = ((fs << k) | u64::from(low)) as u32 & mask;
                lastpix = lastpix.wrapping_add(unfold::<T>(diff)) & mask;
                out[i] = T::from_bits(lastpix);
                i += 1;
            }
        } else if k as u32 == T::KMAX + 1 {
            while i < imax {
                let diff = r.read(T::width())?;
                lastpix = lastpix.wrapping_add(unfold::<T>(diff)) & mask;
                out[i] = T::from_bits(lastpix);
                i += 1;
            }
        } else {
            return Err(RiceError::InvalidCode(k));
        }
    }

    if r.consumed() == input.len() {
        Ok(())
    } else {
        Err(RiceError::TrailingGarbage)
    }
}
