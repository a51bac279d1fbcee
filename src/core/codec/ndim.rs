//! N-dimensional hyper-slab copies
//!
//! Arrays are stored with the first axis varying fastest. `pack` gathers the
//! inclusive region `start..=end` of an array into a dense buffer, `unpack`
//! scatters a dense buffer back into the region, and `permute` transposes axes.
//!
//! Leading axes that are covered completely form one contiguous run of `n1`
//! bytes; the remaining axes are walked with an odometer that copies one run
//! per step.

use crate::error::{Result, SumsError};

/// Byte stride of every axis for elements of `sz` bytes.
pub fn dope(sz: usize, dims: &[usize]) -> Vec<usize> {
    let mut dope = Vec::with_capacity(dims.len());
    let mut stride = sz;
    for &d in dims {
        dope.push(stride);
        stride *= d;
    }
    dope
}

/// Number of elements in the inclusive region `start..=end`.
pub fn region_count(start: &[usize], end: &[usize]) -> usize {
    start
        .iter()
        .zip(end)
        .map(|(&s, &e)| e.saturating_sub(s) + 1)
        .product()
}

fn check_region(dims: &[usize], start: &[usize], end: &[usize]) -> Result<()> {
    if dims.is_empty() {
        return Err(SumsError::InvalidRequest("zero-dimensional array".into()));
    }
    if start.len() != dims.len() {
        return Err(SumsError::DimensionMismatch {
            expected: dims.len(),
            found: start.len(),
        });
    }
    if end.len() != dims.len() {
        return Err(SumsError::DimensionMismatch {
            expected: dims.len(),
            found: end.len(),
        });
    }
    for (axis, ((&s, &e), &len)) in start.iter().zip(end).zip(dims).enumerate() {
        if s > e {
            return Err(SumsError::EmptySlice {
                axis,
                start: s,
                end: e,
            });
        }
        if e >= len {
            return Err(SumsError::SliceOutOfBounds {
                axis,
                start: s,
                end: e,
                len,
            });
        }
    }
    Ok(())
}

fn check_len(what: &str, have: usize, need: usize) -> Result<()> {
    if have < need {
        return Err(SumsError::InvalidRequest(format!(
            "{} holds {} bytes, need {}",
            what, have, need
        )));
    }
    Ok(())
}

/// Walk the region, calling `copy(array_offset, buffer_offset, len)` for
/// every contiguous run.
fn for_each_run<F>(sz: usize, dims: &[usize], start: &[usize], end: &[usize], mut copy: F)
where
    F: FnMut(usize, usize, usize),
{
    let ndim = dims.len();

    if ndim == 1 {
        copy(sz * start[0], 0, sz * (end[0] - start[0] + 1));
        return;
    }

    // First partial axis and the byte length of one contiguous run
    let mut firstdim = 0;
    let mut n1 = sz;
    for i in 0..ndim - 1 {
        if firstdim == i && start[i] == 0 && end[i] == dims[i] - 1 {
            firstdim = i + 1;
            n1 *= dims[i];
        }
    }
    let total = sz * region_count(start, end);
    let dope = dope(sz, dims);

    let base: usize = (0..ndim).map(|i| dope[i] * start[i]).sum();

    let onechunk = firstdim == ndim - 1 || (firstdim..ndim).all(|i| start[i] == end[i]);
    if onechunk {
        copy(base, 0, total);
        return;
    }

    let mut id = start.to_vec();
    let mut offset = base;
    let mut done = 0;
    while done < total {
        copy(offset, done, n1);
        done += n1;

        id[firstdim] += 1;
        if id[firstdim] > end[firstdim] {
            for i in firstdim..ndim - 1 {
                if id[i] > end[i] {
                    id[i] = start[i];
                    id[i + 1] += 1;
                }
            }
            offset = (0..ndim).map(|i| dope[i] * id[i]).sum();
        } else {
            offset += dope[firstdim];
        }
    }
}

/// Copy the region `start..=end` of `array` into the dense buffer `out`.
pub fn pack(
    sz: usize,
    dims: &[usize],
    start: &[usize],
    end: &[usize],
    array: &[u8],
    out: &mut [u8],
) -> Result<()> {
    check_region(dims, start, end)?;
    check_len("array", array.len(), sz * dims.iter().product::<usize>())?;
    check_len("buffer", out.len(), sz * region_count(start, end))?;

    for_each_run(sz, dims, start, end, |a, b, len| {
        out[b..b + len].copy_from_slice(&array[a..a + len]);
    });
    Ok(())
}

/// Copy the dense buffer `input` into the region `start..=end` of `array`.
pub fn unpack(
    sz: usize,
    dims: &[usize],
    start: &[usize],
    end: &[usize],
    input: &[u8],
    array: &mut [u8],
) -> Result<()> {
    check_region(dims, start, end)?;
    check_len("array", array.len(), sz * dims.iter().product::<usize>())?;
    check_len("buffer", input.len(), sz * region_count(start, end))?;

    for_each_run(sz, dims, start, end, |a, b, len| {
        array[a..a + len].copy_from_slice(&input[b..b + len]);
    });
    Ok(())
}

/// Transpose `input` so that output axis `i` is input axis `perm[i]`.
///
/// Returns the permuted dimensions.
pub fn permute(
    sz: usize,
    dims: &[usize],
    perm: &[usize],
    input: &[u8],
    out: &mut [u8],
) -> Result<Vec<usize>> {
    let ndim = dims.len();
    if ndim == 0 {
        return Err(SumsError::InvalidRequest("zero-dimensional array".into()));
    }
    if perm.len() != ndim {
        return Err(SumsError::DimensionMismatch {
            expected: ndim,
            found: perm.len(),
        });
    }

    let mut seen = vec![0usize; ndim];
    for &p in perm {
        if p >= ndim {
            return Err(SumsError::InvalidPermutation);
        }
        seen[p] += 1;
    }
    if seen.iter().any(|&n| n != 1) {
        return Err(SumsError::InvalidPermutation);
    }

    let count: usize = dims.iter().product();
    let bytes = sz * count;
    check_len("array", input.len(), bytes)?;
    check_len("buffer", out.len(), bytes)?;

    let permdims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();

    if ndim == 1 || perm.iter().enumerate().all(|(i, &p)| i == p) {
        out[..bytes].copy_from_slice(&input[..bytes]);
        return Ok(permdims);
    }

    // Output strides indexed by input axis
    let out_dope = dope(sz, &permdims);
    let mut dope2 = vec![0usize; ndim];
    for (i, &p) in perm.iter().enumerate() {
        dope2[p] = out_dope[i];
    }

    let mut id = vec![0usize; ndim];
    let mut src = 0;
    let mut dst = 0;
    for _ in 0..count {
        out[dst..dst + sz].copy_from_slice(&input[src..src + sz]);

        id[0] += 1;
        src += sz;
        dst += dope2[0];
        if id[0] >= dims[0] {
            let mut i = 0;
            while i < ndim - 1 && id[i] >= dims[i] {
                id[i] = 0;
                id[i + 1] += 1;
                i += 1;
            }
            dst = id.iter().zip(&dope2).map(|(&x, &d)| x * d).sum();
        }
    }

    Ok(permdims)
}
