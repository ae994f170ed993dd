//! Unfold (`im2col`) and fold (`col2im`) kernels.
//!
//! `im2col` gathers the kernel-sized neighborhoods of a channel-first tensor
//! into a patch matrix so convolution reduces to a dense GEMM. `col2im` is
//! its adjoint: overlapping patch contributions are scatter-added back into
//! the tensor, which is what transposed convolution needs.
//!
//! The patch matrix has one row per (channel, kernel offset) pair and one
//! column per output position. Rows are channel-major, kernel offsets and
//! output positions are row-major over their spatial dims. A rank-2 fast
//! path covers the common image case; other spatial ranks go through the
//! generic index arithmetic.

use ndarray::{Array2, ArrayView2, Axis};
use num_traits::Zero;
use rayon::prelude::*;

use crate::error::{GroveError, Result};

/// Spatial output dims for the given unfold geometry (unit dilation). An
/// axis whose window exceeds the padded extent has no valid positions and
/// yields 0.
pub fn output_spatial_dims(
    im_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> Vec<usize> {
    im_dims
        .iter()
        .zip(pads)
        .zip(window_dims)
        .zip(strides)
        .map(|(((&d, &p), &w), &s)| match (d + 2 * p).checked_sub(w) {
            Some(span) => span / s + 1,
            None => 0,
        })
        .collect()
}

/// Shape `(rows, cols)` of the patch matrix produced by [`im2col`].
/// A geometry with no channels or an empty axis has an empty patch matrix.
pub fn col_matrix_dims(
    num_channels: usize,
    im_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> (usize, usize) {
    if num_channels == 0
        || im_dims.iter().any(|&d| d == 0)
        || window_dims.iter().any(|&w| w == 0)
    {
        return (0, 0);
    }
    let window_size: usize = window_dims.iter().product();
    let num_positions: usize = output_spatial_dims(im_dims, pads, window_dims, strides)
        .iter()
        .product();
    (num_channels * window_size, num_positions)
}

fn check_geometry(
    operation: &str,
    im_len: usize,
    num_channels: usize,
    im_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
    col_shape: (usize, usize),
) -> Result<()> {
    let rank = im_dims.len();
    if pads.len() != rank || window_dims.len() != rank || strides.len() != rank {
        return Err(GroveError::invalid_argument(
            operation,
            format!(
                "geometry rank mismatch (dims {}, pads {}, window {}, strides {})",
                rank,
                pads.len(),
                window_dims.len(),
                strides.len()
            ),
        ));
    }
    let im_size: usize = num_channels * im_dims.iter().product::<usize>();
    if im_len != im_size {
        return Err(GroveError::shape_mismatch(
            operation,
            format!("{im_size} tensor entries"),
            format!("{im_len}"),
        ));
    }
    let expected = col_matrix_dims(num_channels, im_dims, pads, window_dims, strides);
    if col_shape != expected {
        return Err(GroveError::shape_mismatch(
            operation,
            format!("{}x{} patch matrix", expected.0, expected.1),
            format!("{}x{}", col_shape.0, col_shape.1),
        ));
    }
    Ok(())
}

/// Unfolds one channel-first sample into a patch matrix.
///
/// `im` holds `num_channels * prod(im_dims)` entries. Positions that fall in
/// the zero padding produce zero entries.
pub fn im2col<T>(
    im: &[T],
    col: &mut Array2<T>,
    num_channels: usize,
    im_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> Result<()>
where
    T: Copy + Zero + Send + Sync,
{
    check_geometry("im2col", im.len(), num_channels, im_dims, pads, window_dims, strides, col.dim())?;
    if im2col_2d(im, col, num_channels, im_dims, pads, window_dims, strides) {
        return Ok(());
    }

    let out_dims = output_spatial_dims(im_dims, pads, window_dims, strides);
    let window_size: usize = window_dims.iter().product();
    let im_spatial: usize = im_dims.iter().product();

    // Each row of the patch matrix is owned by one (channel, offset) pair,
    // so rows can be filled independently.
    col.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut col_row)| {
            let channel = row / window_size;
            let offsets = decompose(row % window_size, window_dims);
            let channel_base = channel * im_spatial;
            for (pos, entry) in col_row.iter_mut().enumerate() {
                let out_coords = decompose(pos, &out_dims);
                let mut im_index = 0usize;
                let mut valid = true;
                for d in 0..im_dims.len() {
                    let coord = (out_coords[d] * strides[d] + offsets[d]) as isize - pads[d] as isize;
                    if coord < 0 || coord >= im_dims[d] as isize {
                        valid = false;
                        break;
                    }
                    im_index = im_index * im_dims[d] + coord as usize;
                }
                *entry = if valid { im[channel_base + im_index] } else { T::zero() };
            }
        });
    Ok(())
}

/// Folds a patch matrix back into a channel-first sample, summing
/// overlapping contributions. The destination is overwritten.
pub fn col2im<T>(
    col: ArrayView2<'_, T>,
    im: &mut [T],
    num_channels: usize,
    im_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> Result<()>
where
    T: Copy + Zero + std::ops::AddAssign + Send + Sync,
{
    check_geometry("col2im", im.len(), num_channels, im_dims, pads, window_dims, strides, col.dim())?;

    let out_dims = output_spatial_dims(im_dims, pads, window_dims, strides);
    let window_size: usize = window_dims.iter().product();
    let im_spatial: usize = im_dims.iter().product();
    let num_positions: usize = out_dims.iter().product();

    // Rows of one channel only touch that channel's block, so the scatter
    // parallelizes over channels without contention.
    im.par_chunks_mut(im_spatial.max(1))
        .take(num_channels)
        .enumerate()
        .for_each(|(channel, im_channel)| {
            for v in im_channel.iter_mut() {
                *v = T::zero();
            }
            for offset in 0..window_size {
                let offsets = decompose(offset, window_dims);
                let row = channel * window_size + offset;
                for pos in 0..num_positions {
                    let out_coords = decompose(pos, &out_dims);
                    let mut im_index = 0usize;
                    let mut valid = true;
                    for d in 0..im_dims.len() {
                        let coord =
                            (out_coords[d] * strides[d] + offsets[d]) as isize - pads[d] as isize;
                        if coord < 0 || coord >= im_dims[d] as isize {
                            valid = false;
                            break;
                        }
                        im_index = im_index * im_dims[d] + coord as usize;
                    }
                    if valid {
                        im_channel[im_index] += col[[row, pos]];
                    }
                }
            }
        });
    Ok(())
}

/// Rank-2 fast path. Returns false if the geometry is not rank 2.
fn im2col_2d<T>(
    im: &[T],
    col: &mut Array2<T>,
    _num_channels: usize,
    im_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> bool
where
    T: Copy + Zero + Send + Sync,
{
    if im_dims.len() != 2 {
        return false;
    }
    let (im_h, im_w) = (im_dims[0], im_dims[1]);
    let (win_h, win_w) = (window_dims[0], window_dims[1]);
    let (pad_h, pad_w) = (pads[0], pads[1]);
    let (stride_h, stride_w) = (strides[0], strides[1]);
    let spatial = output_spatial_dims(im_dims, pads, window_dims, strides);
    let (out_h, out_w) = (spatial[0], spatial[1]);
    let window_size = win_h * win_w;

    col.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut col_row)| {
            let channel = row / window_size;
            let ky = (row % window_size) / win_w;
            let kx = row % win_w;
            let channel_base = channel * im_h * im_w;
            let mut pos = 0;
            for oy in 0..out_h {
                let iy = (oy * stride_h + ky) as isize - pad_h as isize;
                for ox in 0..out_w {
                    let ix = (ox * stride_w + kx) as isize - pad_w as isize;
                    col_row[pos] = if iy >= 0 && iy < im_h as isize && ix >= 0 && ix < im_w as isize
                    {
                        im[channel_base + iy as usize * im_w + ix as usize]
                    } else {
                        T::zero()
                    };
                    pos += 1;
                }
            }
        });
    true
}

fn decompose(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        coords[d] = index % dims[d];
        index /= dims[d];
    }
    coords
}
