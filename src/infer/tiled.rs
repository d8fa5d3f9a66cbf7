//! Tiled VAE decode.
//!
//! Latents whose decoded output exceeds the GPU budget are split into
//! overlapping spatial tiles; each tile decodes independently on the GPU
//! and accumulates into CPU buffers under a separable linear blend mask so
//! that neighboring tiles agree on shared borders.
//!
//! Temporal latents are not tiled: the temporal VAE needs the full clip
//! context, so multi-frame inputs fall back to the standard decode path.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;
use crate::memory::MemoryGovernor;
use crate::models::VaeModel;

/// Which edges of a tile lie on the outer boundary of the latent.
#[derive(Debug, Clone, Copy)]
pub struct TileBoundary {
    pub top: bool,
    pub bottom: bool,
    pub left: bool,
    pub right: bool,
}

fn linspace(start: f32, end: f32, n: usize) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f32 / (n - 1) as f32)
        .collect()
}

/// Separable blend mask `(1, 1, h, w)` for one decoded tile.
///
/// Each 1D factor is flat 1 except at edges that are not on the outer
/// boundary, where it ramps linearly over `border` samples: 0→1 on the
/// leading edge, 1→0 on the trailing edge.
pub fn tile_blend_mask(
    h: usize,
    w: usize,
    boundary: TileBoundary,
    border: (usize, usize),
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let (border_h, border_w) = border;

    let mut h_mask = vec![1.0f32; h];
    if !boundary.top && border_h > 0 {
        let ramp = linspace(0.0, 1.0, border_h.min(h));
        h_mask[..ramp.len()].copy_from_slice(&ramp);
    }
    if !boundary.bottom && border_h > 0 {
        let ramp = linspace(1.0, 0.0, border_h.min(h));
        let start = h - ramp.len();
        h_mask[start..].copy_from_slice(&ramp);
    }

    let mut w_mask = vec![1.0f32; w];
    if !boundary.left && border_w > 0 {
        let ramp = linspace(0.0, 1.0, border_w.min(w));
        w_mask[..ramp.len()].copy_from_slice(&ramp);
    }
    if !boundary.right && border_w > 0 {
        let ramp = linspace(1.0, 0.0, border_w.min(w));
        let start = w - ramp.len();
        w_mask[start..].copy_from_slice(&ramp);
    }

    let h_col = Tensor::from_vec(h_mask, (h, 1), device)?;
    let w_row = Tensor::from_vec(w_mask, (1, w), device)?;
    let mask = h_col.broadcast_mul(&w_row)?;
    Ok(mask.reshape((1, 1, h, w))?.to_dtype(dtype)?)
}

/// Decode a prepared single-frame latent `(b, c, h, w)` tile by tile.
///
/// The latent must already be on the compute device in the decode dtype
/// with scale/shift undone. Returns the blended output `(b, 3, U·h, U·w)`
/// on the compute device.
pub fn decode_tiled(
    vae: &mut dyn VaeModel,
    governor: &mut MemoryGovernor,
    device: &Device,
    latent: &Tensor,
    tile_size: (usize, usize),
    tile_stride: (usize, usize),
) -> Result<Tensor> {
    let (b, _c, h, w) = latent.dims4()?;
    let u = vae.spatial_upsample_factor();
    let dtype = latent.dtype();
    let (tile_h, tile_w) = tile_size;
    let (stride_h, stride_w) = tile_stride;

    let out_h = h * u;
    let out_w = w * u;
    let cpu = Device::Cpu;
    let mut output = Tensor::zeros((b, 3, out_h, out_w), dtype, &cpu)?;
    let mut weight = Tensor::zeros((b, 1, out_h, out_w), dtype, &cpu)?;

    let border = ((tile_h.saturating_sub(stride_h)) * u, (tile_w.saturating_sub(stride_w)) * u);

    let mut tiles_processed = 0usize;
    let mut y = 0;
    while y < h {
        // Skip rows fully covered by the previous tile.
        if y > 0 && y + tile_h > h && y + tile_h.saturating_sub(stride_h) >= h {
            y += stride_h;
            continue;
        }
        let mut x = 0;
        while x < w {
            if x > 0 && x + tile_w > w && x + tile_w.saturating_sub(stride_w) >= w {
                x += stride_w;
                continue;
            }
            let y_end = (y + tile_h).min(h);
            let x_end = (x + tile_w).min(w);

            let tile_latent = latent
                .narrow(2, y, y_end - y)?
                .narrow(3, x, x_end - x)?
                .contiguous()?;
            let tile = vae.decode(&tile_latent)?;
            let (_, _, tile_out_h, tile_out_w) = tile.dims4()?;

            let mask = tile_blend_mask(
                tile_out_h,
                tile_out_w,
                TileBoundary {
                    top: y == 0,
                    bottom: y_end >= h,
                    left: x == 0,
                    right: x_end >= w,
                },
                border,
                dtype,
                &cpu,
            )?;

            let out_y = y * u;
            let out_x = x * u;
            let tile_cpu = tile.to_device(&cpu)?.to_dtype(dtype)?;
            let masked = tile_cpu.broadcast_mul(&mask)?;

            let ranges = [0..b, 0..3usize, out_y..out_y + tile_out_h, out_x..out_x + tile_out_w];
            let current = output
                .narrow(2, out_y, tile_out_h)?
                .narrow(3, out_x, tile_out_w)?;
            output = output.slice_assign(&ranges, &(current + masked)?)?;

            let w_ranges = [0..b, 0..1usize, out_y..out_y + tile_out_h, out_x..out_x + tile_out_w];
            let current_w = weight
                .narrow(2, out_y, tile_out_h)?
                .narrow(3, out_x, tile_out_w)?;
            let mask_b = mask.broadcast_as((b, 1, tile_out_h, tile_out_w))?;
            weight = weight.slice_assign(&w_ranges, &(current_w + mask_b)?)?;

            tiles_processed += 1;
            if tiles_processed % 4 == 0 {
                governor.empty_cache();
            }
            x += stride_w;
        }
        y += stride_h;
    }

    tracing::info!("Tiled decode: {} tiles processed", tiles_processed);

    let blended = output.broadcast_div(&weight.clamp(1e-8, f64::INFINITY)?)?;
    Ok(blended.to_device(device)?)
}

/// Number of tiles the origin enumeration will emit for a latent extent.
pub fn tile_count_1d(extent: usize, tile: usize, stride: usize) -> usize {
    if stride == 0 {
        return 1;
    }
    let mut count = 0;
    let mut origin = 0;
    while origin < extent {
        if !(origin > 0 && origin + tile > extent && origin + tile.saturating_sub(stride) >= extent)
        {
            count += 1;
        }
        origin += stride;
    }
    count
}
