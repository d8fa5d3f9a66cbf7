//! Video transform pipeline.
//!
//! Each batch is resized so its longer side matches the target width
//! (upscale only), clamped, center-cropped to 16-divisible dimensions,
//! normalized to `[-1, 1]` and permuted to `(c, t, h, w)`. The temporal
//! VAE additionally requires clip lengths of the form 4n+1, enforced by
//! replicating the last frame.

use candle_core::{Device, Tensor};

use crate::error::{Result, VsrError};

/// Bilinear resize along one spatial axis via gather-and-lerp.
fn resize_dim(x: &Tensor, dim: usize, in_len: usize, out_len: usize) -> Result<Tensor> {
    if in_len == out_len {
        return Ok(x.clone());
    }
    let mut lo = Vec::with_capacity(out_len);
    let mut hi = Vec::with_capacity(out_len);
    let mut frac = Vec::with_capacity(out_len);
    let scale = in_len as f32 / out_len as f32;
    for i in 0..out_len {
        let src = ((i as f32 + 0.5) * scale - 0.5).clamp(0.0, (in_len - 1) as f32);
        let base = src.floor();
        lo.push(base as u32);
        hi.push(((base as usize) + 1).min(in_len - 1) as u32);
        frac.push(src - base);
    }
    let device = x.device();
    let lo_idx = Tensor::from_vec(lo, out_len, device)?;
    let hi_idx = Tensor::from_vec(hi, out_len, device)?;
    let low = x.index_select(&lo_idx, dim)?;
    let high = x.index_select(&hi_idx, dim)?;

    let mut weight_shape = vec![1usize; x.rank()];
    weight_shape[dim] = out_len;
    let w = Tensor::from_vec(frac, weight_shape, device)?.to_dtype(x.dtype())?;
    let one_minus = w.affine(-1.0, 1.0)?;
    Ok((low.broadcast_mul(&one_minus)? + high.broadcast_mul(&w)?)?)
}

/// Bilinear resize of `(t, c, h, w)` video to an exact spatial size.
pub fn bilinear_resize(video: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_t, _c, h, w) = video.dims4()?;
    let resized = resize_dim(video, 2, h, out_h)?;
    resize_dim(&resized, 3, w, out_w)
}

/// Resize so the longer spatial side equals `target`. Upscale only: inputs
/// already at or above the target pass through unchanged.
pub fn resize_longer_side(video: &Tensor, target: usize) -> Result<Tensor> {
    let (_t, _c, h, w) = video.dims4()?;
    let longer = h.max(w);
    if longer == 0 {
        return Err(VsrError::Shape("empty spatial dimensions".into()));
    }
    let factor = target as f64 / longer as f64;
    if factor <= 1.0 {
        return Ok(video.clone());
    }
    let out_h = (h as f64 * factor).round() as usize;
    let out_w = (w as f64 * factor).round() as usize;
    bilinear_resize(video, out_h, out_w)
}

/// Center-crop the spatial dimensions to multiples of `factor`.
pub fn divisible_crop(video: &Tensor, factor: usize) -> Result<Tensor> {
    let (_t, _c, h, w) = video.dims4()?;
    let h2 = h - h % factor;
    let w2 = w - w % factor;
    if h2 == 0 || w2 == 0 {
        return Err(VsrError::Shape(format!(
            "spatial dimensions {h}x{w} too small for {factor}-divisible crop"
        )));
    }
    if h2 == h && w2 == w {
        return Ok(video.clone());
    }
    let top = (h - h2) / 2;
    let left = (w - w2) / 2;
    Ok(video.narrow(2, top, h2)?.narrow(3, left, w2)?)
}

/// Full transform: resize → clamp → crop → normalize → `(c, t, h, w)`.
pub fn apply_video_transform(video: &Tensor, target_width: usize) -> Result<Tensor> {
    let video = video.contiguous()?;
    let video = resize_longer_side(&video, target_width)?;
    let video = video.clamp(0.0, 1.0)?;
    let video = divisible_crop(&video, 16)?;
    // mean 0.5, std 0.5: [0,1] -> [-1,1]
    let video = video.affine(2.0, -1.0)?;
    Ok(video.permute((1, 0, 2, 3))?.contiguous()?)
}

/// Pad a `(c, t, h, w)` clip to the next 4n+1 length by replicating the
/// last frame. Clips already satisfying the invariant pass through.
pub fn pad_to_temporal_stride(video: &Tensor) -> Result<Tensor> {
    let t = video.dim(1)?;
    if t % 4 == 1 {
        return Ok(video.clone());
    }
    let padding = (4 - t % 4) % 4 + 1;
    let last = video.narrow(1, t - 1, 1)?;
    let repeated = last.repeat((1, padding, 1, 1))?;
    Ok(Tensor::cat(&[video, &repeated], 1)?)
}

/// `(c, t, h, w)` → `(t, c, h, w)`.
pub fn to_frame_major(video: &Tensor) -> Result<Tensor> {
    Ok(video.permute((1, 0, 2, 3))?.contiguous()?)
}

/// `(t, c, h, w)` → image format `(t, h, w, c)`.
pub fn to_image_format(video: &Tensor) -> Result<Tensor> {
    Ok(video.permute((0, 2, 3, 1))?.contiguous()?)
}
