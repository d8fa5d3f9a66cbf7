//! Wavelet color reconstruction.
//!
//! The diffusion output tends to drift in color relative to its input.
//! Both tensors are decomposed into frequency bands with an iterated
//! dilated Gaussian blur; the generated high band is recombined with the
//! input's low band, pinning global color while keeping generated detail.

use candle_core::{DType, Tensor};

use crate::error::Result;

const LEVELS: usize = 5;

/// 3×3 Gaussian kernel, one group per channel.
fn blur_kernel(channels: usize, reference: &Tensor) -> Result<Tensor> {
    #[rustfmt::skip]
    let weights = [
        0.0625f32, 0.125, 0.0625,
        0.125,     0.25,  0.125,
        0.0625,    0.125, 0.0625,
    ];
    let kernel = Tensor::from_vec(weights.to_vec(), (1, 1, 3, 3), reference.device())?;
    Ok(kernel.repeat((channels, 1, 1, 1))?)
}

/// Dilated depthwise Gaussian blur preserving spatial size.
fn wavelet_blur(x: &Tensor, kernel: &Tensor, radius: usize) -> Result<Tensor> {
    let channels = x.dim(1)?;
    Ok(x.conv2d(kernel, radius, 1, radius, channels)?)
}

/// Iterated blur decomposition: returns `(high_band, low_band)`.
fn wavelet_decomposition(x: &Tensor, kernel: &Tensor) -> Result<(Tensor, Tensor)> {
    let mut low = x.clone();
    let mut high = x.zeros_like()?;
    for level in 0..LEVELS {
        let radius = 1 << level;
        let blurred = wavelet_blur(&low, kernel, radius)?;
        high = (high + (low - &blurred)?)?;
        low = blurred;
    }
    Ok((high, low))
}

/// Transfer the low-frequency band of `style` onto the high-frequency
/// band of `content`. Both are `(t, c, h, w)`; the result keeps the
/// content dtype. Internally computed in F32.
pub fn wavelet_reconstruction(content: &Tensor, style: &Tensor) -> Result<Tensor> {
    let out_dtype = content.dtype();
    let content_f = content.to_dtype(DType::F32)?;
    let style_f = style.to_dtype(DType::F32)?;
    let kernel = blur_kernel(content_f.dim(1)?, &content_f)?;

    let (content_high, _) = wavelet_decomposition(&content_f, &kernel)?;
    let (_, style_low) = wavelet_decomposition(&style_f, &kernel)?;
    Ok((content_high + style_low)?.to_dtype(out_dtype)?)
}
