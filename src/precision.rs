//! Precision planning for mixed-dtype checkpoints.
//!
//! The DiT ships in FP8, FP16 or BF16 depending on the checkpoint; each
//! variant needs a compatible compute dtype for intermediate tensors and a
//! decode dtype for the VAE output path. FP8 weights compute in BF16
//! (widest compatibility) but decode in FP16, which is what the frame
//! consumers expect.

use candle_core::DType;

/// Dtype assignments derived from the loaded DiT weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPlan {
    /// Dtype for text embeddings, noise and conditioning latents.
    pub compute: DType,
    /// Dtype the DiT forward runs under.
    pub autocast: DType,
    /// Dtype the VAE parameters run under.
    pub vae: DType,
    /// Explicit target dtype for the VAE decode path.
    pub decode: DType,
}

impl PrecisionPlan {
    /// Derive the plan from the dtype of the loaded DiT weights.
    ///
    /// FP8 e5m2 checkpoints are converted to e4m3 by the loader, so
    /// `F8E4M3` is the only FP8 dtype seen here.
    pub fn from_weights(weights: DType) -> Self {
        match weights {
            DType::F8E4M3 => Self {
                compute: DType::BF16,
                autocast: DType::BF16,
                vae: DType::BF16,
                decode: DType::F16,
            },
            DType::F16 => Self {
                compute: DType::F16,
                autocast: DType::F16,
                vae: DType::F16,
                decode: DType::F16,
            },
            _ => Self {
                compute: DType::BF16,
                autocast: DType::BF16,
                vae: DType::BF16,
                decode: DType::BF16,
            },
        }
    }
}
