//! Model interfaces.
//!
//! The concrete DiT and VAE live outside this crate; the core drives them
//! through these traits. The DiT forward is block-structured so the engine
//! can page individual transformer blocks between devices during sampling.

pub mod blockswap;
pub mod lifecycle;

use candle_core::{DType, Device, Tensor};

use crate::config::{VaeConfig, VaeMemoryLimitConfig, VaeSlicingConfig};
use crate::error::Result;
use crate::memory::cache::RopeKey;
use crate::packing::ShapeTable;

/// Inputs for one DiT forward pass over the packed representation.
pub struct DitInputs<'a> {
    /// Packed video tokens `(Σ t·h·w, c_latent + c_cond)`.
    pub vid: &'a Tensor,
    /// Packed text tokens `(Σ l, d)`.
    pub txt: &'a Tensor,
    pub vid_shapes: &'a ShapeTable,
    pub txt_lens: &'a [usize],
    /// Timestep, repeated per sample `(B,)`.
    pub timestep: &'a Tensor,
}

/// Diffusion transformer interface.
///
/// The forward pass is split into `embed` → `forward_block` per block →
/// `head` so the engine can run the block-swap pager between blocks.
/// Implementations keep whatever internal state they need across the
/// three stages of one pass.
pub trait DitModel: Send {
    /// Dtype of the loaded weights (FP8/FP16/BF16 checkpoints).
    fn weights_dtype(&self) -> DType;

    /// Device the bulk of the model currently resides on.
    fn device(&self) -> Device;

    /// Move the entire model, blocks included.
    fn to_device(&mut self, device: &Device) -> Result<()>;

    /// Number of transformer blocks.
    fn block_count(&self) -> usize;

    /// Move a single transformer block.
    fn move_block(&mut self, idx: usize, device: &Device) -> Result<()>;

    /// Device a single block currently resides on.
    fn block_device(&self, idx: usize) -> Device;

    /// Move everything that is not a transformer block: patch/text
    /// embeddings, norms and the output head.
    fn move_io_modules(&mut self, device: &Device) -> Result<()>;

    /// Input embedding stage; returns the initial hidden state.
    fn embed(&mut self, inputs: &DitInputs<'_>) -> Result<Tensor>;

    /// One transformer block over the hidden state.
    fn forward_block(&mut self, idx: usize, hidden: &Tensor, inputs: &DitInputs<'_>)
        -> Result<Tensor>;

    /// Output head; returns the packed velocity prediction `(Σ t·h·w, c)`.
    fn head(&mut self, hidden: &Tensor, inputs: &DitInputs<'_>) -> Result<Tensor>;

    /// Compute rotary frequency tensors for a shape key. Used to warm the
    /// frequency cache before the first forward.
    fn rope_freqs(&mut self, key: &RopeKey) -> Result<Tensor>;

    /// Drop any scratch tensors accumulated on blocks. Returns the number
    /// of entries removed.
    fn clear_block_scratch(&mut self) -> usize {
        0
    }
}

/// Temporal VAE interface.
///
/// A VAE instance is either fully resident on one device or fully on
/// another — the core never splits it.
pub trait VaeModel: Send {
    /// Encode pixel video `(b, c, t, h, w)` to a latent
    /// `(b, c_l, t_l, h_l, w_l)` (temporal axis may be absent for t = 1).
    /// `sample` selects posterior sampling over the deterministic mode.
    fn encode(&mut self, video: &Tensor, sample: bool) -> Result<Tensor>;

    /// Decode a latent `(b, c_l, t_l, h_l, w_l)` / `(b, c_l, h_l, w_l)`
    /// back to pixel video.
    fn decode(&mut self, latent: &Tensor) -> Result<Tensor>;

    /// Optional input normalization before encode.
    fn preprocess(&mut self, video: &Tensor) -> Result<Tensor> {
        Ok(video.clone())
    }

    /// Optional output denormalization after decode.
    fn postprocess(&mut self, video: &Tensor) -> Result<Tensor> {
        Ok(video.clone())
    }

    fn to_device(&mut self, device: &Device) -> Result<()>;

    fn device(&self) -> Device;

    /// Spatial pixel/latent ratio of the decoder (the tile mapper's `U`).
    fn spatial_upsample_factor(&self) -> usize {
        8
    }

    fn set_causal_slicing(&mut self, _config: &VaeSlicingConfig) {}

    fn set_memory_limit(&mut self, _config: &VaeMemoryLimitConfig) {}
}

/// Factory for VAE instances.
///
/// Construction is expensive (weights load to CPU) but side-effect free,
/// so the lifecycle manager can destroy and rebuild the VAE between
/// batches under VRAM preservation.
pub trait VaeFactory: Send {
    fn build(&self, config: &VaeConfig) -> Result<Box<dyn VaeModel>>;
}
