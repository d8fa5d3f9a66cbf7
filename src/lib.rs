//! Inference orchestration core for latent-diffusion video
//! super-resolution.
//!
//! Drives a DiT sampler and a temporal VAE over batches of low-resolution
//! frames under a strict VRAM budget. Memory pressure is handled by three
//! cooperating mechanisms: per-block CPU↔GPU paging inside the DiT
//! ([`models::blockswap`]), spatially tiled VAE decoding
//! ([`infer::tiled`]) and a VRAM preservation policy that rebuilds the
//! VAE from scratch between batches ([`models::lifecycle`]).
//!
//! The concrete DiT and VAE are external: the core drives them through
//! the traits in [`models`], which keeps every memory policy testable
//! without a GPU.

pub mod config;
pub mod error;
pub mod generation;
pub mod infer;
pub mod memory;
pub mod models;
pub mod packing;
pub mod precision;
pub mod sampling;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Phase, Result, VsrError};
pub use generation::{generate, GenerationCallbacks, GenerationRequest, TextEmbeddings};
pub use infer::{InferenceEngine, InferenceOptions, Task};
pub use memory::{MemoryGovernor, VramStatus};
pub use precision::PrecisionPlan;

use candle_core::Device;

/// Install a tracing subscriber honoring `RUST_LOG` (idempotent).
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Select the compute device from a preference string.
///
/// Preference: "auto", "cpu", "cuda", "metal".
pub fn select_device(preference: &str) -> Device {
    match preference {
        "cpu" => {
            tracing::info!("Using CPU device (explicit preference)");
            Device::Cpu
        }
        "cuda" => {
            if let Some(device) = try_cuda_device() {
                return device;
            }
            tracing::warn!("CUDA requested but not available, falling back to CPU");
            Device::Cpu
        }
        "metal" => {
            if let Some(device) = try_metal_device() {
                return device;
            }
            tracing::warn!("Metal requested but not available, falling back to CPU");
            Device::Cpu
        }
        _ => {
            if let Some(device) = try_cuda_device() {
                return device;
            }
            if let Some(device) = try_metal_device() {
                return device;
            }
            tracing::info!("Using CPU device (no GPU available)");
            Device::Cpu
        }
    }
}

fn try_cuda_device() -> Option<Device> {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                tracing::info!("CUDA GPU device initialized");
                return Some(device);
            }
            Err(e) => {
                tracing::debug!("CUDA initialization failed: {}", e);
            }
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        tracing::debug!("CUDA support not compiled (enable 'cuda' feature)");
    }
    None
}

fn try_metal_device() -> Option<Device> {
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("Metal GPU device initialized");
                return Some(device);
            }
            Err(e) => {
                tracing::debug!("Metal initialization failed: {}", e);
            }
        }
    }
    #[cfg(not(feature = "metal"))]
    {
        tracing::debug!("Metal support not compiled (enable 'metal' feature)");
    }
    None
}
