//! Pipeline configuration.
//!
//! The configuration is stored as JSON and mirrors the checkpoint's own
//! config layout: a `diffusion` section for guidance and sampling, a `vae`
//! section for the codec, and a `runtime` section for the per-run flags.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VsrError};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub vae: VaeConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Directory holding the precomputed `pos_emb.pt` / `neg_emb.pt` files.
    #[serde(default = "default_embedding_dir")]
    pub embedding_dir: PathBuf,
}

fn default_embedding_dir() -> PathBuf {
    PathBuf::from("./models")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            diffusion: DiffusionConfig::default(),
            vae: VaeConfig::default(),
            runtime: RuntimeConfig::default(),
            embedding_dir: default_embedding_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. Returns defaults if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file: {} — using defaults", e);
                Self::default()
            }),
            Err(_) => {
                tracing::info!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Config saved to {}", path.display());
        Ok(())
    }
}

/// Diffusion sampling and guidance configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default)]
    pub cfg: CfgConfig,
    #[serde(default)]
    pub timesteps: TimestepsConfig,
}

/// Classifier-free guidance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgConfig {
    /// Guidance scale; 1.0 disables the negative branch entirely.
    #[serde(default = "default_cfg_scale")]
    pub scale: f64,
    /// Std-matched rescale blend factor in `[0, 1]`.
    #[serde(default)]
    pub rescale: f64,
    /// Fraction of sampling steps that use the full guidance scale.
    #[serde(default = "default_cfg_partial")]
    pub partial: f64,
}

fn default_cfg_scale() -> f64 {
    1.0
}
fn default_cfg_partial() -> f64 {
    1.0
}

impl Default for CfgConfig {
    fn default() -> Self {
        Self {
            scale: default_cfg_scale(),
            rescale: 0.0,
            partial: default_cfg_partial(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestepsConfig {
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Enable the resolution-aware timestep shift.
    #[serde(default = "default_true")]
    pub transform: bool,
}

impl Default for TimestepsConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            transform: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of sampler steps. The distilled SR checkpoint runs one step.
    #[serde(default = "default_steps")]
    pub steps: usize,
}

fn default_steps() -> usize {
    1
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
        }
    }
}

/// A scaling/shifting factor that is either a scalar or per-channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Factor {
    Scalar(f64),
    PerChannel(Vec<f64>),
}

impl Factor {
    /// Materialize the factor as a tensor that broadcasts over the channel
    /// (last) axis of a channels-last latent.
    pub fn to_tensor(&self, device: &Device, dtype: DType) -> Result<Tensor> {
        let values: Vec<f32> = match self {
            Factor::Scalar(v) => vec![*v as f32],
            Factor::PerChannel(vs) => vs.iter().map(|v| *v as f32).collect(),
        };
        let len = values.len();
        Ok(Tensor::from_vec(values, len, device)?.to_dtype(dtype)?)
    }

    pub fn scalar(&self) -> Option<f64> {
        match self {
            Factor::Scalar(v) => Some(*v),
            Factor::PerChannel(_) => None,
        }
    }
}

/// Temporal VAE codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeConfig {
    /// Parameter dtype name: "float16", "bfloat16", "float32".
    #[serde(default = "default_vae_dtype")]
    pub dtype: String,
    #[serde(default = "default_scaling")]
    pub scaling_factor: Factor,
    #[serde(default = "default_shifting")]
    pub shifting_factor: Factor,
    /// Batch same-shape samples together for encode/decode.
    #[serde(default = "default_true")]
    pub grouping: bool,
    /// Sample from the posterior on encode (deterministic mode otherwise).
    #[serde(default = "default_true")]
    pub use_sample: bool,
    /// Checkpoint path, relative to the model cache directory.
    #[serde(default = "default_vae_checkpoint")]
    pub checkpoint: PathBuf,
    /// Causal-slicing settings re-applied after each (re)construction.
    #[serde(default)]
    pub slicing: Option<VaeSlicingConfig>,
    /// Per-op memory limits re-applied after each (re)construction.
    #[serde(default)]
    pub memory_limit: Option<VaeMemoryLimitConfig>,
    #[serde(default)]
    pub model: VaeModelConfig,
}

fn default_vae_dtype() -> String {
    "bfloat16".to_string()
}
fn default_scaling() -> Factor {
    Factor::Scalar(1.0)
}
fn default_shifting() -> Factor {
    Factor::Scalar(0.0)
}
fn default_vae_checkpoint() -> PathBuf {
    PathBuf::from("vae.safetensors")
}
fn default_true() -> bool {
    true
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            dtype: default_vae_dtype(),
            scaling_factor: default_scaling(),
            shifting_factor: default_shifting(),
            grouping: true,
            use_sample: true,
            checkpoint: default_vae_checkpoint(),
            slicing: None,
            memory_limit: None,
            model: VaeModelConfig::default(),
        }
    }
}

impl VaeConfig {
    /// Parse the configured parameter dtype name.
    pub fn parse_dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }
}

/// Parse a dtype name as it appears in checkpoint configs.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "float16" | "f16" | "half" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float32" | "f32" | "float" => Ok(DType::F32),
        "float8_e4m3fn" | "f8_e4m3" => Ok(DType::F8E4M3),
        other => Err(VsrError::Config(format!("unknown dtype name: {other}"))),
    }
}

/// Structural parameters of the temporal VAE, needed for shape math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeModelConfig {
    #[serde(default = "default_temporal_down")]
    pub temporal_downsample_factor: usize,
    #[serde(default = "default_spatial_down")]
    pub spatial_downsample_factor: usize,
}

fn default_temporal_down() -> usize {
    4
}
fn default_spatial_down() -> usize {
    8
}

impl Default for VaeModelConfig {
    fn default() -> Self {
        Self {
            temporal_downsample_factor: default_temporal_down(),
            spatial_downsample_factor: default_spatial_down(),
        }
    }
}

/// Causal-slicing settings forwarded to the VAE when it supports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaeSlicingConfig {
    #[serde(default)]
    pub split_size: Option<usize>,
    #[serde(default)]
    pub memory_device: Option<String>,
}

/// Per-op memory limits forwarded to the VAE when it supports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaeMemoryLimitConfig {
    #[serde(default)]
    pub conv_max_mem: Option<f64>,
    #[serde(default)]
    pub norm_max_mem: Option<f64>,
}

/// Per-run flags, overridable per `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub preserve_vram: bool,
    #[serde(default)]
    pub tiled_vae: bool,
    #[serde(default = "default_tile_size")]
    pub tile_size: (usize, usize),
    #[serde(default = "default_tile_stride")]
    pub tile_stride: (usize, usize),
    #[serde(default)]
    pub temporal_overlap: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub block_swap: Option<BlockSwapSettings>,
}

fn default_tile_size() -> (usize, usize) {
    (64, 64)
}
fn default_tile_stride() -> (usize, usize) {
    (32, 32)
}
fn default_batch_size() -> usize {
    90
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preserve_vram: false,
            tiled_vae: false,
            tile_size: default_tile_size(),
            tile_stride: default_tile_stride(),
            temporal_overlap: 0,
            batch_size: default_batch_size(),
            block_swap: None,
        }
    }
}

/// Block-swap request: how many trailing DiT blocks live on the CPU.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockSwapSettings {
    pub blocks_to_swap: usize,
}
