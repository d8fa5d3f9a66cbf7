//! GPU capability tiers and memory recommendations.
//!
//! Tiers are keyed by total VRAM and carry the default block-swap depth,
//! the memory-fraction caps applied while block-swap is active, and the
//! cleanup thresholds for the paging machinery.

use serde::Serialize;

/// GPU capability class by total VRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuTier {
    /// ≥ 24 GB (RTX 4090, A100, ...).
    HighEnd,
    /// ≥ 12 GB (RTX 3080, 4070 Ti, ...).
    MidRange,
    /// ≥ 8 GB (RTX 3060, 4060, ...).
    Entry,
    /// < 8 GB.
    Low,
    /// No usable GPU.
    Cpu,
}

impl GpuTier {
    pub fn from_total_gb(total_gb: f64) -> Self {
        if total_gb <= 0.0 {
            GpuTier::Cpu
        } else if total_gb >= 24.0 {
            GpuTier::HighEnd
        } else if total_gb >= 12.0 {
            GpuTier::MidRange
        } else if total_gb >= 8.0 {
            GpuTier::Entry
        } else {
            GpuTier::Low
        }
    }
}

impl std::fmt::Display for GpuTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuTier::HighEnd => write!(f, "high_end"),
            GpuTier::MidRange => write!(f, "mid_range"),
            GpuTier::Entry => write!(f, "entry_level"),
            GpuTier::Low => write!(f, "low_vram"),
            GpuTier::Cpu => write!(f, "cpu"),
        }
    }
}

/// Per-tier memory settings.
#[derive(Debug, Clone, Serialize)]
pub struct GpuProfile {
    pub name: String,
    pub total_memory_gb: f64,
    pub tier: GpuTier,
    /// Reserved-memory level below which the relaxed fraction cap applies.
    pub reserved_threshold_gb: f64,
    /// Fraction cap when reservations are below the threshold.
    pub fraction_low_reserved: f64,
    /// Fraction cap when reservations are above the threshold.
    pub fraction_high_reserved: f64,
    pub block_cleanup_threshold: f64,
    pub io_cleanup_threshold: f64,
    pub recommended_blocks_to_swap: usize,
}

impl GpuProfile {
    pub fn for_device(name: String, total_gb: f64) -> Self {
        let tier = GpuTier::from_total_gb(total_gb);
        let (reserved, low, high, block, io, swap) = match tier {
            GpuTier::HighEnd => (8.0, 0.9, 0.8, 0.85, 0.95, 0),
            GpuTier::MidRange => (4.0, 0.8, 0.6, 0.7, 0.85, 8),
            GpuTier::Entry => (2.0, 0.7, 0.5, 0.6, 0.8, 16),
            GpuTier::Low => (1.5, 0.6, 0.4, 0.5, 0.7, 24),
            GpuTier::Cpu => (4.0, 0.8, 0.6, 0.7, 0.9, 0),
        };
        Self {
            name,
            total_memory_gb: total_gb,
            tier,
            reserved_threshold_gb: reserved,
            fraction_low_reserved: low,
            fraction_high_reserved: high,
            block_cleanup_threshold: block,
            io_cleanup_threshold: io,
            recommended_blocks_to_swap: swap,
        }
    }

    /// Fraction cap for the observed reservation level.
    pub fn fraction_for_reserved(&self, reserved_gb: f64) -> f64 {
        if reserved_gb < self.reserved_threshold_gb {
            self.fraction_low_reserved
        } else {
            self.fraction_high_reserved
        }
    }
}

/// Checkpoint size class used for memory estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    /// 3B-parameter class checkpoint (~8 GB resident).
    Small,
    /// 7B-parameter class checkpoint (~14 GB resident).
    Large,
}

impl ModelSize {
    fn base_memory_gb(self) -> f64 {
        match self {
            ModelSize::Small => 8.0,
            ModelSize::Large => 14.0,
        }
    }
}

/// Recommended memory configuration for a model/batch/resolution triple.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecommendation {
    pub tier: GpuTier,
    pub gpu_name: String,
    pub total_vram_gb: f64,
    pub blocks_to_swap: usize,
    pub estimated_memory_gb: f64,
    pub reserved_threshold_gb: f64,
    pub fraction_low_reserved: f64,
    pub fraction_high_reserved: f64,
    pub block_cleanup_threshold: f64,
    pub io_cleanup_threshold: f64,
}

impl MemoryRecommendation {
    pub fn optimization_level(&self) -> &'static str {
        if self.blocks_to_swap > 16 {
            "aggressive"
        } else if self.blocks_to_swap > 0 {
            "moderate"
        } else {
            "none"
        }
    }
}

/// Estimate memory pressure and derive a block-swap depth, floored at the
/// tier's own recommendation.
pub fn recommend_config(
    profile: &GpuProfile,
    model: ModelSize,
    batch_size: usize,
    resolution: usize,
) -> MemoryRecommendation {
    let mut multiplier = 1.0;
    if batch_size > 5 {
        multiplier += (batch_size - 5) as f64 * 0.1;
    }
    if resolution > 1024 {
        multiplier += (resolution as f64 / 1024.0 - 1.0) * 0.2;
    }
    let required = model.base_memory_gb() * multiplier;
    let available = profile.total_memory_gb;

    let mut blocks_to_swap = if available <= 0.0 {
        0
    } else if required > available * 0.9 {
        (((required - available * 0.7) / 0.5) as usize).min(28)
    } else if required > available * 0.7 {
        (((required - available * 0.6) / 0.5) as usize).min(16)
    } else {
        0
    };
    blocks_to_swap = blocks_to_swap.max(profile.recommended_blocks_to_swap);

    MemoryRecommendation {
        tier: profile.tier,
        gpu_name: profile.name.clone(),
        total_vram_gb: profile.total_memory_gb,
        blocks_to_swap,
        estimated_memory_gb: required,
        reserved_threshold_gb: profile.reserved_threshold_gb,
        fraction_low_reserved: profile.fraction_low_reserved,
        fraction_high_reserved: profile.fraction_high_reserved,
        block_cleanup_threshold: profile.block_cleanup_threshold,
        io_cleanup_threshold: profile.io_cleanup_threshold,
    }
}
