//! VRAM governance.
//!
//! The governor owns the allocator handle for the process: it answers
//! status queries, runs the ordered release procedure, applies fraction
//! caps while block-swap is active, and profiles the GPU into a capability
//! tier.

pub mod cache;
pub mod profile;
pub mod vram;

use candle_core::{DType, Device, Tensor};

use crate::error::Result;
use profile::{GpuProfile, MemoryRecommendation, ModelSize};
use vram::{NullVramProvider, SmiVramProvider, VramProvider};

/// Snapshot of allocator and device memory state, in GB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VramStatus {
    pub allocated_gb: f64,
    pub reserved_gb: f64,
    pub free_gb: f64,
    pub total_gb: f64,
    pub peak_gb: f64,
}

pub struct MemoryGovernor {
    provider: Box<dyn VramProvider>,
    device: Device,
}

impl MemoryGovernor {
    pub fn new(provider: Box<dyn VramProvider>, device: Device) -> Self {
        Self { provider, device }
    }

    /// Governor for the given device, with `nvidia-smi` accounting when an
    /// NVIDIA GPU is present.
    pub fn auto(device: &Device) -> Self {
        let provider: Box<dyn VramProvider> = match SmiVramProvider::detect() {
            Some(smi) => Box::new(smi),
            None => Box::new(NullVramProvider),
        };
        Self::new(provider, device.clone())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_gpu(&self) -> bool {
        self.provider.is_gpu()
    }

    /// Current allocator and device memory state.
    pub fn vram_status(&self) -> VramStatus {
        let (free_gb, total_gb) = self.provider.mem_info();
        VramStatus {
            allocated_gb: self.provider.allocated_gb(),
            reserved_gb: self.provider.reserved_gb(),
            free_gb,
            total_gb,
            peak_gb: self.provider.peak_gb(),
        }
    }

    /// Log a full VRAM report for a pipeline stage.
    pub fn log_status(&self, stage: &str, details: &str) {
        if !self.provider.is_gpu() {
            return;
        }
        let s = self.vram_status();
        let used = s.total_gb - s.free_gb;
        let percent = if s.total_gb > 0.0 {
            used / s.total_gb * 100.0
        } else {
            0.0
        };
        tracing::info!(
            "VRAM [{stage}] {details} — total {:.2} GB, used {:.2} GB ({:.1}%), free {:.2} GB, \
             allocated {:.2} GB, reserved {:.2} GB, peak {:.2} GB",
            s.total_gb,
            used,
            percent,
            s.free_gb,
            s.allocated_gb,
            s.reserved_gb,
            s.peak_gb
        );
    }

    /// Release reserved-but-unused allocator memory.
    ///
    /// Ordered procedure: empty the allocator cache, synchronize the
    /// device, reset peak and accumulated stats, allocate and drop a
    /// 1-element tensor to force allocator coalescing, then empty again.
    /// Returns the before/after state.
    pub fn release_reserved(&mut self) -> Result<(VramStatus, VramStatus)> {
        let before = self.vram_status();

        self.provider.empty_cache();
        self.synchronize()?;
        self.provider.reset_peak();
        self.provider.reset_accumulated();

        let probe = Tensor::zeros(1, DType::F32, &self.device)?;
        drop(probe);

        self.provider.empty_cache();
        self.synchronize()?;

        let after = self.vram_status();
        tracing::debug!(
            "Released reserved memory: {:.2} GB -> {:.2} GB",
            before.reserved_gb,
            after.reserved_gb
        );
        Ok((before, after))
    }

    pub fn reset_peak(&mut self) {
        self.provider.reset_peak();
    }

    pub fn empty_cache(&mut self) {
        self.provider.empty_cache();
    }

    /// Multi-round cleanup between pipeline stages.
    pub fn clear_vram_cache(&mut self) {
        tracing::debug!("Clearing VRAM cache");
        self.provider.empty_cache();
        if self.synchronize().is_ok() {
            self.provider.empty_cache();
        }
    }

    pub fn synchronize(&self) -> Result<()> {
        if self.provider.is_gpu() {
            self.device.synchronize()?;
        }
        Ok(())
    }

    pub fn set_memory_fraction(&mut self, fraction: f64) {
        tracing::debug!("Setting memory fraction to {:.0}%", fraction * 100.0);
        self.provider.set_memory_fraction(fraction);
    }

    pub fn memory_fraction(&self) -> f64 {
        self.provider.memory_fraction()
    }

    /// Capability profile of the underlying GPU.
    pub fn gpu_profile(&self) -> GpuProfile {
        let (_, total_gb) = self.provider.mem_info();
        GpuProfile::for_device(self.provider.device_name(), total_gb)
    }

    /// Recommended memory configuration for a workload.
    pub fn recommend_config(
        &self,
        model: ModelSize,
        batch_size: usize,
        resolution: usize,
    ) -> MemoryRecommendation {
        let rec = profile::recommend_config(&self.gpu_profile(), model, batch_size, resolution);
        tracing::info!(
            "Memory recommendation for {} ({:.0} GB, {}): {} blocks to swap, ~{:.1} GB estimated ({})",
            rec.gpu_name,
            rec.total_vram_gb,
            rec.tier,
            rec.blocks_to_swap,
            rec.estimated_memory_gb,
            rec.optimization_level()
        );
        rec
    }
}
