//! VRAM accounting providers.
//!
//! The governor talks to the allocator through this trait so that the rest
//! of the core never touches process-global GPU state directly, and so the
//! whole memory policy is testable with a recording fake.

use std::cell::Cell;

/// Allocator-level VRAM accounting and control.
pub trait VramProvider: Send {
    /// Whether a real GPU backs this provider.
    fn is_gpu(&self) -> bool;
    /// Human-readable device name.
    fn device_name(&self) -> String;
    /// `(free_gb, total_gb)` at device level.
    fn mem_info(&self) -> (f64, f64);
    /// Memory currently allocated by this process, in GB.
    fn allocated_gb(&self) -> f64;
    /// Memory reserved by the allocator (allocated + cached), in GB.
    fn reserved_gb(&self) -> f64;
    /// Peak allocation since the last reset, in GB.
    fn peak_gb(&self) -> f64;
    fn reset_peak(&mut self);
    fn reset_accumulated(&mut self);
    /// Return cached-but-unused pages to the device.
    fn empty_cache(&mut self);
    /// Cap the fraction of total VRAM this process may reserve.
    fn set_memory_fraction(&mut self, fraction: f64);
    fn memory_fraction(&self) -> f64;
}

/// Provider for hosts without a usable GPU. All queries return zero and
/// every control operation is a no-op.
pub struct NullVramProvider;

impl VramProvider for NullVramProvider {
    fn is_gpu(&self) -> bool {
        false
    }
    fn device_name(&self) -> String {
        "cpu".to_string()
    }
    fn mem_info(&self) -> (f64, f64) {
        (0.0, 0.0)
    }
    fn allocated_gb(&self) -> f64 {
        0.0
    }
    fn reserved_gb(&self) -> f64 {
        0.0
    }
    fn peak_gb(&self) -> f64 {
        0.0
    }
    fn reset_peak(&mut self) {}
    fn reset_accumulated(&mut self) {}
    fn empty_cache(&mut self) {}
    fn set_memory_fraction(&mut self, _fraction: f64) {}
    fn memory_fraction(&self) -> f64 {
        1.0
    }
}

/// Provider backed by `nvidia-smi` queries.
///
/// Allocated and reserved figures are the device-level usage reported by
/// the driver; the peak is the maximum usage observed across queries since
/// the last reset.
pub struct SmiVramProvider {
    name: String,
    total_gb: f64,
    fraction: f64,
    peak_gb: Cell<f64>,
}

impl SmiVramProvider {
    /// Probe for an NVIDIA GPU. Returns `None` when `nvidia-smi` is not
    /// available or reports no device.
    pub fn detect() -> Option<Self> {
        let output = std::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .ok()?;
        let text = String::from_utf8(output.stdout).ok()?;
        let line = text.lines().next()?;
        let mut parts = line.split(',').map(str::trim);
        let name = parts.next()?.to_string();
        let total_mb: f64 = parts.next()?.parse().ok()?;
        tracing::info!("GPU detected: {} ({:.1} GB)", name, total_mb / 1024.0);
        Some(Self {
            name,
            total_gb: total_mb / 1024.0,
            fraction: 1.0,
            peak_gb: Cell::new(0.0),
        })
    }

    fn used_gb(&self) -> f64 {
        let used = std::process::Command::new("nvidia-smi")
            .args(["--query-gpu=memory.used", "--format=csv,noheader,nounits"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|s| s.lines().next().and_then(|l| l.trim().parse::<f64>().ok()))
            .map(|mb| mb / 1024.0)
            .unwrap_or(0.0);
        if used > self.peak_gb.get() {
            self.peak_gb.set(used);
        }
        used
    }
}

impl VramProvider for SmiVramProvider {
    fn is_gpu(&self) -> bool {
        true
    }
    fn device_name(&self) -> String {
        self.name.clone()
    }
    fn mem_info(&self) -> (f64, f64) {
        let used = self.used_gb();
        ((self.total_gb - used).max(0.0), self.total_gb)
    }
    fn allocated_gb(&self) -> f64 {
        self.used_gb()
    }
    fn reserved_gb(&self) -> f64 {
        self.used_gb()
    }
    fn peak_gb(&self) -> f64 {
        self.used_gb();
        self.peak_gb.get()
    }
    fn reset_peak(&mut self) {
        self.peak_gb.set(0.0);
    }
    fn reset_accumulated(&mut self) {}
    fn empty_cache(&mut self) {}
    fn set_memory_fraction(&mut self, fraction: f64) {
        self.fraction = fraction.clamp(0.0, 1.0);
    }
    fn memory_fraction(&self) -> f64 {
        self.fraction
    }
}
