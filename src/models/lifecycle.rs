//! VAE lifecycle management.
//!
//! Under VRAM preservation the VAE is destroyed after every batch and
//! rebuilt before the next one — reconstruction cost is traded for a
//! guaranteed release of its memory. Causal-slicing and memory-limit
//! settings are re-applied after every (re)construction.

use crate::config::VaeConfig;
use crate::error::{Result, VsrError};
use crate::models::{VaeFactory, VaeModel};

pub struct VaeLifecycle {
    factory: Box<dyn VaeFactory>,
    vae: Option<Box<dyn VaeModel>>,
}

impl VaeLifecycle {
    /// Lifecycle with no instance yet; `ensure` builds on first use.
    pub fn new(factory: Box<dyn VaeFactory>) -> Self {
        Self { factory, vae: None }
    }

    /// Lifecycle seeded with an already-constructed instance.
    pub fn with_model(factory: Box<dyn VaeFactory>, vae: Box<dyn VaeModel>) -> Self {
        Self {
            factory,
            vae: Some(vae),
        }
    }

    pub fn is_present(&self) -> bool {
        self.vae.is_some()
    }

    /// Construct the VAE (weights on CPU) if absent and return it.
    pub fn ensure(&mut self, config: &VaeConfig) -> Result<&mut dyn VaeModel> {
        if self.vae.is_none() {
            tracing::info!("Re-creating VAE for a clean VRAM state");
            let mut vae = self.factory.build(config)?;
            if let Some(slicing) = &config.slicing {
                vae.set_causal_slicing(slicing);
            }
            if let Some(limit) = &config.memory_limit {
                vae.set_memory_limit(limit);
            }
            self.vae = Some(vae);
            tracing::info!("VAE re-created on CPU");
        }
        Ok(self.vae.as_deref_mut().expect("vae just ensured"))
    }

    /// The current instance, which must exist.
    pub fn get(&mut self) -> Result<&mut (dyn VaeModel + '_)> {
        match self.vae.as_deref_mut() {
            Some(vae) => Ok(vae),
            None => Err(VsrError::Config("VAE not constructed".into())),
        }
    }

    /// Destroy the instance. Returns whether one was present.
    pub fn teardown(&mut self) -> bool {
        let present = self.vae.is_some();
        if present {
            tracing::info!("Tearing down VAE to release VRAM");
            self.vae = None;
        }
        present
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use candle_core::{Device, Tensor};

    use crate::config::{VaeMemoryLimitConfig, VaeSlicingConfig};

    pub(crate) struct CountingVae {
        alive: Arc<AtomicUsize>,
        slicing_applied: Arc<AtomicUsize>,
        limits_applied: Arc<AtomicUsize>,
    }

    impl Drop for CountingVae {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl VaeModel for CountingVae {
        fn encode(&mut self, video: &Tensor, _sample: bool) -> Result<Tensor> {
            Ok(video.clone())
        }
        fn decode(&mut self, latent: &Tensor) -> Result<Tensor> {
            Ok(latent.clone())
        }
        fn to_device(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn device(&self) -> Device {
            Device::Cpu
        }
        fn set_causal_slicing(&mut self, _config: &VaeSlicingConfig) {
            self.slicing_applied.fetch_add(1, Ordering::SeqCst);
        }
        fn set_memory_limit(&mut self, _config: &VaeMemoryLimitConfig) {
            self.limits_applied.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct CountingFactory {
        pub built: Arc<AtomicUsize>,
        pub alive: Arc<AtomicUsize>,
        pub slicing_applied: Arc<AtomicUsize>,
        pub limits_applied: Arc<AtomicUsize>,
    }

    impl VaeFactory for CountingFactory {
        fn build(&self, _config: &VaeConfig) -> Result<Box<dyn VaeModel>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            self.alive.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingVae {
                alive: self.alive.clone(),
                slicing_applied: self.slicing_applied.clone(),
                limits_applied: self.limits_applied.clone(),
            }))
        }
    }

    fn harness() -> (VaeLifecycle, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let alive = Arc::new(AtomicUsize::new(0));
        let slicing = Arc::new(AtomicUsize::new(0));
        let limits = Arc::new(AtomicUsize::new(0));
        let lifecycle = VaeLifecycle::new(Box::new(CountingFactory {
            built: built.clone(),
            alive: alive.clone(),
            slicing_applied: slicing.clone(),
            limits_applied: limits.clone(),
        }));
        (lifecycle, built, alive, slicing)
    }

    #[test]
    fn test_ensure_builds_once() {
        let (mut lifecycle, built, alive, _) = harness();
        let config = VaeConfig::default();
        assert!(!lifecycle.is_present());
        lifecycle.ensure(&config).unwrap();
        lifecycle.ensure(&config).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(alive.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_destroys_instance() {
        let (mut lifecycle, built, alive, _) = harness();
        let config = VaeConfig::default();
        lifecycle.ensure(&config).unwrap();
        assert!(lifecycle.teardown());
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert!(!lifecycle.is_present());
        assert!(lifecycle.get().is_err());

        lifecycle.ensure(&config).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_settings_reapplied_on_rebuild() {
        let (mut lifecycle, _, _, slicing) = harness();
        let mut config = VaeConfig::default();
        config.slicing = Some(VaeSlicingConfig::default());
        lifecycle.ensure(&config).unwrap();
        lifecycle.teardown();
        lifecycle.ensure(&config).unwrap();
        assert_eq!(slicing.load(Ordering::SeqCst), 2);
    }
}
