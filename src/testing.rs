//! Shared test doubles: a block-structured DiT, a nearest-neighbor VAE and
//! a counting factory. The DiT records every device move and forward call
//! so residency invariants can be asserted from the event stream; the VAE
//! is a real (if trivial) codec so decode paths produce comparable bits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};

use crate::config::{Config, VaeConfig};
use crate::error::{Result, VsrError};
use crate::memory::cache::RopeKey;
use crate::models::{DitInputs, DitModel, VaeFactory, VaeModel};

/// Observable event on the mock DiT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DitEvent {
    FullMove,
    IoMove,
    BlockMove(usize),
    Embed,
    Block(usize),
    Head,
}

pub struct MockDit {
    pub weights: DType,
    pub blocks: usize,
    pub out_channels: usize,
    pub events: Arc<Mutex<Vec<DitEvent>>>,
    /// When set, the Nth `embed` call (1-based) fails with an OOM error.
    pub fail_on_embed: Option<usize>,
    embed_calls: usize,
}

impl MockDit {
    pub fn new(weights: DType, blocks: usize, out_channels: usize) -> Self {
        Self {
            weights,
            blocks,
            out_channels,
            events: Arc::new(Mutex::new(Vec::new())),
            fail_on_embed: None,
            embed_calls: 0,
        }
    }

    fn record(&self, event: DitEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl DitModel for MockDit {
    fn weights_dtype(&self) -> DType {
        self.weights
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn to_device(&mut self, _device: &Device) -> Result<()> {
        self.record(DitEvent::FullMove);
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.blocks
    }

    fn move_block(&mut self, idx: usize, _device: &Device) -> Result<()> {
        self.record(DitEvent::BlockMove(idx));
        Ok(())
    }

    fn block_device(&self, _idx: usize) -> Device {
        Device::Cpu
    }

    fn move_io_modules(&mut self, _device: &Device) -> Result<()> {
        self.record(DitEvent::IoMove);
        Ok(())
    }

    fn embed(&mut self, inputs: &DitInputs<'_>) -> Result<Tensor> {
        self.embed_calls += 1;
        if self.fail_on_embed == Some(self.embed_calls) {
            return Err(VsrError::OutOfMemory(
                "CUDA out of memory: tried to allocate 2.50 GB".into(),
            ));
        }
        self.record(DitEvent::Embed);
        Ok(inputs.vid.clone())
    }

    fn forward_block(
        &mut self,
        idx: usize,
        hidden: &Tensor,
        _inputs: &DitInputs<'_>,
    ) -> Result<Tensor> {
        self.record(DitEvent::Block(idx));
        Ok(hidden.clone())
    }

    fn head(&mut self, hidden: &Tensor, _inputs: &DitInputs<'_>) -> Result<Tensor> {
        self.record(DitEvent::Head);
        // Velocity prediction: a fixed contraction of the noisy latent so
        // sampling is deterministic and shape-correct.
        Ok(hidden.narrow(1, 0, self.out_channels)?.affine(0.5, 0.0)?)
    }

    fn rope_freqs(&mut self, key: &RopeKey) -> Result<Tensor> {
        let tokens = key.vid[0] * key.vid[1] * key.vid[2];
        Ok(Tensor::zeros((tokens, 64), DType::F32, &Device::Cpu)?)
    }
}

/// Nearest-neighbor temporal VAE: encode subsamples (stride 4 temporal,
/// 8×8 spatial mean), decode takes the three leading channels, replicates
/// frames and upsamples.
pub struct MockVae {
    pub alive: Arc<AtomicUsize>,
    pub device_moves: Arc<AtomicUsize>,
    pub decode_calls: Arc<AtomicUsize>,
    pub temporal: usize,
    pub spatial: usize,
}

impl MockVae {
    pub fn new(alive: Arc<AtomicUsize>, device_moves: Arc<AtomicUsize>) -> Self {
        alive.fetch_add(1, Ordering::SeqCst);
        Self {
            alive,
            device_moves,
            decode_calls: Arc::new(AtomicUsize::new(0)),
            temporal: 4,
            spatial: 8,
        }
    }

    pub fn with_decode_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.decode_calls = counter;
        self
    }
}

impl Drop for MockVae {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

impl VaeModel for MockVae {
    fn encode(&mut self, video: &Tensor, _sample: bool) -> Result<Tensor> {
        let dims = video.dims().to_vec();
        let [b, c, t, h, w] = match dims.as_slice() {
            [b, c, t, h, w] => [*b, *c, *t, *h, *w],
            other => {
                return Err(VsrError::Shape(format!(
                    "mock encode expects (b,c,t,h,w), got {other:?}"
                )))
            }
        };
        if t % self.temporal != 1 {
            return Err(VsrError::Shape(format!(
                "temporal VAE requires t % {} == 1, got t={t}",
                self.temporal
            )));
        }
        let t_indices: Vec<u32> = (0..t).step_by(self.temporal).map(|i| i as u32).collect();
        let idx = Tensor::from_vec(t_indices.clone(), t_indices.len(), video.device())?;
        let sub = video.index_select(&idx, 2)?;

        let hl = h / self.spatial;
        let wl = w / self.spatial;
        let tl = t_indices.len();
        let pooled = sub
            .reshape(vec![b, c, tl, hl, self.spatial, wl, self.spatial])?
            .mean(6)?
            .mean(4)?;
        Ok(pooled)
    }

    fn decode(&mut self, latent: &Tensor) -> Result<Tensor> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        let dims = latent.dims().to_vec();
        match dims.as_slice() {
            &[_b, c, h, w] => {
                let rgb = latent.narrow(1, 0, c.min(3))?.contiguous()?;
                Ok(rgb.upsample_nearest2d(h * self.spatial, w * self.spatial)?)
            }
            &[b, c, t, h, w] => {
                let c_out = c.min(3);
                let rgb = latent.narrow(1, 0, c_out)?.contiguous()?;
                let t_out = (t - 1) * self.temporal + 1;
                let mut frame_indices = Vec::with_capacity(t_out);
                for i in 0..t - 1 {
                    frame_indices.extend(std::iter::repeat(i as u32).take(self.temporal));
                }
                frame_indices.push((t - 1) as u32);
                let idx = Tensor::from_vec(frame_indices, t_out, latent.device())?;
                let expanded = rgb.index_select(&idx, 2)?;
                let flat = expanded.contiguous()?.reshape((b, c_out * t_out, h, w))?;
                let up = flat.upsample_nearest2d(h * self.spatial, w * self.spatial)?;
                Ok(up.reshape((b, c_out, t_out, h * self.spatial, w * self.spatial))?)
            }
            other => Err(VsrError::Shape(format!(
                "mock decode expects rank 4 or 5, got {other:?}"
            ))),
        }
    }

    fn to_device(&mut self, _device: &Device) -> Result<()> {
        self.device_moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn spatial_upsample_factor(&self) -> usize {
        self.spatial
    }
}

/// Factory counting constructions and live instances.
pub struct CountingVaeFactory {
    pub built: Arc<AtomicUsize>,
    pub alive: Arc<AtomicUsize>,
    pub device_moves: Arc<AtomicUsize>,
}

impl CountingVaeFactory {
    pub fn new() -> Self {
        Self {
            built: Arc::new(AtomicUsize::new(0)),
            alive: Arc::new(AtomicUsize::new(0)),
            device_moves: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl VaeFactory for CountingVaeFactory {
    fn build(&self, _config: &VaeConfig) -> Result<Box<dyn VaeModel>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockVae::new(
            self.alive.clone(),
            self.device_moves.clone(),
        )))
    }
}

/// Config tuned for small CPU tests: F32 VAE dtype, one sampling step.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.vae.dtype = "float32".to_string();
    config
}

/// Tiny text embeddings pair.
pub fn test_embeddings() -> (Tensor, Tensor) {
    let pos = Tensor::full(0.25f32, (7, 16), &Device::Cpu).unwrap();
    let neg = Tensor::full(-0.25f32, (7, 16), &Device::Cpu).unwrap();
    (pos, neg)
}
