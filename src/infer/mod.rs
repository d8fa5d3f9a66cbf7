//! Diffusion inference engine.
//!
//! Owns the DiT, the VAE lifecycle, the block-swap capability, the memory
//! governor and the rotary cache, and runs the encode → sample → decode
//! sequence for one batch under the VRAM preservation policy.

pub mod tiled;

use candle_core::{DType, Device, Tensor};

use crate::config::{BlockSwapSettings, Config, Factor, VaeConfig};
use crate::error::{Phase, Result, VsrError};
use crate::memory::cache::{self, RopeFreqCache};
use crate::memory::MemoryGovernor;
use crate::models::blockswap::BlockSwap;
use crate::models::lifecycle::VaeLifecycle;
use crate::models::{DitInputs, DitModel, VaeFactory, VaeModel};
use crate::packing::{self, ShapeTable};
use crate::precision::PrecisionPlan;
use crate::sampling::guidance::{CfgDispatcher, GuidanceModel};
use crate::sampling::{EulerSampler, Schedule};

/// Conditioning task selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Text-to-video: empty condition.
    T2v,
    /// Image-to-video: leading frame valid.
    I2v,
    /// Video extension: two leading frames valid.
    V2v,
    /// Super-resolution: noised blur latent in every frame.
    Sr,
}

/// Per-call inference options.
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// Guidance scale override; defaults to the configured scale.
    pub cfg_scale: Option<f64>,
    pub preserve_vram: bool,
    pub use_blockswap: bool,
    /// Separate preservation flag for the DiT; defaults to `preserve_vram`.
    pub dit_preserve_vram: Option<bool>,
    pub tiled_vae: bool,
    pub tile_size: (usize, usize),
    pub tile_stride: (usize, usize),
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            cfg_scale: None,
            preserve_vram: false,
            use_blockswap: false,
            dit_preserve_vram: None,
            tiled_vae: false,
            tile_size: (64, 64),
            tile_stride: (32, 32),
        }
    }
}

pub struct InferenceEngine {
    config: Config,
    device: Device,
    dit: Box<dyn DitModel>,
    vae: VaeLifecycle,
    block_swap: Option<BlockSwap>,
    governor: MemoryGovernor,
    rope_cache: RopeFreqCache,
    schedule: Schedule,
    sampler: EulerSampler,
}

impl InferenceEngine {
    /// Engine without a constructed VAE; the lifecycle builds one on
    /// first use.
    pub fn new(
        config: Config,
        device: Device,
        dit: Box<dyn DitModel>,
        vae_factory: Box<dyn VaeFactory>,
        governor: MemoryGovernor,
    ) -> Result<Self> {
        let schedule = Schedule::default();
        let sampler = EulerSampler::new(schedule, config.diffusion.timesteps.sampling.steps)?;
        let mut engine = Self {
            config,
            device,
            dit,
            vae: VaeLifecycle::new(vae_factory),
            block_swap: None,
            governor,
            rope_cache: RopeFreqCache::new(),
            schedule,
            sampler,
        };
        engine.warm_rope_cache();
        Ok(engine)
    }

    /// Engine seeded with an already-constructed VAE.
    pub fn with_vae(
        config: Config,
        device: Device,
        dit: Box<dyn DitModel>,
        vae_factory: Box<dyn VaeFactory>,
        vae: Box<dyn VaeModel>,
        governor: MemoryGovernor,
    ) -> Result<Self> {
        let schedule = Schedule::default();
        let sampler = EulerSampler::new(schedule, config.diffusion.timesteps.sampling.steps)?;
        let mut engine = Self {
            config,
            device,
            dit,
            vae: VaeLifecycle::with_model(vae_factory, vae),
            block_swap: None,
            governor,
            rope_cache: RopeFreqCache::new(),
            schedule,
            sampler,
        };
        engine.warm_rope_cache();
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut MemoryGovernor {
        &mut self.governor
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Rebuild the sampler from the current sampling configuration.
    pub fn configure_diffusion(&mut self) -> Result<()> {
        self.sampler =
            EulerSampler::new(self.schedule, self.config.diffusion.timesteps.sampling.steps)?;
        Ok(())
    }

    /// Install (or remove, with zero depth) the block-swap capability.
    pub fn configure_block_swap(&mut self, settings: &BlockSwapSettings) -> Result<()> {
        if settings.blocks_to_swap == 0 {
            self.block_swap = None;
            return Ok(());
        }
        let swap = BlockSwap::install(self.dit.as_mut(), settings.blocks_to_swap, &self.device)?;
        self.block_swap = Some(swap);
        Ok(())
    }

    pub fn block_swap_active(&self) -> bool {
        self.block_swap.as_ref().is_some_and(|s| s.is_active())
    }

    /// Dtype plan for the loaded DiT weights.
    pub fn precision_plan(&self) -> PrecisionPlan {
        PrecisionPlan::from_weights(self.dit.weights_dtype())
    }

    /// Warm the rotary frequency cache for common shapes.
    pub fn warm_rope_cache(&mut self) {
        cache::preinitialize_rope_cache(&mut self.rope_cache, self.dit.as_mut());
    }

    /// Sweep the rotary cache and per-block scratch, then empty the
    /// allocator cache. Returns the number of entries removed.
    pub fn clear_caches(&mut self) -> usize {
        let cleaned = cache::clear_all_caches(&mut self.rope_cache, self.dit.as_mut());
        self.governor.empty_cache();
        cleaned
    }

    pub fn vae_present(&self) -> bool {
        self.vae.is_present()
    }

    /// Construct the VAE (weights on CPU) if it is absent.
    pub fn ensure_vae(&mut self) -> Result<()> {
        let config = self.config.vae.clone();
        self.vae.ensure(&config)?;
        Ok(())
    }

    /// Destroy the VAE and empty the allocator cache.
    pub fn teardown_vae(&mut self) {
        if self.vae.teardown() {
            self.governor.empty_cache();
        }
    }

    pub fn vae_to_device(&mut self, device: &Device) -> Result<()> {
        self.vae.get()?.to_device(device)
    }

    /// Build the conditioning latent with its extra validity channel.
    pub fn get_condition(
        &self,
        latent: &Tensor,
        latent_blur: Option<&Tensor>,
        task: Task,
    ) -> Result<Tensor> {
        let (t, h, w, c) = latent.dims4()?;
        let ones = |frames: usize| Tensor::ones((frames, h, w, 1), latent.dtype(), latent.device());
        let zeros =
            |frames: usize| Tensor::zeros((frames, h, w, c + 1), latent.dtype(), latent.device());

        match task {
            Task::Sr => {
                let blur = latent_blur.ok_or_else(|| {
                    VsrError::Config("sr conditioning requires a blur latent".into())
                })?;
                Ok(Tensor::cat(&[blur, &ones(t)?], 3)?)
            }
            Task::T2v => Ok(zeros(t)?),
            // Single-frame latents degenerate to the unconditional case for
            // the frame-seeded tasks.
            Task::I2v if t == 1 => Ok(zeros(t)?),
            Task::V2v if t < 2 => Ok(zeros(t)?),
            Task::I2v => {
                let head = Tensor::cat(&[&latent.narrow(0, 0, 1)?, &ones(1)?], 3)?;
                Ok(Tensor::cat(&[&head, &zeros(t - 1)?], 0)?)
            }
            Task::V2v => {
                let head = Tensor::cat(&[&latent.narrow(0, 0, 2)?, &ones(2)?], 3)?;
                Ok(Tensor::cat(&[&head, &zeros(t - 2)?], 0)?)
            }
        }
    }

    /// Resolution-aware timestep shift.
    ///
    /// `t' = s·t / (1 + (s − 1)·t)` in normalized time, with the shift `s`
    /// taken from a linear function of pixel area (single frame) or pixel
    /// volume (video).
    pub fn timestep_transform(&self, timesteps: &Tensor, shapes: &ShapeTable) -> Result<Tensor> {
        if !self.config.diffusion.timesteps.transform {
            return Ok(timesteps.clone());
        }
        let vt = self.config.vae.model.temporal_downsample_factor as f64;
        let vs = self.config.vae.model.spatial_downsample_factor as f64;

        let img_shift = lin_function(256.0 * 256.0, 1.0, 1024.0 * 1024.0, 3.2);
        let vid_shift = lin_function(256.0 * 256.0 * 37.0, 1.0, 1280.0 * 720.0 * 145.0, 5.0);

        let t_max = self.schedule.t_max;
        let values: Vec<f32> = timesteps.to_dtype(DType::F32)?.to_vec1()?;
        if values.len() != shapes.len() {
            return Err(VsrError::Shape(format!(
                "{} timesteps for {} shapes",
                values.len(),
                shapes.len()
            )));
        }
        let shifted: Vec<f32> = values
            .iter()
            .zip(&shapes.0)
            .map(|(t, [tl, hl, wl])| {
                let frames = (*tl as f64 - 1.0) * vt + 1.0;
                let height = *hl as f64 * vs;
                let width = *wl as f64 * vs;
                let shift = if frames > 1.0 {
                    vid_shift(height * width * frames)
                } else {
                    img_shift(height * width)
                };
                let tn = *t as f64 / t_max;
                ((shift * tn / (1.0 + (shift - 1.0) * tn)) * t_max) as f32
            })
            .collect();
        let out = Tensor::from_vec(shifted, values.len(), timesteps.device())?;
        Ok(out.to_dtype(timesteps.dtype())?)
    }

    /// Encode pixel videos `(c, t, h, w)` into scaled channels-last
    /// latents `(t_l, h_l, w_l, c_l)`.
    pub fn vae_encode(&mut self, videos: Vec<Tensor>) -> Result<Vec<Tensor>> {
        if videos.is_empty() {
            return Ok(Vec::new());
        }
        let cfg = self.config.vae.clone();
        let dtype = cfg.parse_dtype()?;
        let device = self.device.clone();

        let (batches, indices) = if cfg.grouping {
            packing::pack(&videos)?
        } else {
            singleton_groups(&videos)?
        };

        let vae = self.vae.get()?;
        let mut latents = Vec::with_capacity(batches.len());
        for batch in batches {
            let x = batch.to_device(&device)?.to_dtype(dtype)?;
            let x = vae.preprocess(&x)?;
            let mut latent = vae.encode(&x, cfg.use_sample)?;
            if latent.rank() == 4 {
                latent = latent.unsqueeze(2)?;
            }
            let latent = latent.permute((0, 2, 3, 4, 1))?.contiguous()?;
            let latent = apply_encode_scaling(&latent, &cfg)?;
            latents.push(latent);
        }
        let latents = packing::unpack(&latents, &indices)?;

        for (video, latent) in videos.iter().zip(&latents) {
            check_latent_shape(video, latent, &cfg)?;
        }
        Ok(latents)
    }

    /// Decode scaled channels-last latents back to pixel videos
    /// `(c, t, h, w)`, optionally via the tiled path.
    pub fn vae_decode(
        &mut self,
        latents: Vec<Tensor>,
        target_dtype: DType,
        tiled: bool,
        tile_size: (usize, usize),
        tile_stride: (usize, usize),
    ) -> Result<Vec<Tensor>> {
        if latents.is_empty() {
            return Ok(Vec::new());
        }
        let cfg = self.config.vae.clone();
        let device = self.device.clone();

        if tiled {
            tracing::info!(
                "Tiled VAE decode: tile_size={:?}, tile_stride={:?}",
                tile_size,
                tile_stride
            );
            let mut samples = Vec::with_capacity(latents.len());
            for latent in &latents {
                let prepared = latent
                    .unsqueeze(0)?
                    .to_device(&device)?
                    .to_dtype(target_dtype)?;
                let prepared = apply_decode_scaling(&prepared, &cfg)?;
                let prepared = prepared.permute((0, 4, 1, 2, 3))?.contiguous()?;
                let frames = prepared.dim(2)?;

                let sample = if frames > 1 {
                    tracing::warn!(
                        "Tiled decode needs full temporal context — falling back to standard \
                         decode for a {frames}-frame latent"
                    );
                    let vae = self.vae.get()?;
                    let sample = vae.decode(&prepared)?;
                    normalize_decoded(vae.postprocess(&sample)?)?
                } else {
                    let spatial = prepared.squeeze(2)?;
                    let out = tiled::decode_tiled(
                        self.vae.get()?,
                        &mut self.governor,
                        &device,
                        &spatial,
                        tile_size,
                        tile_stride,
                    )?;
                    normalize_decoded(self.vae.get()?.postprocess(&out)?)?
                };
                samples.push(sample.squeeze(0)?);
            }
            return Ok(samples);
        }

        let (batches, indices) = if cfg.grouping {
            packing::pack(&latents)?
        } else {
            singleton_groups(&latents)?
        };

        let vae = self.vae.get()?;
        let mut samples = Vec::with_capacity(batches.len());
        for batch in batches {
            let latent = batch.to_device(&device)?.to_dtype(target_dtype)?;
            let latent = apply_decode_scaling(&latent, &cfg)?;
            let latent = latent.permute((0, 4, 1, 2, 3))?.contiguous()?;
            let latent = if latent.dim(2)? == 1 {
                latent.squeeze(2)?
            } else {
                latent
            };
            let sample = vae.decode(&latent)?;
            let sample = vae.postprocess(&sample)?;
            samples.push(normalize_decoded(sample)?);
        }
        packing::unpack(&samples, &indices)
    }

    /// Run the sampler over a batch of noises and conditions and decode
    /// the result.
    pub fn inference(
        &mut self,
        noises: Vec<Tensor>,
        conditions: Vec<Tensor>,
        texts_pos: Vec<Tensor>,
        texts_neg: Vec<Tensor>,
        options: &InferenceOptions,
    ) -> Result<Vec<Tensor>> {
        let batch_size = noises.len();
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        if conditions.len() != batch_size
            || texts_pos.len() != batch_size
            || texts_neg.len() != batch_size
        {
            return Err(VsrError::Shape(format!(
                "inference batch mismatch: {} noises, {} conditions, {} pos, {} neg",
                batch_size,
                conditions.len(),
                texts_pos.len(),
                texts_neg.len()
            )));
        }

        let plan = self.precision_plan();
        let cfg_scale = options.cfg_scale.unwrap_or(self.config.diffusion.cfg.scale);
        let dispatcher = CfgDispatcher {
            scale: cfg_scale,
            rescale: self.config.diffusion.cfg.rescale,
            partial: self.config.diffusion.cfg.partial,
        };

        let cast_all = |tensors: Vec<Tensor>| -> Result<Vec<Tensor>> {
            tensors
                .into_iter()
                .map(|t| packing::cast(&t, plan.compute))
                .collect()
        };
        let (txt_pos, pos_lens) = packing::flatten_text(&cast_all(texts_pos)?)?;
        let (txt_neg, neg_lens) = packing::flatten_text(&cast_all(texts_neg)?)?;
        let (latents, vid_shapes) = packing::flatten(&cast_all(noises)?)?;
        let (latents_cond, _) = packing::flatten(&cast_all(conditions)?)?;

        let cond_frames = vid_shapes.0[0][0];
        let dit_preserve = options.dit_preserve_vram.unwrap_or(options.preserve_vram);
        let swap_active = self.block_swap_active();

        // Memory preparation. The VAE is idle during sampling, so it is
        // offloaded whenever VRAM preservation is on; the DiT placement is
        // governed by its own flag and the swap capability.
        if options.preserve_vram || dit_preserve {
            self.governor
                .log_status("inference start", "before moving models");
        }
        if options.preserve_vram && cond_frames > 1 && self.vae.is_present() {
            self.vae.get()?.to_device(&Device::Cpu)?;
            self.governor
                .log_status("vae offloaded", "DiT ready for sampling");
        }
        if dit_preserve {
            if swap_active {
                tracing::info!("Block swap active — skipping DiT GPU movement");
            } else {
                if options.use_blockswap {
                    tracing::warn!(
                        "Block swap requested but not configured on the model — \
                         loading the full DiT to the GPU"
                    );
                }
                self.dit.to_device(&self.device)?;
            }
        }

        if options.use_blockswap {
            let (_, after) = self.governor.release_reserved()?;
            if swap_active {
                let profile = self.governor.gpu_profile();
                let fraction = profile.fraction_for_reserved(after.reserved_gb);
                self.governor.set_memory_fraction(fraction);
            }
            // Without a configured capability the fraction cap stays at 1.0.
        }

        self.governor
            .log_status("before sampling", &format!("block swap: {swap_active}"));

        // Sampling.
        let sampled = {
            let mut guidance = PackedGuidance {
                dit: self.dit.as_mut(),
                swap: self.block_swap.as_mut(),
                cond: &latents_cond,
                txt_pos: &txt_pos,
                txt_neg: &txt_neg,
                vid_shapes: &vid_shapes,
                pos_lens: &pos_lens,
                neg_lens: &neg_lens,
                batch_size,
                compute: plan.compute,
            };
            self.sampler
                .sample(latents, &mut |args| {
                    dispatcher.dispatch(&mut guidance, args.x_t, args.t, args.i, args.steps)
                })
                .map_err(|e| e.in_phase(Phase::Sample))?
        };

        self.governor.log_status("after sampling", "before VAE decode");

        let sample_latents = packing::unflatten(&sampled, &vid_shapes)?;

        if dit_preserve {
            self.dit.to_device(&Device::Cpu)?;
            if cond_frames > 1 {
                self.governor.clear_vram_cache();
            }
        }
        if swap_active {
            // Defragment before the VAE takes the GPU.
            self.governor.synchronize()?;
            let scratch = self.dit.clear_block_scratch();
            if scratch > 0 {
                tracing::debug!("Dropped {scratch} block scratch tensors after swap run");
            }
            self.governor.empty_cache();
        }
        if options.preserve_vram && cond_frames > 1 && self.vae.is_present() {
            self.vae.get()?.to_device(&self.device)?;
            self.governor.log_status("vae resident", "ready for decode");
        }

        let samples = self
            .vae_decode(
                sample_latents,
                plan.decode,
                options.tiled_vae,
                options.tile_size,
                options.tile_stride,
            )
            .map_err(|e| e.in_phase(Phase::Decode))?;

        let samples = samples
            .into_iter()
            .map(|s| packing::cast(&s, DType::F16))
            .collect::<Result<Vec<_>>>()?;

        if options.use_blockswap {
            self.governor.set_memory_fraction(1.0);
        }
        Ok(samples)
    }
}

/// Guidance model over the packed DiT representation, paging blocks
/// through the swap capability when one is installed.
struct PackedGuidance<'a> {
    dit: &'a mut dyn DitModel,
    swap: Option<&'a mut BlockSwap>,
    cond: &'a Tensor,
    txt_pos: &'a Tensor,
    txt_neg: &'a Tensor,
    vid_shapes: &'a ShapeTable,
    pos_lens: &'a [usize],
    neg_lens: &'a [usize],
    batch_size: usize,
    compute: DType,
}

impl PackedGuidance<'_> {
    fn forward(&mut self, x_t: &Tensor, t: f64, positive: bool) -> Result<Tensor> {
        let vid = Tensor::cat(&[x_t, self.cond], 1)?;
        let timestep = Tensor::full(t, self.batch_size, x_t.device())?.to_dtype(self.compute)?;
        let (txt, txt_lens) = if positive {
            (self.txt_pos, self.pos_lens)
        } else {
            (self.txt_neg, self.neg_lens)
        };
        let inputs = DitInputs {
            vid: &vid,
            txt,
            vid_shapes: self.vid_shapes,
            txt_lens,
            timestep: &timestep,
        };

        let mut hidden = self.dit.embed(&inputs)?;
        for idx in 0..self.dit.block_count() {
            if let Some(swap) = self.swap.as_mut() {
                swap.enter_block(&mut *self.dit, idx)?;
            }
            hidden = self.dit.forward_block(idx, &hidden, &inputs)?;
            if let Some(swap) = self.swap.as_mut() {
                swap.exit_block(&mut *self.dit, idx)?;
            }
        }
        self.dit.head(&hidden, &inputs)
    }
}

impl GuidanceModel for PackedGuidance<'_> {
    fn pos_forward(&mut self, x_t: &Tensor, t: f64) -> Result<Tensor> {
        self.forward(x_t, t, true)
    }

    fn neg_forward(&mut self, x_t: &Tensor, t: f64) -> Result<Tensor> {
        self.forward(x_t, t, false)
    }
}

fn lin_function(x1: f64, y1: f64, x2: f64, y2: f64) -> impl Fn(f64) -> f64 {
    let m = (y2 - y1) / (x2 - x1);
    let b = y1 - m * x1;
    move |x| m * x + b
}

fn singleton_groups(samples: &[Tensor]) -> Result<(Vec<Tensor>, Vec<Vec<usize>>)> {
    let batches = samples
        .iter()
        .map(|s| s.unsqueeze(0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let indices = (0..samples.len()).map(|i| vec![i]).collect();
    Ok((batches, indices))
}

/// `(latent − shift) · scale` with scalar or per-channel factors.
fn apply_encode_scaling(latent: &Tensor, cfg: &VaeConfig) -> Result<Tensor> {
    match (&cfg.scaling_factor, &cfg.shifting_factor) {
        (Factor::Scalar(scale), Factor::Scalar(shift)) => {
            Ok(latent.affine(*scale, -shift * scale)?)
        }
        (scale, shift) => {
            let scale = scale.to_tensor(latent.device(), latent.dtype())?;
            let shift = shift.to_tensor(latent.device(), latent.dtype())?;
            Ok(latent.broadcast_sub(&shift)?.broadcast_mul(&scale)?)
        }
    }
}

/// `latent / scale + shift`, the inverse of the encode scaling.
fn apply_decode_scaling(latent: &Tensor, cfg: &VaeConfig) -> Result<Tensor> {
    match (&cfg.scaling_factor, &cfg.shifting_factor) {
        (Factor::Scalar(scale), Factor::Scalar(shift)) => Ok(latent.affine(1.0 / scale, *shift)?),
        (scale, shift) => {
            let scale = scale.to_tensor(latent.device(), latent.dtype())?;
            let shift = shift.to_tensor(latent.device(), latent.dtype())?;
            Ok(latent.broadcast_div(&scale)?.broadcast_add(&shift)?)
        }
    }
}

/// Normalize a decoded batch to `(b, c, t, h, w)`.
fn normalize_decoded(sample: Tensor) -> Result<Tensor> {
    if sample.rank() == 4 {
        Ok(sample.unsqueeze(2)?)
    } else {
        Ok(sample)
    }
}

/// Verify encoded latent dimensions against the configured downsample
/// factors.
fn check_latent_shape(video: &Tensor, latent: &Tensor, cfg: &VaeConfig) -> Result<()> {
    let (_c, t, h, w) = video.dims4()?;
    let vt = cfg.model.temporal_downsample_factor;
    let vs = cfg.model.spatial_downsample_factor;
    let expected = [(t - 1) / vt + 1, h / vs, w / vs];
    let got = latent.dims();
    if got.len() != 4 || got[0] != expected[0] || got[1] != expected[1] || got[2] != expected[2] {
        return Err(VsrError::Shape(format!(
            "latent {:?} inconsistent with video {:?} at downsample factors ({vt}, {vs}); \
             expected ({}, {}, {}, c)",
            got,
            video.dims(),
            expected[0],
            expected[1],
            expected[2]
        )));
    }
    Ok(())
}
