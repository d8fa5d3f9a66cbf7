//! Generation loop.
//!
//! Splits the input frames into overlapping batches, drives the
//! transform → encode → sample → decode sequence per batch, reconciles the
//! VAE lifecycle under VRAM preservation, reports progress and assembles
//! the final frame sequence.

pub mod color;
pub mod transforms;

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use crate::config::BlockSwapSettings;
use crate::error::{Phase, Result, VsrError};
use crate::infer::{InferenceEngine, InferenceOptions, Task};
use crate::packing::ShapeTable;
use crate::sampling::NoiseSource;

/// Precomputed positive/negative text embeddings.
#[derive(Clone)]
pub struct TextEmbeddings {
    pub pos: Tensor,
    pub neg: Tensor,
}

impl TextEmbeddings {
    /// Load `pos_emb.pt` / `neg_emb.pt` from a directory.
    pub fn load(dir: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let pos = load_pt_tensor(&dir.join("pos_emb.pt"))?;
        let neg = load_pt_tensor(&dir.join("neg_emb.pt"))?;
        tracing::info!(
            "Text embeddings loaded from {}: pos {:?}, neg {:?}",
            dir.display(),
            pos.dims(),
            neg.dims()
        );
        Self { pos, neg }.to(device, dtype)
    }

    /// Move both embeddings to a device and dtype.
    pub fn to(&self, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            pos: self.pos.to_device(device)?.to_dtype(dtype)?,
            neg: self.neg.to_device(device)?.to_dtype(dtype)?,
        })
    }
}

fn load_pt_tensor(path: &Path) -> Result<Tensor> {
    let tensors = candle_core::pickle::read_all(path)?;
    tensors
        .into_iter()
        .next()
        .map(|(_, t)| t)
        .ok_or_else(|| VsrError::Config(format!("{} holds no tensors", path.display())))
}

/// Parameters for one `generate` call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub cfg_scale: f64,
    pub seed: u64,
    /// Target length of the longer spatial side.
    pub target_width: usize,
    pub batch_size: usize,
    pub preserve_vram: bool,
    pub temporal_overlap: usize,
    pub block_swap: Option<BlockSwapSettings>,
    pub tiled_vae: bool,
    pub tile_size: (usize, usize),
    pub tile_stride: (usize, usize),
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            cfg_scale: 1.0,
            seed: 666,
            target_width: 720,
            batch_size: 90,
            preserve_vram: false,
            temporal_overlap: 0,
            block_swap: None,
            tiled_vae: false,
            tile_size: (64, 64),
            tile_stride: (32, 32),
        }
    }
}

impl GenerationRequest {
    /// Request seeded from the configured runtime flags.
    pub fn from_runtime(
        runtime: &crate::config::RuntimeConfig,
        cfg_scale: f64,
        seed: u64,
        target_width: usize,
    ) -> Self {
        Self {
            cfg_scale,
            seed,
            target_width,
            batch_size: runtime.batch_size,
            preserve_vram: runtime.preserve_vram,
            temporal_overlap: runtime.temporal_overlap,
            block_swap: runtime.block_swap,
            tiled_vae: runtime.tiled_vae,
            tile_size: runtime.tile_size,
            tile_stride: runtime.tile_stride,
        }
    }
}

/// Host callbacks, all optional.
#[derive(Default)]
pub struct GenerationCallbacks<'a> {
    /// `(batch_number, total_batches, frame_count, description)` after
    /// each batch.
    pub progress: Option<Box<dyn FnMut(usize, usize, usize, &str) + 'a>>,
    /// `(frames, batch_index, start, end)` after each batch; frames are
    /// FP16 on CPU in `(t, h, w, c)` layout.
    pub frame_save: Option<Box<dyn FnMut(&Tensor, usize, usize, usize) -> Result<()> + 'a>>,
    /// Per-batch wall time in seconds.
    pub batch_time: Option<Box<dyn FnMut(f64) + 'a>>,
    /// Cancellation probe, checked at batch boundaries.
    pub cancelled: Option<Box<dyn Fn() -> bool + 'a>>,
}

impl GenerationCallbacks<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().is_some_and(|probe| probe())
    }
}

/// Advisory batch-size hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHint {
    /// Largest 4n+1 batch size not exceeding the frame count (capped at
    /// 200).
    pub best: usize,
    /// Frames of padding the current batch size will waste.
    pub padding_waste: usize,
}

/// Compute the optimal-batch hint; `None` when the user's batch size is
/// already of 4n+1 form or no candidate fits.
pub fn optimal_batch_hint(total_frames: usize, batch_size: usize) -> Option<BatchHint> {
    let candidates: Vec<usize> = (1..200).filter(|i| i % 4 == 1).collect();
    let best = candidates
        .iter()
        .copied()
        .filter(|b| *b <= total_frames)
        .max()?;
    if best == batch_size {
        return None;
    }
    let padding_waste = if candidates.contains(&batch_size) {
        0
    } else {
        (batch_size..total_frames)
            .step_by(batch_size.max(1))
            .map(|i| (i / 4 + 1) * 4 + 1 - i)
            .sum()
    };
    Some(BatchHint {
        best,
        padding_waste,
    })
}

fn format_duration(seconds: f64) -> String {
    if seconds > 60.0 {
        let minutes = (seconds / 60.0) as u64;
        let secs = (seconds % 60.0) as u64;
        format!("{minutes}m {secs}s")
    } else {
        format!("{}s", seconds as u64)
    }
}

/// Upscale a frame sequence.
///
/// `frames` is `(n, h, w, 3)` in `[0, 1]` on the CPU. Returns the full
/// output sequence `(n, H, W, 3)` in FP16 on the CPU. `embeddings`
/// overrides the on-disk `pos_emb.pt`/`neg_emb.pt` pair when the session
/// layer has already loaded them.
pub fn generate(
    engine: &mut InferenceEngine,
    frames: &Tensor,
    request: &GenerationRequest,
    callbacks: &mut GenerationCallbacks<'_>,
    embeddings: Option<TextEmbeddings>,
) -> Result<Tensor> {
    let total_frames = frames.dim(0)?;
    if total_frames == 0 {
        tracing::warn!("No input frames — nothing to generate");
        return Ok(Tensor::zeros((0, 0, 0, 0), DType::F16, &Device::Cpu)?);
    }

    if let Some(settings) = &request.block_swap {
        if settings.blocks_to_swap > 0 && !engine.block_swap_active() {
            engine.configure_block_swap(settings)?;
        }
        if settings.blocks_to_swap > 0 {
            tracing::info!(
                "Generation starting with block swap: {} blocks",
                settings.blocks_to_swap
            );
        }
    }

    let plan = engine.precision_plan();
    tracing::debug!(
        "Precision plan: compute {:?}, vae {:?}, decode {:?}",
        plan.compute,
        plan.vae,
        plan.decode
    );

    if let Some(hint) = optimal_batch_hint(total_frames, request.batch_size) {
        tracing::info!(
            "TIP: for {} frames, batch_size={} avoids padding",
            total_frames,
            hint.best
        );
        if hint.padding_waste > 0 {
            tracing::info!("Currently ~{} wasted padding frames", hint.padding_waste);
        }
    }

    engine.config_mut().diffusion.cfg.scale = request.cfg_scale;
    engine.configure_diffusion()?;

    let mut noise = NoiseSource::new(request.seed);

    let embeds = match embeddings {
        Some(e) => e.to(engine.device(), plan.compute)?,
        None => {
            let dir = engine.config().embedding_dir.clone();
            TextEmbeddings::load(&dir, engine.device(), plan.compute)?
        }
    };

    engine.governor_mut().reset_peak();

    let mut overlap = request.temporal_overlap;
    let mut step = request.batch_size.saturating_sub(overlap);
    if step == 0 {
        step = request.batch_size;
        overlap = 0;
    }
    let total_batches = total_frames.div_ceil(step);

    let started = Instant::now();
    let mut batch_times: Vec<f64> = Vec::new();

    let outcome = run_batches(
        engine,
        frames,
        request,
        callbacks,
        &embeds,
        &mut noise,
        BatchPlan {
            total_frames,
            step,
            overlap,
            total_batches,
        },
        &mut batch_times,
    );

    // Cleanup runs on every exit path: release the embeddings, tear down
    // the VAE under preservation, return cached pages.
    drop(embeds);
    if request.preserve_vram && engine.vae_present() {
        engine.teardown_vae();
    }
    engine.governor_mut().empty_cache();

    let outputs = outcome?;
    let result = concatenate_batches(engine, outputs)?;

    if !batch_times.is_empty() {
        let total = started.elapsed().as_secs_f64();
        let avg = batch_times.iter().sum::<f64>() / batch_times.len() as f64;
        tracing::info!(
            "Generation complete! Total time: {} | {} batches | avg {:.1}s per batch",
            format_duration(total),
            batch_times.len(),
            avg
        );
    }
    Ok(result)
}

struct BatchPlan {
    total_frames: usize,
    step: usize,
    overlap: usize,
    total_batches: usize,
}

#[allow(clippy::too_many_arguments)]
fn run_batches(
    engine: &mut InferenceEngine,
    frames: &Tensor,
    request: &GenerationRequest,
    callbacks: &mut GenerationCallbacks<'_>,
    embeds: &TextEmbeddings,
    noise: &mut NoiseSource,
    plan: BatchPlan,
    batch_times: &mut Vec<f64>,
) -> Result<Vec<Tensor>> {
    let device = engine.device().clone();
    let compute = engine.precision_plan().compute;
    let n = plan.total_frames;

    let mut outputs = Vec::new();
    let mut batch_count = 0usize;
    let mut batch_idx = 0usize;

    while batch_idx < n {
        if callbacks.is_cancelled() {
            tracing::info!("Cancellation requested — stopping at batch boundary");
            break;
        }

        if request.preserve_vram && !engine.vae_present() {
            engine.ensure_vae()?;
        }

        let start = batch_idx;
        let end = (batch_idx + request.batch_size).min(n);
        let effective = end - start;
        let is_first = batch_idx == 0;
        if !is_first && effective <= plan.overlap {
            break;
        }

        let batch_number = batch_idx / plan.step + 1;
        let percent = batch_number * 100 / plan.total_batches;
        tracing::info!(
            "Batch {}/{} ({}%): frames {}-{} | {} frames left",
            batch_number,
            plan.total_batches,
            percent,
            start,
            end - 1,
            n - end
        );
        let tick = Instant::now();

        let video = frames
            .narrow(0, start, effective)?
            .permute((0, 3, 1, 2))?
            .to_device(&device)?
            .to_dtype(compute)?;
        let mut transformed = transforms::apply_video_transform(&video, request.target_width)
            .map_err(|e| e.in_batch(batch_count, Phase::Encode))?;
        drop(video);

        let original_length = transformed.dim(1)?;
        tracing::debug!("Sequence of {original_length} frames");
        if original_length % 4 != 1 {
            transformed = transforms::pad_to_temporal_stride(&transformed)?;
        }

        engine
            .vae_to_device(&device)
            .map_err(|e| e.in_phase(Phase::Encode).in_batch(batch_count, Phase::Encode))?;
        let cond_latents = engine
            .vae_encode(vec![transformed.clone()])
            .map_err(|e| e.in_phase(Phase::Encode).in_batch(batch_count, Phase::Encode))?;
        if request.preserve_vram {
            transformed = transformed.to_device(&Device::Cpu)?;
        }

        let sample = generation_step(engine, embeds, request, cond_latents, noise)
            .map_err(|e| e.in_batch(batch_count, Phase::Sample))?;

        let sample = if original_length < sample.dim(0)? {
            sample.narrow(0, 0, original_length)?
        } else {
            sample
        };

        if !transformed.device().same_device(&device) {
            transformed = transformed.to_device(&device)?;
        }
        let input_video = transforms::to_frame_major(&transformed)?;
        let sample_len = sample.dim(0)?;
        let sample =
            color::wavelet_reconstruction(&sample, &input_video.narrow(0, 0, sample_len)?)?;
        let sample = transforms::to_image_format(&sample)?;
        let sample = sample.clamp(-1.0, 1.0)?.affine(0.5, 0.5)?;
        let sample = sample.to_dtype(DType::F16)?.to_device(&Device::Cpu)?;

        // Non-first batches re-generate the overlap region for temporal
        // context; only the fresh tail is emitted.
        let (emit, emit_start) = if !is_first && plan.overlap > 0 {
            let len = sample.dim(0)? - plan.overlap;
            (sample.narrow(0, plan.overlap, len)?, start + plan.overlap)
        } else {
            (sample, start)
        };
        let emit_len = emit.dim(0)?;
        outputs.push(emit.clone());

        if let Some(cb) = callbacks.frame_save.as_mut() {
            cb(&emit, batch_count, emit_start, emit_start + emit_len)?;
        }
        if let Some(cb) = callbacks.progress.as_mut() {
            cb(
                batch_number,
                plan.total_batches,
                effective,
                &format!("frames {}-{}", start, end - 1),
            );
        }

        let batch_time = tick.elapsed().as_secs_f64();
        batch_times.push(batch_time);
        let avg = batch_times.iter().sum::<f64>() / batch_times.len() as f64;
        let remaining = plan.total_batches.saturating_sub(batch_number);
        tracing::info!(
            "Batch time: {:.1}s | Avg: {:.1}s | ETA: {}",
            batch_time,
            avg,
            format_duration(avg * remaining as f64)
        );
        if let Some(cb) = callbacks.batch_time.as_mut() {
            cb(batch_time);
        }

        if request.preserve_vram {
            engine.teardown_vae();
        }

        batch_count += 1;
        batch_idx += plan.step;
    }

    Ok(outputs)
}

/// One batch through noise construction, conditioning and inference.
/// Returns the decoded sample in frame-major `(t, c, h, w)` layout.
fn generation_step(
    engine: &mut InferenceEngine,
    embeds: &TextEmbeddings,
    request: &GenerationRequest,
    cond_latents: Vec<Tensor>,
    noise: &mut NoiseSource,
) -> Result<Tensor> {
    let plan = engine.precision_plan();
    let device = engine.device().clone();

    let cond = cond_latents
        .into_iter()
        .next()
        .ok_or_else(|| VsrError::Shape("encode produced no latent".into()))?
        .to_device(&device)?
        .to_dtype(plan.compute)?;

    let base_noise = noise.randn_like(&cond)?;
    let aug_noise =
        (base_noise.affine(0.1, 0.0)? + noise.randn_like(&base_noise)?.affine(0.05, 0.0)?)?;

    // The conditioning latent is "noised" at level zero: the transform and
    // schedule still run so a nonzero scale is a config-only change.
    let cond_noise_scale = 0.0;
    let (t_l, h_l, w_l, _c) = cond.dims4()?;
    let shapes = ShapeTable(vec![[t_l, h_l, w_l]]);
    let t_raw = Tensor::from_vec(
        vec![(engine.schedule().t_max * cond_noise_scale) as f32],
        1,
        &device,
    )?;
    let t_shifted = engine.timestep_transform(&t_raw, &shapes)?;
    let t_value = t_shifted.to_dtype(DType::F32)?.to_vec1::<f32>()?[0] as f64;
    let noised_blur = engine.schedule().forward(&cond, &aug_noise, t_value)?;

    let condition = engine.get_condition(&base_noise, Some(&noised_blur), Task::Sr)?;

    let use_blockswap = engine.block_swap_active();
    let options = InferenceOptions {
        cfg_scale: Some(request.cfg_scale),
        preserve_vram: request.preserve_vram,
        use_blockswap,
        // Block swap owns DiT placement; plain offload would fight it.
        dit_preserve_vram: Some(request.preserve_vram && !use_blockswap),
        tiled_vae: request.tiled_vae,
        tile_size: request.tile_size,
        tile_stride: request.tile_stride,
    };

    let tick = Instant::now();
    let videos = engine.inference(
        vec![base_noise],
        vec![condition],
        vec![embeds.pos.clone()],
        vec![embeds.neg.clone()],
        &options,
    )?;
    tracing::debug!("Inference time: {:.2}s", tick.elapsed().as_secs_f64());

    let video = videos
        .into_iter()
        .next()
        .ok_or_else(|| VsrError::Model("inference returned no samples".into()))?;
    transforms::to_frame_major(&video)
}

/// Assemble per-batch outputs into one preallocated `(Σt, h, w, c)` FP16
/// tensor, concatenating in 500-batch blocks on the compute device.
fn concatenate_batches(engine: &mut InferenceEngine, batches: Vec<Tensor>) -> Result<Tensor> {
    if batches.is_empty() {
        tracing::warn!("No batch samples to assemble");
        return Ok(Tensor::zeros((0, 0, 0, 0), DType::F16, &Device::Cpu)?);
    }
    let total: usize = batches
        .iter()
        .map(|b| b.dim(0))
        .collect::<candle_core::Result<Vec<_>>>()?
        .into_iter()
        .sum();
    let dims = batches[0].dims().to_vec();
    let (h, w, c) = (dims[1], dims[2], dims[3]);
    tracing::info!(
        "Assembling {} batches into {} frames of {}x{}x{}",
        batches.len(),
        total,
        h,
        w,
        c
    );

    let device = engine.device().clone();
    let mut out = Tensor::zeros((total, h, w, c), DType::F16, &Device::Cpu)?;
    let mut cursor = 0usize;
    const BLOCK: usize = 500;

    for chunk in batches.chunks(BLOCK) {
        let moved = chunk
            .iter()
            .map(|b| b.to_device(&device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = moved.iter().collect();
        let block = Tensor::cat(&refs, 0)?;
        let len = block.dim(0)?;
        let block = block.to_device(&Device::Cpu)?.to_dtype(DType::F16)?;
        out = out.slice_assign(&[cursor..cursor + len, 0..h, 0..w, 0..c], &block)?;
        cursor += len;
        engine.governor_mut().empty_cache();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::memory::MemoryGovernor;
    use crate::memory::vram::NullVramProvider;
    use crate::testing::{test_config, test_embeddings, CountingVaeFactory, MockDit, MockVae};

    const H: usize = 32;
    const W: usize = 32;

    fn input_frames(n: usize) -> Tensor {
        let count = n * H * W * 3;
        let values: Vec<f32> = (0..count).map(|i| (i % 29) as f32 / 29.0).collect();
        Tensor::from_vec(values, (n, H, W, 3), &Device::Cpu).unwrap()
    }

    struct Harness {
        engine: InferenceEngine,
        built: Arc<AtomicUsize>,
        alive: Arc<AtomicUsize>,
    }

    fn harness_with_dit(dit: MockDit, seed_vae: bool) -> Harness {
        let factory = CountingVaeFactory::new();
        let built = factory.built.clone();
        let alive = factory.alive.clone();
        let governor = MemoryGovernor::new(Box::new(NullVramProvider), Device::Cpu);
        let engine = if seed_vae {
            let vae = Box::new(MockVae::new(
                factory.alive.clone(),
                factory.device_moves.clone(),
            ));
            InferenceEngine::with_vae(
                test_config(),
                Device::Cpu,
                Box::new(dit),
                Box::new(factory),
                vae,
                governor,
            )
            .unwrap()
        } else {
            InferenceEngine::new(
                test_config(),
                Device::Cpu,
                Box::new(dit),
                Box::new(factory),
                governor,
            )
            .unwrap()
        };
        Harness {
            engine,
            built,
            alive,
        }
    }

    fn harness(seed_vae: bool) -> Harness {
        harness_with_dit(MockDit::new(candle_core::DType::F32, 4, 3), seed_vae)
    }

    fn request(batch_size: usize, overlap: usize) -> GenerationRequest {
        GenerationRequest {
            target_width: W,
            batch_size,
            temporal_overlap: overlap,
            ..Default::default()
        }
    }

    fn embeddings() -> TextEmbeddings {
        let (pos, neg) = test_embeddings();
        TextEmbeddings { pos, neg }
    }

    #[test]
    fn test_output_frame_count_matches_input() {
        for (n, batch, overlap) in [
            (1usize, 1usize, 0usize),
            (4, 4, 0),
            (9, 5, 0),
            (10, 5, 2),
            (13, 5, 1),
        ] {
            let mut h = harness(true);
            let frames = input_frames(n);
            let out = generate(
                &mut h.engine,
                &frames,
                &request(batch, overlap),
                &mut GenerationCallbacks::default(),
                Some(embeddings()),
            )
            .unwrap();
            assert_eq!(
                out.dims(),
                [n, H, W, 3],
                "n={n} batch={batch} overlap={overlap}"
            );
            assert_eq!(out.dtype(), DType::F16);
        }
    }

    #[test]
    fn test_single_frame_batch() {
        let mut h = harness(true);
        let frames = input_frames(1);
        let out = generate(
            &mut h.engine,
            &frames,
            &request(1, 0),
            &mut GenerationCallbacks::default(),
            Some(embeddings()),
        )
        .unwrap();
        assert_eq!(out.dims(), [1, H, W, 3]);
    }

    #[test]
    fn test_two_batch_origins_and_eta() {
        // 91 frames, batch 89, overlap 8: origins 0 and 81.
        let mut h = harness(true);
        let frames = input_frames(91);
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let ranges_cb = ranges.clone();
        let times = Arc::new(Mutex::new(Vec::new()));
        let times_cb = times.clone();
        let mut callbacks = GenerationCallbacks {
            progress: Some(Box::new(move |batch, total, frames, desc: &str| {
                ranges_cb
                    .lock()
                    .unwrap()
                    .push((batch, total, frames, desc.to_string()));
            })),
            batch_time: Some(Box::new(move |t| times_cb.lock().unwrap().push(t))),
            ..Default::default()
        };
        let out = generate(
            &mut h.engine,
            &frames,
            &request(89, 8),
            &mut callbacks,
            Some(embeddings()),
        )
        .unwrap();
        assert_eq!(out.dim(0).unwrap(), 91);

        let seen = ranges.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[0].3, "frames 0-88");
        assert_eq!(seen[1].3, "frames 81-90");
        // Batch times reported for both batches.
        assert_eq!(times.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_frame_save_receives_contiguous_ranges() {
        let mut h = harness(true);
        let frames = input_frames(10);
        let saved = Arc::new(Mutex::new(Vec::new()));
        let saved_cb = saved.clone();
        let mut callbacks = GenerationCallbacks {
            frame_save: Some(Box::new(move |tensor, batch, start, end| {
                saved_cb
                    .lock()
                    .unwrap()
                    .push((tensor.dim(0).unwrap(), batch, start, end));
                Ok(())
            })),
            ..Default::default()
        };
        generate(
            &mut h.engine,
            &frames,
            &request(5, 2),
            &mut callbacks,
            Some(embeddings()),
        )
        .unwrap();

        let calls = saved.lock().unwrap().clone();
        // Ranges tile [0, 10) without gaps or duplicates.
        let mut expected_start = 0;
        for (len, _batch, start, end) in &calls {
            assert_eq!(*start, expected_start);
            assert_eq!(*end, start + len);
            expected_start = *end;
        }
        assert_eq!(expected_start, 10);
    }

    #[test]
    fn test_preserve_vram_rebuilds_and_tears_down_vae() {
        let mut h = harness(false);
        let frames = input_frames(10);
        let mut req = request(5, 0);
        req.preserve_vram = true;
        generate(
            &mut h.engine,
            &frames,
            &req,
            &mut GenerationCallbacks::default(),
            Some(embeddings()),
        )
        .unwrap();
        // One construction per batch, none left alive afterwards.
        assert_eq!(h.built.load(Ordering::SeqCst), 2);
        assert_eq!(h.alive.load(Ordering::SeqCst), 0);
        assert!(!h.engine.vae_present());
    }

    #[test]
    fn test_oom_in_third_batch_surfaces_after_two_callbacks() {
        let mut dit = MockDit::new(candle_core::DType::F32, 4, 3);
        dit.fail_on_embed = Some(3);
        let mut h = harness_with_dit(dit, false);
        let frames = input_frames(15);
        let mut req = request(5, 0);
        req.preserve_vram = true;

        let saves = Arc::new(AtomicUsize::new(0));
        let saves_cb = saves.clone();
        let mut callbacks = GenerationCallbacks {
            frame_save: Some(Box::new(move |_t, _b, _s, _e| {
                saves_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            ..Default::default()
        };

        let err = generate(&mut h.engine, &frames, &req, &mut callbacks, Some(embeddings()))
            .unwrap_err();
        assert!(err.is_out_of_memory());
        match &err {
            VsrError::Batch { index, .. } => assert_eq!(*index, 2),
            other => panic!("expected batch error, got {other}"),
        }
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        // The cleanup path tore the VAE down despite the error.
        assert_eq!(h.alive.load(Ordering::SeqCst), 0);
        assert!(!h.engine.vae_present());
    }

    #[test]
    fn test_cancellation_is_clean_early_exit() {
        let mut h = harness(true);
        let frames = input_frames(15);
        let cancel_after = Arc::new(AtomicUsize::new(0));
        let counter = cancel_after.clone();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_probe = flag.clone();
        let flag_set = flag.clone();
        let mut callbacks = GenerationCallbacks {
            cancelled: Some(Box::new(move || flag_probe.load(Ordering::SeqCst))),
            progress: Some(Box::new(move |_b, _t, _f, _d: &str| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    flag_set.store(true, Ordering::SeqCst);
                }
            })),
            ..Default::default()
        };
        let out = generate(
            &mut h.engine,
            &frames,
            &request(5, 0),
            &mut callbacks,
            Some(embeddings()),
        )
        .unwrap();
        // One batch completed before the cancel was observed.
        assert_eq!(out.dim(0).unwrap(), 5);
    }

    #[test]
    fn test_identical_seeds_reproduce_identical_bits() {
        let run = |seed: u64| -> Vec<f32> {
            let mut h = harness(true);
            let frames = input_frames(9);
            let mut req = request(9, 0);
            req.seed = seed;
            let out = generate(
                &mut h.engine,
                &frames,
                &req,
                &mut GenerationCallbacks::default(),
                Some(embeddings()),
            )
            .unwrap();
            out.to_dtype(DType::F32)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        let a = run(666);
        let b = run(666);
        assert_eq!(a, b);
        let c = run(1234);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tiled_and_standard_decode_agree_end_to_end() {
        let run = |tiled: bool| -> Vec<f32> {
            let mut h = harness(true);
            let frames = input_frames(1);
            let mut req = request(1, 0);
            // A single tile covering the whole latent, no overlap.
            req.tiled_vae = tiled;
            req.tile_size = (64, 64);
            req.tile_stride = (64, 64);
            let out = generate(
                &mut h.engine,
                &frames,
                &req,
                &mut GenerationCallbacks::default(),
                Some(embeddings()),
            )
            .unwrap();
            out.to_dtype(DType::F32)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn test_optimal_batch_hint() {
        // 90 frames: best 4n+1 batch is 89. A single 90-frame batch has no
        // further batch origins, so the waste estimate is zero.
        let hint = optimal_batch_hint(90, 90).unwrap();
        assert_eq!(hint.best, 89);
        assert_eq!(hint.padding_waste, 0);

        // Multiple misaligned batches accumulate waste.
        let hint = optimal_batch_hint(10, 3).unwrap();
        assert_eq!(hint.best, 9);
        assert_eq!(hint.padding_waste, 9);

        // Already optimal: no hint.
        assert!(optimal_batch_hint(90, 89).is_none());

        // Tiny inputs still produce a candidate.
        let hint = optimal_batch_hint(3, 2).unwrap();
        assert_eq!(hint.best, 1);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.7), "42s");
        assert_eq!(format_duration(135.0), "2m 15s");
    }

    #[test]
    fn test_empty_input_returns_empty_tensor() {
        let mut h = harness(true);
        let frames = Tensor::zeros((0, H, W, 3), DType::F32, &Device::Cpu).unwrap();
        let out = generate(
            &mut h.engine,
            &frames,
            &request(5, 0),
            &mut GenerationCallbacks::default(),
            Some(embeddings()),
        )
        .unwrap();
        assert_eq!(out.elem_count(), 0);
    }
}
