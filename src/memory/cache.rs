//! Rotary-embedding frequency cache.
//!
//! Frequency tensors are memoized by `(video_shape, text_len)` key. The
//! cache is warmed for common shapes before the first forward (a cold
//! first call can OOM on small cards) and swept together with per-block
//! scratch state on teardown. The registry only ever holds cache entries,
//! so a sweep cannot remove structural module state.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::Result;
use crate::models::DitModel;

/// Cache key: latent video shape plus text sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RopeKey {
    pub vid: [usize; 3],
    pub txt: usize,
}

impl std::fmt::Display for RopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vid({},{},{})_txt({})",
            self.vid[0], self.vid[1], self.vid[2], self.txt
        )
    }
}

/// Shape keys warmed at startup: single frame, short clips at the smallest
/// latent grid, and one step up in resolution, all at the standard text
/// length.
pub const WARMUP_KEYS: [RopeKey; 4] = [
    RopeKey { vid: [1, 3, 3], txt: 77 },
    RopeKey { vid: [4, 3, 3], txt: 77 },
    RopeKey { vid: [5, 3, 3], txt: 77 },
    RopeKey { vid: [1, 4, 4], txt: 77 },
];

/// Keyed rotary frequency cache.
#[derive(Default)]
pub struct RopeFreqCache {
    entries: HashMap<RopeKey, Tensor>,
}

impl RopeFreqCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &RopeKey) -> Option<&Tensor> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: RopeKey, freqs: Tensor) {
        self.entries.insert(key, freqs);
    }

    /// Look up or compute-and-store the frequencies for a key.
    pub fn get_or_try_insert<F>(&mut self, key: RopeKey, compute: F) -> Result<&Tensor>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if !self.entries.contains_key(&key) {
            let freqs = compute()?;
            self.entries.insert(key, freqs);
        }
        Ok(self.entries.get(&key).expect("entry just inserted"))
    }

    /// Drop every entry. Returns the number removed.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}

/// Warm the frequency cache for the common shape keys.
///
/// Failures are soft: the model still works, but the first forward for an
/// uncached shape may hit an allocation spike.
pub fn preinitialize_rope_cache(cache: &mut RopeFreqCache, dit: &mut dyn DitModel) {
    for key in WARMUP_KEYS {
        if cache.get(&key).is_some() {
            continue;
        }
        match dit.rope_freqs(&key) {
            Ok(freqs) => {
                cache.insert(key, freqs);
            }
            Err(e) => {
                tracing::warn!(
                    "RoPE pre-init failed for {}: {} — first call for this shape may OOM",
                    key,
                    e
                );
            }
        }
    }
    tracing::debug!("RoPE cache warmed: {} entries", cache.len());
}

/// Sweep every cache the pipeline owns: the rotary frequency cache and the
/// per-block scratch tensors on the DiT. Returns the total number of
/// entries removed.
pub fn clear_all_caches(cache: &mut RopeFreqCache, dit: &mut dyn DitModel) -> usize {
    let mut cleaned = cache.clear();
    if cleaned > 0 {
        tracing::debug!("Cleared {} rotary frequency cache entries", cleaned);
    }
    let scratch = dit.clear_block_scratch();
    if scratch > 0 {
        tracing::debug!("Cleared {} scratch tensors from blocks", scratch);
    }
    cleaned += scratch;
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    use crate::models::DitInputs;

    struct FreqDit {
        fail: bool,
        scratch: usize,
    }

    impl DitModel for FreqDit {
        fn weights_dtype(&self) -> DType {
            DType::F32
        }
        fn device(&self) -> Device {
            Device::Cpu
        }
        fn to_device(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn block_count(&self) -> usize {
            1
        }
        fn move_block(&mut self, _idx: usize, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn block_device(&self, _idx: usize) -> Device {
            Device::Cpu
        }
        fn move_io_modules(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn embed(&mut self, inputs: &DitInputs<'_>) -> Result<Tensor> {
            Ok(inputs.vid.clone())
        }
        fn forward_block(
            &mut self,
            _idx: usize,
            hidden: &Tensor,
            _inputs: &DitInputs<'_>,
        ) -> Result<Tensor> {
            Ok(hidden.clone())
        }
        fn head(&mut self, hidden: &Tensor, _inputs: &DitInputs<'_>) -> Result<Tensor> {
            Ok(hidden.clone())
        }
        fn rope_freqs(&mut self, key: &RopeKey) -> Result<Tensor> {
            if self.fail {
                return Err(crate::error::VsrError::Model("no freqs".into()));
            }
            let tokens = key.vid[0] * key.vid[1] * key.vid[2];
            Tensor::zeros((tokens, 64), DType::F32, &Device::Cpu).map_err(Into::into)
        }
        fn clear_block_scratch(&mut self) -> usize {
            std::mem::take(&mut self.scratch)
        }
    }

    #[test]
    fn test_preinit_warms_common_shapes() {
        let mut cache = RopeFreqCache::new();
        let mut dit = FreqDit {
            fail: false,
            scratch: 0,
        };
        preinitialize_rope_cache(&mut cache, &mut dit);
        assert_eq!(cache.len(), WARMUP_KEYS.len());
        assert!(cache.get(&RopeKey { vid: [5, 3, 3], txt: 77 }).is_some());
    }

    #[test]
    fn test_preinit_failure_is_soft() {
        let mut cache = RopeFreqCache::new();
        let mut dit = FreqDit {
            fail: true,
            scratch: 0,
        };
        preinitialize_rope_cache(&mut cache, &mut dit);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_try_insert_memoizes() {
        let mut cache = RopeFreqCache::new();
        let key = RopeKey { vid: [2, 2, 2], txt: 77 };
        let mut calls = 0;
        for _ in 0..3 {
            cache
                .get_or_try_insert(key, || {
                    calls += 1;
                    Tensor::zeros((8, 64), DType::F32, &Device::Cpu).map_err(Into::into)
                })
                .unwrap();
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_sweep_counts_all_caches() {
        let mut cache = RopeFreqCache::new();
        let mut dit = FreqDit {
            fail: false,
            scratch: 5,
        };
        preinitialize_rope_cache(&mut cache, &mut dit);
        let cleaned = clear_all_caches(&mut cache, &mut dit);
        assert_eq!(cleaned, WARMUP_KEYS.len() + 5);
        assert!(cache.is_empty());
    }
}
