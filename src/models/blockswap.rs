//! Block-swap paging for the DiT.
//!
//! Keeps a trailing suffix of transformer blocks on the CPU and pages each
//! one onto the GPU only for the duration of its own forward call. The
//! capability is installed once per session; while it is active the engine
//! must never move the full model to the GPU.

use candle_core::Device;

use crate::error::{Result, VsrError};
use crate::models::DitModel;

/// Residency record for one pageable block.
#[derive(Debug, Clone)]
pub struct BlockResidency {
    pub idx: usize,
    pub resident: Device,
}

/// Installed block-swap capability.
pub struct BlockSwap {
    first_swapped: usize,
    block_count: usize,
    compute: Device,
    offload: Device,
    records: Vec<BlockResidency>,
}

impl BlockSwap {
    /// Install paging on a DiT: the non-swapped prefix and all IO modules
    /// (embeddings, norms, heads) go to the compute device, the trailing
    /// `blocks_to_swap` blocks go to the offload device.
    pub fn install(
        dit: &mut dyn DitModel,
        blocks_to_swap: usize,
        compute: &Device,
    ) -> Result<Self> {
        let block_count = dit.block_count();
        if block_count == 0 {
            return Err(VsrError::Model(
                "block swap requested on a model with no blocks".into(),
            ));
        }
        let swapped = blocks_to_swap.min(block_count);
        let first_swapped = block_count - swapped;
        let offload = Device::Cpu;

        dit.move_io_modules(compute)?;
        for idx in 0..first_swapped {
            dit.move_block(idx, compute)?;
        }
        for idx in first_swapped..block_count {
            dit.move_block(idx, &offload)?;
        }

        let records = (first_swapped..block_count)
            .map(|idx| BlockResidency {
                idx,
                resident: offload.clone(),
            })
            .collect();

        tracing::info!(
            "Block swap installed: {}/{} blocks offloaded to CPU",
            swapped,
            block_count
        );

        Ok(Self {
            first_swapped,
            block_count,
            compute: compute.clone(),
            offload,
            records,
        })
    }

    /// Whether any block is actually paged.
    pub fn is_active(&self) -> bool {
        self.first_swapped < self.block_count
    }

    pub fn swapped_blocks(&self) -> usize {
        self.block_count - self.first_swapped
    }

    pub fn is_swapped(&self, idx: usize) -> bool {
        idx >= self.first_swapped && idx < self.block_count
    }

    /// Residency records for diagnostics.
    pub fn records(&self) -> &[BlockResidency] {
        &self.records
    }

    /// Page a block onto the compute device before its forward call.
    pub fn enter_block(&mut self, dit: &mut dyn DitModel, idx: usize) -> Result<()> {
        if self.is_swapped(idx) {
            dit.move_block(idx, &self.compute)?;
            self.records[idx - self.first_swapped].resident = self.compute.clone();
        }
        Ok(())
    }

    /// Return a block to the offload device after its forward call.
    pub fn exit_block(&mut self, dit: &mut dyn DitModel, idx: usize) -> Result<()> {
        if self.is_swapped(idx) {
            dit.move_block(idx, &self.offload)?;
            self.records[idx - self.first_swapped].resident = self.offload.clone();
        }
        Ok(())
    }
}
