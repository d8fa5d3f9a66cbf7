//! Classifier-free guidance dispatch.
//!
//! The dispatcher blends model outputs under positive and negative text
//! conditions. The negative branch is skipped entirely when the effective
//! scale is 1.0, and guidance can be limited to a leading fraction of the
//! sampling steps via `partial`.

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Model under both text conditions. The two methods capture the same
/// latent tensors and differ only in the text branch.
pub trait GuidanceModel {
    fn pos_forward(&mut self, x_t: &Tensor, t: f64) -> Result<Tensor>;
    fn neg_forward(&mut self, x_t: &Tensor, t: f64) -> Result<Tensor>;
}

/// Classifier-free guidance parameters.
#[derive(Debug, Clone, Copy)]
pub struct CfgDispatcher {
    pub scale: f64,
    pub rescale: f64,
    /// Fraction of steps using the full scale; later steps fall back to 1.0.
    pub partial: f64,
}

impl CfgDispatcher {
    /// Scale in effect at step `i` of `steps`.
    pub fn effective_scale(&self, i: usize, steps: usize) -> f64 {
        if steps == 0 {
            return self.scale;
        }
        if (i + 1) as f64 / steps as f64 <= self.partial {
            self.scale
        } else {
            1.0
        }
    }

    /// Run guidance for one sampler step:
    /// `out = neg + s·(pos − neg)`, optionally std-rescaled toward `pos`.
    pub fn dispatch(
        &self,
        model: &mut dyn GuidanceModel,
        x_t: &Tensor,
        t: f64,
        i: usize,
        steps: usize,
    ) -> Result<Tensor> {
        let scale = self.effective_scale(i, steps);
        let pos = model.pos_forward(x_t, t)?;
        if scale == 1.0 {
            return Ok(pos);
        }
        let neg = model.neg_forward(x_t, t)?;
        let out = (&neg + (&pos - &neg)?.affine(scale, 0.0)?)?;

        if self.rescale == 0.0 {
            return Ok(out);
        }
        let std_pos = std_all(&pos)?;
        let std_out = std_all(&out)?;
        if std_out == 0.0 {
            return Ok(out);
        }
        let matched = out.affine(std_pos / std_out, 0.0)?;
        Ok((matched.affine(self.rescale, 0.0)? + out.affine(1.0 - self.rescale, 0.0)?)?)
    }
}

fn std_all(t: &Tensor) -> Result<f64> {
    let t = t.to_dtype(DType::F32)?;
    let mean = t.mean_all()?.to_scalar::<f32>()? as f64;
    let centered = t.affine(1.0, -mean)?;
    let var = centered.sqr()?.mean_all()?.to_scalar::<f32>()? as f64;
    Ok(var.sqrt())
}
