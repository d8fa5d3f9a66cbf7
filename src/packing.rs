//! Packed tensor representations for the DiT and the VAE.
//!
//! The DiT consumes a batch of variable-shape latents as one flat token
//! sequence plus a shape table; the VAE groups same-shape samples into
//! real batches. Both transformations are order-preserving and invertible.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, VsrError};

/// Per-sample latent dimensions `(t, h, w)`, consumed by the timestep
/// transform and the DiT attention machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeTable(pub Vec<[usize; 3]>);

impl ShapeTable {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Materialize as a `(B, 3)` integer tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let values: Vec<i64> = self
            .0
            .iter()
            .flat_map(|d| d.iter().map(|v| *v as i64))
            .collect();
        Ok(Tensor::from_vec(values, (self.0.len(), 3), device)?)
    }

    /// Number of tokens of sample `i`.
    pub fn tokens(&self, i: usize) -> usize {
        let [t, h, w] = self.0[i];
        t * h * w
    }
}

/// Flatten a list of channels-last latents `(t, h, w, c)` into one packed
/// `(Σ t·h·w, c)` token sequence plus the shape table.
pub fn flatten(latents: &[Tensor]) -> Result<(Tensor, ShapeTable)> {
    if latents.is_empty() {
        return Err(VsrError::Shape("flatten of empty latent list".into()));
    }
    let mut shapes = Vec::with_capacity(latents.len());
    let mut flat = Vec::with_capacity(latents.len());
    for latent in latents {
        let dims = latent.dims();
        let [t, h, w, c] = match dims {
            [t, h, w, c] => [*t, *h, *w, *c],
            other => {
                return Err(VsrError::Shape(format!(
                    "expected rank-4 channels-last latent, got {other:?}"
                )))
            }
        };
        shapes.push([t, h, w]);
        flat.push(latent.reshape((t * h * w, c))?);
    }
    let refs: Vec<&Tensor> = flat.iter().collect();
    Ok((Tensor::cat(&refs, 0)?, ShapeTable(shapes)))
}

/// Invert [`flatten`]: split a packed token sequence back into per-sample
/// channels-last latents.
pub fn unflatten(packed: &Tensor, shapes: &ShapeTable) -> Result<Vec<Tensor>> {
    let c = packed.dim(1)?;
    let mut out = Vec::with_capacity(shapes.len());
    let mut offset = 0;
    for [t, h, w] in &shapes.0 {
        let tokens = t * h * w;
        let part = packed.narrow(0, offset, tokens)?;
        out.push(part.reshape((*t, *h, *w, c))?);
        offset += tokens;
    }
    if offset != packed.dim(0)? {
        return Err(VsrError::Shape(format!(
            "packed sequence has {} tokens, shape table accounts for {offset}",
            packed.dim(0)?
        )));
    }
    Ok(out)
}

/// Flatten per-sample text embeddings `(l, d)` into one `(Σ l, d)` sequence
/// plus the per-sample lengths.
pub fn flatten_text(embeds: &[Tensor]) -> Result<(Tensor, Vec<usize>)> {
    if embeds.is_empty() {
        return Err(VsrError::Shape("flatten of empty embedding list".into()));
    }
    let lens: Vec<usize> = embeds
        .iter()
        .map(|e| e.dim(0))
        .collect::<candle_core::Result<_>>()?;
    let refs: Vec<&Tensor> = embeds.iter().collect();
    Ok((Tensor::cat(&refs, 0)?, lens))
}

/// Group same-shape samples into stacked batches, preserving original order
/// through the returned index lists.
pub fn pack(samples: &[Tensor]) -> Result<(Vec<Tensor>, Vec<Vec<usize>>)> {
    let mut groups: Vec<(Vec<usize>, Vec<usize>)> = Vec::new();
    for (i, sample) in samples.iter().enumerate() {
        let dims = sample.dims().to_vec();
        match groups.iter_mut().find(|(shape, _)| *shape == dims) {
            Some((_, indices)) => indices.push(i),
            None => groups.push((dims, vec![i])),
        }
    }
    let mut batches = Vec::with_capacity(groups.len());
    let mut indices = Vec::with_capacity(groups.len());
    for (_, idxs) in groups {
        let members: Vec<&Tensor> = idxs.iter().map(|i| &samples[*i]).collect();
        batches.push(Tensor::stack(&members, 0)?);
        indices.push(idxs);
    }
    Ok((batches, indices))
}

/// Invert [`pack`]: split stacked batches back into individual samples in
/// their original order.
pub fn unpack(batches: &[Tensor], indices: &[Vec<usize>]) -> Result<Vec<Tensor>> {
    let total: usize = indices.iter().map(|ix| ix.len()).sum();
    let mut out: Vec<Option<Tensor>> = vec![None; total];
    for (batch, idxs) in batches.iter().zip(indices) {
        for (row, original) in idxs.iter().enumerate() {
            out[*original] = Some(batch.narrow(0, row, 1)?.squeeze(0)?);
        }
    }
    out.into_iter()
        .map(|t| t.ok_or_else(|| VsrError::Shape("unpack index table has a gap".into())))
        .collect()
}

/// Cast a tensor to the given dtype only when needed.
pub fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latent(t: usize, h: usize, w: usize, c: usize, fill: f32) -> Tensor {
        Tensor::full(fill, (t, h, w, c), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_flatten_roundtrip() {
        let a = latent(5, 4, 4, 16, 1.0);
        let b = latent(3, 2, 2, 16, 2.0);
        let (packed, shapes) = flatten(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(packed.dims(), [5 * 4 * 4 + 3 * 2 * 2, 16]);
        assert_eq!(shapes.0, vec![[5, 4, 4], [3, 2, 2]]);

        let restored = unflatten(&packed, &shapes).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].dims(), a.dims());
        assert_eq!(restored[1].dims(), b.dims());
        let av: Vec<f32> = restored[1].flatten_all().unwrap().to_vec1().unwrap();
        assert!(av.iter().all(|v| *v == 2.0));
    }

    #[test]
    fn test_shape_table_tensor() {
        let shapes = ShapeTable(vec![[5, 4, 4], [1, 2, 2]]);
        let t = shapes.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), [2, 3]);
        let rows: Vec<Vec<i64>> = t.to_vec2().unwrap();
        assert_eq!(rows[0], vec![5, 4, 4]);
        assert_eq!(rows[1], vec![1, 2, 2]);
    }

    #[test]
    fn test_pack_groups_by_shape_and_restores_order() {
        let a = latent(2, 2, 2, 4, 0.0);
        let b = latent(3, 2, 2, 4, 1.0);
        let c = latent(2, 2, 2, 4, 2.0);
        let (batches, indices) = pack(&[a, b, c]).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].dims(), [2, 2, 2, 2, 4]);
        assert_eq!(indices, vec![vec![0, 2], vec![1]]);

        let restored = unpack(&batches, &indices).unwrap();
        assert_eq!(restored.len(), 3);
        let v: Vec<f32> = restored[2].flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|x| *x == 2.0));
    }

    #[test]
    fn test_flatten_text_lengths() {
        let p = Tensor::zeros((77, 1024), DType::F32, &Device::Cpu).unwrap();
        let n = Tensor::zeros((32, 1024), DType::F32, &Device::Cpu).unwrap();
        let (packed, lens) = flatten_text(&[p, n]).unwrap();
        assert_eq!(packed.dims(), [109, 1024]);
        assert_eq!(lens, vec![77, 32]);
    }

    #[test]
    fn test_flatten_rejects_wrong_rank() {
        let bad = Tensor::zeros((4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(flatten(&[bad]).is_err());
    }
}
