//! Interleaving of labeled and unlabeled chunks.
//!
//! Each chunk is forwarded through the network separately, so every chunk
//! should hold a share of both labeled and unlabeled samples for batch-norm
//! statistics to be representative. Chunk 0 is split into `nu + 1` groups and
//! group `i` is exchanged with group `i` of chunk `i`. The exchange is its own
//! inverse, so interleaving the per-chunk outputs again restores the original
//! row order.

use burn::tensor::{backend::Backend, Tensor};
use oct_core::{Error, Result};

use crate::host::index_tensor;

/// Group boundaries of a chunk of `batch` rows split into `nu + 1` groups.
///
/// Groups hold `batch / (nu + 1)` rows; the remainder goes one row at a time
/// to the trailing groups. Returns `nu + 2` cumulative offsets.
pub fn interleave_offsets(batch: usize, nu: usize) -> Vec<usize> {
    let num_groups = nu + 1;
    let mut groups = vec![batch / num_groups; num_groups];
    let remainder = batch - groups.iter().sum::<usize>();
    for x in 0..remainder {
        groups[num_groups - 1 - x] += 1;
    }

    let mut offsets = Vec::with_capacity(num_groups + 1);
    offsets.push(0);
    for g in groups {
        offsets.push(offsets[offsets.len() - 1] + g);
    }
    offsets
}

/// Row permutation over `num_chunks * batch` concatenated rows.
///
/// Applying it twice yields the identity.
pub fn interleave_indices(batch: usize, num_chunks: usize) -> Result<Vec<usize>> {
    if batch == 0 || num_chunks == 0 {
        return Err(Error::Shape(format!(
            "cannot interleave {num_chunks} chunks of {batch} rows"
        )));
    }
    let nu = num_chunks - 1;
    let offsets = interleave_offsets(batch, nu);

    let mut indices: Vec<usize> = (0..num_chunks * batch).collect();
    for i in 1..=nu {
        for row in offsets[i]..offsets[i + 1] {
            let in_first = row;
            let in_chunk = i * batch + row;
            indices.swap(in_first, in_chunk);
        }
    }
    Ok(indices)
}

/// Exchange groups between chunks of `batch` rows each.
///
/// Works for tensors of any rank; only the leading dimension is permuted.
pub fn interleave<B: Backend, const D: usize>(
    chunks: Vec<Tensor<B, D>>,
    batch: usize,
) -> Result<Vec<Tensor<B, D>>> {
    if chunks.is_empty() {
        return Err(Error::Shape("nothing to interleave".to_string()));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let rows = chunk.dims()[0];
        if rows != batch {
            return Err(Error::Shape(format!(
                "chunk {i} has {rows} rows, expected {batch}"
            )));
        }
    }

    let num_chunks = chunks.len();
    let indices = interleave_indices(batch, num_chunks)?;
    if num_chunks == 1 {
        return Ok(chunks);
    }

    let device = chunks[0].device();
    let all = Tensor::cat(chunks, 0).select(0, index_tensor::<B>(&indices, &device));

    Ok((0..num_chunks)
        .map(|c| all.clone().narrow(0, c * batch, batch))
        .collect())
}

/// Split the leading dimension into chunks of `batch` rows
pub fn split_rows<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    batch: usize,
) -> Result<Vec<Tensor<B, D>>> {
    let rows = tensor.dims()[0];
    if batch == 0 || rows % batch != 0 {
        return Err(Error::Shape(format!(
            "{rows} rows do not split into chunks of {batch}"
        )));
    }
    Ok((0..rows / batch)
        .map(|c| tensor.clone().narrow(0, c * batch, batch))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{float_tensor, float_values};
    use burn::backend::NdArray;

    type B = NdArray;

    fn chunk(start: f32, rows: usize) -> Tensor<B, 2> {
        let values: Vec<f32> = (0..rows).map(|r| start + r as f32).collect();
        float_tensor(values, [rows, 1], &Default::default()).unwrap()
    }

    #[test]
    fn test_offsets_even_split() {
        assert_eq!(interleave_offsets(6, 2), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_offsets_remainder_goes_to_trailing_groups() {
        assert_eq!(interleave_offsets(64, 2), vec![0, 21, 42, 64]);
        assert_eq!(interleave_offsets(5, 2), vec![0, 1, 3, 5]);
        assert_eq!(interleave_offsets(1, 2), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_indices_are_an_involution() {
        for (batch, chunks) in [(6, 3), (64, 3), (5, 3), (7, 4), (4, 1)] {
            let p = interleave_indices(batch, chunks).unwrap();
            let twice: Vec<usize> = p.iter().map(|&i| p[i]).collect();
            assert_eq!(twice, (0..batch * chunks).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_interleave_exchanges_groups() {
        let chunks = vec![chunk(0.0, 6), chunk(10.0, 6), chunk(20.0, 6)];
        let out = interleave(chunks, 6).unwrap();

        let values: Vec<Vec<f32>> = out.into_iter().map(|t| float_values(t).unwrap()).collect();
        assert_eq!(values[0], vec![0.0, 1.0, 12.0, 13.0, 24.0, 25.0]);
        assert_eq!(values[1], vec![10.0, 11.0, 2.0, 3.0, 14.0, 15.0]);
        assert_eq!(values[2], vec![20.0, 21.0, 22.0, 23.0, 4.0, 5.0]);
    }

    #[test]
    fn test_interleave_twice_is_identity() {
        let chunks = vec![chunk(0.0, 5), chunk(100.0, 5), chunk(200.0, 5)];
        let original: Vec<Vec<f32>> = chunks.iter().map(|t| float_values(t.clone()).unwrap()).collect();

        let restored = interleave(interleave(chunks, 5).unwrap(), 5).unwrap();
        let restored: Vec<Vec<f32>> = restored.into_iter().map(|t| float_values(t).unwrap()).collect();

        assert_eq!(restored, original);
    }

    #[test]
    fn test_interleave_rank_four() {
        let device = Default::default();
        let a = float_tensor::<B, 4>((0..8).map(|v| v as f32).collect(), [2, 1, 2, 2], &device).unwrap();
        let b = float_tensor::<B, 4>((8..16).map(|v| v as f32).collect(), [2, 1, 2, 2], &device).unwrap();

        let out = interleave(vec![a, b], 2).unwrap();
        assert_eq!(out[0].dims(), [2, 1, 2, 2]);
        // second row of the first chunk came from the second chunk
        let first = float_values(out[0].clone()).unwrap();
        assert_eq!(&first[4..], &[12.0, 13.0, 14.0, 15.0]);
    }

    #[test]
    fn test_interleave_rejects_bad_input() {
        let empty: Vec<Tensor<B, 2>> = Vec::new();
        assert!(matches!(interleave(empty, 4), Err(Error::Shape(_))));

        let uneven = vec![chunk(0.0, 4), chunk(10.0, 3)];
        assert!(matches!(interleave(uneven, 4), Err(Error::Shape(_))));

        assert!(matches!(interleave(vec![chunk(0.0, 0)], 0), Err(Error::Shape(_))));
    }

    #[test]
    fn test_split_rows() {
        let parts = split_rows(chunk(0.0, 6), 2).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(float_values(parts[2].clone()).unwrap(), vec![4.0, 5.0]);

        assert!(split_rows(chunk(0.0, 5), 2).is_err());
    }
}
