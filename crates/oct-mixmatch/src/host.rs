//! Reading tensors back to host memory and building them from host values.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use oct_core::{Error, Result};

/// Copy a float tensor to a flat host vector
pub fn float_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("failed to read float tensor: {e:?}")))
}

/// Copy an integer tensor to a flat host vector
pub fn int_values<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| Error::Tensor(format!("failed to read int tensor: {e:?}")))
}

/// Read a single float scalar
pub fn scalar_value<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<f64> {
    let values = float_values(tensor)?;
    match values.as_slice() {
        [value] => Ok(*value as f64),
        other => Err(Error::Shape(format!(
            "expected a single element, got {}",
            other.len()
        ))),
    }
}

/// Index tensor used by `select` on the leading dimension
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    let len = values.len();
    Tensor::from_data(TensorData::new(values, [len]), device)
}

/// Build a float tensor of rank `D` from host values
pub fn float_tensor<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(Error::Shape(format!(
            "{} values do not fill shape {shape:?}",
            values.len()
        )));
    }
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn test_float_tensor_shape_check() {
        let device = Default::default();
        let ok = float_tensor::<B, 2>(vec![1.0, 2.0, 3.0, 4.0], [2, 2], &device);
        assert!(ok.is_ok());

        let bad = float_tensor::<B, 2>(vec![1.0, 2.0, 3.0], [2, 2], &device);
        assert!(matches!(bad, Err(Error::Shape(_))));
    }

    #[test]
    fn test_index_tensor_select() {
        let device = Default::default();
        let t = float_tensor::<B, 2>(vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0], [3, 2], &device).unwrap();
        let picked = t.select(0, index_tensor::<B>(&[2, 0], &device));
        assert_eq!(float_values(picked).unwrap(), vec![20.0, 21.0, 0.0, 1.0]);
    }

    #[test]
    fn test_scalar_value() {
        let device = Default::default();
        let t = float_tensor::<B, 1>(vec![2.5], [1], &device).unwrap();
        assert_eq!(scalar_value(t).unwrap(), 2.5);
    }
}
