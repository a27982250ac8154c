//! Named, ordered parameter state of a model.
//!
//! A [`ParameterState`] is a flat host-side copy of every trainable tensor and
//! running statistic of a model, in a fixed order. Shapes are stored
//! explicitly so that rank-0 buffers (scalars such as step counters) can be
//! represented next to ordinary weight tensors.

use burn::tensor::{backend::Backend, Tensor};
use oct_core::{Error, Result};

use crate::host::{float_tensor, float_values};

/// One named buffer of a model
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBuffer {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParameterBuffer {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(Error::Shape(format!(
                "buffer '{name}' has {} values but shape {shape:?}",
                values.len()
            )));
        }
        Ok(Self {
            name,
            shape,
            values,
        })
    }

    /// Rank-0 buffer holding a single value
    pub fn scalar(name: impl Into<String>, value: f32) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            values: vec![value],
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn from_tensor<B: Backend, const D: usize>(
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = float_values(tensor)?;
        Self::new(name, shape, values)
    }

    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        let shape: [usize; D] = self.shape.as_slice().try_into().map_err(|_| {
            Error::Shape(format!(
                "buffer '{}' has rank {}, expected rank {D}",
                self.name,
                self.rank()
            ))
        })?;
        float_tensor(self.values.clone(), shape, device)
    }

    fn check_compatible(&self, other: &ParameterBuffer) -> Result<()> {
        if self.name != other.name || self.shape != other.shape {
            return Err(Error::Shape(format!(
                "buffer '{}' {:?} does not match '{}' {:?}",
                self.name, self.shape, other.name, other.shape
            )));
        }
        Ok(())
    }
}

/// Ordered list of named buffers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterState {
    buffers: Vec<ParameterBuffer>,
}

impl ParameterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: ParameterBuffer) {
        self.buffers.push(buffer);
    }

    /// Append a tensor under the given name
    pub fn push_tensor<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<()> {
        self.buffers.push(ParameterBuffer::from_tensor(name, tensor)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[ParameterBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [ParameterBuffer] {
        &mut self.buffers
    }

    pub fn get(&self, name: &str) -> Option<&ParameterBuffer> {
        self.buffers.iter().find(|b| b.name == name)
    }

    /// Total number of scalar values across all buffers
    pub fn num_values(&self) -> usize {
        self.buffers.iter().map(|b| b.values.len()).sum()
    }

    /// Fails unless both states list the same buffers, in the same order,
    /// with the same shapes
    pub fn check_compatible(&self, other: &ParameterState) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::Shape(format!(
                "parameter states have {} and {} buffers",
                self.len(),
                other.len()
            )));
        }
        for (a, b) in self.buffers.iter().zip(other.buffers.iter()) {
            a.check_compatible(b)?;
        }
        Ok(())
    }

    /// Sequential reader used when loading the state back into a model
    pub fn reader(&self) -> StateReader<'_> {
        StateReader {
            buffers: self.buffers.iter(),
        }
    }
}

/// Hands out buffers in order, checking names as it goes
pub struct StateReader<'a> {
    buffers: std::slice::Iter<'a, ParameterBuffer>,
}

impl<'a> StateReader<'a> {
    pub fn next_buffer(&mut self, name: &str) -> Result<&'a ParameterBuffer> {
        let buffer = self
            .buffers
            .next()
            .ok_or_else(|| Error::Shape(format!("parameter state ended before '{name}'")))?;
        if buffer.name != name {
            return Err(Error::Shape(format!(
                "expected buffer '{name}', found '{}'",
                buffer.name
            )));
        }
        Ok(buffer)
    }

    pub fn next_tensor<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        self.next_buffer(name)?.to_tensor(device)
    }

    /// Fails if buffers are left over
    pub fn finish(mut self) -> Result<()> {
        match self.buffers.next() {
            Some(extra) => Err(Error::Shape(format!(
                "unexpected trailing buffer '{}'",
                extra.name
            ))),
            None => Ok(()),
        }
    }
}

/// Models whose parameters can be copied out to, and loaded from, a
/// [`ParameterState`]
pub trait ParameterAccess<B: Backend>: Sized {
    fn parameter_state(&self) -> Result<ParameterState>;

    fn load_parameter_state(self, state: &ParameterState, device: &B::Device) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn sample_state() -> ParameterState {
        let mut state = ParameterState::new();
        state.push(ParameterBuffer::new("fc.weight", vec![2, 3], vec![1.0; 6]).unwrap());
        state.push(ParameterBuffer::new("fc.bias", vec![3], vec![0.5; 3]).unwrap());
        state.push(ParameterBuffer::scalar("bn.num_batches_tracked", 7.0));
        state
    }

    #[test]
    fn test_buffer_value_count_checked() {
        let result = ParameterBuffer::new("w", vec![2, 2], vec![1.0; 3]);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_scalar_buffer_has_rank_zero() {
        let buffer = ParameterBuffer::scalar("steps", 3.0);
        assert_eq!(buffer.rank(), 0);
        assert_eq!(buffer.values, vec![3.0]);
    }

    #[test]
    fn test_tensor_round_trip() {
        let device = Default::default();
        let buffer = ParameterBuffer::new("w", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let tensor: Tensor<B, 2> = buffer.to_tensor(&device).unwrap();
        assert_eq!(tensor.dims(), [2, 2]);

        let back = ParameterBuffer::from_tensor("w", tensor).unwrap();
        assert_eq!(back, buffer);

        let wrong_rank = buffer.to_tensor::<B, 1>(&device);
        assert!(matches!(wrong_rank, Err(Error::Shape(_))));
    }

    #[test]
    fn test_compatible_states() {
        let a = sample_state();
        let b = sample_state();
        assert!(a.check_compatible(&b).is_ok());
        assert_eq!(a.num_values(), 10);
    }

    #[test]
    fn test_incompatible_states() {
        let a = sample_state();

        let mut shorter = sample_state();
        shorter.buffers.pop();
        assert!(matches!(a.check_compatible(&shorter), Err(Error::Shape(_))));

        let mut reshaped = sample_state();
        reshaped.buffers_mut()[1].shape = vec![1, 3];
        assert!(matches!(a.check_compatible(&reshaped), Err(Error::Shape(_))));
    }

    #[test]
    fn test_reader_checks_names_and_leftovers() {
        let device = Default::default();
        let state = sample_state();

        let mut reader = state.reader();
        let w: Tensor<B, 2> = reader.next_tensor("fc.weight", &device).unwrap();
        assert_eq!(w.dims(), [2, 3]);
        assert!(reader.next_buffer("fc.wrong").is_err());

        let mut reader = state.reader();
        reader.next_buffer("fc.weight").unwrap();
        assert!(reader.finish().is_err());
    }
}
