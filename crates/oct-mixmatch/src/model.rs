//! Reference OCT classifier.
//!
//! MixMatch is agnostic to the network; any module implementing
//! [`Classifier`] and [`ParameterAccess`] can be trained. This small CNN
//! exists so the training step can be exercised end to end on grayscale
//! retinal scans.

use burn::{
    config::Config,
    module::{Module, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use oct_core::Error;

use crate::params::{ParameterAccess, ParameterState, StateReader};

/// A network mapping images `[B, C, H, W]` to class logits `[B, K]`
pub trait Classifier<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;
}

/// Configuration for the OctClassifier CNN
#[derive(Config, Debug)]
pub struct OctClassifierConfig {
    /// CNV, DME, DRUSEN, NORMAL
    #[config(default = "4")]
    pub num_classes: usize,

    /// OCT scans are single channel
    #[config(default = "1")]
    pub in_channels: usize,

    #[config(default = "8")]
    pub base_filters: usize,
}

impl OctClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OctClassifier<B> {
        OctClassifier::new(self, device)
    }
}

/// Conv2d, BatchNorm, ReLU and 2x2 max pooling
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }

    fn save_state(&self, prefix: &str, state: &mut ParameterState) -> oct_core::Result<()> {
        save_param(state, format!("{prefix}.conv.weight"), &self.conv.weight)?;
        if let Some(bias) = &self.conv.bias {
            save_param(state, format!("{prefix}.conv.bias"), bias)?;
        }
        save_param(state, format!("{prefix}.bn.gamma"), &self.bn.gamma)?;
        save_param(state, format!("{prefix}.bn.beta"), &self.bn.beta)?;
        state.push_tensor(format!("{prefix}.bn.running_mean"), self.bn.running_mean.value())?;
        state.push_tensor(format!("{prefix}.bn.running_var"), self.bn.running_var.value())?;
        Ok(())
    }

    fn load_state(self, prefix: &str, reader: &mut StateReader<'_>, device: &B::Device) -> oct_core::Result<Self> {
        let mut conv = self.conv;
        conv.weight = load_param(reader, &format!("{prefix}.conv.weight"), conv.weight, device)?;
        conv.bias = match conv.bias {
            Some(bias) => Some(load_param(reader, &format!("{prefix}.conv.bias"), bias, device)?),
            None => None,
        };

        let mut bn = self.bn;
        bn.gamma = load_param(reader, &format!("{prefix}.bn.gamma"), bn.gamma, device)?;
        bn.beta = load_param(reader, &format!("{prefix}.bn.beta"), bn.beta, device)?;
        bn.running_mean = load_running(reader, &format!("{prefix}.bn.running_mean"), &bn.running_mean, device)?;
        bn.running_var = load_running(reader, &format!("{prefix}.bn.running_var"), &bn.running_var, device)?;

        Ok(Self {
            conv,
            bn,
            relu: self.relu,
            pool: self.pool,
        })
    }
}

/// Small CNN for retinal OCT classification
///
/// Architecture:
/// - 2 convolutional blocks (base, 2 * base filters), each halving resolution
/// - Global average pooling
/// - Linear classifier head
#[derive(Module, Debug)]
pub struct OctClassifier<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> OctClassifier<B> {
    pub fn new(config: &OctClassifierConfig, device: &B::Device) -> Self {
        let base = config.base_filters;

        Self {
            conv1: ConvBlock::new(config.in_channels, base, device),
            conv2: ConvBlock::new(base, base * 2, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(base * 2, config.num_classes).init(device),
            num_classes: config.num_classes,
        }
    }
}

impl<B: Backend> Classifier<B> for OctClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.conv2.forward(x);

        // [B, C, 1, 1] -> [B, C]
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        self.fc.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl<B: Backend> ParameterAccess<B> for OctClassifier<B> {
    fn parameter_state(&self) -> oct_core::Result<ParameterState> {
        let mut state = ParameterState::new();
        self.conv1.save_state("conv1", &mut state)?;
        self.conv2.save_state("conv2", &mut state)?;
        save_param(&mut state, "fc.weight".to_string(), &self.fc.weight)?;
        if let Some(bias) = &self.fc.bias {
            save_param(&mut state, "fc.bias".to_string(), bias)?;
        }
        Ok(state)
    }

    fn load_parameter_state(self, state: &ParameterState, device: &B::Device) -> oct_core::Result<Self> {
        let mut reader = state.reader();

        let conv1 = self.conv1.load_state("conv1", &mut reader, device)?;
        let conv2 = self.conv2.load_state("conv2", &mut reader, device)?;

        let mut fc = self.fc;
        fc.weight = load_param(&mut reader, "fc.weight", fc.weight, device)?;
        fc.bias = match fc.bias {
            Some(bias) => Some(load_param(&mut reader, "fc.bias", bias, device)?),
            None => None,
        };
        reader.finish()?;

        Ok(Self {
            conv1,
            conv2,
            global_pool: self.global_pool,
            fc,
            num_classes: self.num_classes,
        })
    }
}

fn save_param<B: Backend, const D: usize>(
    state: &mut ParameterState,
    name: String,
    param: &Param<Tensor<B, D>>,
) -> oct_core::Result<()> {
    state.push_tensor(name, param.val())
}

fn load_param<B: Backend, const D: usize>(
    reader: &mut StateReader<'_>,
    name: &str,
    param: Param<Tensor<B, D>>,
    device: &B::Device,
) -> oct_core::Result<Param<Tensor<B, D>>> {
    let values: Tensor<B, D> = reader.next_tensor(name, device)?;
    check_dims(name, param.val().dims(), values.dims())?;

    Ok(param.map(|current| {
        let require_grad = current.is_require_grad();
        values.set_require_grad(require_grad)
    }))
}

fn load_running<B: Backend>(
    reader: &mut StateReader<'_>,
    name: &str,
    running: &RunningState<Tensor<B, 1>>,
    device: &B::Device,
) -> oct_core::Result<RunningState<Tensor<B, 1>>> {
    let values: Tensor<B, 1> = reader.next_tensor(name, device)?;
    check_dims(name, running.value().dims(), values.dims())?;
    Ok(RunningState::new(values))
}

fn check_dims<const D: usize>(name: &str, expected: [usize; D], found: [usize; D]) -> oct_core::Result<()> {
    if expected != found {
        return Err(Error::Shape(format!(
            "buffer '{name}' has shape {found:?}, model expects {expected:?}"
        )));
    }
    Ok(())
}
