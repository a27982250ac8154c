//! Seeded synthetic OCT-like scans.
//!
//! Each scan is a stack of horizontal retinal layers with noise. The classes
//! differ by a lesion drawn over the layers:
//! - CNV: the lower layers bulge upwards in the middle of the scan
//! - DME: dark fluid pockets inside the middle layer
//! - DRUSEN: small bright deposits above the lowest layer
//! - NORMAL: layers only

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use oct_core::ExperimentConfig;
use oct_mixmatch::{EvalBatch, MixMatchBatch};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

pub const CLASS_NAMES: [&str; 4] = ["CNV", "DME", "DRUSEN", "NORMAL"];

/// Relative depth and brightness of each retinal layer
const LAYERS: [(f32, f32); 4] = [(0.30, 0.9), (0.45, 0.5), (0.60, 0.7), (0.75, 1.0)];
const LAYER_WIDTH: f32 = 0.04;

#[derive(Debug, Clone)]
pub struct OctSample {
    pub image: Vec<f32>,
    pub label: usize,
}

/// Generates scans and their augmented views
pub struct ScanGenerator {
    image_size: usize,
    channels: usize,
    rng: ChaCha8Rng,
    noise: Normal<f32>,
}

impl ScanGenerator {
    pub fn new(image_size: usize, channels: usize, seed: u64) -> Result<Self> {
        Ok(Self {
            image_size,
            channels,
            rng: ChaCha8Rng::seed_from_u64(seed),
            noise: Normal::new(0.0, 0.05).context("Invalid noise distribution")?,
        })
    }

    pub fn sample(&mut self, label: usize) -> OctSample {
        let size = self.image_size;
        let shift = self.rng.gen_range(-0.05f32..0.05);
        let mut plane = vec![0.0f32; size * size];

        for y in 0..size {
            for x in 0..size {
                let fy = y as f32 / size as f32;
                let fx = x as f32 / size as f32;
                let bulge = if label == 0 {
                    0.12 * (-((fx - 0.5) * (fx - 0.5)) / 0.02).exp()
                } else {
                    0.0
                };

                let mut value = 0.0;
                for (i, &(depth, brightness)) in LAYERS.iter().enumerate() {
                    let center = depth + shift - if i >= 2 { bulge } else { 0.0 };
                    let d = (fy - center) / LAYER_WIDTH;
                    value += brightness * (-d * d).exp();
                }
                plane[y * size + x] = value;
            }
        }

        match label {
            1 => self.draw_spots(&mut plane, LAYERS[1].0 + shift, 0.06, -0.8),
            2 => self.draw_spots(&mut plane, LAYERS[3].0 + shift - 0.06, 0.03, 0.8),
            _ => {}
        }

        for value in plane.iter_mut() {
            *value = (*value + self.noise.sample(&mut self.rng)).clamp(0.0, 1.0);
        }

        OctSample {
            image: plane.repeat(self.channels),
            label,
        }
    }

    /// Random horizontal flip plus fresh noise
    pub fn augment(&mut self, image: &[f32]) -> Vec<f32> {
        let size = self.image_size;
        let flip = self.rng.gen_bool(0.5);
        let mut out = Vec::with_capacity(image.len());

        for plane in image.chunks(size * size) {
            for row in plane.chunks(size) {
                for x in 0..size {
                    let v = if flip { row[size - 1 - x] } else { row[x] };
                    out.push((v + self.noise.sample(&mut self.rng)).clamp(0.0, 1.0));
                }
            }
        }
        out
    }

    fn draw_spots(&mut self, plane: &mut [f32], depth: f32, radius: f32, delta: f32) {
        let size = self.image_size as f32;
        let count = self.rng.gen_range(2..=4);
        for _ in 0..count {
            let cx = self.rng.gen_range(0.2f32..0.8);
            for (i, value) in plane.iter_mut().enumerate() {
                let fx = (i % self.image_size) as f32 / size;
                let fy = (i / self.image_size) as f32 / size;
                let d2 = ((fx - cx) * (fx - cx) + (fy - depth) * (fy - depth)) / (radius * radius);
                *value += delta * (-d2).exp();
            }
        }
    }
}

/// Labeled, unlabeled and test scans of one run
pub struct OctPool {
    pub labeled: Vec<OctSample>,
    pub unlabeled: Vec<OctSample>,
    pub test: Vec<OctSample>,
    generator: ScanGenerator,
    rng: ChaCha8Rng,
    image_size: usize,
    channels: usize,
}

impl OctPool {
    pub fn generate(config: &ExperimentConfig) -> Result<Self> {
        let data = &config.data;
        if data.num_classes > CLASS_NAMES.len() {
            anyhow::bail!(
                "Synthetic scans cover {} classes, config asks for {}",
                CLASS_NAMES.len(),
                data.num_classes
            );
        }

        let mut generator = ScanGenerator::new(data.image_size, data.channels, config.seed)?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));

        let labeled = (0..data.num_classes)
            .flat_map(|label| std::iter::repeat(label).take(data.labeled_per_class))
            .map(|label| generator.sample(label))
            .collect::<Vec<_>>();
        let unlabeled = (0..data.unlabeled_samples)
            .map(|_| generator.sample(rng.gen_range(0..data.num_classes)))
            .collect::<Vec<_>>();
        let test = (0..data.test_samples)
            .map(|i| generator.sample(i % data.num_classes))
            .collect::<Vec<_>>();

        Ok(Self {
            labeled,
            unlabeled,
            test,
            generator,
            rng,
            image_size: data.image_size,
            channels: data.channels,
        })
    }

    /// Draw a training batch: one augmented view of labeled scans and two of
    /// unlabeled scans
    pub fn train_batch<B: Backend>(&mut self, batch_size: usize, device: &B::Device) -> Result<MixMatchBatch<B>> {
        if self.labeled.is_empty() || self.unlabeled.is_empty() {
            anyhow::bail!("Training needs both labeled and unlabeled scans");
        }

        let mut images_x = Vec::new();
        let mut labels_x = Vec::with_capacity(batch_size);
        let mut images_u1 = Vec::new();
        let mut images_u2 = Vec::new();

        for _ in 0..batch_size {
            let sample = self.labeled.choose(&mut self.rng).context("No labeled scan")?;
            images_x.extend(self.generator.augment(&sample.image));
            labels_x.push(sample.label as i64);

            let sample = self.unlabeled.choose(&mut self.rng).context("No unlabeled scan")?;
            images_u1.extend(self.generator.augment(&sample.image));
            images_u2.extend(self.generator.augment(&sample.image));
        }

        Ok(MixMatchBatch {
            images_x: self.images(images_x, batch_size, device),
            labels_x: labels(labels_x, device),
            images_u1: self.images(images_u1, batch_size, device),
            images_u2: self.images(images_u2, batch_size, device),
        })
    }

    /// Full batches over the test scans; a trailing partial batch is dropped
    pub fn test_batches<B: Backend>(&self, batch_size: usize, device: &B::Device) -> Vec<EvalBatch<B>> {
        self.test
            .chunks_exact(batch_size)
            .map(|chunk| {
                let images: Vec<f32> = chunk.iter().flat_map(|s| s.image.iter().copied()).collect();
                let targets: Vec<i64> = chunk.iter().map(|s| s.label as i64).collect();
                EvalBatch {
                    images: self.images(images, chunk.len(), device),
                    labels: labels(targets, device),
                }
            })
            .collect()
    }

    fn images<B: Backend>(&self, data: Vec<f32>, batch_size: usize, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 4>::from_floats(
            TensorData::new(data, [batch_size, self.channels, self.image_size, self.image_size]),
            device,
        )
    }
}

fn labels<B: Backend>(targets: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let batch_size = targets.len();
    Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [batch_size]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn small_config() -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.data.image_size = 16;
        config.data.labeled_per_class = 2;
        config.data.unlabeled_samples = 10;
        config.data.test_samples = 10;
        config
    }

    #[test]
    fn test_samples_in_unit_range() {
        let mut generator = ScanGenerator::new(16, 1, 0).unwrap();
        for label in 0..4 {
            let sample = generator.sample(label);
            assert_eq!(sample.image.len(), 256);
            assert!(sample.image.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_same_seed_same_pool() {
        let a = OctPool::generate(&small_config()).unwrap();
        let b = OctPool::generate(&small_config()).unwrap();
        assert_eq!(a.labeled[3].image, b.labeled[3].image);
        assert_eq!(a.labeled.len(), 8);
    }

    #[test]
    fn test_batches() {
        let device = Default::default();
        let mut pool = OctPool::generate(&small_config()).unwrap();

        let batch = pool.train_batch::<NdArray>(4, &device).unwrap();
        assert_eq!(batch.images_x.dims(), [4, 1, 16, 16]);
        assert_eq!(batch.images_u1.dims(), batch.images_u2.dims());
        assert_eq!(batch.batch_size().unwrap(), 4);

        // 10 test scans give two full batches of 4
        let test = pool.test_batches::<NdArray>(4, &device);
        assert_eq!(test.len(), 2);
    }
}
