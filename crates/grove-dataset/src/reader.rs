//! Sample producers.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use grove_core::{GroveError, Result};

/// A producer of fixed-size sample vectors, addressed by index.
///
/// Implementations must be deterministic: fetching the same index twice
/// yields the same sample, so every rank can address the global dataset
/// without coordination.
pub trait DataReader {
    /// Flattened length of one sample (channel-first for image data).
    fn sample_size(&self) -> usize;

    /// Number of samples in the dataset.
    fn num_samples(&self) -> usize;

    /// Writes sample `index` into `out`, which has `sample_size()` entries.
    fn fetch(&self, index: usize, out: &mut [f32]) -> Result<()>;
}

/// Samples held in memory, stored sample-major.
pub struct InMemoryReader {
    sample_size: usize,
    data: Vec<f32>,
}

impl InMemoryReader {
    /// `data` holds whole samples back to back; its length must be a
    /// multiple of `sample_size`.
    pub fn new(sample_size: usize, data: Vec<f32>) -> Result<Self> {
        if sample_size == 0 {
            return Err(GroveError::invalid_argument(
                "InMemoryReader::new",
                "sample size must be positive",
            ));
        }
        if data.len() % sample_size != 0 {
            return Err(GroveError::invalid_argument(
                "InMemoryReader::new",
                format!(
                    "data length {} is not a multiple of the sample size {}",
                    data.len(),
                    sample_size
                ),
            ));
        }
        Ok(Self { sample_size, data })
    }
}

impl DataReader for InMemoryReader {
    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn num_samples(&self) -> usize {
        self.data.len() / self.sample_size
    }

    fn fetch(&self, index: usize, out: &mut [f32]) -> Result<()> {
        if index >= self.num_samples() {
            return Err(GroveError::invalid_argument(
                "InMemoryReader::fetch",
                format!("index {} out of range ({} samples)", index, self.num_samples()),
            ));
        }
        let start = index * self.sample_size;
        out.copy_from_slice(&self.data[start..start + self.sample_size]);
        Ok(())
    }
}

/// Serializable description of a synthetic dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSpec {
    pub sample_size: usize,
    pub num_samples: usize,
    pub seed: u64,
    #[serde(default)]
    pub mean: f32,
    #[serde(default = "default_stddev")]
    pub stddev: f32,
}

fn default_stddev() -> f32 {
    1.0
}

/// Gaussian random samples, reproducible per index.
///
/// Each sample is drawn from its own generator seeded from the base seed and
/// the sample index, so ranks fetching disjoint indices see the same dataset
/// a single process would.
pub struct SyntheticReader {
    sample_size: usize,
    num_samples: usize,
    seed: u64,
    mean: f32,
    stddev: f32,
}

impl SyntheticReader {
    pub fn new(sample_size: usize, num_samples: usize, seed: u64) -> Self {
        Self {
            sample_size,
            num_samples,
            seed,
            mean: 0.0,
            stddev: 1.0,
        }
    }

    pub fn with_distribution(mut self, mean: f32, stddev: f32) -> Self {
        self.mean = mean;
        self.stddev = stddev;
        self
    }

    pub fn from_spec(spec: &SyntheticSpec) -> Self {
        Self::new(spec.sample_size, spec.num_samples, spec.seed)
            .with_distribution(spec.mean, spec.stddev)
    }
}

impl DataReader for SyntheticReader {
    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn fetch(&self, index: usize, out: &mut [f32]) -> Result<()> {
        if index >= self.num_samples {
            return Err(GroveError::invalid_argument(
                "SyntheticReader::fetch",
                format!("index {} out of range ({} samples)", index, self.num_samples),
            ));
        }
        let normal = Normal::new(self.mean, self.stddev)
            .map_err(|e| GroveError::invalid_argument("SyntheticReader::fetch", e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(self.seed ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        for v in out.iter_mut() {
            *v = normal.sample(&mut rng);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_reader_rejects_ragged_data() {
        assert!(InMemoryReader::new(3, vec![0.0; 7]).is_err());
        assert!(InMemoryReader::new(0, vec![]).is_err());
    }

    #[test]
    fn in_memory_reader_fetches_by_index() {
        let reader = InMemoryReader::new(2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(reader.num_samples(), 3);
        let mut out = [0.0f32; 2];
        reader.fetch(2, &mut out).unwrap();
        assert_eq!(out, [5.0, 6.0]);
        assert!(reader.fetch(3, &mut out).is_err());
    }

    #[test]
    fn synthetic_reader_is_reproducible_per_index() {
        let reader = SyntheticReader::new(4, 10, 42);
        let mut a = [0.0f32; 4];
        let mut b = [0.0f32; 4];
        reader.fetch(7, &mut a).unwrap();
        reader.fetch(7, &mut b).unwrap();
        assert_eq!(a, b);
        reader.fetch(8, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn synthetic_spec_fills_distribution_defaults() {
        let spec: SyntheticSpec =
            serde_json::from_str(r#"{"sample_size": 4, "num_samples": 16, "seed": 1}"#).unwrap();
        assert_eq!(spec.mean, 0.0);
        assert_eq!(spec.stddev, 1.0);
        let reader = SyntheticReader::from_spec(&spec);
        assert_eq!(reader.num_samples(), 16);
    }

    #[test]
    fn synthetic_reader_respects_the_distribution() {
        let reader = SyntheticReader::new(1000, 1, 7).with_distribution(3.0, 0.5);
        let mut out = vec![0.0f32; 1000];
        reader.fetch(0, &mut out).unwrap();
        let mean: f32 = out.iter().sum::<f32>() / 1000.0;
        assert!((mean - 3.0).abs() < 0.1);
    }
}
