//! Weight initializers.
//!
//! The variance-scaling family covers He, Glorot and LeCun schemes; the
//! provisioning code fills in fan-in and fan-out once the weight dims are
//! known, so an initializer can be constructed before the layer is sized.

use grove_core::{GroveError, LocalMat, Result};
use num_traits::Float;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

/// Which fan count feeds the variance formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingMode {
    FanIn,
    FanOut,
    FanAvg,
}

/// Sampling distribution for variance-scaling draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingDistribution {
    Normal,
    Uniform,
}

/// Variance-scaling initializer: draws with variance `scale / fan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarianceScaling {
    pub scale: f64,
    pub mode: ScalingMode,
    pub distribution: ScalingDistribution,
    pub fan_in: f64,
    pub fan_out: f64,
}

impl VarianceScaling {
    /// He initialization, the default for convolution kernels feeding
    /// rectified activations.
    pub fn he() -> Self {
        Self {
            scale: 2.0,
            mode: ScalingMode::FanIn,
            distribution: ScalingDistribution::Normal,
            fan_in: 1.0,
            fan_out: 1.0,
        }
    }

    pub fn glorot() -> Self {
        Self {
            scale: 1.0,
            mode: ScalingMode::FanAvg,
            distribution: ScalingDistribution::Normal,
            fan_in: 1.0,
            fan_out: 1.0,
        }
    }

    pub fn lecun() -> Self {
        Self {
            scale: 1.0,
            mode: ScalingMode::FanIn,
            distribution: ScalingDistribution::Normal,
            fan_in: 1.0,
            fan_out: 1.0,
        }
    }

    pub fn with_fans(mut self, fan_in: f64, fan_out: f64) -> Self {
        self.fan_in = fan_in;
        self.fan_out = fan_out;
        self
    }

    fn variance(&self) -> f64 {
        let fan = match self.mode {
            ScalingMode::FanIn => self.fan_in,
            ScalingMode::FanOut => self.fan_out,
            ScalingMode::FanAvg => 0.5 * (self.fan_in + self.fan_out),
        };
        self.scale / fan.max(1.0)
    }
}

/// An initialization rule attached to a weight tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Initializer {
    Constant(f64),
    VarianceScaling(VarianceScaling),
}

impl Initializer {
    /// Fills `values` in place.
    pub fn fill<T, R>(&self, values: &mut LocalMat<T>, rng: &mut R) -> Result<()>
    where
        T: Float,
        R: Rng,
    {
        match self {
            Initializer::Constant(c) => {
                let c = convert::<T>(*c)?;
                values.fill(c);
                Ok(())
            }
            Initializer::VarianceScaling(vs) => {
                let variance = vs.variance();
                match vs.distribution {
                    ScalingDistribution::Normal => {
                        let dist = Normal::new(0.0, variance.sqrt()).map_err(|e| {
                            GroveError::invalid_argument("initializer", e.to_string())
                        })?;
                        for v in values.iter_mut() {
                            *v = convert::<T>(dist.sample(rng))?;
                        }
                        Ok(())
                    }
                    ScalingDistribution::Uniform => {
                        let limit = (3.0 * variance).sqrt();
                        let dist = Uniform::new_inclusive(-limit, limit);
                        for v in values.iter_mut() {
                            *v = convert::<T>(dist.sample(rng))?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

fn convert<T: Float>(v: f64) -> Result<T> {
    T::from(v).ok_or_else(|| {
        GroveError::invalid_argument("initializer", "sample is not representable in the weight type")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::matrix::local_mat;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn constant_fill_sets_every_entry() {
        let mut m = local_mat::<f32>(3, 2);
        let mut rng = StdRng::seed_from_u64(0);
        Initializer::Constant(0.25).fill(&mut m, &mut rng).unwrap();
        assert!(m.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn he_variance_tracks_fan_in() {
        let vs = VarianceScaling::he().with_fans(50.0, 10.0);
        assert!((vs.variance() - 2.0 / 50.0).abs() < 1e-12);
    }

    #[test]
    fn variance_scaling_draws_are_bounded_for_uniform() {
        let mut vs = VarianceScaling::glorot().with_fans(8.0, 8.0);
        vs.distribution = ScalingDistribution::Uniform;
        let limit = (3.0 * vs.variance()).sqrt();
        let mut m = local_mat::<f64>(16, 16);
        let mut rng = StdRng::seed_from_u64(7);
        Initializer::VarianceScaling(vs).fill(&mut m, &mut rng).unwrap();
        assert!(m.iter().all(|&v| v.abs() <= limit));
        assert!(m.iter().any(|&v| v != 0.0));
    }
}
