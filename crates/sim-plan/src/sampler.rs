use rand::Rng;
use rand_distr::{Beta, Distribution as _, Gamma, LogNormal, Normal, Poisson};
use thiserror::Error;

use crate::Distribution;

#[derive(Debug, Error)]
#[error("invalid {distribution} parameters: {message}")]
pub struct SampleError {
    pub distribution: &'static str,
    pub message: String,
}

fn invalid(distribution: &'static str, err: impl std::fmt::Display) -> SampleError {
    SampleError {
        distribution,
        message: err.to_string(),
    }
}

/// Draw one scalar from the named distribution. Parameters are validated on
/// every draw; there is no fallback distribution for bad input.
pub fn sample<R: Rng + ?Sized>(
    distribution: &Distribution,
    rng: &mut R,
) -> Result<f64, SampleError> {
    match distribution {
        Distribution::Normal { mean, std } => {
            let dist = Normal::new(*mean, *std).map_err(|e| invalid("normal", e))?;
            Ok(dist.sample(rng))
        }
        Distribution::LogNormal { mu, sigma } => {
            let dist = LogNormal::new(*mu, *sigma).map_err(|e| invalid("log-normal", e))?;
            Ok(dist.sample(rng))
        }
        Distribution::Poisson { rate } => {
            let dist = Poisson::new(*rate).map_err(|e| invalid("poisson", e))?;
            Ok(dist.sample(rng))
        }
        Distribution::Beta { alpha, beta } => {
            let dist = Beta::new(*alpha, *beta).map_err(|e| invalid("beta", e))?;
            Ok(dist.sample(rng))
        }
        Distribution::Gamma { shape, scale } => {
            let dist = Gamma::new(*shape, *scale).map_err(|e| invalid("gamma", e))?;
            Ok(dist.sample(rng))
        }
    }
}
