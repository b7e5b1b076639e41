use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};
use crate::returns::{self, PathTensor, RegimePath, RegimeSwitching};
use crate::rng::{RandomStreams, Stream};

const DT: f64 = 1.0 / 12.0;

fn default_reversion_speed() -> f64 {
    0.5
}

/// Ornstein-Uhlenbeck inflation: annual rate reverting to `mean` at speed
/// `reversion_speed` with annual shock `volatility`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflationParams {
    pub mean: f64,
    pub volatility: f64,
    #[serde(default = "default_reversion_speed")]
    pub reversion_speed: f64,
}

impl Default for InflationParams {
    fn default() -> Self {
        Self {
            mean: 0.03,
            volatility: 0.01,
            reversion_speed: default_reversion_speed(),
        }
    }
}

/// A long-run mean at or below -12/yr turns the monthly rate to -100% or
/// worse and flips the price index negative.
pub(crate) fn validate_mean(mean: f64, what: &str) -> PlanResult<()> {
    if !mean.is_finite() || mean * DT <= -1.0 {
        return Err(PlanError::config(format!(
            "{what} inflation mean must be finite and above -12/yr (got {mean})"
        )));
    }
    Ok(())
}

impl InflationParams {
    pub fn validate(&self) -> PlanResult<()> {
        validate_mean(self.mean, "plan")?;
        if self.volatility < 0.0 || !self.volatility.is_finite() {
            return Err(PlanError::config(format!(
                "inflation volatility must be non-negative (got {})",
                self.volatility
            )));
        }
        if !(self.reversion_speed >= 0.0) {
            return Err(PlanError::config(format!(
                "inflation reversion speed must be non-negative (got {})",
                self.reversion_speed
            )));
        }
        Ok(())
    }
}

/// Monthly inflation rate per (path, step).
#[derive(Debug, Clone, PartialEq)]
pub struct InflationPaths {
    rates: PathTensor,
}

impl InflationPaths {
    pub fn n_paths(&self) -> usize {
        self.rates.n_paths
    }

    pub fn n_steps(&self) -> usize {
        self.rates.n_steps
    }

    pub fn monthly_rate(&self, path: usize, step: usize) -> f64 {
        self.rates.at(path, step, 0)
    }

    pub(crate) fn set_monthly_rate(&mut self, path: usize, step: usize, rate: f64) {
        self.rates.set(path, step, 0, rate);
    }

    /// Fold one month of inflation into a per-path index column.
    pub fn advance_index(&self, step: usize, index: &mut [f64]) {
        for (p, ix) in index.iter_mut().enumerate() {
            *ix *= 1.0 + self.monthly_rate(p, step);
        }
    }

    /// Cumulative price index for one path, starting at 1.0 (length `n_steps + 1`).
    pub fn cumulative_index(&self, path: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n_steps() + 1);
        let mut level = 1.0;
        out.push(level);
        for t in 0..self.n_steps() {
            level *= 1.0 + self.monthly_rate(path, t);
            out.push(level);
        }
        out
    }
}

/// Per-step (theta, sigma) source.
enum Drift<'a> {
    Fixed { theta: f64, sigma: f64 },
    Regime {
        switching: &'a RegimeSwitching,
        path: &'a RegimePath,
    },
}

impl Drift<'_> {
    fn at(&self, p: usize, t: usize) -> (f64, f64) {
        match self {
            Drift::Fixed { theta, sigma } => (*theta, *sigma),
            Drift::Regime { switching, path } => {
                let r = &switching.regimes[path.at(p, t)];
                (r.inflation_mean, r.inflation_volatility)
            }
        }
    }

    fn initial(&self) -> f64 {
        match self {
            Drift::Fixed { theta, .. } => *theta,
            Drift::Regime { switching, .. } => switching.regimes[switching.initial_regime].inflation_mean,
        }
    }
}

/// Simulate monthly inflation. With `regime` set, theta and sigma follow the
/// same regime sequence that drove returns; kappa stays global.
pub fn sample(
    params: &InflationParams,
    regime: Option<(&RegimeSwitching, &RegimePath)>,
    streams: &RandomStreams,
    n_paths: usize,
    n_steps: usize,
    antithetic: bool,
) -> InflationPaths {
    let eps = returns::standard_normal_innovations(
        &mut streams.stream(Stream::Inflation),
        n_paths,
        n_steps,
        1,
        antithetic,
    );
    let drift = match regime {
        Some((switching, path)) => Drift::Regime { switching, path },
        None => Drift::Fixed {
            theta: params.mean,
            sigma: params.volatility,
        },
    };
    let kappa = params.reversion_speed;
    let shock_scale = DT.sqrt();

    let mut rates = PathTensor::zeros(n_paths, n_steps, 1);
    for p in 0..n_paths {
        let mut level = drift.initial();
        for t in 0..n_steps {
            let (theta, sigma) = drift.at(p, t);
            level += kappa * (theta - level) * DT + sigma * shock_scale * eps.at(p, t, 0);
            rates.set(p, t, 0, level * DT);
        }
    }
    InflationPaths { rates }
}
