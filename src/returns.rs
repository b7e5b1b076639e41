//! Monthly return generation: (paths × steps × assets) tensors drawn from one
//! of four models, plus the regime path that drives regime-coupled inflation.

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};
use crate::inflation;
use crate::linalg::{self, LowerTriangular};
use crate::rng::{RandomStreams, Stream};

const MONTHS: f64 = 12.0;
const ROW_SUM_TOL: f64 = 1e-6;

/// Default bootstrap block: one year of contiguous history.
pub const DEFAULT_BLOCK_MONTHS: usize = 12;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regime {
    pub name: String,
    /// Annual expected return per asset.
    pub expected_returns: Vec<f64>,
    /// Annual volatility per asset.
    pub volatilities: Vec<f64>,
    pub correlation: Vec<Vec<f64>>,
    /// Long-run inflation mean while this regime is active.
    pub inflation_mean: f64,
    pub inflation_volatility: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSwitching {
    pub regimes: Vec<Regime>,
    /// Row-stochastic: `transition_matrix[i][j]` = P(next = j | current = i).
    pub transition_matrix: Vec<Vec<f64>>,
    pub initial_regime: usize,
}

impl RegimeSwitching {
    pub fn validate(&self, n_assets: usize) -> PlanResult<()> {
        let k = self.regimes.len();
        if k == 0 {
            return Err(PlanError::config("regime switching requires at least one regime"));
        }
        if self.initial_regime >= k {
            return Err(PlanError::config(format!(
                "initial_regime {} out of range for {k} regimes",
                self.initial_regime
            )));
        }
        for regime in &self.regimes {
            if regime.expected_returns.len() != n_assets || regime.volatilities.len() != n_assets {
                return Err(PlanError::config(format!(
                    "regime '{}' must define {n_assets} returns and volatilities",
                    regime.name
                )));
            }
            if regime.volatilities.iter().any(|v| *v < 0.0) || regime.inflation_volatility < 0.0 {
                return Err(PlanError::config(format!(
                    "regime '{}' has a negative volatility",
                    regime.name
                )));
            }
            inflation::validate_mean(regime.inflation_mean, &format!("regime '{}'", regime.name))?;
            linalg::validate_correlation(
                &regime.correlation,
                n_assets,
                &format!("regime '{}'", regime.name),
            )?;
        }
        if self.transition_matrix.len() != k || self.transition_matrix.iter().any(|r| r.len() != k) {
            return Err(PlanError::config(format!("transition matrix must be {k}x{k}")));
        }
        for (i, row) in self.transition_matrix.iter().enumerate() {
            if row.iter().any(|p| !(0.0..=1.0).contains(p)) {
                return Err(PlanError::config(format!(
                    "transition row {i} has a probability outside [0, 1]"
                )));
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOL {
                return Err(PlanError::config(format!(
                    "transition row {i} sums to {sum}, expected 1"
                )));
            }
        }
        Ok(())
    }
}

/// Which process generates monthly returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReturnModel {
    #[default]
    MultivariateNormal,
    /// Correlated Student-t with variance matched to the configured volatility.
    StudentT { degrees_of_freedom: f64 },
    /// Block bootstrap over monthly history; one row per month, one column per asset.
    Bootstrap {
        history: Vec<Vec<f64>>,
        #[serde(default = "default_block_months")]
        block_months: usize,
    },
    RegimeSwitching(RegimeSwitching),
}

fn default_block_months() -> usize {
    DEFAULT_BLOCK_MONTHS
}

impl ReturnModel {
    /// Bootstrap over `history` with the default one-year block.
    pub fn bootstrap(history: Vec<Vec<f64>>) -> Self {
        ReturnModel::Bootstrap {
            history,
            block_months: DEFAULT_BLOCK_MONTHS,
        }
    }

    pub fn validate(&self, n_assets: usize) -> PlanResult<()> {
        match self {
            ReturnModel::MultivariateNormal => Ok(()),
            ReturnModel::StudentT { degrees_of_freedom } => {
                if !(*degrees_of_freedom > 2.0) {
                    return Err(PlanError::config(format!(
                        "Student-t degrees of freedom must exceed 2 (got {degrees_of_freedom})"
                    )));
                }
                Ok(())
            }
            ReturnModel::Bootstrap {
                history,
                block_months,
            } => {
                if *block_months == 0 {
                    return Err(PlanError::config("bootstrap block must be at least one month"));
                }
                if history.len() < *block_months {
                    return Err(PlanError::Data(format!(
                        "bootstrap history has {} months, shorter than one {block_months}-month block",
                        history.len()
                    )));
                }
                if let Some(i) = history.iter().position(|row| row.len() != n_assets) {
                    return Err(PlanError::config(format!(
                        "bootstrap history row {i} must have {n_assets} columns"
                    )));
                }
                Ok(())
            }
            ReturnModel::RegimeSwitching(rs) => rs.validate(n_assets),
        }
    }

    pub fn regime_switching(&self) -> Option<&RegimeSwitching> {
        match self {
            ReturnModel::RegimeSwitching(rs) => Some(rs),
            _ => None,
        }
    }
}

// ── Tensors ─────────────────────────────────────────────────────────────────

/// Dense (paths × steps × width) buffer, path-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTensor {
    pub n_paths: usize,
    pub n_steps: usize,
    pub width: usize,
    values: Vec<f64>,
}

impl PathTensor {
    pub fn zeros(n_paths: usize, n_steps: usize, width: usize) -> Self {
        Self {
            n_paths,
            n_steps,
            width,
            values: vec![0.0; n_paths * n_steps * width],
        }
    }

    fn offset(&self, path: usize, step: usize) -> usize {
        (path * self.n_steps + step) * self.width
    }

    pub fn at(&self, path: usize, step: usize, k: usize) -> f64 {
        self.values[self.offset(path, step) + k]
    }

    pub fn set(&mut self, path: usize, step: usize, k: usize, value: f64) {
        let i = self.offset(path, step) + k;
        self.values[i] = value;
    }

    pub fn row(&self, path: usize, step: usize) -> &[f64] {
        let i = self.offset(path, step);
        &self.values[i..i + self.width]
    }

    pub fn row_mut(&mut self, path: usize, step: usize) -> &mut [f64] {
        let i = self.offset(path, step);
        &mut self.values[i..i + self.width]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Active regime per (path, step).
#[derive(Debug, Clone, PartialEq)]
pub struct RegimePath {
    pub n_paths: usize,
    pub n_steps: usize,
    states: Vec<usize>,
}

impl RegimePath {
    pub fn at(&self, path: usize, step: usize) -> usize {
        self.states[path * self.n_steps + step]
    }
}

#[derive(Debug, Clone)]
pub struct MarketPaths {
    pub returns: PathTensor,
    pub regimes: Option<RegimePath>,
}

/// Standard-normal innovations for `n_paths` paths. With `antithetic`, only
/// the first half is drawn; path `p + half` is the exact negation of path `p`.
pub fn standard_normal_innovations(
    rng: &mut ChaCha20Rng,
    n_paths: usize,
    n_steps: usize,
    width: usize,
    antithetic: bool,
) -> PathTensor {
    let mut z = PathTensor::zeros(n_paths, n_steps, width);
    let drawn = if antithetic { n_paths / 2 } else { n_paths };
    let block = n_steps * width;
    for v in &mut z.values[..drawn * block] {
        *v = rng.sample(StandardNormal);
    }
    if antithetic {
        let (base, mirror) = z.values.split_at_mut(drawn * block);
        for (m, b) in mirror.iter_mut().zip(base.iter()) {
            *m = -*b;
        }
    }
    z
}

// ── Generator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Moments {
    mean: Vec<f64>,
    vol: Vec<f64>,
    factor: LowerTriangular,
}

impl Moments {
    fn monthly(annual_returns: &[f64], annual_vols: &[f64], corr: &[Vec<f64>], label: &str) -> PlanResult<Self> {
        Ok(Self {
            mean: annual_returns.iter().map(|r| r / MONTHS).collect(),
            vol: annual_vols.iter().map(|v| v / MONTHS.sqrt()).collect(),
            factor: linalg::cholesky_psd(corr, label)?,
        })
    }

    /// `out = mean + vol ⊙ (L z) * scale`.
    fn correlate(&self, z: &[f64], scale: f64, scratch: &mut [f64], out: &mut [f64]) {
        self.factor.apply(z, scratch);
        for a in 0..out.len() {
            out[a] = self.mean[a] + self.vol[a] * scratch[a] * scale;
        }
    }
}

enum Kind {
    Normal,
    StudentT { dist: ChiSquared<f64>, df: f64 },
    Bootstrap { history: Vec<Vec<f64>>, block: usize },
    Regime {
        moments: Vec<Moments>,
        cumulative: Vec<Vec<f64>>,
        initial: usize,
    },
}

/// Return sampler with all matrix factorizations done up front, so numerical
/// failures surface before any draw is consumed.
pub struct ReturnGenerator {
    n_assets: usize,
    base: Moments,
    kind: Kind,
}

impl ReturnGenerator {
    pub fn new(
        model: &ReturnModel,
        expected_returns: &[f64],
        volatilities: &[f64],
        correlation: &[Vec<f64>],
    ) -> PlanResult<Self> {
        let n_assets = expected_returns.len();
        model.validate(n_assets)?;
        let base = Moments::monthly(expected_returns, volatilities, correlation, "market correlation")?;
        let kind = match model {
            ReturnModel::MultivariateNormal => Kind::Normal,
            ReturnModel::StudentT { degrees_of_freedom } => Kind::StudentT {
                dist: ChiSquared::new(*degrees_of_freedom).map_err(|e| {
                    PlanError::numerical("Student-t degrees of freedom", e.to_string())
                })?,
                df: *degrees_of_freedom,
            },
            ReturnModel::Bootstrap {
                history,
                block_months,
            } => Kind::Bootstrap {
                history: history.clone(),
                block: *block_months,
            },
            ReturnModel::RegimeSwitching(rs) => {
                let moments = rs
                    .regimes
                    .iter()
                    .map(|r| {
                        Moments::monthly(
                            &r.expected_returns,
                            &r.volatilities,
                            &r.correlation,
                            &format!("regime '{}' correlation", r.name),
                        )
                    })
                    .collect::<PlanResult<Vec<_>>>()?;
                let cumulative = rs
                    .transition_matrix
                    .iter()
                    .map(|row| {
                        row.iter()
                            .scan(0.0, |acc, p| {
                                *acc += p;
                                Some(*acc)
                            })
                            .collect()
                    })
                    .collect();
                Kind::Regime {
                    moments,
                    cumulative,
                    initial: rs.initial_regime,
                }
            }
        };
        Ok(Self {
            n_assets,
            base,
            kind,
        })
    }

    /// Draw the full return tensor for one run.
    pub fn sample(
        &self,
        streams: &RandomStreams,
        n_paths: usize,
        n_steps: usize,
        antithetic: bool,
    ) -> PlanResult<MarketPaths> {
        if antithetic && n_paths % 2 != 0 {
            return Err(PlanError::config(format!(
                "antithetic sampling needs an even path count (got {n_paths})"
            )));
        }
        let n = self.n_assets;
        match &self.kind {
            Kind::Normal => {
                let z = standard_normal_innovations(
                    &mut streams.stream(Stream::Returns),
                    n_paths,
                    n_steps,
                    n,
                    antithetic,
                );
                Ok(MarketPaths {
                    returns: self.correlate_all(&z, |_, _| 1.0, |_, _| &self.base),
                    regimes: None,
                })
            }
            Kind::StudentT { dist, df } => {
                let z = standard_normal_innovations(
                    &mut streams.stream(Stream::Returns),
                    n_paths,
                    n_steps,
                    n,
                    antithetic,
                );
                let scales = self.tail_scales(streams, dist, *df, n_paths, n_steps, antithetic);
                Ok(MarketPaths {
                    returns: self.correlate_all(&z, |p, t| scales[p * n_steps + t], |_, _| &self.base),
                    regimes: None,
                })
            }
            Kind::Bootstrap { history, block } => Ok(MarketPaths {
                returns: bootstrap(
                    &mut streams.stream(Stream::BootstrapBlocks),
                    history,
                    *block,
                    n_paths,
                    n_steps,
                    n,
                ),
                regimes: None,
            }),
            Kind::Regime {
                moments,
                cumulative,
                initial,
            } => {
                let regimes = regime_path(
                    &mut streams.stream(Stream::RegimeTransitions),
                    cumulative,
                    *initial,
                    n_paths,
                    n_steps,
                    antithetic,
                );
                let z = standard_normal_innovations(
                    &mut streams.stream(Stream::Returns),
                    n_paths,
                    n_steps,
                    n,
                    antithetic,
                );
                let returns = self.correlate_all(&z, |_, _| 1.0, |p, t| &moments[regimes.at(p, t)]);
                Ok(MarketPaths {
                    returns,
                    regimes: Some(regimes),
                })
            }
        }
    }

    fn correlate_all<'m>(
        &'m self,
        z: &PathTensor,
        scale: impl Fn(usize, usize) -> f64,
        moments: impl Fn(usize, usize) -> &'m Moments,
    ) -> PathTensor {
        let mut out = PathTensor::zeros(z.n_paths, z.n_steps, z.width);
        let mut scratch = vec![0.0; z.width];
        for p in 0..z.n_paths {
            for t in 0..z.n_steps {
                moments(p, t).correlate(z.row(p, t), scale(p, t), &mut scratch, out.row_mut(p, t));
            }
        }
        out
    }

    /// Per-(path, step) multiplier `sqrt(df / chi2) * sqrt((df - 2) / df)`,
    /// shared between a path and its mirror.
    fn tail_scales(
        &self,
        streams: &RandomStreams,
        dist: &ChiSquared<f64>,
        df: f64,
        n_paths: usize,
        n_steps: usize,
        antithetic: bool,
    ) -> Vec<f64> {
        let mut rng = streams.stream(Stream::TailScale);
        let drawn = if antithetic { n_paths / 2 } else { n_paths };
        let variance_match = ((df - 2.0) / df).sqrt();
        let mut scales = vec![0.0; n_paths * n_steps];
        for s in &mut scales[..drawn * n_steps] {
            let chi2: f64 = dist.sample(&mut rng);
            *s = (df / chi2.max(f64::MIN_POSITIVE)).sqrt() * variance_match;
        }
        if antithetic {
            let (base, mirror) = scales.split_at_mut(drawn * n_steps);
            mirror.copy_from_slice(base);
        }
        scales
    }
}

fn bootstrap(
    rng: &mut ChaCha20Rng,
    history: &[Vec<f64>],
    block: usize,
    n_paths: usize,
    n_steps: usize,
    n_assets: usize,
) -> PathTensor {
    let mut out = PathTensor::zeros(n_paths, n_steps, n_assets);
    let max_start = history.len() - block;
    for p in 0..n_paths {
        let mut t = 0;
        while t < n_steps {
            let start = rng.random_range(0..=max_start);
            let take = block.min(n_steps - t);
            for k in 0..take {
                out.row_mut(p, t + k).copy_from_slice(&history[start + k]);
            }
            t += take;
        }
    }
    out
}

fn next_regime(cumulative_row: &[f64], u: f64) -> usize {
    cumulative_row
        .iter()
        .position(|c| u < *c)
        .unwrap_or(cumulative_row.len() - 1)
}

/// Regime at each step is the state *before* that step's transition.
fn regime_path(
    rng: &mut ChaCha20Rng,
    cumulative: &[Vec<f64>],
    initial: usize,
    n_paths: usize,
    n_steps: usize,
    antithetic: bool,
) -> RegimePath {
    let drawn = if antithetic { n_paths / 2 } else { n_paths };
    let mut states = vec![0usize; n_paths * n_steps];
    for p in 0..drawn {
        let mut current = initial;
        for t in 0..n_steps {
            states[p * n_steps + t] = current;
            let u: f64 = rng.random();
            current = next_regime(&cumulative[current], u);
        }
    }
    if antithetic {
        let (base, mirror) = states.split_at_mut(drawn * n_steps);
        mirror.copy_from_slice(base);
    }
    RegimePath {
        n_paths,
        n_steps,
        states,
    }
}
