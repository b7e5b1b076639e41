use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Inputs;
use crate::error::{PlanError, PlanResult};
use crate::simulation;

pub const DEFAULT_PERTURBATION: f64 = 0.10;
/// Perturbed runs are capped at this many paths.
pub const DEFAULT_MAX_PATHS: usize = 2_000;
/// Retirement age moves by whole years rather than a percentage.
const RETIREMENT_AGE_DELTA: f64 = 2.0;

/// Shared stop flag for a sweep. Runs already in flight finish normally;
/// runs not yet started are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Parameters ──────────────────────────────────────────────────────────────

/// A scalar input that can be read and overwritten on an `Inputs` bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    AssetReturn(usize),
    AssetVolatility(usize),
    /// Other weights are rescaled proportionally to keep the sum at one.
    AssetWeight(usize),
    InflationMean,
    InflationVolatility,
    MonthlySpending,
    RetirementAge,
    Contribution(usize),
    ExpenseRatio,
    AumFee,
    AdvisoryFee,
}

impl Parameter {
    pub fn name(self, inputs: &Inputs) -> String {
        let asset = |i: usize| inputs.market.assets.get(i).map_or("?", |a| a.name.as_str());
        match self {
            Parameter::AssetReturn(i) => format!("{} Return", asset(i)),
            Parameter::AssetVolatility(i) => format!("{} Volatility", asset(i)),
            Parameter::AssetWeight(i) => format!("{} Weight", asset(i)),
            Parameter::InflationMean => "Inflation Rate".to_string(),
            Parameter::InflationVolatility => "Inflation Volatility".to_string(),
            Parameter::MonthlySpending => "Monthly Spending".to_string(),
            Parameter::RetirementAge => "Retirement Age".to_string(),
            Parameter::Contribution(i) => {
                let accounts = &inputs.plan.accounts;
                let Some(account) = accounts.get(i) else {
                    return "? Contribution".to_string();
                };
                // Disambiguate repeated account kinds by position.
                if accounts[..i].iter().any(|a| a.kind == account.kind) {
                    format!("{} Contribution {}", account.kind.label(), i + 1)
                } else {
                    format!("{} Contribution", account.kind.label())
                }
            }
            Parameter::ExpenseRatio => "Expense Ratio".to_string(),
            Parameter::AumFee => "AUM Fee".to_string(),
            Parameter::AdvisoryFee => "Advisory Fee".to_string(),
        }
    }

    pub fn value(self, inputs: &Inputs) -> f64 {
        let market = &inputs.market;
        match self {
            Parameter::AssetReturn(i) => market.assets.get(i).map_or(0.0, |a| a.expected_return),
            Parameter::AssetVolatility(i) => market.assets.get(i).map_or(0.0, |a| a.volatility),
            Parameter::AssetWeight(i) => market.assets.get(i).map_or(0.0, |a| a.weight),
            Parameter::InflationMean => market.inflation.mean,
            Parameter::InflationVolatility => market.inflation.volatility,
            Parameter::MonthlySpending => inputs.plan.monthly_spending,
            Parameter::RetirementAge => inputs.plan.retirement_age as f64,
            Parameter::Contribution(i) => inputs.plan.accounts.get(i).map_or(0.0, |a| a.annual_contribution),
            Parameter::ExpenseRatio => market.fees.expense_ratio,
            Parameter::AumFee => market.fees.aum_fee,
            Parameter::AdvisoryFee => market.fees.advisory_fee,
        }
    }

    /// Overwrite the parameter. No validation; the run that follows does it.
    /// Ages round to whole years and a negative age saturates to 0, which
    /// validation rejects as before `current_age`.
    pub fn apply(self, inputs: &mut Inputs, value: f64) {
        let market = &mut inputs.market;
        match self {
            Parameter::AssetReturn(i) => {
                if let Some(a) = market.assets.get_mut(i) {
                    a.expected_return = value;
                }
            }
            Parameter::AssetVolatility(i) => {
                if let Some(a) = market.assets.get_mut(i) {
                    a.volatility = value;
                }
            }
            Parameter::AssetWeight(i) => {
                let Some(old) = market.assets.get(i).map(|a| a.weight) else {
                    return;
                };
                let rest = 1.0 - old;
                for (k, a) in market.assets.iter_mut().enumerate() {
                    if k == i {
                        a.weight = value;
                    } else if rest > 0.0 {
                        a.weight *= (1.0 - value) / rest;
                    }
                }
            }
            Parameter::InflationMean => market.inflation.mean = value,
            Parameter::InflationVolatility => market.inflation.volatility = value,
            Parameter::MonthlySpending => inputs.plan.monthly_spending = value,
            Parameter::RetirementAge => inputs.plan.retirement_age = value.round() as u32,
            Parameter::Contribution(i) => {
                if let Some(a) = inputs.plan.accounts.get_mut(i) {
                    a.annual_contribution = value;
                }
            }
            Parameter::ExpenseRatio => market.fees.expense_ratio = value,
            Parameter::AumFee => market.fees.aum_fee = value,
            Parameter::AdvisoryFee => market.fees.advisory_fee = value,
        }
    }

    fn bounds(self, base: f64, pct: f64) -> (f64, f64) {
        match self {
            Parameter::RetirementAge => (base - RETIREMENT_AGE_DELTA, base + RETIREMENT_AGE_DELTA),
            _ => (base * (1.0 - pct), base * (1.0 + pct)),
        }
    }
}

/// Every parameter the bundle exposes, zero-valued ones included.
pub fn all_parameters(inputs: &Inputs) -> Vec<Parameter> {
    let n_assets = inputs.market.assets.len();
    let mut params = Vec::new();
    for i in 0..n_assets {
        params.push(Parameter::AssetReturn(i));
        params.push(Parameter::AssetVolatility(i));
    }
    params.extend([
        Parameter::InflationMean,
        Parameter::InflationVolatility,
        Parameter::MonthlySpending,
        Parameter::RetirementAge,
    ]);
    if n_assets > 1 {
        params.push(Parameter::AssetWeight(0));
    }
    params.extend((0..inputs.plan.accounts.len()).map(Parameter::Contribution));
    params.extend([Parameter::ExpenseRatio, Parameter::AumFee, Parameter::AdvisoryFee]);
    params
}

/// Parameters worth perturbing: a percentage of zero is no perturbation.
pub fn discover_parameters(inputs: &Inputs) -> Vec<Parameter> {
    all_parameters(inputs)
        .into_iter()
        .filter(|p| p.value(inputs) != 0.0)
        .collect()
}

pub fn parameter_by_name(inputs: &Inputs, name: &str) -> PlanResult<Parameter> {
    all_parameters(inputs)
        .into_iter()
        .find(|p| p.name(inputs) == name)
        .ok_or_else(|| PlanError::config(format!("unknown sensitivity parameter '{name}'")))
}

// ── One-at-a-time ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityOptions {
    /// Fractional move applied in both directions.
    pub perturbation: f64,
    pub max_paths: usize,
    /// Restrict to these names; `None` uses every discovered parameter.
    pub parameters: Option<Vec<String>>,
    /// Worker threads; `None` lets rayon size the pool.
    pub workers: Option<usize>,
}

impl Default for SensitivityOptions {
    fn default() -> Self {
        Self {
            perturbation: DEFAULT_PERTURBATION,
            max_paths: DEFAULT_MAX_PATHS,
            parameters: None,
            workers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityResult {
    pub parameter_name: String,
    pub base_value: f64,
    pub low_value: f64,
    pub high_value: f64,
    pub base_success: f64,
    pub low_success: f64,
    pub high_success: f64,
    /// `high_success - low_success`.
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    pub base_success_probability: f64,
    /// Fully finished parameters, in discovery order.
    pub results: Vec<SensitivityResult>,
    /// False when cancellation cut the sweep short.
    pub completed: bool,
}

impl SensitivityReport {
    /// Results sorted by absolute impact, largest first.
    pub fn ranked(&self) -> Vec<&SensitivityResult> {
        let mut ranked: Vec<_> = self.results.iter().collect();
        ranked.sort_by(|a, b| b.impact.abs().total_cmp(&a.impact.abs()));
        ranked
    }
}

fn capped(inputs: &Inputs, max_paths: usize) -> Inputs {
    let mut capped = inputs.clone();
    let mut n = inputs.simulation.n_paths.min(max_paths.max(1));
    if capped.simulation.antithetic && n % 2 != 0 {
        n = (n - 1).max(2);
    }
    capped.simulation.n_paths = n;
    capped
}

fn build_pool(workers: Option<usize>) -> PlanResult<rayon::ThreadPool> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("sensitivity-{i}"));
    if let Some(n) = workers {
        builder = builder.num_threads(n.max(1));
    }
    builder
        .build()
        .map_err(|e| PlanError::config(format!("cannot start sensitivity workers: {e}")))
}

/// Success probability with one parameter moved, or `None` if the new
/// configuration is rejected.
fn perturbed_success(base: &Inputs, param: Parameter, value: f64) -> Option<f64> {
    let mut inputs = base.clone();
    param.apply(&mut inputs, value);
    match simulation::run(&inputs) {
        Ok(result) => Some(result.success_probability),
        Err(e) => {
            warn!("{} = {value}: {e}", param.name(base));
            None
        }
    }
}

/// Move each parameter down and up by `options.perturbation` and rerun with
/// the same seed. Rejected perturbations fall back to the base success.
pub fn run_sensitivity(
    inputs: &Inputs,
    options: &SensitivityOptions,
    cancel: &CancelToken,
) -> PlanResult<SensitivityReport> {
    let base = capped(inputs, options.max_paths);
    let base_success = simulation::run(&base)?.success_probability;

    let params = match &options.parameters {
        Some(names) => names
            .iter()
            .map(|n| parameter_by_name(&base, n))
            .collect::<PlanResult<Vec<_>>>()?,
        None => discover_parameters(&base),
    };
    let specs: Vec<(Parameter, f64, f64, f64)> = params
        .iter()
        .map(|p| {
            let value = p.value(&base);
            let (low, high) = p.bounds(value, options.perturbation);
            (*p, value, low, high)
        })
        .collect();
    let jobs: Vec<(Parameter, f64)> = specs
        .iter()
        .flat_map(|(p, _, low, high)| [(*p, *low), (*p, *high)])
        .collect();

    info!(
        "sensitivity: {} parameters, {} runs of {} paths",
        specs.len(),
        jobs.len(),
        base.simulation.n_paths
    );
    let pool = build_pool(options.workers)?;
    // Outer None: skipped after cancellation. Inner None: rejected config.
    let outcomes: Vec<Option<Option<f64>>> = pool.install(|| {
        jobs.par_iter()
            .map(|(p, value)| (!cancel.is_cancelled()).then(|| perturbed_success(&base, *p, *value)))
            .collect()
    });

    let results: Vec<SensitivityResult> = specs
        .iter()
        .zip(outcomes.chunks(2))
        .filter_map(|((p, value, low, high), pair)| {
            let low_success = pair[0]?.unwrap_or(base_success);
            let high_success = pair[1]?.unwrap_or(base_success);
            Some(SensitivityResult {
                parameter_name: p.name(&base),
                base_value: *value,
                low_value: *low,
                high_value: *high,
                base_success,
                low_success,
                high_success,
                impact: high_success - low_success,
            })
        })
        .collect();

    let completed = results.len() == specs.len();
    if !completed {
        info!("sensitivity cancelled after {} of {} parameters", results.len(), specs.len());
    }
    Ok(SensitivityReport {
        base_success_probability: base_success,
        results,
        completed,
    })
}

// ── Two-dimensional sweep ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub parameter: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityGrid {
    pub x_parameter: String,
    pub y_parameter: String,
    pub x_values: Vec<f64>,
    pub y_values: Vec<f64>,
    /// `success_grid[i][j]` is the run at `x_values[i]`, `y_values[j]`.
    /// `None` marks a cell that was cancelled or rejected.
    pub success_grid: Vec<Vec<Option<f64>>>,
    pub completed: bool,
}

/// Full rerun at every point of the `x` by `y` grid.
pub fn run_2d_sensitivity(
    inputs: &Inputs,
    x: &Axis,
    y: &Axis,
    options: &SensitivityOptions,
    cancel: &CancelToken,
) -> PlanResult<SensitivityGrid> {
    if x.values.is_empty() || y.values.is_empty() {
        return Err(PlanError::config("sensitivity grid axes need at least one value"));
    }
    let base = capped(inputs, options.max_paths);
    let px = parameter_by_name(&base, &x.parameter)?;
    let py = parameter_by_name(&base, &y.parameter)?;
    if px == py {
        return Err(PlanError::config(format!(
            "grid axes must differ (both '{}')",
            x.parameter
        )));
    }

    let cells: Vec<(f64, f64)> = x
        .values
        .iter()
        .flat_map(|vx| y.values.iter().map(move |vy| (*vx, *vy)))
        .collect();
    info!(
        "sensitivity grid: {} x {} = {} runs",
        x.values.len(),
        y.values.len(),
        cells.len()
    );

    let pool = build_pool(options.workers)?;
    let outcomes: Vec<Option<Option<f64>>> = pool.install(|| {
        cells
            .par_iter()
            .map(|(vx, vy)| {
                if cancel.is_cancelled() {
                    return None;
                }
                let mut cell = base.clone();
                px.apply(&mut cell, *vx);
                Some(perturbed_success(&cell, py, *vy))
            })
            .collect()
    });

    let completed = outcomes.iter().all(Option::is_some);
    let success_grid = outcomes
        .chunks(y.values.len())
        .map(|row| row.iter().map(|c| c.flatten()).collect())
        .collect();
    Ok(SensitivityGrid {
        x_parameter: x.parameter.clone(),
        y_parameter: y.parameter.clone(),
        x_values: x.values.clone(),
        y_values: y.values.clone(),
        success_grid,
        completed,
    })
}
