use serde::{Deserialize, Serialize};

/// Cross-path distribution of one quantity at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSet {
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub mean: f64,
}

impl PercentileSet {
    pub fn named(&self) -> [(&'static str, f64); 6] {
        [
            ("p5", self.p5),
            ("p25", self.p25),
            ("p50", self.p50),
            ("p75", self.p75),
            ("p95", self.p95),
            ("mean", self.mean),
        ]
    }
}

/// Sorts `values` in place and interpolates linearly between order
/// statistics (`h = p * (n - 1)`). Zeros for an empty slice.
pub fn percentile_set(values: &mut [f64]) -> PercentileSet {
    if values.is_empty() {
        return PercentileSet::default();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();

    let interp = |p: f64| -> f64 {
        let h = p * (n - 1) as f64;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        let frac = h - lo as f64;
        values[lo] * (1.0 - frac) + values[hi] * frac
    };

    PercentileSet {
        p5: interp(0.05),
        p25: interp(0.25),
        p50: interp(0.50),
        p75: interp(0.75),
        p95: interp(0.95),
        mean: values.iter().sum::<f64>() / n as f64,
    }
}

/// One percentile set per step, stored column-wise so each named series is
/// a contiguous vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSeries {
    pub p5: Vec<f64>,
    pub p25: Vec<f64>,
    pub p50: Vec<f64>,
    pub p75: Vec<f64>,
    pub p95: Vec<f64>,
    pub mean: Vec<f64>,
}

impl PercentileSeries {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            p5: Vec::with_capacity(n),
            p25: Vec::with_capacity(n),
            p50: Vec::with_capacity(n),
            p75: Vec::with_capacity(n),
            p95: Vec::with_capacity(n),
            mean: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, set: PercentileSet) {
        self.p5.push(set.p5);
        self.p25.push(set.p25);
        self.p50.push(set.p50);
        self.p75.push(set.p75);
        self.p95.push(set.p95);
        self.mean.push(set.mean);
    }

    /// Fold one step's cross-path column. The column is sorted in place.
    pub fn push_column(&mut self, column: &mut [f64]) {
        self.push(percentile_set(column));
    }

    pub fn len(&self) -> usize {
        self.p50.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p50.is_empty()
    }

    pub fn at(&self, step: usize) -> Option<PercentileSet> {
        (step < self.len()).then(|| PercentileSet {
            p5: self.p5[step],
            p25: self.p25[step],
            p50: self.p50[step],
            p75: self.p75[step],
            p95: self.p95[step],
            mean: self.mean[step],
        })
    }

    pub fn named(&self) -> [(&'static str, &[f64]); 6] {
        [
            ("p5", self.p5.as_slice()),
            ("p25", self.p25.as_slice()),
            ("p50", self.p50.as_slice()),
            ("p75", self.p75.as_slice()),
            ("p95", self.p95.as_slice()),
            ("mean", self.mean.as_slice()),
        ]
    }
}

/// Per-path outcome tallies the orchestrator keeps alongside the state.
#[derive(Debug, Clone, Default)]
pub struct PathOutcomes {
    pub failed: Vec<bool>,
    /// Retirement months spent depleted or short of the spending target.
    pub ruin_months: Vec<u32>,
    /// Nominal spending that could not be funded.
    pub unmet: Vec<f64>,
}

impl PathOutcomes {
    pub fn new(n_paths: usize) -> Self {
        Self {
            failed: vec![false; n_paths],
            ruin_months: vec![0; n_paths],
            unmet: vec![0.0; n_paths],
        }
    }

    pub fn success_probability(&self) -> f64 {
        if self.failed.is_empty() {
            return 0.0;
        }
        let ok = self.failed.iter().filter(|f| !**f).count();
        ok as f64 / self.failed.len() as f64
    }
}

/// Shortfall statistics complementing the success probability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationMetrics {
    pub shortfall_probability: f64,
    /// Mean months in ruin, over failed paths only. Zero when none failed.
    pub mean_ruin_months: f64,
    /// Mean unmet spending over all paths.
    pub mean_unmet_spending: f64,
    pub mean_terminal_wealth: f64,
}

pub fn compute_metrics(outcomes: &PathOutcomes, terminal_wealth: &[f64]) -> SimulationMetrics {
    let n = outcomes.failed.len();
    if n == 0 {
        return SimulationMetrics::default();
    }
    let failed: Vec<usize> = (0..n).filter(|p| outcomes.failed[*p]).collect();
    let mean_ruin_months = if failed.is_empty() {
        0.0
    } else {
        failed.iter().map(|p| outcomes.ruin_months[*p] as f64).sum::<f64>() / failed.len() as f64
    };
    let mean_terminal_wealth = if terminal_wealth.is_empty() {
        0.0
    } else {
        terminal_wealth.iter().sum::<f64>() / terminal_wealth.len() as f64
    };
    SimulationMetrics {
        shortfall_probability: failed.len() as f64 / n as f64,
        mean_ruin_months,
        mean_unmet_spending: outcomes.unmet.iter().sum::<f64>() / n as f64,
        mean_terminal_wealth,
    }
}
