//! Deterministic shocks overwritten onto generated market paths.
//!
//! Scenarios are applied in the order listed. Each one replaces the values in
//! its own window on the series it governs (asset returns, or inflation), so
//! where two windows overlap on the same series the later scenario wins.
//! Returns and inflation are separate series and never clobber each other.

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};
use crate::inflation::InflationPaths;
use crate::returns::PathTensor;
use crate::types::Timeline;

/// Peak-to-trough fall of a severity-1 crash.
pub const CRASH_DECLINE: f64 = 0.38;
/// Longest run of sequence-risk losses before the rebound phase.
pub const SEQUENCE_BAD_MONTHS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressKind {
    /// Geometric decline over the first half of the window, V-shaped recovery
    /// back to the pre-crash level over the second.
    Crash,
    /// Near-zero returns for the whole window.
    LostDecade,
    /// Inflation pinned at 6% + 2% × severity annualised.
    HighInflation,
    /// Clustered monthly losses up front, then a modest rebound.
    SequenceRisk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub kind: StressKind,
    pub start_age: f64,
    pub duration_months: usize,
    pub severity: f64,
}

impl StressScenario {
    pub fn validate(&self) -> PlanResult<()> {
        if !self.severity.is_finite() || self.severity < 0.0 {
            return Err(PlanError::config(format!(
                "{:?} severity must be a non-negative number (got {})",
                self.kind, self.severity
            )));
        }
        if self.duration_months == 0 {
            return Err(PlanError::config(format!("{:?} duration must be positive", self.kind)));
        }
        if self.kind == StressKind::Crash && CRASH_DECLINE * self.severity >= 1.0 {
            return Err(PlanError::config(format!(
                "crash severity {} would wipe out more than the whole portfolio",
                self.severity
            )));
        }
        Ok(())
    }

    /// Step window `[start, end)` clipped to the horizon, or `None` if empty.
    pub fn window(&self, timeline: &Timeline) -> Option<(usize, usize)> {
        let start = timeline.step_at_age(self.start_age);
        let end = start + self.duration_months as i64;
        let start = start.max(0) as usize;
        let end = end.clamp(0, timeline.n_steps() as i64) as usize;
        (start < end).then_some((start, end))
    }
}

fn fill_returns(returns: &mut PathTensor, start: usize, end: usize, value: f64) {
    for p in 0..returns.n_paths {
        for t in start..end {
            returns.row_mut(p, t).fill(value);
        }
    }
}

/// Overwrite stressed windows in place.
pub fn apply(
    scenarios: &[StressScenario],
    timeline: &Timeline,
    returns: &mut PathTensor,
    inflation: &mut InflationPaths,
) {
    for scenario in scenarios {
        let Some((start, end)) = scenario.window(timeline) else {
            log::debug!("stress {:?} falls outside the horizon, skipped", scenario.kind);
            continue;
        };
        let severity = scenario.severity;
        match scenario.kind {
            StressKind::Crash => {
                let duration = end - start;
                let half = duration / 2;
                let trough = 1.0 - CRASH_DECLINE * severity;
                if half > 0 {
                    let monthly = trough.powf(1.0 / half as f64) - 1.0;
                    fill_returns(returns, start, start + half, monthly);
                }
                let recovery = duration - half;
                if recovery > 0 {
                    let monthly = (1.0 / trough).powf(1.0 / recovery as f64) - 1.0;
                    fill_returns(returns, start + half, end, monthly);
                }
            }
            StressKind::LostDecade => {
                fill_returns(returns, start, end, 0.001 * (1.0 - severity));
            }
            StressKind::HighInflation => {
                let monthly = (0.06 + 0.02 * severity) / 12.0;
                for p in 0..inflation.n_paths() {
                    for t in start..end {
                        inflation.set_monthly_rate(p, t, monthly);
                    }
                }
            }
            StressKind::SequenceRisk => {
                let bad = (end - start).min(SEQUENCE_BAD_MONTHS);
                fill_returns(returns, start, start + bad, -0.02 * severity);
                fill_returns(returns, start + bad, end, 0.01);
            }
        }
        log::debug!(
            "stress {:?} applied to steps {start}..{end} at severity {severity}",
            scenario.kind
        );
    }
}
