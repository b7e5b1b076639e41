use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

const REVIEW_INTERVAL_MONTHS: u32 = 12;

/// Guyton-Klinger style guardrails around the initial withdrawal rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Annual withdrawal rate applied to the balance at retirement.
    pub initial_rate: f64,
    /// Raise when the current rate drops this fraction below the initial rate.
    pub upper_threshold: f64,
    /// Cut when the current rate rises this fraction above the initial rate.
    pub lower_threshold: f64,
    pub raise_pct: f64,
    pub cut_pct: f64,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            initial_rate: 0.05,
            upper_threshold: 0.20,
            lower_threshold: 0.20,
            raise_pct: 0.10,
            cut_pct: 0.10,
        }
    }
}

/// Per-path memory carried between steps. `last_real_target` is in
/// retirement-start dollars; it is `None` until the first retirement month.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GuardrailsMemory {
    pub last_real_target: Option<f64>,
    pub months_since_review: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailDecision {
    Hold,
    Raise,
    Cut,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardrailsStep {
    pub target: f64,
    pub memory: GuardrailsMemory,
    pub decision: GuardrailDecision,
}

impl GuardrailsConfig {
    /// One month of the rule. Reviews happen once a year, on the retirement
    /// anniversary; in between the real target is simply re-inflated.
    pub fn step(&self, memory: GuardrailsMemory, balance: f64, inflation_index: f64) -> GuardrailsStep {
        let Some(mut real) = memory.last_real_target else {
            let nominal = balance.max(0.0) * self.initial_rate / 12.0;
            return GuardrailsStep {
                target: nominal,
                memory: GuardrailsMemory {
                    last_real_target: Some(nominal / inflation_index),
                    months_since_review: 0,
                },
                decision: GuardrailDecision::Hold,
            };
        };

        let mut months = memory.months_since_review + 1;
        let mut decision = GuardrailDecision::Hold;
        if months >= REVIEW_INTERVAL_MONTHS {
            months = 0;
            if balance > 0.0 {
                let current_rate = real * inflation_index * 12.0 / balance;
                if current_rate < self.initial_rate * (1.0 - self.upper_threshold) {
                    real *= 1.0 + self.raise_pct;
                    decision = GuardrailDecision::Raise;
                } else if current_rate > self.initial_rate * (1.0 + self.lower_threshold) {
                    real *= 1.0 - self.cut_pct;
                    decision = GuardrailDecision::Cut;
                }
            }
        }
        GuardrailsStep {
            target: real * inflation_index,
            memory: GuardrailsMemory {
                last_real_target: Some(real),
                months_since_review: months,
            },
            decision,
        }
    }
}

/// How much to withdraw each retirement month.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpendingPolicy {
    /// Baseline monthly spending, inflation-adjusted.
    #[default]
    ConstantReal,
    PercentOfPortfolio { annual_rate: f64 },
    Guardrails(GuardrailsConfig),
    /// Variable percentage withdrawal: spread the balance over the months left.
    Vpw { min_rate: f64, max_rate: f64 },
    /// Percent of portfolio, bounded by real floor and ceiling amounts.
    FloorCeiling {
        annual_rate: f64,
        floor: f64,
        ceiling: f64,
    },
}

/// Everything a policy may look at for one path in one month.
#[derive(Debug, Clone, Copy)]
pub struct SpendingInputs {
    /// Portfolio value before this month's withdrawal.
    pub balance: f64,
    pub inflation_index: f64,
    /// Months left in the horizon, counting this one.
    pub remaining_months: usize,
    pub age: f64,
    /// Plan baseline in today's dollars.
    pub base_spending: f64,
}

impl SpendingPolicy {
    pub fn validate(&self) -> PlanResult<()> {
        let non_negative = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(PlanError::config(format!("{name} must be non-negative (got {v})")))
            }
        };
        match self {
            SpendingPolicy::ConstantReal => Ok(()),
            SpendingPolicy::PercentOfPortfolio { annual_rate } => non_negative("annual_rate", *annual_rate),
            SpendingPolicy::Guardrails(g) => {
                if !(g.initial_rate > 0.0) {
                    return Err(PlanError::config("guardrails initial_rate must be positive"));
                }
                non_negative("upper_threshold", g.upper_threshold)?;
                non_negative("lower_threshold", g.lower_threshold)?;
                for (name, v) in [("raise_pct", g.raise_pct), ("cut_pct", g.cut_pct)] {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(PlanError::config(format!("guardrails {name} outside [0, 1]")));
                    }
                }
                Ok(())
            }
            SpendingPolicy::Vpw { min_rate, max_rate } => {
                non_negative("min_rate", *min_rate)?;
                non_negative("max_rate", *max_rate)?;
                if min_rate > max_rate {
                    return Err(PlanError::config(format!(
                        "VPW min_rate {min_rate} exceeds max_rate {max_rate}"
                    )));
                }
                Ok(())
            }
            SpendingPolicy::FloorCeiling {
                annual_rate,
                floor,
                ceiling,
            } => {
                non_negative("annual_rate", *annual_rate)?;
                non_negative("floor", *floor)?;
                non_negative("ceiling", *ceiling)?;
                if floor > ceiling {
                    return Err(PlanError::config(format!(
                        "spending floor {floor} exceeds ceiling {ceiling}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Nominal withdrawal target for one path. Stateless policies hand the
    /// memory back unchanged.
    pub fn target(&self, inputs: &SpendingInputs, memory: GuardrailsMemory) -> (f64, GuardrailsMemory) {
        let balance = inputs.balance.max(0.0);
        let index = inputs.inflation_index;
        let target = match self {
            SpendingPolicy::ConstantReal => inputs.base_spending * index,
            SpendingPolicy::PercentOfPortfolio { annual_rate } => balance * annual_rate / 12.0,
            SpendingPolicy::Guardrails(g) => {
                let step = g.step(memory, inputs.balance, index);
                return (step.target, step.memory);
            }
            SpendingPolicy::Vpw { min_rate, max_rate } => {
                balance * vpw_annual_rate(inputs.remaining_months, *min_rate, *max_rate) / 12.0
            }
            SpendingPolicy::FloorCeiling {
                annual_rate,
                floor,
                ceiling,
            } => (balance * annual_rate / 12.0).max(floor * index).min(ceiling * index),
        };
        (target, memory)
    }

    /// Targets for every path in one month. `memory` is read and rewritten
    /// in place for stateful policies.
    pub fn compute(
        &self,
        base_spending: f64,
        balances: &[f64],
        inflation_index: &[f64],
        remaining_months: usize,
        age: f64,
        memory: &mut [GuardrailsMemory],
        out: &mut [f64],
    ) {
        for p in 0..balances.len() {
            let inputs = SpendingInputs {
                balance: balances[p],
                inflation_index: inflation_index[p],
                remaining_months,
                age,
                base_spending,
            };
            let (target, next) = self.target(&inputs, memory[p]);
            out[p] = target;
            memory[p] = next;
        }
    }
}

/// Annualised VPW rate `12 / remaining_months`, clamped to `[min, max]`.
pub fn vpw_annual_rate(remaining_months: usize, min_rate: f64, max_rate: f64) -> f64 {
    let remaining = remaining_months.max(1) as f64;
    (12.0 / remaining).clamp(min_rate, max_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(balance: f64, inflation_index: f64, remaining_months: usize) -> SpendingInputs {
        SpendingInputs {
            balance,
            inflation_index,
            remaining_months,
            age: 70.0,
            base_spending: 4_000.0,
        }
    }

    #[test]
    fn constant_real_tracks_inflation() {
        let (t, _) = SpendingPolicy::ConstantReal.target(&inputs(1e6, 1.25, 100), GuardrailsMemory::default());
        assert!((t - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn percent_of_portfolio_ignores_negative_balance() {
        let p = SpendingPolicy::PercentOfPortfolio { annual_rate: 0.04 };
        assert!((p.target(&inputs(1_200_000.0, 1.0, 1), GuardrailsMemory::default()).0 - 4_000.0).abs() < 1e-9);
        assert_eq!(p.target(&inputs(-5.0, 1.0, 1), GuardrailsMemory::default()).0, 0.0);
    }

    #[test]
    fn vpw_saturates_at_max_in_last_month() {
        assert_eq!(vpw_annual_rate(1, 0.03, 0.15), 0.15);
        assert_eq!(vpw_annual_rate(0, 0.03, 0.15), 0.15);
        assert_eq!(vpw_annual_rate(600, 0.03, 0.15), 0.03);
        let mid = vpw_annual_rate(240, 0.03, 0.15);
        assert!((mid - 0.05).abs() < 1e-12, "20 years left → 5%, got {mid}");

        let p = SpendingPolicy::Vpw { min_rate: 0.03, max_rate: 0.15 };
        let (t, _) = p.target(&inputs(120_000.0, 1.0, 1), GuardrailsMemory::default());
        assert!((t - 1_500.0).abs() < 1e-9);
    }

    #[test]
    fn vpw_rate_rises_as_horizon_shrinks() {
        let mut last = 0.0;
        for remaining in (1..=480).rev() {
            let r = vpw_annual_rate(remaining, 0.0, 1.0);
            assert!(r >= last, "rate fell at {remaining} months left");
            last = r;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn floor_ceiling_clamps_in_real_terms() {
        let p = SpendingPolicy::FloorCeiling {
            annual_rate: 0.05,
            floor: 3_000.0,
            ceiling: 6_000.0,
        };
        let m = GuardrailsMemory::default();
        assert!((p.target(&inputs(100_000.0, 1.1, 10), m).0 - 3_300.0).abs() < 1e-9);
        assert!((p.target(&inputs(10_000_000.0, 1.1, 10), m).0 - 6_600.0).abs() < 1e-9);
        assert!((p.target(&inputs(1_000_000.0, 1.0, 10), m).0 - 4_166.666_666_666_667).abs() < 1e-6);
    }

    #[test]
    fn non_finite_bounds_are_rejected() {
        let bad = [
            SpendingPolicy::Vpw { min_rate: 0.03, max_rate: f64::NAN },
            SpendingPolicy::Vpw { min_rate: f64::NAN, max_rate: 0.15 },
            SpendingPolicy::Vpw { min_rate: 0.03, max_rate: f64::INFINITY },
            SpendingPolicy::FloorCeiling { annual_rate: 0.04, floor: 3_000.0, ceiling: f64::NAN },
            SpendingPolicy::FloorCeiling { annual_rate: 0.04, floor: f64::NAN, ceiling: 6_000.0 },
            SpendingPolicy::FloorCeiling { annual_rate: 0.04, floor: 3_000.0, ceiling: f64::INFINITY },
        ];
        for policy in bad {
            assert!(matches!(policy.validate(), Err(PlanError::Config(_))), "{policy:?} accepted");
        }
    }

    #[test]
    fn floor_ceiling_does_not_panic_on_negative_index() {
        let p = SpendingPolicy::FloorCeiling {
            annual_rate: 0.04,
            floor: 3_000.0,
            ceiling: 6_000.0,
        };
        let (t, _) = p.target(&inputs(1_000_000.0, -0.5, 10), GuardrailsMemory::default());
        assert!(t.is_finite());
    }

    #[test]
    fn guardrails_first_month_sets_initial_target() {
        let g = GuardrailsConfig::default();
        let step = g.step(GuardrailsMemory::default(), 1_200_000.0, 1.0);
        assert!((step.target - 5_000.0).abs() < 1e-9);
        assert_eq!(step.memory.last_real_target, Some(5_000.0));
        assert_eq!(step.decision, GuardrailDecision::Hold);
    }

    #[test]
    fn guardrails_with_wide_thresholds_match_constant_real() {
        let g = GuardrailsConfig {
            upper_threshold: 1e9,
            lower_threshold: 1e9,
            ..GuardrailsConfig::default()
        };
        let guardrails = SpendingPolicy::Guardrails(g);
        let balance0 = 1_200_000.0;
        let base = balance0 * 0.05 / 12.0;
        let mut memory = GuardrailsMemory::default();
        let mut index = 1.0;
        for month in 0..360 {
            let balance = balance0 * (1.0 + 0.3 * ((month as f64) / 7.0).sin());
            let (g_target, next) = guardrails.target(&inputs(balance, index, 360 - month), memory);
            memory = next;
            let (c_target, _) = SpendingPolicy::ConstantReal.target(
                &SpendingInputs { base_spending: base, ..inputs(balance, index, 360 - month) },
                GuardrailsMemory::default(),
            );
            assert!(
                (g_target - c_target).abs() < 1e-9 * c_target,
                "month {month}: guardrails {g_target} vs constant-real {c_target}"
            );
            index *= 1.002;
        }
    }

    #[test]
    fn guardrails_one_raise_after_fifty_percent_growth() {
        let g = GuardrailsConfig {
            initial_rate: 0.05,
            upper_threshold: 0.20,
            lower_threshold: 0.20,
            raise_pct: 0.10,
            cut_pct: 0.10,
        };
        let mut memory = GuardrailsMemory::default();
        let mut raises = 0;
        let mut last_target = 0.0;
        for month in 0..=12 {
            let balance = 1_000_000.0 * (1.0 + 0.5 * month as f64 / 12.0);
            let step = g.step(memory, balance, 1.0);
            if step.decision == GuardrailDecision::Raise {
                raises += 1;
            }
            assert_ne!(step.decision, GuardrailDecision::Cut);
            memory = step.memory;
            last_target = step.target;
        }
        assert_eq!(raises, 1, "expected exactly one prosperity raise");
        let expected = 1_000_000.0 * 0.05 / 12.0 * 1.1;
        assert!((last_target - expected).abs() < 1e-6, "target {last_target}");
    }

    #[test]
    fn guardrails_cut_after_drawdown() {
        let g = GuardrailsConfig::default();
        let mut memory = g.step(GuardrailsMemory::default(), 1_000_000.0, 1.0).memory;
        let mut decision = GuardrailDecision::Hold;
        for _ in 0..12 {
            let step = g.step(memory, 600_000.0, 1.0);
            memory = step.memory;
            decision = step.decision;
        }
        assert_eq!(decision, GuardrailDecision::Cut);
        let real = memory.last_real_target.unwrap();
        assert!((real - 1_000_000.0 * 0.05 / 12.0 * 0.9).abs() < 1e-9);
    }

    #[test]
    fn bulk_compute_threads_memory() {
        let policy = SpendingPolicy::Guardrails(GuardrailsConfig::default());
        let balances = [1_200_000.0, 2_400_000.0];
        let index = [1.0, 1.0];
        let mut memory = [GuardrailsMemory::default(); 2];
        let mut out = [0.0; 2];
        policy.compute(0.0, &balances, &index, 300, 65.0, &mut memory, &mut out);
        assert!((out[0] - 5_000.0).abs() < 1e-9);
        assert!((out[1] - 10_000.0).abs() < 1e-9);
        assert_eq!(memory[1].last_real_target, Some(10_000.0));
    }

    #[test]
    fn validation() {
        assert!(SpendingPolicy::Vpw { min_rate: 0.2, max_rate: 0.1 }.validate().is_err());
        assert!(SpendingPolicy::FloorCeiling { annual_rate: 0.04, floor: 5.0, ceiling: 1.0 }.validate().is_err());
        assert!(SpendingPolicy::Guardrails(GuardrailsConfig { initial_rate: 0.0, ..Default::default() }).validate().is_err());
        assert!(SpendingPolicy::Guardrails(GuardrailsConfig::default()).validate().is_ok());
        assert!(SpendingPolicy::PercentOfPortfolio { annual_rate: -0.01 }.validate().is_err());
    }
}
