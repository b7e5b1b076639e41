use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::Inputs;
use crate::error::{PlanError, PlanResult};
use crate::simulation;

#[derive(Debug, Clone, PartialEq)]
pub struct SwrOptions {
    pub spending_low: f64,
    /// Defaults to `max(2 * monthly_spending, 1000)`.
    pub spending_high: Option<f64>,
    /// Stop once the bracket is narrower than this many dollars.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for SwrOptions {
    fn default() -> Self {
        Self {
            spending_low: 0.0,
            spending_high: None,
            tolerance: 50.0,
            max_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeWithdrawal {
    pub max_monthly_spending: f64,
    pub annual_withdrawal: f64,
    /// Annual withdrawal over the starting portfolio; zero for an empty one.
    pub implied_rate: f64,
    pub target_success: f64,
    /// Success at `max_monthly_spending`, from a final confirming run.
    pub achieved_success: f64,
    pub iterations: usize,
    pub initial_portfolio: f64,
}

fn success_at(inputs: &Inputs, monthly_spending: f64) -> PlanResult<f64> {
    let mut trial = inputs.clone();
    trial.plan.monthly_spending = monthly_spending;
    Ok(simulation::run(&trial)?.success_probability)
}

/// Bisect on monthly spending for the highest level whose success still
/// meets `target_success`. Reports the conservative end of the bracket.
pub fn find_safe_withdrawal(
    inputs: &Inputs,
    target_success: f64,
    options: &SwrOptions,
) -> PlanResult<SafeWithdrawal> {
    if !(0.0..=1.0).contains(&target_success) {
        return Err(PlanError::config(format!(
            "target success {target_success} outside [0, 1]"
        )));
    }
    let mut low = options.spending_low;
    let mut high = options
        .spending_high
        .unwrap_or_else(|| (inputs.plan.monthly_spending * 2.0).max(1_000.0));
    if !(low >= 0.0 && high > low) || !(options.tolerance > 0.0) {
        return Err(PlanError::config(format!(
            "invalid withdrawal search bracket [{low}, {high}] with tolerance {}",
            options.tolerance
        )));
    }
    inputs.validate()?;

    let mut iterations = 0;
    while iterations < options.max_iterations {
        iterations += 1;
        let mid = 0.5 * (low + high);
        let success = success_at(inputs, mid)?;
        debug!("swr iteration {iterations}: spending {mid:.2} -> success {success:.4}");
        if success >= target_success {
            low = mid;
        } else {
            high = mid;
        }
        if high - low < options.tolerance {
            break;
        }
    }

    let achieved_success = success_at(inputs, low)?;
    let initial_portfolio = inputs.plan.initial_balance();
    let annual_withdrawal = low * 12.0;
    info!("safe spending {low:.2}/month at {achieved_success:.4} success after {iterations} iterations");
    Ok(SafeWithdrawal {
        max_monthly_spending: low,
        annual_withdrawal,
        implied_rate: if initial_portfolio > 0.0 {
            annual_withdrawal / initial_portfolio
        } else {
            0.0
        },
        target_success,
        achieved_success,
        iterations,
        initial_portfolio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_inputs() -> Inputs {
        let mut inputs = Inputs::canonical();
        inputs.plan.current_age = 60;
        inputs.plan.retirement_age = 61;
        inputs.plan.end_age = 85;
        inputs.simulation.n_paths = 200;
        inputs
    }

    #[test]
    fn bracket_narrows_to_tolerance() {
        let inputs = quick_inputs();
        let found = find_safe_withdrawal(&inputs, 0.9, &SwrOptions::default()).unwrap();
        assert!(found.iterations <= 20);
        assert!(found.max_monthly_spending >= 0.0 && found.max_monthly_spending < 10_000.0);
        assert!(found.achieved_success >= 0.9, "{found:?}");
        assert_eq!(found.annual_withdrawal, found.max_monthly_spending * 12.0);
        assert_eq!(found.initial_portfolio, 180_000.0);
    }

    #[test]
    fn higher_target_never_allows_more_spending() {
        let inputs = quick_inputs();
        let loose = find_safe_withdrawal(&inputs, 0.5, &SwrOptions::default()).unwrap();
        let strict = find_safe_withdrawal(&inputs, 0.95, &SwrOptions::default()).unwrap();
        assert!(strict.max_monthly_spending <= loose.max_monthly_spending);
    }

    #[test]
    fn rejects_bad_targets_and_brackets() {
        let inputs = quick_inputs();
        assert!(find_safe_withdrawal(&inputs, 1.5, &SwrOptions::default()).is_err());
        let inverted = SwrOptions {
            spending_low: 2_000.0,
            spending_high: Some(1_000.0),
            ..SwrOptions::default()
        };
        assert!(find_safe_withdrawal(&inputs, 0.9, &inverted).is_err());
    }
}
