//! Annual income tax, withdrawal gross-up, required minimum distributions and
//! Roth conversions. Figures are 2024 US federal.

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};
use crate::types::FilingStatus;

/// First age at which a required minimum distribution applies.
pub const RMD_START_AGE: u32 = 73;

/// Relative tolerance of the gross-up fixed point.
pub const GROSS_UP_TOLERANCE: f64 = 1e-6;
pub const GROSS_UP_MAX_ITERATIONS: usize = 100;

const SURTAX_RATE: f64 = 0.038;

// ── Federal schedules ───────────────────────────────────────────────────────

/// `(upper bound, marginal rate)`; the last bracket is unbounded.
type Brackets = &'static [(f64, f64)];

struct Schedule {
    standard_deduction: f64,
    ordinary: Brackets,
    gains: Brackets,
    surtax_threshold: f64,
}

const SINGLE: Schedule = Schedule {
    standard_deduction: 14_600.0,
    ordinary: &[
        (11_600.0, 0.10),
        (47_150.0, 0.12),
        (100_525.0, 0.22),
        (191_950.0, 0.24),
        (243_725.0, 0.32),
        (609_350.0, 0.35),
        (f64::INFINITY, 0.37),
    ],
    gains: &[(47_025.0, 0.0), (518_900.0, 0.15), (f64::INFINITY, 0.20)],
    surtax_threshold: 200_000.0,
};

const MARRIED_JOINTLY: Schedule = Schedule {
    standard_deduction: 29_200.0,
    ordinary: &[
        (23_200.0, 0.10),
        (94_300.0, 0.12),
        (201_050.0, 0.22),
        (383_900.0, 0.24),
        (487_450.0, 0.32),
        (731_200.0, 0.35),
        (f64::INFINITY, 0.37),
    ],
    gains: &[(94_050.0, 0.0), (583_750.0, 0.15), (f64::INFINITY, 0.20)],
    surtax_threshold: 250_000.0,
};

fn schedule(status: FilingStatus) -> &'static Schedule {
    match status {
        FilingStatus::Single => &SINGLE,
        FilingStatus::MarriedJointly => &MARRIED_JOINTLY,
    }
}

fn apply_brackets(income: f64, brackets: Brackets) -> f64 {
    let mut tax = 0.0;
    let mut floor = 0.0;
    for &(upper, rate) in brackets {
        if income <= floor {
            break;
        }
        tax += (income.min(upper) - floor) * rate;
        floor = upper;
    }
    tax
}

/// Federal tax on ordinary income alone, after the standard deduction.
pub fn ordinary_income_tax(gross: f64, status: FilingStatus) -> f64 {
    let s = schedule(status);
    apply_brackets((gross - s.standard_deduction).max(0.0), s.ordinary)
}

/// Gross ordinary income that exactly fills the bracket taxed at `rate`.
pub fn bracket_ceiling(rate: f64, status: FilingStatus) -> PlanResult<f64> {
    let s = schedule(status);
    match s.ordinary.iter().find(|(_, r)| (r - rate).abs() < 1e-9) {
        Some((upper, _)) if upper.is_finite() => Ok(upper + s.standard_deduction),
        Some(_) => Err(PlanError::config(format!(
            "the {:.0}% bracket has no ceiling to fill",
            rate * 100.0
        ))),
        None => Err(PlanError::config(format!(
            "no {:.1}% ordinary bracket for {status:?}",
            rate * 100.0
        ))),
    }
}

// ── Required minimum distributions ──────────────────────────────────────────

/// IRS Uniform Lifetime Table, ages 72..=120.
const UNIFORM_LIFETIME: [f64; 49] = [
    27.4, 26.5, 25.5, 24.6, 23.7, 22.9, 22.0, 21.1, 20.2, // 72-80
    19.4, 18.5, 17.7, 16.8, 16.0, 15.2, 14.4, 13.7, 12.9, 12.2, // 81-90
    11.5, 10.8, 10.1, 9.5, 8.9, 8.4, 7.8, 7.3, 6.8, 6.4, // 91-100
    6.0, 5.6, 5.2, 4.9, 4.6, 4.3, 4.1, 3.9, 3.7, 3.5, // 101-110
    3.4, 3.3, 3.1, 3.0, 2.9, 2.8, 2.7, 2.5, 2.3, 2.0, // 111-120
];
const TABLE_FIRST_AGE: u32 = 72;

/// Divisor for `age`; ages past the table reuse its last entry.
pub fn rmd_divisor(age: u32) -> Option<f64> {
    if age < TABLE_FIRST_AGE {
        return None;
    }
    let i = ((age - TABLE_FIRST_AGE) as usize).min(UNIFORM_LIFETIME.len() - 1);
    Some(UNIFORM_LIFETIME[i])
}

/// Prior year-end tax-deferred balance divided by the age divisor.
pub fn required_minimum_distribution(prior_balance: f64, age: u32) -> f64 {
    if age < RMD_START_AGE || prior_balance <= 0.0 {
        return 0.0;
    }
    rmd_divisor(age).map_or(0.0, |d| prior_balance / d)
}

// ── Tax configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaxModel {
    /// One rate on all ordinary income and gains.
    Flat { rate: f64 },
    /// Federal brackets, standard deduction and stacked long-term gains.
    Progressive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxConfig {
    pub model: TaxModel,
    pub filing_status: FilingStatus,
    /// Flat state-level rate over ordinary income plus gains.
    #[serde(default)]
    pub state_rate: f64,
    /// Net investment income surtax (progressive model only).
    #[serde(default)]
    pub include_surtax: bool,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            model: TaxModel::Flat { rate: 0.22 },
            filing_status: FilingStatus::Single,
            state_rate: 0.0,
            include_surtax: false,
        }
    }
}

impl TaxConfig {
    pub fn validate(&self) -> PlanResult<()> {
        if let TaxModel::Flat { rate } = self.model {
            if !(0.0..1.0).contains(&rate) {
                return Err(PlanError::config(format!("flat tax rate {rate} outside [0, 1)")));
            }
        }
        if !(0.0..1.0).contains(&self.state_rate) {
            return Err(PlanError::config(format!(
                "state tax rate {} outside [0, 1)",
                self.state_rate
            )));
        }
        let top = self.top_marginal_rate();
        if top >= 1.0 {
            return Err(PlanError::config(format!(
                "combined top marginal rate {top} leaves nothing to withdraw"
            )));
        }
        Ok(())
    }

    /// Highest marginal rate any extra dollar can face, state included.
    pub fn top_marginal_rate(&self) -> f64 {
        let federal = match self.model {
            TaxModel::Flat { rate } => rate,
            TaxModel::Progressive => {
                let s = schedule(self.filing_status);
                let top = |b: Brackets| b.last().map_or(0.0, |(_, r)| *r);
                let surtax = if self.include_surtax { SURTAX_RATE } else { 0.0 };
                top(s.ordinary).max(top(s.gains) + surtax)
            }
        };
        federal + self.state_rate
    }

    /// Annual liability for one household.
    pub fn annual_tax(&self, ordinary: f64, gains: f64) -> f64 {
        let ordinary = ordinary.max(0.0);
        let gains = gains.max(0.0);
        let state = self.state_rate * (ordinary + gains);
        match self.model {
            TaxModel::Flat { rate } => rate * (ordinary + gains) + state,
            TaxModel::Progressive => {
                let s = schedule(self.filing_status);
                let taxable_ordinary = (ordinary - s.standard_deduction).max(0.0);
                let unused_deduction = (s.standard_deduction - ordinary).max(0.0);
                let taxable_gains = (gains - unused_deduction).max(0.0);

                let ordinary_tax = apply_brackets(taxable_ordinary, s.ordinary);
                // Gains sit on top of ordinary income in the gains table.
                let gains_tax = apply_brackets(taxable_ordinary + taxable_gains, s.gains)
                    - apply_brackets(taxable_ordinary, s.gains);
                let surtax = if self.include_surtax {
                    SURTAX_RATE * gains.min((ordinary + gains - s.surtax_threshold).max(0.0))
                } else {
                    0.0
                };
                ordinary_tax + gains_tax + surtax + state
            }
        }
    }

    /// Annual tax for every path.
    pub fn compute_taxes(&self, ordinary: &[f64], gains: &[f64]) -> Vec<f64> {
        ordinary
            .iter()
            .zip(gains)
            .map(|(o, g)| self.annual_tax(*o, *g))
            .collect()
    }

    /// Average rate on `amount` of extra ordinary income stacked on `base`.
    pub fn incremental_rate(&self, base: f64, amount: f64) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        (self.annual_tax(base + amount, 0.0) - self.annual_tax(base, 0.0)) / amount
    }

    /// Gross tax-deferred withdrawal that nets `need` after tax, given `base`
    /// ordinary income already realised this year.
    ///
    /// Iterates `g ← need / (1 − r(g))` where `r` is the incremental rate.
    /// The map is a contraction whenever the top marginal rate is below one
    /// half, so stopping at relative step 1e-6 leaves a relative error of at
    /// most about 1e-6.
    pub fn gross_up(&self, need: f64, base: f64) -> PlanResult<f64> {
        if need <= 0.0 {
            return Ok(0.0);
        }
        let mut gross = need;
        for iteration in 1..=GROSS_UP_MAX_ITERATIONS {
            let rate = self.incremental_rate(base, gross);
            if rate >= 1.0 {
                return Err(PlanError::GrossUpDiverged {
                    need,
                    last_gross: gross,
                    iterations: iteration,
                });
            }
            let next = need / (1.0 - rate);
            if (next - gross).abs() <= GROSS_UP_TOLERANCE * next {
                return Ok(next);
            }
            gross = next;
        }
        Err(PlanError::GrossUpDiverged {
            need,
            last_gross: gross,
            iterations: GROSS_UP_MAX_ITERATIONS,
        })
    }
}

// ── Roth conversions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionStrategy {
    FixedAmount { annual_amount: f64 },
    /// Convert just enough to top up ordinary income to the named bracket.
    FillBracket { bracket_rate: f64 },
}

/// Year-end transfer from tax-deferred to tax-free while `start_age <= age < end_age`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RothConversion {
    pub strategy: ConversionStrategy,
    pub start_age: u32,
    pub end_age: u32,
}

impl RothConversion {
    pub fn validate(&self, tax: &TaxConfig) -> PlanResult<()> {
        if self.end_age <= self.start_age {
            return Err(PlanError::config(format!(
                "Roth conversion window [{}, {}) is empty",
                self.start_age, self.end_age
            )));
        }
        match self.strategy {
            ConversionStrategy::FixedAmount { annual_amount } if annual_amount < 0.0 => {
                Err(PlanError::config("Roth conversion amount must be non-negative"))
            }
            ConversionStrategy::FixedAmount { .. } => Ok(()),
            ConversionStrategy::FillBracket { bracket_rate } => {
                if tax.model != TaxModel::Progressive {
                    return Err(PlanError::config(
                        "bracket-filling Roth conversions need the progressive tax model",
                    ));
                }
                bracket_ceiling(bracket_rate, tax.filing_status).map(|_| ())
            }
        }
    }

    pub fn active_at(&self, age: u32) -> bool {
        (self.start_age..self.end_age).contains(&age)
    }

    /// Amount to convert this year, capped at the available tax-deferred balance.
    pub fn amount(&self, tax: &TaxConfig, ytd_ordinary: f64, available: f64) -> f64 {
        let wanted = match self.strategy {
            ConversionStrategy::FixedAmount { annual_amount } => annual_amount,
            ConversionStrategy::FillBracket { bracket_rate } => {
                bracket_ceiling(bracket_rate, tax.filing_status)
                    .map_or(0.0, |ceiling| (ceiling - ytd_ordinary).max(0.0))
            }
        };
        wanted.min(available.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn progressive(status: FilingStatus) -> TaxConfig {
        TaxConfig {
            model: TaxModel::Progressive,
            filing_status: status,
            state_rate: 0.0,
            include_surtax: false,
        }
    }

    fn flat(rate: f64) -> TaxConfig {
        TaxConfig {
            model: TaxModel::Flat { rate },
            ..TaxConfig::default()
        }
    }

    #[test]
    fn combined_rates_at_or_above_one_are_rejected() {
        let mut t = flat(0.6);
        t.state_rate = 0.3;
        assert!(t.validate().is_ok());
        t.state_rate = 0.5;
        assert!(matches!(t.validate(), Err(PlanError::Config(_))));

        let mut p = progressive(FilingStatus::Single);
        p.state_rate = 0.62;
        assert!((p.top_marginal_rate() - 0.99).abs() < 1e-12);
        assert!(p.validate().is_ok());
        p.state_rate = 0.7;
        assert!(matches!(p.validate(), Err(PlanError::Config(_))));
    }

    #[test]
    fn single_fifty_thousand() {
        // 50,000 − 14,600 = 35,400: 1,160 at 10% + 2,856 at 12%.
        let tax = progressive(FilingStatus::Single).annual_tax(50_000.0, 0.0);
        assert!((tax - 4_016.0).abs() < 1e-6, "tax {tax}");
        assert!((ordinary_income_tax(50_000.0, FilingStatus::Single) - 4_016.0).abs() < 1e-6);
    }

    #[test]
    fn married_hundred_thousand() {
        let tax = progressive(FilingStatus::MarriedJointly).annual_tax(100_000.0, 0.0);
        assert!((tax - 8_032.0).abs() < 1e-6, "tax {tax}");
    }

    #[test]
    fn income_below_deduction_is_untaxed() {
        assert_eq!(progressive(FilingStatus::Single).annual_tax(14_000.0, 0.0), 0.0);
    }

    #[test]
    fn gains_use_unused_deduction_and_zero_bracket() {
        let t = progressive(FilingStatus::Single);
        assert_eq!(t.annual_tax(0.0, 50_000.0), 0.0);
    }

    #[test]
    fn gains_stack_on_ordinary_income() {
        let t = progressive(FilingStatus::Single);
        let with_gains = t.annual_tax(100_000.0, 10_000.0);
        let without = t.annual_tax(100_000.0, 0.0);
        assert!((with_gains - without - 1_500.0).abs() < 1e-6);
    }

    #[test]
    fn surtax_applies_above_threshold() {
        let mut t = progressive(FilingStatus::Single);
        let base = t.annual_tax(250_000.0, 20_000.0);
        t.include_surtax = true;
        let with = t.annual_tax(250_000.0, 20_000.0);
        assert!((with - base - 760.0).abs() < 1e-6, "surtax {}", with - base);

        let below = t.annual_tax(150_000.0, 20_000.0) - progressive(FilingStatus::Single).annual_tax(150_000.0, 20_000.0);
        assert_eq!(below, 0.0);
    }

    #[test]
    fn state_overlay_adds_flat_rate() {
        let mut t = progressive(FilingStatus::Single);
        t.state_rate = 0.05;
        let diff = t.annual_tax(80_000.0, 20_000.0) - progressive(FilingStatus::Single).annual_tax(80_000.0, 20_000.0);
        assert!((diff - 5_000.0).abs() < 1e-6);
    }

    #[test]
    fn flat_model_taxes_everything_once() {
        assert!((flat(0.2).annual_tax(40_000.0, 10_000.0) - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn bulk_matches_scalar() {
        let t = progressive(FilingStatus::MarriedJointly);
        let ord = [0.0, 50_000.0, 400_000.0];
        let gains = [10_000.0, 0.0, 100_000.0];
        let bulk = t.compute_taxes(&ord, &gains);
        for i in 0..3 {
            assert_eq!(bulk[i], t.annual_tax(ord[i], gains[i]));
        }
    }

    #[test]
    fn bracket_ceiling_includes_deduction() {
        assert_eq!(bracket_ceiling(0.22, FilingStatus::Single).unwrap(), 115_125.0);
        assert_eq!(bracket_ceiling(0.12, FilingStatus::MarriedJointly).unwrap(), 123_500.0);
        assert!(bracket_ceiling(0.37, FilingStatus::Single).is_err());
        assert!(bracket_ceiling(0.25, FilingStatus::Single).is_err());
    }

    #[test]
    fn rmd_divisors_strictly_decrease() {
        for age in RMD_START_AGE..120 {
            let (a, b) = (rmd_divisor(age).unwrap(), rmd_divisor(age + 1).unwrap());
            assert!(b < a, "divisor at {} ({b}) not below {age} ({a})", age + 1);
        }
        assert_eq!(rmd_divisor(71), None);
        assert_eq!(rmd_divisor(125), Some(2.0));
    }

    #[test]
    fn rmd_amounts() {
        assert_eq!(required_minimum_distribution(500_000.0, 72), 0.0);
        assert!((required_minimum_distribution(246_000.0, 75) - 10_000.0).abs() < 1e-9);
        assert_eq!(required_minimum_distribution(0.0, 80), 0.0);
    }

    #[test]
    fn gross_up_flat_is_closed_form() {
        let g = flat(0.25).gross_up(750.0, 0.0).unwrap();
        assert!((g - 1_000.0).abs() < 1e-6, "gross {g}");
    }

    #[test]
    fn gross_up_progressive_nets_the_need() {
        let t = progressive(FilingStatus::Single);
        for &(need, base) in &[(4_000.0, 0.0), (6_000.0, 90_000.0), (50_000.0, 180_000.0)] {
            let gross = t.gross_up(need, base).unwrap();
            let tax = t.annual_tax(base + gross, 0.0) - t.annual_tax(base, 0.0);
            let net = gross - tax;
            assert!(((net - need) / need).abs() < 1e-5, "need {need} base {base}: net {net}");
        }
    }

    #[test]
    fn gross_up_below_deduction_is_untaxed() {
        let g = progressive(FilingStatus::Single).gross_up(5_000.0, 0.0).unwrap();
        assert!((g - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn gross_up_fails_when_rates_exceed_one() {
        let mut t = progressive(FilingStatus::Single);
        t.state_rate = 0.7;
        let err = t.gross_up(10_000.0, 1_000_000.0).unwrap_err();
        assert!(matches!(err, PlanError::GrossUpDiverged { .. }), "{err:?}");
    }

    #[test]
    fn roth_fill_bracket_tops_up_income() {
        let tax = progressive(FilingStatus::Single);
        let conv = RothConversion {
            strategy: ConversionStrategy::FillBracket { bracket_rate: 0.12 },
            start_age: 60,
            end_age: 73,
        };
        conv.validate(&tax).unwrap();
        // 47,150 + 14,600 = 61,750 ceiling.
        assert!((conv.amount(&tax, 20_000.0, 1e9) - 41_750.0).abs() < 1e-9);
        assert_eq!(conv.amount(&tax, 70_000.0, 1e9), 0.0);
        assert_eq!(conv.amount(&tax, 0.0, 5_000.0), 5_000.0);
        assert!(conv.active_at(60) && !conv.active_at(73));
    }

    #[test]
    fn roth_validation() {
        let fill = RothConversion {
            strategy: ConversionStrategy::FillBracket { bracket_rate: 0.22 },
            start_age: 60,
            end_age: 70,
        };
        assert!(fill.validate(&flat(0.2)).is_err(), "fill needs brackets");
        let empty = RothConversion {
            strategy: ConversionStrategy::FixedAmount { annual_amount: 10_000.0 },
            start_age: 70,
            end_age: 70,
        };
        assert!(empty.validate(&flat(0.2)).is_err());
    }

    proptest! {
        #[test]
        fn tax_never_falls_as_ordinary_income_rises(
            income in 0.0f64..2_000_000.0,
            extra in 0.0f64..200_000.0,
            gains in 0.0f64..300_000.0,
            married in any::<bool>(),
            surtax in any::<bool>(),
        ) {
            let status = if married { FilingStatus::MarriedJointly } else { FilingStatus::Single };
            let t = TaxConfig { include_surtax: surtax, ..progressive(status) };
            let lo = t.annual_tax(income, gains);
            let hi = t.annual_tax(income + extra, gains);
            prop_assert!(hi >= lo - 1e-9, "{:?}: tax fell from {} to {}", status, lo, hi);
        }

        #[test]
        fn flat_tax_is_monotone(income in 0.0f64..1e7, extra in 0.0f64..1e6, rate in 0.0f64..0.9) {
            let t = flat(rate);
            prop_assert!(t.annual_tax(income + extra, 0.0) >= t.annual_tax(income, 0.0));
        }
    }
}
