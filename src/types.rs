use serde::{Deserialize, Serialize};

/// Tax treatment of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// Brokerage: gains realised on sale are taxed at long-term rates.
    Taxable,
    /// Traditional 401(k)/IRA: withdrawals are ordinary income, subject to RMDs.
    TaxDeferred,
    /// Roth: qualified withdrawals are untaxed.
    TaxFree,
}

impl AccountKind {
    pub fn label(self) -> &'static str {
        match self {
            AccountKind::Taxable => "Taxable",
            AccountKind::TaxDeferred => "Tax-Deferred",
            AccountKind::TaxFree => "Tax-Free",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingStatus {
    Single,
    MarriedJointly,
}

/// Monthly clock for one plan. Step 0 is the first simulated month; every
/// twelfth step starts a new plan year, and `month_of_year` 12 closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    pub current_age: u32,
    pub retirement_age: u32,
    pub end_age: u32,
    pub income_end_age: u32,
}

impl Timeline {
    pub const MONTHS_PER_YEAR: usize = 12;

    pub fn n_steps(&self) -> usize {
        (self.end_age.saturating_sub(self.current_age)) as usize * Self::MONTHS_PER_YEAR
    }

    pub fn retirement_step(&self) -> usize {
        (self.retirement_age.saturating_sub(self.current_age)) as usize * Self::MONTHS_PER_YEAR
    }

    pub fn income_end_step(&self) -> usize {
        (self.income_end_age.saturating_sub(self.current_age)) as usize * Self::MONTHS_PER_YEAR
    }

    /// Fractional age at the start of `step`.
    pub fn age_at(&self, step: usize) -> f64 {
        self.current_age as f64 + step as f64 / Self::MONTHS_PER_YEAR as f64
    }

    /// Completed years of age at `step`.
    pub fn whole_age_at(&self, step: usize) -> u32 {
        self.current_age + (step / Self::MONTHS_PER_YEAR) as u32
    }

    /// 1-based month within the plan year.
    pub fn month_of_year(&self, step: usize) -> u32 {
        (step % Self::MONTHS_PER_YEAR) as u32 + 1
    }

    pub fn is_year_end(&self, step: usize) -> bool {
        self.month_of_year(step) == 12
    }

    pub fn is_retired(&self, step: usize) -> bool {
        step >= self.retirement_step()
    }

    pub fn has_income(&self, step: usize) -> bool {
        step < self.income_end_step()
    }

    /// Months left in the horizon, counting `step` itself.
    pub fn remaining_months(&self, step: usize) -> usize {
        self.n_steps().saturating_sub(step)
    }

    /// Nearest step for a fractional age. Negative before the plan starts.
    pub fn step_at_age(&self, age: f64) -> i64 {
        ((age - self.current_age as f64) * Self::MONTHS_PER_YEAR as f64).round() as i64
    }
}
