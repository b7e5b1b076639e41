use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PlanError, PlanResult};
use crate::inflation::InflationParams;
use crate::linalg;
use crate::portfolio::{self, GlidePath, Rebalancing};
use crate::returns::ReturnModel;
use crate::spending::SpendingPolicy;
use crate::stress::StressScenario;
use crate::tax::{RothConversion, TaxConfig, TaxModel};
use crate::types::{AccountKind, FilingStatus, Timeline};

// ── Plan ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub kind: AccountKind,
    pub balance: f64,
    /// Spread evenly over the months that still have income.
    #[serde(default)]
    pub annual_contribution: f64,
    /// Taxable accounts only; defaults to the balance (no embedded gain).
    #[serde(default)]
    pub cost_basis: Option<f64>,
}

/// One-time cash flow at an age: positive is an inflow, negative an outflow.
/// Amounts are nominal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteEvent {
    pub label: String,
    pub age: f64,
    pub amount: f64,
}

/// Pension, annuity or Social Security style income.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuaranteedIncome {
    pub label: String,
    pub monthly_amount: f64,
    pub start_age: f64,
    #[serde(default)]
    pub end_age: Option<f64>,
    /// Fixed annual cost-of-living adjustment.
    #[serde(default)]
    pub cola_rate: f64,
    /// Also scale by the simulated price index.
    #[serde(default)]
    pub inflation_indexed: bool,
}

impl GuaranteedIncome {
    /// Nominal payment at `step`, or zero outside the payment window.
    pub fn payment(&self, timeline: &Timeline, step: usize, inflation_index: f64) -> f64 {
        let start = timeline.step_at_age(self.start_age);
        let step = step as i64;
        if step < start {
            return 0.0;
        }
        if let Some(end_age) = self.end_age {
            if step >= timeline.step_at_age(end_age) {
                return 0.0;
            }
        }
        let monthly_cola = (1.0 + self.cola_rate).powf(1.0 / 12.0) - 1.0;
        let cola = (1.0 + monthly_cola).powi((step - start) as i32);
        let index = if self.inflation_indexed { inflation_index } else { 1.0 };
        self.monthly_amount * cola * index
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub current_age: u32,
    pub retirement_age: u32,
    pub end_age: u32,
    /// When contributions stop; defaults to the retirement age.
    #[serde(default)]
    pub income_end_age: Option<u32>,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub monthly_income: f64,
    /// Annual growth applied to contributions.
    #[serde(default)]
    pub income_growth_rate: f64,
    /// Baseline retirement spending in today's dollars.
    pub monthly_spending: f64,
    #[serde(default)]
    pub discrete_events: Vec<DiscreteEvent>,
    #[serde(default)]
    pub guaranteed_income: Vec<GuaranteedIncome>,
}

impl Plan {
    /// 30-year-old saver retiring at 65, planning to 95.
    pub fn canonical() -> Self {
        let account = |kind, balance, annual_contribution| Account {
            kind,
            balance,
            annual_contribution,
            cost_basis: None,
        };
        Plan {
            current_age: 30,
            retirement_age: 65,
            end_age: 95,
            income_end_age: None,
            accounts: vec![
                account(AccountKind::Taxable, 50_000.0, 6_000.0),
                account(AccountKind::TaxDeferred, 100_000.0, 20_000.0),
                account(AccountKind::TaxFree, 30_000.0, 7_000.0),
            ],
            monthly_income: 8_000.0,
            income_growth_rate: 0.0,
            monthly_spending: 5_000.0,
            discrete_events: Vec::new(),
            guaranteed_income: Vec::new(),
        }
    }

    pub fn timeline(&self) -> Timeline {
        Timeline {
            current_age: self.current_age,
            retirement_age: self.retirement_age,
            end_age: self.end_age,
            income_end_age: self.income_end_age.unwrap_or(self.retirement_age),
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.accounts.iter().map(|a| a.balance).sum()
    }

    pub fn validate(&self) -> PlanResult<()> {
        if self.retirement_age <= self.current_age {
            return Err(PlanError::config(format!(
                "retirement_age {} must be after current_age {}",
                self.retirement_age, self.current_age
            )));
        }
        if self.end_age <= self.retirement_age {
            return Err(PlanError::config(format!(
                "end_age {} must be after retirement_age {}",
                self.end_age, self.retirement_age
            )));
        }
        if let Some(age) = self.income_end_age {
            if age < self.current_age || age > self.end_age {
                return Err(PlanError::config(format!(
                    "income_end_age {age} outside [{}, {}]",
                    self.current_age, self.end_age
                )));
            }
        }
        if self.accounts.is_empty() {
            return Err(PlanError::config("plan needs at least one account"));
        }
        for (i, a) in self.accounts.iter().enumerate() {
            let bad = |v: f64| !(v.is_finite() && v >= 0.0);
            if bad(a.balance) || bad(a.annual_contribution) || a.cost_basis.is_some_and(bad) {
                return Err(PlanError::config(format!(
                    "account {i} ({}) has a negative or non-finite amount",
                    a.kind.label()
                )));
            }
        }
        if !(self.monthly_spending.is_finite() && self.monthly_spending >= 0.0) {
            return Err(PlanError::config("monthly_spending must be non-negative"));
        }
        if self.income_growth_rate <= -1.0 {
            return Err(PlanError::config("income_growth_rate must exceed -100%"));
        }
        if let Some(e) = self.discrete_events.iter().find(|e| !e.amount.is_finite() || !e.age.is_finite()) {
            return Err(PlanError::config(format!("event '{}' is not finite", e.label)));
        }
        for g in &self.guaranteed_income {
            if !(g.monthly_amount >= 0.0) || g.cola_rate <= -1.0 {
                return Err(PlanError::config(format!("guaranteed income '{}' is invalid", g.label)));
            }
            if g.end_age.is_some_and(|end| end <= g.start_age) {
                return Err(PlanError::config(format!(
                    "guaranteed income '{}' ends before it starts",
                    g.label
                )));
            }
        }
        Ok(())
    }
}

// ── Market ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetClass {
    pub name: String,
    pub weight: f64,
    pub expected_return: f64,
    pub volatility: f64,
}

/// Annual fee rates, all charged monthly as drag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fees {
    #[serde(default)]
    pub expense_ratio: f64,
    #[serde(default)]
    pub aum_fee: f64,
    #[serde(default)]
    pub advisory_fee: f64,
}

impl Fees {
    pub fn annual_total(&self) -> f64 {
        self.expense_ratio + self.aum_fee + self.advisory_fee
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAssumptions {
    pub assets: Vec<AssetClass>,
    pub correlation: Vec<Vec<f64>>,
    #[serde(default)]
    pub inflation: InflationParams,
    #[serde(default)]
    pub return_model: ReturnModel,
    #[serde(default)]
    pub fees: Fees,
    #[serde(default)]
    pub glide_path: Option<GlidePath>,
}

impl MarketAssumptions {
    /// 70/30 US stocks and bonds, uncorrelated.
    pub fn canonical() -> Self {
        MarketAssumptions {
            assets: vec![
                AssetClass {
                    name: "US Stocks".to_string(),
                    weight: 0.7,
                    expected_return: 0.07,
                    volatility: 0.16,
                },
                AssetClass {
                    name: "US Bonds".to_string(),
                    weight: 0.3,
                    expected_return: 0.03,
                    volatility: 0.06,
                },
            ],
            correlation: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            inflation: InflationParams::default(),
            return_model: ReturnModel::MultivariateNormal,
            fees: Fees::default(),
            glide_path: None,
        }
    }

    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.assets.iter().map(|a| a.weight).collect()
    }

    pub fn expected_returns(&self) -> Vec<f64> {
        self.assets.iter().map(|a| a.expected_return).collect()
    }

    pub fn volatilities(&self) -> Vec<f64> {
        self.assets.iter().map(|a| a.volatility).collect()
    }

    pub fn validate(&self) -> PlanResult<()> {
        let n = self.n_assets();
        if n == 0 {
            return Err(PlanError::config("market needs at least one asset"));
        }
        portfolio::validate_weights(&self.weights(), n, "asset weights")?;
        if let Some(a) = self.assets.iter().find(|a| !(a.volatility >= 0.0) || !a.expected_return.is_finite()) {
            return Err(PlanError::config(format!(
                "asset '{}' needs a finite return and non-negative volatility",
                a.name
            )));
        }
        linalg::validate_correlation(&self.correlation, n, "market")?;
        self.inflation.validate()?;
        self.return_model.validate(n)?;
        let fees = [self.fees.expense_ratio, self.fees.aum_fee, self.fees.advisory_fee];
        if fees.iter().any(|f| !(*f >= 0.0)) || self.fees.annual_total() >= 1.0 {
            return Err(PlanError::config("fee rates must be non-negative and total below 100%"));
        }
        if let Some(gp) = &self.glide_path {
            gp.validate(n)?;
        }
        Ok(())
    }
}

// ── Policies ────────────────────────────────────────────────────────────────

fn default_withdrawal_order() -> Vec<AccountKind> {
    vec![AccountKind::Taxable, AccountKind::TaxDeferred, AccountKind::TaxFree]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    #[serde(default)]
    pub spending: SpendingPolicy,
    #[serde(default = "default_withdrawal_order")]
    pub withdrawal_order: Vec<AccountKind>,
    #[serde(default)]
    pub rebalancing: Rebalancing,
    #[serde(default)]
    pub tax: TaxConfig,
    #[serde(default)]
    pub roth_conversion: Option<RothConversion>,
}

impl Default for PolicyBundle {
    fn default() -> Self {
        Self {
            spending: SpendingPolicy::ConstantReal,
            withdrawal_order: default_withdrawal_order(),
            rebalancing: Rebalancing::default(),
            tax: TaxConfig::default(),
            roth_conversion: None,
        }
    }
}

impl PolicyBundle {
    pub fn validate(&self) -> PlanResult<()> {
        self.spending.validate()?;
        self.rebalancing.validate()?;
        self.tax.validate()?;
        if let Some(conv) = &self.roth_conversion {
            conv.validate(&self.tax)?;
        }
        for (i, kind) in self.withdrawal_order.iter().enumerate() {
            if self.withdrawal_order[..i].contains(kind) {
                return Err(PlanError::config(format!(
                    "{} listed twice in withdrawal order",
                    kind.label()
                )));
            }
        }
        Ok(())
    }
}

// ── Simulation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub n_paths: usize,
    pub seed: u64,
    /// Antithetic variates; requires an even path count.
    #[serde(default)]
    pub antithetic: bool,
    #[serde(default)]
    pub stress_scenarios: Vec<StressScenario>,
    /// Keep every path's wealth series in the result.
    #[serde(default)]
    pub retain_paths: bool,
}

impl SimulationConfig {
    pub fn canonical() -> Self {
        SimulationConfig {
            n_paths: 5_000,
            seed: 42,
            antithetic: false,
            stress_scenarios: Vec::new(),
            retain_paths: false,
        }
    }

    pub fn validate(&self) -> PlanResult<()> {
        if self.n_paths == 0 {
            return Err(PlanError::config("n_paths must be at least 1"));
        }
        if self.antithetic && self.n_paths % 2 != 0 {
            return Err(PlanError::config(format!(
                "antithetic variates need an even path count (got {})",
                self.n_paths
            )));
        }
        for s in &self.stress_scenarios {
            s.validate()?;
        }
        Ok(())
    }
}

/// The four input records of one run, bundled for re-running under
/// perturbation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inputs {
    pub plan: Plan,
    pub market: MarketAssumptions,
    pub policies: PolicyBundle,
    pub simulation: SimulationConfig,
}

impl Inputs {
    pub fn canonical() -> Self {
        Inputs {
            plan: Plan::canonical(),
            market: MarketAssumptions::canonical(),
            policies: PolicyBundle::default(),
            simulation: SimulationConfig::canonical(),
        }
    }

    /// Every check that can run without drawing a random number.
    pub fn validate(&self) -> PlanResult<()> {
        self.plan.validate()?;
        self.market.validate()?;
        self.policies.validate()?;
        self.simulation.validate()?;
        for account in &self.plan.accounts {
            if !self.policies.withdrawal_order.contains(&account.kind) {
                return Err(PlanError::config(format!(
                    "withdrawal order never draws on {} accounts",
                    account.kind.label()
                )));
            }
        }
        if self.policies.roth_conversion.is_some() {
            let has = |k| self.plan.accounts.iter().any(|a| a.kind == k);
            if !has(AccountKind::TaxDeferred) || !has(AccountKind::TaxFree) {
                return Err(PlanError::config(
                    "Roth conversions need both a tax-deferred and a tax-free account",
                ));
            }
        }
        Ok(())
    }

    /// Hex SHA-256 of the canonical JSON encoding.
    pub fn config_id(&self) -> PlanResult<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| PlanError::config(format!("cannot encode inputs: {e}")))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Switch to progressive federal brackets for `status`, keeping the state rate and surtax setting.
    pub fn with_progressive_tax(mut self, status: FilingStatus) -> Self {
        self.policies.tax = TaxConfig {
            model: TaxModel::Progressive,
            filing_status: status,
            ..self.policies.tax
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stress::StressKind;

    #[test]
    fn canonical_inputs_are_valid() {
        Inputs::canonical().validate().unwrap();
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut inputs = Inputs::canonical();
        inputs.market.assets[0].weight = 0.8;
        let err = inputs.validate().unwrap_err();
        assert!(matches!(err, PlanError::Config(ref m) if m.contains("sum")), "{err}");
    }

    #[test]
    fn ages_must_be_ordered() {
        let mut plan = Plan::canonical();
        plan.retirement_age = 30;
        assert!(plan.validate().is_err());
        let mut plan = Plan::canonical();
        plan.end_age = 65;
        assert!(plan.validate().is_err());
        let mut plan = Plan::canonical();
        plan.income_end_age = Some(100);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn odd_paths_with_antithetic_rejected() {
        let mut sim = SimulationConfig::canonical();
        sim.antithetic = true;
        sim.n_paths = 1_001;
        assert!(sim.validate().is_err());
        sim.n_paths = 1_000;
        assert!(sim.validate().is_ok());
    }

    #[test]
    fn bad_stress_scenario_rejected() {
        let mut sim = SimulationConfig::canonical();
        sim.stress_scenarios.push(StressScenario {
            kind: StressKind::Crash,
            start_age: 65.0,
            duration_months: 12,
            severity: 5.0,
        });
        assert!(sim.validate().is_err());
    }

    #[test]
    fn withdrawal_order_must_cover_accounts() {
        let mut inputs = Inputs::canonical();
        inputs.policies.withdrawal_order = vec![AccountKind::Taxable, AccountKind::TaxFree];
        assert!(inputs.validate().is_err());
        inputs.policies.withdrawal_order = vec![AccountKind::Taxable, AccountKind::Taxable];
        assert!(inputs.policies.validate().is_err());
    }

    #[test]
    fn fees_are_checked() {
        let mut market = MarketAssumptions::canonical();
        market.fees.aum_fee = -0.01;
        assert!(market.validate().is_err());
        market.fees = Fees {
            expense_ratio: 0.001,
            aum_fee: 0.01,
            advisory_fee: 0.005,
        };
        assert!(market.validate().is_ok());
        assert!((market.fees.annual_total() - 0.016).abs() < 1e-12);
    }

    #[test]
    fn config_id_is_stable_and_content_sensitive() {
        let a = Inputs::canonical();
        let id = a.config_id().unwrap();
        assert_eq!(id.len(), 64);
        assert_eq!(id, Inputs::canonical().config_id().unwrap());
        let mut b = Inputs::canonical();
        b.plan.monthly_spending += 1.0;
        assert_ne!(id, b.config_id().unwrap());
    }

    #[test]
    fn inputs_round_trip_through_json() {
        let inputs = Inputs::canonical().with_progressive_tax(FilingStatus::MarriedJointly);
        let json = serde_json::to_string(&inputs).unwrap();
        let back: Inputs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inputs);
    }

    #[test]
    fn progressive_preset_honours_filing_status() {
        let mut inputs = Inputs::canonical();
        inputs.policies.tax.state_rate = 0.05;
        let single = inputs.clone().with_progressive_tax(FilingStatus::Single);
        assert_eq!(single.policies.tax.model, TaxModel::Progressive);
        assert_eq!(single.policies.tax.filing_status, FilingStatus::Single);
        assert_eq!(single.policies.tax.state_rate, 0.05);
        let joint = inputs.with_progressive_tax(FilingStatus::MarriedJointly);
        assert_eq!(joint.policies.tax.filing_status, FilingStatus::MarriedJointly);
    }

    #[test]
    fn guaranteed_income_window_and_cola() {
        let t = Plan::canonical().timeline();
        let ss = GuaranteedIncome {
            label: "Social Security".to_string(),
            monthly_amount: 2_000.0,
            start_age: 67.0,
            end_age: Some(90.0),
            cola_rate: 0.0,
            inflation_indexed: true,
        };
        assert_eq!(ss.payment(&t, 443, 1.5), 0.0);
        assert_eq!(ss.payment(&t, 444, 1.5), 3_000.0);
        assert_eq!(ss.payment(&t, 720, 1.5), 0.0);

        let annuity = GuaranteedIncome {
            cola_rate: 0.02,
            inflation_indexed: false,
            end_age: None,
            ..ss
        };
        let after_year = annuity.payment(&t, 456, 9.0);
        assert!((after_year - 2_040.0).abs() < 1e-6, "{after_year}");
    }
}
