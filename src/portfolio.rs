//! Per-path account balances and everything that moves money between them.
//!
//! Positions are one flat column `[path][account][asset]`. All money flows
//! go through here so the zero floor and the absorbing ruin state are
//! enforced in one place.

use serde::{Deserialize, Serialize};

use crate::config::Account;
use crate::error::{PlanError, PlanResult};
use crate::returns::PathTensor;
use crate::tax::TaxConfig;
use crate::types::AccountKind;

/// Balances below this are treated as empty.
pub const DUST: f64 = 1e-6;

const WEIGHT_TOL: f64 = 1e-6;

// ── Allocation policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rebalancing {
    /// Rebalance every account in the listed months (1 = January).
    Calendar { months: Vec<u32> },
    /// Rebalance an account when any asset drifts more than `drift` from target.
    Threshold { drift: f64 },
}

impl Default for Rebalancing {
    fn default() -> Self {
        Rebalancing::Calendar { months: vec![1, 7] }
    }
}

impl Rebalancing {
    pub fn validate(&self) -> PlanResult<()> {
        match self {
            Rebalancing::Calendar { months } => match months.iter().find(|m| !(1..=12).contains(*m)) {
                Some(m) => Err(PlanError::config(format!("rebalancing month {m} outside 1..=12"))),
                None => Ok(()),
            },
            Rebalancing::Threshold { drift } if !(*drift > 0.0 && *drift < 1.0) => Err(
                PlanError::config(format!("rebalancing drift {drift} outside (0, 1)")),
            ),
            Rebalancing::Threshold { .. } => Ok(()),
        }
    }
}

/// Linear move from `start_weights` to `end_weights` between two ages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlidePath {
    pub start_age: f64,
    pub end_age: f64,
    pub start_weights: Vec<f64>,
    pub end_weights: Vec<f64>,
}

impl GlidePath {
    pub fn validate(&self, n_assets: usize) -> PlanResult<()> {
        if self.end_age <= self.start_age {
            return Err(PlanError::config("glide path end_age must follow start_age"));
        }
        for (label, w) in [("start", &self.start_weights), ("end", &self.end_weights)] {
            validate_weights(w, n_assets, &format!("glide path {label} weights"))?;
        }
        Ok(())
    }

    /// Target weights at `age`, held flat outside the window.
    pub fn weights_at(&self, age: f64, out: &mut [f64]) {
        let frac = ((age - self.start_age) / (self.end_age - self.start_age)).clamp(0.0, 1.0);
        for (k, w) in out.iter_mut().enumerate() {
            *w = self.start_weights[k] + frac * (self.end_weights[k] - self.start_weights[k]);
        }
    }
}

pub fn validate_weights(weights: &[f64], n: usize, label: &str) -> PlanResult<()> {
    if weights.len() != n {
        return Err(PlanError::config(format!("{label}: expected {n} weights, got {}", weights.len())));
    }
    if let Some(w) = weights.iter().find(|w| !(**w >= 0.0 && **w <= 1.0)) {
        return Err(PlanError::config(format!("{label}: weight {w} outside [0, 1]")));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOL {
        return Err(PlanError::config(format!("{label}: weights sum to {sum}, expected 1")));
    }
    Ok(())
}

// ── Tax-year accumulators ───────────────────────────────────────────────────

/// Running totals for the current plan year on one path.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaxYear {
    pub ordinary_income: f64,
    pub realized_gains: f64,
    pub withheld: f64,
    pub tax_deferred_withdrawn: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Withdrawal {
    /// Net cash delivered toward the need.
    pub delivered: f64,
    pub unmet: f64,
}

// ── Portfolio ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Portfolio {
    n_paths: usize,
    n_assets: usize,
    kinds: Vec<AccountKind>,
    positions: Vec<f64>,
    /// Cost basis per (path, account); only read for taxable accounts.
    basis: Vec<f64>,
    depleted: Vec<bool>,
}

impl Portfolio {
    /// Every path starts from the same balances, split by `weights`.
    pub fn new(accounts: &[Account], weights: &[f64], n_paths: usize) -> Self {
        let n_assets = weights.len();
        let n_accounts = accounts.len();
        let mut positions = Vec::with_capacity(n_paths * n_accounts * n_assets);
        let mut basis = Vec::with_capacity(n_paths * n_accounts);
        for _ in 0..n_paths {
            for account in accounts {
                positions.extend(weights.iter().map(|w| account.balance * w));
                basis.push(account.cost_basis.unwrap_or(account.balance));
            }
        }
        Self {
            n_paths,
            n_assets,
            kinds: accounts.iter().map(|a| a.kind).collect(),
            positions,
            basis,
            depleted: vec![false; n_paths],
        }
    }

    pub fn n_paths(&self) -> usize {
        self.n_paths
    }

    pub fn n_accounts(&self) -> usize {
        self.kinds.len()
    }

    pub fn kind(&self, account: usize) -> AccountKind {
        self.kinds[account]
    }

    fn slot(&self, path: usize, account: usize) -> usize {
        (path * self.kinds.len() + account) * self.n_assets
    }

    fn path_range(&self, path: usize) -> std::ops::Range<usize> {
        let width = self.kinds.len() * self.n_assets;
        path * width..(path + 1) * width
    }

    pub fn positions(&self, path: usize, account: usize) -> &[f64] {
        let i = self.slot(path, account);
        &self.positions[i..i + self.n_assets]
    }

    pub fn account_balance(&self, path: usize, account: usize) -> f64 {
        self.positions(path, account).iter().sum()
    }

    pub fn cost_basis(&self, path: usize, account: usize) -> f64 {
        self.basis[path * self.kinds.len() + account]
    }

    pub fn total(&self, path: usize) -> f64 {
        self.positions[self.path_range(path)].iter().sum()
    }

    pub fn totals(&self, out: &mut [f64]) {
        for (p, o) in out.iter_mut().enumerate() {
            *o = self.total(p);
        }
    }

    pub fn balance_of_kind(&self, path: usize, kind: AccountKind) -> f64 {
        (0..self.n_accounts())
            .filter(|a| self.kinds[*a] == kind)
            .map(|a| self.account_balance(path, a))
            .sum()
    }

    pub fn is_depleted(&self, path: usize) -> bool {
        self.depleted[path]
    }

    pub fn depleted_count(&self) -> usize {
        self.depleted.iter().filter(|d| **d).count()
    }

    /// Zero the path and stop all further flows into or out of it.
    pub fn mark_depleted(&mut self, path: usize) {
        let range = self.path_range(path);
        self.positions[range].fill(0.0);
        let n = self.kinds.len();
        self.basis[path * n..(path + 1) * n].fill(0.0);
        self.depleted[path] = true;
    }

    /// Grow each position by its asset's return for `step`, floored at zero.
    pub fn apply_returns(&mut self, step: usize, returns: &PathTensor) {
        let (n_acc, n_assets) = (self.kinds.len(), self.n_assets);
        for p in 0..self.n_paths {
            if self.depleted[p] {
                continue;
            }
            let r = returns.row(p, step);
            let base = p * n_acc * n_assets;
            for a in 0..n_acc {
                let pos = &mut self.positions[base + a * n_assets..base + (a + 1) * n_assets];
                for (x, r) in pos.iter_mut().zip(r) {
                    *x = (*x * (1.0 + r)).max(0.0);
                }
            }
        }
    }

    /// Multiplicative fee drag `1 - annual_fee / 12` on every position.
    pub fn apply_fee(&mut self, annual_fee: f64) {
        if annual_fee <= 0.0 {
            return;
        }
        let keep = 1.0 - annual_fee / 12.0;
        for x in &mut self.positions {
            *x *= keep;
        }
    }

    /// Add `amount` to one account, split by `weights`.
    pub fn deposit(&mut self, path: usize, account: usize, amount: f64, weights: &[f64]) {
        if amount <= 0.0 || self.depleted[path] {
            return;
        }
        let i = self.slot(path, account);
        for (x, w) in self.positions[i..i + self.n_assets].iter_mut().zip(weights) {
            *x += amount * w;
        }
        let n = self.kinds.len();
        self.basis[path * n + account] += amount;
    }

    /// Contribution into `account` on every live path.
    pub fn deposit_all(&mut self, account: usize, amount: f64, weights: &[f64]) {
        for p in 0..self.n_paths {
            self.deposit(p, account, amount, weights);
        }
    }

    /// Spread an inflow across accounts in proportion to their balances.
    /// An empty portfolio receives it in the first account.
    pub fn distribute_inflow(&mut self, path: usize, amount: f64, weights: &[f64]) {
        if amount <= 0.0 || self.depleted[path] {
            return;
        }
        let total = self.total(path);
        if total <= DUST {
            self.deposit(path, 0, amount, weights);
            return;
        }
        for a in 0..self.n_accounts() {
            let share = self.account_balance(path, a) / total;
            self.deposit(path, a, amount * share, weights);
        }
    }

    pub fn rebalance_account(&mut self, path: usize, account: usize, weights: &[f64]) {
        let total = self.account_balance(path, account);
        let i = self.slot(path, account);
        for (x, w) in self.positions[i..i + self.n_assets].iter_mut().zip(weights) {
            *x = total * w;
        }
    }

    pub fn rebalance_all(&mut self, weights: &[f64]) {
        for p in 0..self.n_paths {
            for a in 0..self.n_accounts() {
                self.rebalance_account(p, a, weights);
            }
        }
    }

    /// Rebalance only the accounts whose largest weight drift exceeds
    /// `threshold`. Returns how many accounts were touched.
    pub fn rebalance_drifted(&mut self, weights: &[f64], threshold: f64) -> usize {
        let mut touched = 0;
        for p in 0..self.n_paths {
            for a in 0..self.n_accounts() {
                let total = self.account_balance(p, a);
                if total <= DUST {
                    continue;
                }
                let drift = self
                    .positions(p, a)
                    .iter()
                    .zip(weights)
                    .map(|(x, w)| (x / total - w).abs())
                    .fold(0.0, f64::max);
                if drift > threshold {
                    self.rebalance_account(p, a, weights);
                    touched += 1;
                }
            }
        }
        touched
    }

    /// Sell `amount` from one account pro rata across assets. Returns the
    /// amount actually sold and the gain realised against cost basis.
    pub fn sell(&mut self, path: usize, account: usize, amount: f64) -> (f64, f64) {
        let balance = self.account_balance(path, account);
        if amount <= 0.0 || balance <= 0.0 {
            return (0.0, 0.0);
        }
        let take = amount.min(balance);
        let frac = take / balance;
        let i = self.slot(path, account);
        for x in &mut self.positions[i..i + self.n_assets] {
            *x = (*x * (1.0 - frac)).max(0.0);
        }
        let b = path * self.kinds.len() + account;
        let basis_sold = self.basis[b] * frac;
        self.basis[b] -= basis_sold;
        let gain = if self.kinds[account] == AccountKind::Taxable {
            take - basis_sold
        } else {
            0.0
        };
        (take, gain)
    }

    /// Sell `amount` from all accounts of `kind`, in account order.
    fn sell_kind(&mut self, path: usize, kind: AccountKind, amount: f64) -> (f64, f64) {
        let mut left = amount;
        let (mut sold, mut gains) = (0.0, 0.0);
        for a in 0..self.n_accounts() {
            if left <= DUST {
                break;
            }
            if self.kinds[a] != kind {
                continue;
            }
            let (s, g) = self.sell(path, a, left);
            sold += s;
            gains += g;
            left -= s;
        }
        (sold, gains)
    }

    fn first_of_kind(&self, kind: AccountKind) -> Option<usize> {
        self.kinds.iter().position(|k| *k == kind)
    }

    /// Fund `need` of net cash by walking `order`. Tax-deferred sales are
    /// grossed up and the difference withheld; taxable sales log their
    /// realised gain for year-end settlement.
    pub fn withdraw(
        &mut self,
        path: usize,
        need: f64,
        order: &[AccountKind],
        tax: &TaxConfig,
        year: &mut TaxYear,
    ) -> PlanResult<Withdrawal> {
        if need <= 0.0 {
            return Ok(Withdrawal::default());
        }
        if self.depleted[path] {
            return Ok(Withdrawal {
                delivered: 0.0,
                unmet: need,
            });
        }
        let mut remaining = need;
        for &kind in order {
            for a in 0..self.n_accounts() {
                if remaining <= DUST {
                    break;
                }
                if self.kinds[a] != kind {
                    continue;
                }
                let balance = self.account_balance(path, a);
                if balance <= DUST {
                    continue;
                }
                match kind {
                    AccountKind::Taxable | AccountKind::TaxFree => {
                        let (sold, gain) = self.sell(path, a, remaining);
                        year.realized_gains += gain;
                        remaining -= sold;
                    }
                    AccountKind::TaxDeferred => {
                        let gross = tax.gross_up(remaining, year.ordinary_income)?;
                        let (sold, _) = self.sell(path, a, gross);
                        let withheld = sold * tax.incremental_rate(year.ordinary_income, sold);
                        year.ordinary_income += sold;
                        year.tax_deferred_withdrawn += sold;
                        year.withheld += withheld;
                        remaining -= if sold >= gross { remaining } else { sold - withheld };
                    }
                }
            }
        }
        let unmet = remaining.max(0.0);
        let unmet = if unmet <= DUST { 0.0 } else { unmet };
        Ok(Withdrawal {
            delivered: need - unmet,
            unmet,
        })
    }

    /// Year-end required distribution out of tax-deferred accounts. Net
    /// proceeds land in the first taxable account if there is one. Returns
    /// the gross amount distributed.
    pub fn force_distribution(
        &mut self,
        path: usize,
        amount: f64,
        tax: &TaxConfig,
        year: &mut TaxYear,
        weights: &[f64],
    ) -> f64 {
        if amount <= 0.0 || self.depleted[path] {
            return 0.0;
        }
        let (sold, _) = self.sell_kind(path, AccountKind::TaxDeferred, amount);
        let withheld = sold * tax.incremental_rate(year.ordinary_income, sold);
        year.ordinary_income += sold;
        year.tax_deferred_withdrawn += sold;
        year.withheld += withheld;
        if let Some(a) = self.first_of_kind(AccountKind::Taxable) {
            self.deposit(path, a, sold - withheld, weights);
        }
        sold
    }

    /// Move `amount` from tax-deferred into the first tax-free account. The
    /// conversion is ordinary income, settled with the annual bill.
    pub fn convert_to_tax_free(&mut self, path: usize, amount: f64, year: &mut TaxYear, weights: &[f64]) -> f64 {
        let Some(target) = self.first_of_kind(AccountKind::TaxFree) else {
            return 0.0;
        };
        if amount <= 0.0 || self.depleted[path] {
            return 0.0;
        }
        let (moved, _) = self.sell_kind(path, AccountKind::TaxDeferred, amount);
        year.ordinary_income += moved;
        self.deposit(path, target, moved, weights);
        moved
    }

    /// Settle the year's bill against what was withheld: pay the shortfall
    /// pro rata from every position, or reinvest a refund. Returns the
    /// amount that could not be paid.
    pub fn settle_tax(&mut self, path: usize, liability: f64, withheld: f64, weights: &[f64]) -> f64 {
        if self.depleted[path] {
            return 0.0;
        }
        let due = liability - withheld;
        if due < 0.0 {
            self.distribute_inflow(path, -due, weights);
            return 0.0;
        }
        let total = self.total(path);
        if total <= DUST {
            return due;
        }
        let paid = due.min(total);
        let keep = 1.0 - paid / total;
        let range = self.path_range(path);
        for x in &mut self.positions[range] {
            *x *= keep;
        }
        let n = self.kinds.len();
        for b in &mut self.basis[path * n..(path + 1) * n] {
            *b *= keep;
        }
        due - paid
    }
}
