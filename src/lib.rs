//! Monte Carlo survival engine for retirement plans. Simulates taxed
//! multi-account drawdowns over correlated market and inflation paths and
//! reports success probabilities with percentile bands.

pub mod analysis;
pub mod config;
pub mod error;
pub mod inflation;
pub mod linalg;
pub mod portfolio;
pub mod returns;
pub mod rng;
pub mod sensitivity;
pub mod simulation;
pub mod spending;
pub mod stress;
pub mod swr;
pub mod tax;
pub mod types;

pub use config::{Inputs, MarketAssumptions, Plan, PolicyBundle, SimulationConfig};
pub use error::{PlanError, PlanResult};
pub use sensitivity::{CancelToken, run_2d_sensitivity, run_sensitivity};
pub use simulation::{ENGINE_VERSION, SimulationResult, simulate};
pub use swr::find_safe_withdrawal;
