use thiserror::Error;

/// Every failure the engine can report. Validation runs before any random
/// draw, so `Config` and `Data` errors never leave a half-built result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("numerical error in {context}: {detail}")]
    Numerical { context: String, detail: String },

    #[error("insufficient data: {0}")]
    Data(String),

    #[error(
        "tax gross-up did not converge for need {need:.2} after {iterations} iterations (last gross {last_gross:.2})"
    )]
    GrossUpDiverged {
        need: f64,
        last_gross: f64,
        iterations: usize,
    },
}

impl PlanError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PlanError::Config(msg.into())
    }

    pub(crate) fn numerical(context: impl Into<String>, detail: impl Into<String>) -> Self {
        PlanError::Numerical {
            context: context.into(),
            detail: detail.into(),
        }
    }
}

pub type PlanResult<T> = Result<T, PlanError>;
