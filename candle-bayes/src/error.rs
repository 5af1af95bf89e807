use thiserror::Error;

/// Errors surfaced by model construction and inference routines.
#[derive(Error, Debug)]
pub enum BayesError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    Shape {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("non-finite objective value: {0}")]
    NonFinite(f32),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, BayesError>;
