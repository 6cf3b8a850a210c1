use nalgebra::DVector;
use thiserror::Error;

/// Unified error type for `mnlrs` operations.
#[derive(Debug, Error)]
pub enum MnlError {
    /// Raised when provided vectors or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, usually implied by the number of products.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when the wide table lacks a column the reshaper needs.
    #[error("wide table is missing expected column `{column}`")]
    MissingColumn { column: String },

    /// Raised when a wide column does not have one value per consumer.
    #[error("column `{column}` has {found} values but the table has {expected} consumers")]
    RaggedColumn {
        column: String,
        expected: usize,
        found: usize,
    },

    /// Raised when a choice or feature indicator is neither 0 nor 1.
    #[error("indicator `{column}` for consumer `{consumer_id}` must be 0 or 1, found {value}")]
    InvalidIndicator {
        column: String,
        consumer_id: String,
        value: f64,
    },

    /// Raised when a consumer does not choose exactly one product.
    #[error("consumer `{consumer_id}` must choose exactly one product, found {chosen}")]
    InvalidChoiceCount { consumer_id: String, chosen: usize },

    /// Raised when a consumer does not carry exactly one row per product.
    #[error("consumer `{consumer_id}` has {found} rows but {expected} products are modelled")]
    UnbalancedConsumer {
        consumer_id: String,
        expected: usize,
        found: usize,
    },

    /// Raised when the same product appears twice for one consumer.
    #[error("consumer `{consumer_id}` lists product {product_id} more than once")]
    DuplicateProduct {
        consumer_id: String,
        product_id: usize,
    },

    /// Raised when a product identifier falls outside `1..=products`.
    #[error("product {product_id} is outside the modelled range 1..={products}")]
    UnknownProduct { product_id: usize, products: usize },

    /// Raised when a configuration value is outside its admissible range.
    #[error("setting `{name}` is invalid: {value}")]
    InvalidSetting { name: &'static str, value: f64 },

    /// Raised when utilities or probabilities become NaN or infinite.
    #[error("encountered non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the likelihood optimizer stops without meeting its tolerance.
    #[error(
        "optimization failed after {iterations} iterations ({reason}); last objective {objective}"
    )]
    OptimizationFailed {
        /// Why the optimizer stopped.
        reason: &'static str,
        /// Number of iterations performed before termination.
        iterations: usize,
        /// Objective value at the last accepted iterate.
        objective: f64,
        /// Last accepted coefficient vector.
        beta: DVector<f64>,
    },

    /// Raised when `argmin` fails for a reason that does not originate in this crate.
    #[error("solver error: {message}")]
    Solver { message: String },
}

/// Coarse grouping of [`MnlError`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input data.
    Schema,
    /// Coefficient or configuration length mismatch.
    Dimension,
    /// The likelihood search did not converge.
    Optimization,
    /// Non-finite arithmetic outside the optimizer.
    Numerical,
    /// Out-of-range option or generator setting.
    Configuration,
}

impl MnlError {
    /// Helper to format a [`DimensionMismatch`](MnlError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for reporting a column the reshaper could not find.
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    /// Helper for rejecting an out-of-range setting.
    pub fn invalid_setting(name: &'static str, value: f64) -> Self {
        Self::InvalidSetting { name, value }
    }

    /// Helper to build an [`OptimizationFailed`](MnlError::OptimizationFailed) error.
    pub fn optimization_failed(
        reason: &'static str,
        iterations: usize,
        objective: f64,
        beta: DVector<f64>,
    ) -> Self {
        Self::OptimizationFailed {
            reason,
            iterations,
            objective,
            beta,
        }
    }

    /// Returns the broad category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DimensionMismatch { .. } => ErrorKind::Dimension,
            Self::MissingColumn { .. }
            | Self::RaggedColumn { .. }
            | Self::InvalidIndicator { .. }
            | Self::InvalidChoiceCount { .. }
            | Self::UnbalancedConsumer { .. }
            | Self::DuplicateProduct { .. }
            | Self::UnknownProduct { .. } => ErrorKind::Schema,
            Self::InvalidSetting { .. } => ErrorKind::Configuration,
            Self::NumericalError { .. } => ErrorKind::Numerical,
            Self::OptimizationFailed { .. } | Self::Solver { .. } => ErrorKind::Optimization,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, MnlError>;
