//! Configuration for likelihood fitting, with chained builders over sensible defaults.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{MnlError, Result};
use crate::formulation::DesignLayout;
use crate::solving::SolverOptions;

/// Search strategy used to minimize the negative log-likelihood.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Limited-memory BFGS with an analytic gradient.
    #[default]
    Bfgs,
    /// Newton-CG steps on the expected information matrix.
    Newton,
}

/// Aggregated configuration used when fitting an [`MnlProblem`](crate::MnlProblem).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub method: Method,
    /// Value every coefficient starts from when no explicit start is given.
    pub initial_value: f64,
    /// Explicit starting coefficients; overrides `initial_value` when present.
    pub initial_beta: Option<DVector<f64>>,
    /// Added to the chosen probability before taking its logarithm.
    ///
    /// Shifts the log-likelihood by at most `consumers * floor`, which is
    /// negligible at the default `1e-10`. Set to zero for the exact likelihood.
    pub probability_floor: f64,
    pub solver: SolverOptions,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            method: Method::Bfgs,
            initial_value: 0.1,
            initial_beta: None,
            probability_floor: 1e-10,
            solver: SolverOptions::default(),
        }
    }
}

impl FitOptions {
    /// Select the minimization method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Start every coefficient from the same value.
    pub fn with_initial_value(mut self, value: f64) -> Self {
        self.initial_value = value;
        self.initial_beta = None;
        self
    }

    /// Start the search from explicit coefficients.
    pub fn with_initial_beta(mut self, beta: DVector<f64>) -> Self {
        self.initial_beta = Some(beta);
        self
    }

    /// Override the probability floor used inside the logarithm.
    pub fn with_probability_floor(mut self, floor: f64) -> Self {
        self.probability_floor = floor;
        self
    }

    /// Override the solver settings while preserving other defaults.
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    /// Set the iteration budget of the solver.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.solver.max_iterations = max_iterations;
        self
    }

    /// Set the gradient tolerance of the solver.
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.solver.gradient_tolerance = tolerance;
        self
    }

    /// Resolves the starting coefficients for `layout`, checking their length.
    pub(crate) fn starting_beta(&self, layout: &DesignLayout) -> Result<DVector<f64>> {
        match &self.initial_beta {
            Some(beta) => {
                layout.check_beta_len(beta.len())?;
                Ok(beta.clone())
            }
            None => Ok(DVector::from_element(
                layout.column_count(),
                self.initial_value,
            )),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.probability_floor.is_nan() || self.probability_floor < 0.0 {
            return Err(MnlError::invalid_setting(
                "probability_floor",
                self.probability_floor,
            ));
        }
        if !self.initial_value.is_finite() {
            return Err(MnlError::invalid_setting(
                "initial_value",
                self.initial_value,
            ));
        }
        self.solver.validate()
    }
}
