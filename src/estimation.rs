//! Maximum-likelihood estimation of the multinomial logit model.
//!
//! The objective is the negated log-likelihood
//! `-sum_i ln(p_{i,chosen} + floor)`, evaluated consumer by consumer with the
//! log-sum-exp shift. Its analytic gradient and the expected information matrix
//! are accumulated in the same pass, and [`LikelihoodObjective`] hands them to
//! `argmin` so L-BFGS and Newton-CG share one objective.

use argmin::core::{CostFunction, Error as ArgminError, Gradient, Hessian};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{ConsumerGroup, LongTable};
use crate::demand::stable_softmax;
use crate::error::{MnlError, Result};
use crate::options::{FitOptions, Method};
use crate::simulation::{self, PriceScenario, ScenarioOutcome};
use crate::solving::{minimize_lbfgs, minimize_newton_cg, OptimizationSummary};

/// Likelihood problem over a fixed long table.
#[derive(Clone, Debug)]
pub struct MnlProblem {
    data: LongTable,
}

impl MnlProblem {
    /// Wraps a long table; at least one consumer is required.
    pub fn new(data: LongTable) -> Result<Self> {
        if data.consumer_count() == 0 {
            return Err(MnlError::dimension_mismatch("consumer count", 1, 0));
        }
        Ok(Self { data })
    }

    /// Accessor for the long table.
    pub fn data(&self) -> &LongTable {
        &self.data
    }

    /// Negated log-likelihood at `beta` with the given probability floor.
    ///
    /// Non-finite utilities yield a non-finite value rather than an error.
    pub fn negative_log_likelihood(&self, beta: &DVector<f64>, floor: f64) -> Result<f64> {
        Ok(self.evaluate(beta, floor, false)?.value)
    }

    /// Analytic gradient of [`negative_log_likelihood`](Self::negative_log_likelihood).
    pub fn gradient(&self, beta: &DVector<f64>, floor: f64) -> Result<DVector<f64>> {
        Ok(self.evaluate(beta, floor, false)?.gradient)
    }

    /// Expected information matrix `sum_i sum_j p_ij (x_ij - xbar_i)(x_ij - xbar_i)'`.
    ///
    /// This is the Hessian of the unfloored negative log-likelihood.
    pub fn information_matrix(&self, beta: &DVector<f64>) -> Result<DMatrix<f64>> {
        self.evaluate(beta, 0.0, true)?
            .curvature
            .ok_or(MnlError::NumericalError {
                context: "information matrix",
            })
    }

    /// Finds the maximum-likelihood coefficients.
    pub fn fit(&self, options: &FitOptions) -> Result<FitResult> {
        options.validate()?;
        let layout = *self.data.layout();
        let start = options.starting_beta(&layout)?;
        let floor = options.probability_floor;
        let initial_value = self.negative_log_likelihood(&start, floor)?;

        info!(
            "fitting MNL on {} consumers x {} products with {:?}; initial objective {:.6}",
            self.data.consumer_count(),
            self.data.products(),
            options.method,
            initial_value
        );

        let consumers = self.data.consumer_count() as f64;
        let objective = LikelihoodObjective {
            problem: self,
            floor,
            scale: consumers.recip(),
        };
        let minimum = match options.method {
            Method::Bfgs => minimize_lbfgs(objective, start, &options.solver),
            Method::Newton => minimize_newton_cg(objective, start, &options.solver),
        }
        .map_err(|err| match err {
            MnlError::OptimizationFailed {
                reason,
                iterations,
                objective,
                beta,
            } => MnlError::optimization_failed(reason, iterations, objective * consumers, beta),
            other => other,
        })?;
        let neg_log_likelihood = self.negative_log_likelihood(&minimum.point, floor)?;

        info!(
            "converged ({}) after {} iterations; objective {:.6} ({:.8} per consumer), gradient norm {:.3e}",
            minimum.summary.status,
            minimum.summary.iterations,
            neg_log_likelihood,
            minimum.value,
            minimum.summary.gradient_norm
        );

        let standard_errors = self.standard_errors(&minimum.point)?;
        let zero = DVector::zeros(layout.column_count());
        let null_value = self.negative_log_likelihood(&zero, floor)?;

        Ok(FitResult {
            coefficient_names: layout.coefficient_names(),
            beta: minimum.point,
            neg_log_likelihood,
            initial_neg_log_likelihood: initial_value,
            null_neg_log_likelihood: null_value,
            standard_errors,
            consumers: self.data.consumer_count(),
            products: self.data.products(),
            method: options.method,
            summary: minimum.summary,
        })
    }

    /// Square roots of the diagonal of the inverse information matrix, when it is invertible.
    fn standard_errors(&self, beta: &DVector<f64>) -> Result<Option<DVector<f64>>> {
        let information = self.information_matrix(beta)?;
        let Some(cholesky) = nalgebra::linalg::Cholesky::new(information) else {
            debug!("information matrix is singular; standard errors unavailable");
            return Ok(None);
        };
        let variances = cholesky.inverse().diagonal();
        if variances.iter().any(|v| !v.is_finite() || *v < 0.0) {
            debug!("information matrix is numerically singular; standard errors unavailable");
            return Ok(None);
        }
        Ok(Some(variances.map(f64::sqrt)))
    }

    fn evaluate(&self, beta: &DVector<f64>, floor: f64, curvature: bool) -> Result<Evaluation> {
        let layout = self.data.layout();
        layout.check_beta_len(beta.len())?;
        let k = layout.column_count();
        let utilities = self.data.design() * beta;

        let terms: Vec<Option<GroupTerm>> = self
            .data
            .partition()
            .as_slice()
            .par_iter()
            .map(|group| group_term(group, &utilities, self.data.design(), floor, curvature))
            .collect();

        let mut value = 0.0;
        let mut gradient = DVector::<f64>::zeros(k);
        let mut information = curvature.then(|| DMatrix::<f64>::zeros(k, k));
        for term in terms {
            let Some(term) = term else {
                return Ok(Evaluation {
                    value: f64::NAN,
                    gradient: DVector::from_element(k, f64::NAN),
                    curvature: None,
                });
            };
            value += term.value;
            gradient += term.gradient;
            if let (Some(total), Some(part)) = (information.as_mut(), term.information) {
                *total += part;
            }
        }

        Ok(Evaluation {
            value,
            gradient,
            curvature: information,
        })
    }
}

/// Objective value, gradient and optional curvature at one point.
struct Evaluation {
    value: f64,
    gradient: DVector<f64>,
    curvature: Option<DMatrix<f64>>,
}

/// The likelihood as an `argmin` problem, averaged over consumers.
///
/// Averaging keeps the gradient tolerance independent of the panel size; the
/// minimizer is the same as for the summed objective.
#[derive(Clone, Copy)]
struct LikelihoodObjective<'a> {
    problem: &'a MnlProblem,
    floor: f64,
    scale: f64,
}

impl CostFunction for LikelihoodObjective<'_> {
    type Param = DVector<f64>;
    type Output = f64;

    fn cost(&self, beta: &DVector<f64>) -> std::result::Result<f64, ArgminError> {
        Ok(self.problem.evaluate(beta, self.floor, false)?.value * self.scale)
    }
}

impl Gradient for LikelihoodObjective<'_> {
    type Param = DVector<f64>;
    type Gradient = DVector<f64>;

    fn gradient(&self, beta: &DVector<f64>) -> std::result::Result<DVector<f64>, ArgminError> {
        Ok(self.problem.evaluate(beta, self.floor, false)?.gradient * self.scale)
    }
}

impl Hessian for LikelihoodObjective<'_> {
    type Param = DVector<f64>;
    type Hessian = DMatrix<f64>;

    fn hessian(&self, beta: &DVector<f64>) -> std::result::Result<DMatrix<f64>, ArgminError> {
        Ok(self.problem.information_matrix(beta)? * self.scale)
    }
}

/// One consumer's contribution to the objective.
struct GroupTerm {
    value: f64,
    gradient: DVector<f64>,
    information: Option<DMatrix<f64>>,
}

fn group_term(
    group: &ConsumerGroup,
    utilities: &DVector<f64>,
    design: &DMatrix<f64>,
    floor: f64,
    curvature: bool,
) -> Option<GroupTerm> {
    let rows = group.rows();
    let values: Vec<f64> = rows.iter().map(|&row| utilities[row]).collect();
    let softmax = stable_softmax(&values)?;
    let chosen = group.chosen_offset();
    let p_chosen = softmax.probabilities[chosen];

    let log_probability = if floor > 0.0 {
        (p_chosen + floor).ln()
    } else {
        values[chosen] - softmax.log_normalizer
    };

    let mean = rows
        .iter()
        .zip(&softmax.probabilities)
        .fold(DVector::<f64>::zeros(design.ncols()), |acc, (&row, &p)| {
            acc + design.row(row).transpose() * p
        });

    // d/dbeta ln(p_c + floor) = p_c / (p_c + floor) * (x_c - xbar)
    let weight = p_chosen / (p_chosen + floor);
    let gradient = (design.row(rows[chosen]).transpose() - &mean) * -weight;

    let information = curvature.then(|| {
        rows.iter()
            .zip(&softmax.probabilities)
            .fold(DMatrix::<f64>::zeros(design.ncols(), design.ncols()), |acc, (&row, &p)| {
                let centered = design.row(row).transpose() - &mean;
                acc + (&centered * centered.transpose()) * p
            })
    });

    Some(GroupTerm {
        value: -log_probability,
        gradient,
        information,
    })
}

/// Estimates the model from the default starting point and options.
pub fn fit(data: &LongTable) -> Result<FitResult> {
    MnlProblem::new(data.clone())?.fit(&FitOptions::default())
}

/// Negated log-likelihood of `beta` with the default probability floor.
pub fn negative_log_likelihood(data: &LongTable, beta: &DVector<f64>) -> Result<f64> {
    let floor = FitOptions::default().probability_floor;
    MnlProblem::new(data.clone())?.negative_log_likelihood(beta, floor)
}

/// Immutable outcome of a maximum-likelihood fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitResult {
    /// Estimated coefficients `[brand_1, .., brand_{J-1}, featured, price]`.
    pub beta: DVector<f64>,
    pub coefficient_names: Vec<String>,
    /// Negated log-likelihood at `beta`.
    pub neg_log_likelihood: f64,
    /// Negated log-likelihood at the starting point.
    pub initial_neg_log_likelihood: f64,
    /// Negated log-likelihood with every coefficient at zero (equal shares).
    pub null_neg_log_likelihood: f64,
    /// `None` when the information matrix is singular, e.g. a constant regressor.
    pub standard_errors: Option<DVector<f64>>,
    pub consumers: usize,
    pub products: usize,
    pub method: Method,
    pub summary: OptimizationSummary,
}

impl FitResult {
    /// The `(beta_hat, objective)` pair.
    pub fn into_parts(self) -> (DVector<f64>, f64) {
        (self.beta, self.neg_log_likelihood)
    }

    /// Log-likelihood at the estimate.
    pub fn log_likelihood(&self) -> f64 {
        -self.neg_log_likelihood
    }

    /// McFadden's pseudo R-squared against the equal-shares model.
    pub fn pseudo_r_squared(&self) -> f64 {
        1.0 - self.neg_log_likelihood / self.null_neg_log_likelihood
    }

    /// Looks up a coefficient by name, e.g. `"price"` or `"brand_2"`.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficient_names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| self.beta[index])
    }

    /// Iterates over `(name, estimate)` pairs in design order.
    pub fn coefficients(&self) -> impl Iterator<Item = (&str, f64)> {
        self.coefficient_names
            .iter()
            .map(String::as_str)
            .zip(self.beta.iter().copied())
    }

    /// Predicted market shares on `data` under the fitted coefficients.
    pub fn market_shares(&self, data: &LongTable) -> Result<DVector<f64>> {
        simulation::market_shares(data, &self.beta)
    }

    /// Baseline and counterfactual shares after shifting one product's price.
    pub fn simulate_price_change(
        &self,
        data: &LongTable,
        product_id: usize,
        delta: f64,
    ) -> Result<ScenarioOutcome> {
        PriceScenario::new(product_id, delta).evaluate(data, &self.beta)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::data::LongTableBuilder;
    use crate::solving::SolverOptions;

    /// Four consumers see product 1 cheaper and three of them buy it; four see it
    /// dearer and two buy it. With `d = brand_1 + price * (p1 - p2)` the saturated
    /// MLE solves `brand_1 - price = ln 3` and `brand_1 + price = 0`.
    fn price_sensitive_panel() -> LongTable {
        let mut builder = LongTableBuilder::new(2);
        let plan = [
            (1.0, 2.0, 1),
            (1.0, 2.0, 1),
            (1.0, 2.0, 1),
            (1.0, 2.0, 2),
            (2.0, 1.0, 1),
            (2.0, 1.0, 1),
            (2.0, 1.0, 2),
            (2.0, 1.0, 2),
        ];
        for (consumer, (p1, p2, choice)) in plan.into_iter().enumerate() {
            let id = format!("c{consumer}");
            builder = builder
                .row(id.clone(), 1, choice == 1, 0.0, p1)
                .row(id, 2, choice == 2, 0.0, p2);
        }
        builder.build().unwrap()
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let beta = DVector::from_vec(vec![0.3, 0.2, -0.7]);
        let analytic = problem.gradient(&beta, 1e-10).unwrap();

        let h = 1e-6;
        for index in 0..beta.len() {
            let mut up = beta.clone();
            let mut down = beta.clone();
            up[index] += h;
            down[index] -= h;
            let numeric = (problem.negative_log_likelihood(&up, 1e-10).unwrap()
                - problem.negative_log_likelihood(&down, 1e-10).unwrap())
                / (2.0 * h);
            assert_relative_eq!(analytic[index], numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn bfgs_recovers_saturated_estimates() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let result = problem.fit(&FitOptions::default()).unwrap();

        let half_ln3 = 0.5 * 3.0_f64.ln();
        assert_relative_eq!(result.coefficient("brand_1").unwrap(), half_ln3, epsilon = 1e-4);
        assert_relative_eq!(result.coefficient("price").unwrap(), -half_ln3, epsilon = 1e-4);
        // The featured column is constant zero, so its coefficient never moves.
        assert_relative_eq!(result.coefficient("featured").unwrap(), 0.1, epsilon = 1e-12);
        assert!(result.standard_errors.is_none());
        assert!(result.neg_log_likelihood <= result.initial_neg_log_likelihood);
    }

    #[test]
    fn newton_agrees_with_bfgs() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let bfgs = problem.fit(&FitOptions::default()).unwrap();
        let newton = problem
            .fit(&FitOptions::default().with_method(Method::Newton))
            .unwrap();

        assert_eq!(newton.method, Method::Newton);
        assert_relative_eq!(bfgs.beta, newton.beta, epsilon = 1e-4);
        assert_relative_eq!(
            bfgs.neg_log_likelihood,
            newton.neg_log_likelihood,
            epsilon = 1e-8
        );
    }

    #[test]
    fn information_matrix_matches_gradient_differences() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let beta = DVector::from_vec(vec![0.3, 0.0, -0.7]);
        let information = problem.information_matrix(&beta).unwrap();

        let h = 1e-5;
        for index in 0..beta.len() {
            let mut up = beta.clone();
            let mut down = beta.clone();
            up[index] += h;
            down[index] -= h;
            let column = (problem.gradient(&up, 0.0).unwrap()
                - problem.gradient(&down, 0.0).unwrap())
                / (2.0 * h);
            for row in 0..beta.len() {
                assert_relative_eq!(information[(row, index)], column[row], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn exhausted_budget_is_an_optimization_error() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let result = problem.fit(&FitOptions::default().with_max_iterations(1));
        match result {
            Err(err @ MnlError::OptimizationFailed { .. }) => {
                assert_eq!(err.kind(), crate::error::ErrorKind::Optimization);
            }
            other => panic!("expected optimization failure, got {other:?}"),
        }
    }

    #[test]
    fn stalled_search_is_not_reported_as_converged() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let solver = SolverOptions {
            cost_tolerance: 1e3,
            ..SolverOptions::default()
        };
        match problem.fit(&FitOptions::default().with_solver(solver)) {
            Err(MnlError::OptimizationFailed {
                reason, objective, ..
            }) => {
                assert_eq!(reason, "line search stalled");
                let start = problem
                    .negative_log_likelihood(&DVector::from_element(3, 0.1), 1e-10)
                    .unwrap();
                assert!(objective <= start);
            }
            other => panic!("expected a stalled search, got {other:?}"),
        }
    }

    #[test]
    fn newton_failure_reports_summed_objective() {
        let problem = MnlProblem::new(price_sensitive_panel()).unwrap();
        let options = FitOptions::default()
            .with_method(Method::Newton)
            .with_solver(SolverOptions {
                cost_tolerance: 1e3,
                ..SolverOptions::default()
            });
        match problem.fit(&options) {
            Err(MnlError::OptimizationFailed { objective, .. }) => {
                // Per-consumer values would be below ln 2.
                assert!(objective > 8.0 * 0.5);
            }
            other => panic!("expected a stalled search, got {other:?}"),
        }
    }

    #[test]
    fn infinite_price_is_a_non_finite_objective() {
        let data = LongTableBuilder::new(2)
            .row("a", 1, true, 0.0, f64::INFINITY)
            .row("a", 2, false, 0.0, 1.0)
            .build()
            .unwrap();
        assert!(matches!(
            fit(&data),
            Err(MnlError::OptimizationFailed { iterations: 0, .. })
        ));
    }

    #[test]
    fn pseudo_r_squared_is_between_zero_and_one() {
        let result = fit(&price_sensitive_panel()).unwrap();
        let r2 = result.pseudo_r_squared();
        assert!(r2 > 0.0 && r2 < 1.0, "pseudo R^2 = {r2}");
        assert_relative_eq!(
            result.null_neg_log_likelihood,
            8.0 * 2.0_f64.ln(),
            epsilon = 1e-6
        );
    }
}
