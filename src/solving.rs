//! Likelihood minimization on top of `argmin`.
//!
//! [`Method::Bfgs`](crate::Method::Bfgs) runs limited-memory BFGS and
//! [`Method::Newton`](crate::Method::Newton) runs Newton-CG on the information
//! matrix; both use a More-Thuente line search. Whatever stopped the executor,
//! a run only counts as converged when the gradient norm at the best iterate is
//! within [`SolverOptions::gradient_tolerance`]. Anything else, including a
//! non-finite objective at any trial point, becomes
//! [`MnlError::OptimizationFailed`].

use std::cell::RefCell;
use std::rc::Rc;

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, Hessian, IterState, State,
    TerminationReason, TerminationStatus, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::newton::NewtonCG;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{MnlError, Result};

/// Coefficient vector handled by the solvers.
pub type Param = DVector<f64>;

type MoreThuente = MoreThuenteLineSearch<Param, Param, f64>;
type Lbfgs = LBFGS<MoreThuente, Param, Param, f64>;
type NewtonCg = NewtonCG<MoreThuente, f64>;

/// Configuration for the likelihood minimizers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Maximum number of iterations allowed before aborting.
    pub max_iterations: usize,
    /// Euclidean norm of the gradient that counts as stationary.
    pub gradient_tolerance: f64,
    /// Change in objective between iterations below which the solver stops.
    ///
    /// Stopping here is only a success if the gradient is also within tolerance;
    /// otherwise the run is reported as a stalled line search.
    pub cost_tolerance: f64,
    /// Number of correction pairs kept by L-BFGS.
    pub lbfgs_memory: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            gradient_tolerance: 1e-6,
            cost_tolerance: f64::EPSILON,
            lbfgs_memory: 7,
        }
    }
}

impl SolverOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(MnlError::invalid_setting("max_iterations", 0.0));
        }
        if self.gradient_tolerance.is_nan() || self.gradient_tolerance < 0.0 {
            return Err(MnlError::invalid_setting(
                "gradient_tolerance",
                self.gradient_tolerance,
            ));
        }
        if self.cost_tolerance.is_nan() || self.cost_tolerance < 0.0 {
            return Err(MnlError::invalid_setting(
                "cost_tolerance",
                self.cost_tolerance,
            ));
        }
        if self.lbfgs_memory == 0 {
            return Err(MnlError::invalid_setting("lbfgs_memory", 0.0));
        }
        Ok(())
    }
}

/// Diagnostics returned alongside the minimizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationSummary {
    /// Number of iterations performed.
    pub iterations: usize,
    /// Euclidean norm of the gradient at the returned point.
    pub gradient_norm: f64,
    /// How the executor ended the run, as reported by `argmin`.
    pub status: String,
}

/// Minimizer together with its objective value.
#[derive(Clone, Debug)]
pub(crate) struct Minimum {
    pub point: Param,
    pub value: f64,
    pub summary: OptimizationSummary,
}

/// Minimizes `problem` from `start` with L-BFGS.
pub(crate) fn minimize_lbfgs<O>(problem: O, start: Param, options: &SolverOptions) -> Result<Minimum>
where
    O: CostFunction<Param = Param, Output = f64>
        + Gradient<Param = Param, Gradient = Param>
        + Clone,
{
    options.validate()?;
    let problem = Finite(problem);
    let (value, gradient) = match initial_point(&problem, &start, options)? {
        Start::Stationary(minimum) => return Ok(minimum),
        Start::Descend { value, gradient } => (value, gradient),
    };

    let solver = Lbfgs::new(MoreThuente::new(), options.lbfgs_memory)
        .with_tolerance_grad(options.gradient_tolerance)
        .and_then(|solver| solver.with_tolerance_cost(options.cost_tolerance))
        .map_err(|_| MnlError::invalid_setting("gradient_tolerance", options.gradient_tolerance))?;

    // L-BFGS evaluates the starting cost itself; seeding it would read as a zero cost change.
    let trace = Trace::new(start.clone(), value);
    let outcome = Executor::new(problem.clone(), solver)
        .configure(|state| {
            state
                .param(start)
                .gradient(gradient)
                .max_iters(options.max_iterations as u64)
        })
        .add_observer(trace.clone(), ObserverMode::Always)
        .run()
        .map(|result| result.state().clone());
    conclude(&problem, outcome, &trace, options)
}

/// Minimizes `problem` from `start` with Newton-CG on its Hessian.
pub(crate) fn minimize_newton_cg<O>(
    problem: O,
    start: Param,
    options: &SolverOptions,
) -> Result<Minimum>
where
    O: CostFunction<Param = Param, Output = f64>
        + Gradient<Param = Param, Gradient = Param>
        + Hessian<Param = Param, Hessian = DMatrix<f64>>
        + Clone,
{
    options.validate()?;
    let problem = Finite(problem);
    let (value, gradient) = match initial_point(&problem, &start, options)? {
        Start::Stationary(minimum) => return Ok(minimum),
        Start::Descend { value, gradient } => (value, gradient),
    };

    let tolerance = options.cost_tolerance.max(f64::MIN_POSITIVE);
    let solver = NewtonCg::new(MoreThuente::new())
        .with_tolerance(tolerance)
        .map_err(|_| MnlError::invalid_setting("cost_tolerance", options.cost_tolerance))?;

    let trace = Trace::new(start.clone(), value);
    let outcome = Executor::new(problem.clone(), solver)
        .configure(|state| {
            state
                .param(start)
                .cost(value)
                .gradient(gradient)
                .max_iters(options.max_iterations as u64)
        })
        .add_observer(trace.clone(), ObserverMode::Always)
        .run()
        .map(|result| result.state().clone());
    conclude(&problem, outcome, &trace, options)
}

enum Start {
    Stationary(Minimum),
    Descend { value: f64, gradient: Param },
}

/// Evaluates the starting point; a start that already meets the tolerance is returned as is.
fn initial_point<O>(problem: &Finite<O>, start: &Param, options: &SolverOptions) -> Result<Start>
where
    O: CostFunction<Param = Param, Output = f64> + Gradient<Param = Param, Gradient = Param>,
{
    let evaluated = problem
        .cost(start)
        .and_then(|value| Ok((value, problem.gradient(start)?)));
    let (value, gradient) = match evaluated {
        Ok(pair) => pair,
        Err(err) => {
            return Err(match into_mnl_error(err) {
                MnlError::NumericalError { .. } => MnlError::optimization_failed(
                    "non-finite objective at the initial guess",
                    0,
                    f64::NAN,
                    start.clone(),
                ),
                other => other,
            })
        }
    };

    let gradient_norm = gradient.norm();
    if gradient_norm <= options.gradient_tolerance {
        debug!("starting point is already stationary (gradient norm {gradient_norm:.3e})");
        return Ok(Start::Stationary(Minimum {
            point: start.clone(),
            value,
            summary: OptimizationSummary {
                iterations: 0,
                gradient_norm,
                status: "stationary start".to_string(),
            },
        }));
    }
    Ok(Start::Descend { value, gradient })
}

/// Turns an executor outcome into a converged minimum or an optimization error.
fn conclude<O, H>(
    problem: &Finite<O>,
    outcome: std::result::Result<IterState<Param, Param, (), H, (), f64>, ArgminError>,
    trace: &Trace,
    options: &SolverOptions,
) -> Result<Minimum>
where
    O: Gradient<Param = Param, Gradient = Param>,
{
    let (point, value, iterations, status, reason) = match outcome {
        Ok(mut state) => {
            let iterations = state.get_iter() as usize;
            let value = state.get_best_cost();
            let termination = state.get_termination_status().clone();
            let point = match state.take_best_param() {
                Some(point) => point,
                None => trace.best().0,
            };
            let reason = match &termination {
                TerminationStatus::Terminated(TerminationReason::MaxItersReached) => {
                    "iteration budget exhausted"
                }
                TerminationStatus::Terminated(TerminationReason::SolverConverged) => {
                    "line search stalled"
                }
                _ => "solver stopped early",
            };
            (point, value, iterations, format!("{termination:?}"), reason)
        }
        Err(err) => {
            let (point, value) = trace.best();
            let iterations = trace.iterations();
            match into_mnl_error(err) {
                MnlError::NumericalError { .. } => {
                    return Err(MnlError::optimization_failed(
                        "non-finite objective",
                        iterations,
                        value,
                        point,
                    ))
                }
                MnlError::Solver { message } => {
                    warn!("argmin stopped after {iterations} iterations: {message}");
                    (point, value, iterations, message, "line search failed")
                }
                other => return Err(other),
            }
        }
    };

    let gradient_norm = match problem.gradient(&point) {
        Ok(gradient) => gradient.norm(),
        Err(_) => f64::NAN,
    };
    if value.is_finite() && gradient_norm <= options.gradient_tolerance {
        debug!("converged after {iterations} iterations ({status})");
        return Ok(Minimum {
            point,
            value,
            summary: OptimizationSummary {
                iterations,
                gradient_norm,
                status,
            },
        });
    }
    debug!("{reason} with gradient norm {gradient_norm:.3e} after {iterations} iterations");
    Err(MnlError::optimization_failed(reason, iterations, value, point))
}

/// Recovers a crate error from `argmin`'s boxed error type.
fn into_mnl_error(err: ArgminError) -> MnlError {
    match err.downcast::<MnlError>() {
        Ok(err) => err,
        Err(err) => MnlError::Solver {
            message: err.to_string(),
        },
    }
}

/// Rejects non-finite objective values and gradients before the line search sees them.
#[derive(Clone)]
struct Finite<O>(O);

impl<O> CostFunction for Finite<O>
where
    O: CostFunction<Param = Param, Output = f64>,
{
    type Param = Param;
    type Output = f64;

    fn cost(&self, param: &Param) -> std::result::Result<f64, ArgminError> {
        let value = self.0.cost(param)?;
        if !value.is_finite() {
            return Err(MnlError::NumericalError {
                context: "objective",
            }
            .into());
        }
        Ok(value)
    }
}

impl<O> Gradient for Finite<O>
where
    O: Gradient<Param = Param, Gradient = Param>,
{
    type Param = Param;
    type Gradient = Param;

    fn gradient(&self, param: &Param) -> std::result::Result<Param, ArgminError> {
        let gradient = self.0.gradient(param)?;
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(MnlError::NumericalError {
                context: "gradient",
            }
            .into());
        }
        Ok(gradient)
    }
}

impl<O> Hessian for Finite<O>
where
    O: Hessian<Param = Param, Hessian = DMatrix<f64>>,
{
    type Param = Param;
    type Hessian = DMatrix<f64>;

    fn hessian(&self, param: &Param) -> std::result::Result<DMatrix<f64>, ArgminError> {
        let hessian = self.0.hessian(param)?;
        if hessian.iter().any(|h| !h.is_finite()) {
            return Err(MnlError::NumericalError { context: "hessian" }.into());
        }
        Ok(hessian)
    }
}

/// Observer keeping the best accepted iterate, so failures can report it.
#[derive(Clone)]
struct Trace(Rc<RefCell<Progress>>);

struct Progress {
    iterations: usize,
    point: Param,
    value: f64,
}

impl Trace {
    fn new(start: Param, value: f64) -> Self {
        Self(Rc::new(RefCell::new(Progress {
            iterations: 0,
            point: start,
            value,
        })))
    }

    fn iterations(&self) -> usize {
        self.0.borrow().iterations
    }

    fn best(&self) -> (Param, f64) {
        let progress = self.0.borrow();
        (progress.point.clone(), progress.value)
    }
}

impl<H> Observe<IterState<Param, Param, (), H, (), f64>> for Trace {
    fn observe_iter(
        &mut self,
        state: &IterState<Param, Param, (), H, (), f64>,
        _kv: &KV,
    ) -> std::result::Result<(), ArgminError> {
        let mut progress = self.0.borrow_mut();
        progress.iterations = state.get_iter() as usize + 1;
        if let Some(best) = state.get_best_param() {
            if state.get_best_cost() <= progress.value {
                progress.point = best.clone();
                progress.value = state.get_best_cost();
            }
        }
        debug!(
            "iteration {}: objective {:.10e}",
            progress.iterations,
            state.get_cost()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Convex quadratic `0.5 (x - c)' A (x - c)` with a known minimizer.
    #[derive(Clone)]
    struct Quadratic;

    impl Quadratic {
        fn curvature() -> DMatrix<f64> {
            DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0])
        }

        fn offset(x: &Param) -> Param {
            x - DVector::from_vec(vec![1.0, -2.0])
        }
    }

    impl CostFunction for Quadratic {
        type Param = Param;
        type Output = f64;

        fn cost(&self, x: &Param) -> std::result::Result<f64, ArgminError> {
            let diff = Self::offset(x);
            Ok(0.5 * diff.dot(&(Self::curvature() * &diff)))
        }
    }

    impl Gradient for Quadratic {
        type Param = Param;
        type Gradient = Param;

        fn gradient(&self, x: &Param) -> std::result::Result<Param, ArgminError> {
            Ok(Self::curvature() * Self::offset(x))
        }
    }

    impl Hessian for Quadratic {
        type Param = Param;
        type Hessian = DMatrix<f64>;

        fn hessian(&self, _x: &Param) -> std::result::Result<DMatrix<f64>, ArgminError> {
            Ok(Self::curvature())
        }
    }

    /// Rosenbrock's banana function, a standard stress test for quasi-Newton methods.
    #[derive(Clone)]
    struct Rosenbrock;

    impl CostFunction for Rosenbrock {
        type Param = Param;
        type Output = f64;

        fn cost(&self, x: &Param) -> std::result::Result<f64, ArgminError> {
            let (a, b) = (x[0], x[1]);
            Ok((1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2))
        }
    }

    impl Gradient for Rosenbrock {
        type Param = Param;
        type Gradient = Param;

        fn gradient(&self, x: &Param) -> std::result::Result<Param, ArgminError> {
            let (a, b) = (x[0], x[1]);
            Ok(DVector::from_vec(vec![
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ]))
        }
    }

    /// Decreases without bound along `x`, but is undefined past `x = 2`.
    #[derive(Clone)]
    struct CliffEdge;

    impl CostFunction for CliffEdge {
        type Param = Param;
        type Output = f64;

        fn cost(&self, x: &Param) -> std::result::Result<f64, ArgminError> {
            Ok(if x[0] > 2.0 { f64::NAN } else { -x[0] })
        }
    }

    impl Gradient for CliffEdge {
        type Param = Param;
        type Gradient = Param;

        fn gradient(&self, x: &Param) -> std::result::Result<Param, ArgminError> {
            Ok(DVector::from_element(x.len(), -1.0))
        }
    }

    #[test]
    fn lbfgs_finds_quadratic_minimum() {
        let start = DVector::from_vec(vec![10.0, 10.0]);
        let minimum = minimize_lbfgs(Quadratic, start, &SolverOptions::default()).unwrap();
        assert_relative_eq!(minimum.point[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(minimum.point[1], -2.0, epsilon = 1e-6);
        assert!(minimum.value >= 0.0 && minimum.value < 1e-10);
        assert!(minimum.summary.gradient_norm <= 1e-6);
    }

    #[test]
    fn lbfgs_solves_rosenbrock() {
        let start = DVector::from_vec(vec![-1.2, 1.0]);
        let options = SolverOptions {
            max_iterations: 2_000,
            gradient_tolerance: 1e-5,
            ..SolverOptions::default()
        };
        let minimum = minimize_lbfgs(Rosenbrock, start, &options).unwrap();
        assert_relative_eq!(minimum.point[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(minimum.point[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn newton_cg_solves_quadratic_in_a_few_steps() {
        let start = DVector::from_vec(vec![3.0, 4.0]);
        let minimum = minimize_newton_cg(Quadratic, start, &SolverOptions::default()).unwrap();
        assert!(minimum.summary.iterations <= 3);
        assert_relative_eq!(minimum.point[0], 1.0, epsilon = 1e-8);
        assert_relative_eq!(minimum.point[1], -2.0, epsilon = 1e-8);
    }

    #[test]
    fn stationary_start_returns_without_iterating() {
        let start = DVector::from_vec(vec![1.0, -2.0]);
        let minimum = minimize_newton_cg(Quadratic, start, &SolverOptions::default()).unwrap();
        assert_eq!(minimum.summary.iterations, 0);
        assert_eq!(minimum.point, DVector::from_vec(vec![1.0, -2.0]));
    }

    #[test]
    fn exhausted_budget_reports_best_iterate() {
        let start = DVector::from_vec(vec![-1.2, 1.0]);
        let options = SolverOptions {
            max_iterations: 2,
            ..SolverOptions::default()
        };
        match minimize_lbfgs(Rosenbrock, start, &options) {
            Err(MnlError::OptimizationFailed {
                reason,
                iterations,
                objective,
                beta,
            }) => {
                assert_eq!(reason, "iteration budget exhausted");
                assert_eq!(iterations, 2);
                assert!(objective < 24.2 + 1e-9);
                assert_eq!(beta.len(), 2);
            }
            other => panic!("expected optimization failure, got {other:?}"),
        }
    }

    #[test]
    fn stalled_objective_above_gradient_tolerance_is_an_error() {
        // A huge cost tolerance stops the solver after one step, far from stationary.
        let options = SolverOptions {
            cost_tolerance: 1e6,
            ..SolverOptions::default()
        };
        let start = DVector::from_vec(vec![10.0, 10.0]);
        match minimize_lbfgs(Quadratic, start, &options) {
            Err(MnlError::OptimizationFailed {
                reason, objective, ..
            }) => {
                assert_eq!(reason, "line search stalled");
                assert!(objective < 486.0);
            }
            other => panic!("expected a stalled search, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_start_is_rejected() {
        #[derive(Clone)]
        struct Undefined;

        impl CostFunction for Undefined {
            type Param = Param;
            type Output = f64;

            fn cost(&self, _x: &Param) -> std::result::Result<f64, ArgminError> {
                Ok(f64::NAN)
            }
        }

        impl Gradient for Undefined {
            type Param = Param;
            type Gradient = Param;

            fn gradient(&self, x: &Param) -> std::result::Result<Param, ArgminError> {
                Ok(x.clone())
            }
        }

        let result = minimize_lbfgs(Undefined, DVector::zeros(2), &SolverOptions::default());
        assert!(matches!(
            result,
            Err(MnlError::OptimizationFailed { iterations: 0, .. })
        ));
    }

    #[test]
    fn non_finite_objective_during_search_is_an_error() {
        let start = DVector::from_vec(vec![0.0]);
        match minimize_lbfgs(CliffEdge, start, &SolverOptions::default()) {
            Err(MnlError::OptimizationFailed {
                reason,
                objective,
                beta,
                ..
            }) => {
                assert_eq!(reason, "non-finite objective");
                assert!(objective.is_finite() && objective <= 0.0);
                assert!(beta[0] <= 2.0);
            }
            other => panic!("expected a non-finite objective error, got {other:?}"),
        }
    }

    #[test]
    fn zero_iteration_budget_is_rejected() {
        let options = SolverOptions {
            max_iterations: 0,
            ..SolverOptions::default()
        };
        assert!(matches!(
            minimize_lbfgs(Quadratic, DVector::from_vec(vec![3.0, 4.0]), &options),
            Err(MnlError::InvalidSetting {
                name: "max_iterations",
                ..
            })
        ));
    }

    #[test]
    fn empty_lbfgs_memory_is_rejected() {
        let options = SolverOptions {
            lbfgs_memory: 0,
            ..SolverOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(MnlError::InvalidSetting {
                name: "lbfgs_memory",
                ..
            })
        ));
    }
}
