//! Maximum-likelihood multinomial logit estimation and counterfactual market shares.
//!
//! The crate targets the single-choice, linear-utility logit used to study
//! consumer purchase panels (for instance yogurt brands with prices and
//! in-store features). It provides tools to
//!
//! - reshape wide per-consumer records into a long design matrix (`data` module),
//! - evaluate utilities and per-consumer logit probabilities (`demand` module),
//! - minimize the negative log-likelihood with `argmin`'s L-BFGS or Newton-CG
//!   (`estimation`, `solving` modules), and
//! - simulate market shares under hypothetical price changes (`simulation` module).
//!
//! Utility of product `j` for consumer `i` is
//! `brand_j + featured * f_ij + price * p_ij`, with the last product as the
//! reference category. Probabilities use a log-sum-exp shift, so large
//! utilities never overflow.
//!
//! # Quick start
//!
//! ```no_run
//! use mnlrs::data::Reshaper;
//! use mnlrs::synthetic::SyntheticPanel;
//! use mnlrs::{FitOptions, MnlProblem, PriceScenario};
//! use nalgebra::DVector;
//!
//! // Any loader producing `id, y1..y4, f1..f4, p1..p4` columns works here.
//! let truth = DVector::from_vec(vec![1.0, 0.5, -0.3, 0.8, -30.0]);
//! let wide = SyntheticPanel::new(4, 2_000)
//!     .expect("four products")
//!     .with_seed(42)
//!     .generate(&truth)
//!     .expect("valid panel settings");
//!
//! let long = Reshaper::new(4).unwrap().reshape(&wide).expect("one choice per consumer");
//! let problem = MnlProblem::new(long.clone()).expect("non-empty panel");
//! let fit = problem.fit(&FitOptions::default()).expect("converged");
//! for (name, value) in fit.coefficients() {
//!     println!("{name}: {value:.4}");
//! }
//!
//! // Raise the price of product 1 by one cent and compare predicted shares.
//! let outcome = PriceScenario::new(1, 0.01)
//!     .evaluate(&long, &fit.beta)
//!     .expect("valid scenario");
//! println!("baseline {:?} -> counterfactual {:?}", outcome.baseline, outcome.counterfactual);
//! ```

pub mod data;
pub mod demand;
pub mod error;
pub mod estimation;
pub mod formulation;
pub mod options;
pub mod simulation;
pub mod solving;
pub mod synthetic;

pub use error::{ErrorKind, MnlError, Result};
pub use estimation::{fit, negative_log_likelihood, FitResult, MnlProblem};
pub use options::{FitOptions, Method};
pub use simulation::{market_shares, simulate_price_change, PriceScenario, ScenarioOutcome};
pub use solving::{OptimizationSummary, SolverOptions};
