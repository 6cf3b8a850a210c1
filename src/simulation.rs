//! Market-share prediction and ceteris-paribus price counterfactuals.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::data::LongTable;
use crate::demand::probability_matrix;
use crate::error::{MnlError, Result};

/// Averages each product's predicted choice probability across consumers.
///
/// The result has one entry per product and sums to one.
pub fn market_shares(data: &LongTable, beta: &DVector<f64>) -> Result<DVector<f64>> {
    if data.consumer_count() == 0 {
        return Err(MnlError::dimension_mismatch("consumer count", 1, 0));
    }
    let matrix = probability_matrix(data, beta)?;
    Ok(matrix.row_mean().transpose())
}

/// Market shares after adding `delta` to the price of `product_id` for every consumer.
///
/// The perturbation is applied to a copy; `data` is left untouched. Negative
/// deltas are allowed and the resulting price sign is not checked.
pub fn simulate_price_change(
    data: &LongTable,
    product_id: usize,
    delta: f64,
    beta: &DVector<f64>,
) -> Result<DVector<f64>> {
    let shifted = data.with_price_change(product_id, delta)?;
    market_shares(&shifted, beta)
}

/// A single-product price perturbation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceScenario {
    pub product_id: usize,
    pub delta: f64,
}

impl PriceScenario {
    /// Shift the price of `product_id` (1-based) by `delta` for every consumer.
    pub fn new(product_id: usize, delta: f64) -> Self {
        Self { product_id, delta }
    }

    /// Computes baseline and counterfactual shares under the same coefficients.
    pub fn evaluate(&self, data: &LongTable, beta: &DVector<f64>) -> Result<ScenarioOutcome> {
        let baseline = market_shares(data, beta)?;
        let counterfactual = simulate_price_change(data, self.product_id, self.delta, beta)?;
        Ok(ScenarioOutcome {
            scenario: *self,
            baseline,
            counterfactual,
        })
    }
}

/// Baseline versus counterfactual market shares for one [`PriceScenario`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub scenario: PriceScenario,
    pub baseline: DVector<f64>,
    pub counterfactual: DVector<f64>,
}

impl ScenarioOutcome {
    /// Counterfactual minus baseline share, per product.
    pub fn share_changes(&self) -> DVector<f64> {
        &self.counterfactual - &self.baseline
    }

    /// Share change of the product whose price moved.
    ///
    /// `None` when the scenario's product is not in the share vectors, which can
    /// only happen for an outcome deserialized from elsewhere.
    pub fn own_share_change(&self) -> Option<f64> {
        let index = self.scenario.product_id.checked_sub(1)?;
        Some(self.counterfactual.get(index)? - self.baseline.get(index)?)
    }
}
