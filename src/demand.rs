//! Choice primitives: linear utilities and per-consumer logit probabilities.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::data::{ConsumerGroup, ConsumerPartition, LongTable};
use crate::error::{MnlError, Result};

/// Logit probabilities of one consumer together with the log normalizer
/// `max(u) + ln(sum_j exp(u_j - max(u)))`.
#[derive(Clone, Debug)]
pub(crate) struct Softmax {
    pub probabilities: Vec<f64>,
    pub log_normalizer: f64,
}

/// Softmax with the group maximum subtracted before exponentiation.
///
/// Returns `None` when any utility is NaN or infinite. The shifted maximum is
/// `exp(0) = 1`, so the denominator never underflows to zero.
pub(crate) fn stable_softmax(utilities: &[f64]) -> Option<Softmax> {
    if utilities.iter().any(|u| !u.is_finite()) {
        return None;
    }
    let max = utilities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp_utilities: Vec<f64> = utilities.iter().map(|u| (u - max).exp()).collect();
    let denominator: f64 = exp_utilities.iter().sum();

    Some(Softmax {
        probabilities: exp_utilities.into_iter().map(|e| e / denominator).collect(),
        log_normalizer: max + denominator.ln(),
    })
}

/// Computes the linear utility `x_row . beta` of every long-table row.
pub fn utilities(data: &LongTable, beta: &DVector<f64>) -> Result<DVector<f64>> {
    data.layout().check_beta_len(beta.len())?;
    Ok(data.design() * beta)
}

/// Normalizes utilities into choice probabilities within each consumer group.
///
/// Adding a constant to every utility of a consumer leaves that consumer's
/// probabilities unchanged.
pub fn group_probabilities(
    utilities: &DVector<f64>,
    partition: &ConsumerPartition,
) -> Result<DVector<f64>> {
    if utilities.len() != partition.row_count() {
        return Err(MnlError::dimension_mismatch(
            "utility length",
            partition.row_count(),
            utilities.len(),
        ));
    }

    let blocks = partition
        .as_slice()
        .par_iter()
        .map(|group| group_softmax(group, utilities))
        .collect::<Result<Vec<_>>>()?;

    let mut probabilities = DVector::zeros(utilities.len());
    for (group, block) in partition.groups().zip(blocks) {
        for (&row, probability) in group.rows().iter().zip(block) {
            probabilities[row] = probability;
        }
    }
    Ok(probabilities)
}

fn group_softmax(group: &ConsumerGroup, utilities: &DVector<f64>) -> Result<Vec<f64>> {
    let values: Vec<f64> = group.rows().iter().map(|&row| utilities[row]).collect();
    stable_softmax(&values)
        .map(|softmax| softmax.probabilities)
        .ok_or(MnlError::NumericalError {
            context: "utility normalization",
        })
}

/// Computes one choice probability per (consumer, product) row for coefficients `beta`.
pub fn choice_probabilities(data: &LongTable, beta: &DVector<f64>) -> Result<DVector<f64>> {
    let utilities = utilities(data, beta)?;
    group_probabilities(&utilities, data.partition())
}

/// Arranges choice probabilities as a consumers-by-products matrix.
///
/// Row `i` follows the consumer order of [`ConsumerPartition`]; column `j`
/// holds product `j + 1`.
pub fn probability_matrix(data: &LongTable, beta: &DVector<f64>) -> Result<DMatrix<f64>> {
    let probabilities = choice_probabilities(data, beta)?;
    let mut matrix = DMatrix::zeros(data.consumer_count(), data.products());
    for (consumer, group) in data.partition().groups().enumerate() {
        for (product, &row) in group.rows().iter().enumerate() {
            matrix[(consumer, product)] = probabilities[row];
        }
    }
    Ok(matrix)
}
