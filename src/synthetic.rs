//! Random-utility panel generator for exercising the estimator on known coefficients.

use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Gumbel, Uniform};

use crate::data::{WideTable, WideTableBuilder, CHOICE_PREFIX, FEATURED_PREFIX, PRICE_PREFIX};
use crate::error::{MnlError, Result};
use crate::formulation::DesignLayout;

/// Draws consumers who pick the product maximizing `x . beta + e`, with `e` i.i.d.
/// standard Gumbel, so choices follow the multinomial logit exactly.
#[derive(Clone, Debug)]
pub struct SyntheticPanel {
    layout: DesignLayout,
    consumers: usize,
    price_range: (f64, f64),
    feature_probability: f64,
    seed: u64,
}

impl SyntheticPanel {
    /// Panel of `consumers` facing `products` alternatives.
    pub fn new(products: usize, consumers: usize) -> Result<Self> {
        Ok(Self {
            layout: DesignLayout::new(products)?,
            consumers,
            price_range: (0.05, 0.12),
            feature_probability: 0.1,
            seed: 0,
        })
    }

    /// Prices are drawn uniformly from `[low, high)`.
    pub fn with_prices(mut self, low: f64, high: f64) -> Self {
        self.price_range = (low, high);
        self
    }

    /// Probability that a product is featured for a given consumer.
    pub fn with_feature_probability(mut self, probability: f64) -> Self {
        self.feature_probability = probability;
        self
    }

    /// Seed of the random generator; the same seed and coefficients give the same panel.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Generates a wide table with `id, y*, f*, p*` columns under coefficients `beta`.
    pub fn generate(&self, beta: &DVector<f64>) -> Result<WideTable> {
        self.layout.check_beta_len(beta.len())?;
        let (low, high) = self.price_range;
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(MnlError::invalid_setting("price range", high - low));
        }
        let featured_draw = Bernoulli::new(self.feature_probability)
            .map_err(|_| MnlError::invalid_setting("feature probability", self.feature_probability))?;
        let shock = Gumbel::<f64>::new(0.0, 1.0)
            .map_err(|_| MnlError::invalid_setting("gumbel scale", 1.0))?;
        let price_draw = Uniform::new(low, high);
        let mut rng = SmallRng::seed_from_u64(self.seed);

        let products = self.layout.products();
        let mut choice = vec![vec![0.0; self.consumers]; products];
        let mut featured = vec![vec![0.0; self.consumers]; products];
        let mut price = vec![vec![0.0; self.consumers]; products];
        let mut row = vec![0.0; self.layout.column_count()];

        for consumer in 0..self.consumers {
            let mut best = (0usize, f64::NEG_INFINITY);
            for offset in 0..products {
                let f = if featured_draw.sample(&mut rng) { 1.0 } else { 0.0 };
                let p = price_draw.sample(&mut rng);
                self.layout.fill_row(&mut row, offset + 1, f, p);
                let utility = DVector::from_column_slice(&row).dot(beta) + shock.sample(&mut rng);
                if utility > best.1 {
                    best = (offset, utility);
                }
                featured[offset][consumer] = f;
                price[offset][consumer] = p;
            }
            choice[best.0][consumer] = 1.0;
        }

        let mut builder = WideTableBuilder::new((1..=self.consumers).map(|i| i.to_string()));
        for (offset, ((y, f), p)) in choice.into_iter().zip(featured).zip(price).enumerate() {
            let product = offset + 1;
            builder = builder
                .column(format!("{CHOICE_PREFIX}{product}"), y)
                .column(format!("{FEATURED_PREFIX}{product}"), f)
                .column(format!("{PRICE_PREFIX}{product}"), p);
        }
        builder.build()
    }
}
