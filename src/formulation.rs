//! Column layout shared by the design matrix and the coefficient vector.
//!
//! The utility of product `j` is `brand_j + featured * f_j + price * p_j`, with the
//! last product acting as the reference category whose brand intercept is fixed at
//! zero. Every component that touches `beta` goes through [`DesignLayout`] so the
//! ordering `[brand_1, .., brand_{J-1}, featured, price]` lives in one place.

use serde::{Deserialize, Serialize};

use crate::error::{MnlError, Result};

/// Describes the design-matrix columns implied by the number of products.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignLayout {
    products: usize,
}

impl DesignLayout {
    /// Creates the layout for `products` alternatives. At least two are required.
    pub fn new(products: usize) -> Result<Self> {
        if products < 2 {
            return Err(MnlError::dimension_mismatch("product count", 2, products));
        }
        Ok(Self { products })
    }

    /// Number of alternatives `J`.
    pub fn products(&self) -> usize {
        self.products
    }

    /// Number of brand indicator columns (`J - 1`).
    pub fn brand_count(&self) -> usize {
        self.products - 1
    }

    /// Column of the featured indicator.
    pub fn featured_column(&self) -> usize {
        self.brand_count()
    }

    /// Column of the price.
    pub fn price_column(&self) -> usize {
        self.brand_count() + 1
    }

    /// Total number of design columns, equal to the length of `beta`.
    pub fn column_count(&self) -> usize {
        self.brand_count() + 2
    }

    /// Brand indicator column for `product_id`, or `None` for the reference product.
    pub fn brand_column(&self, product_id: usize) -> Option<usize> {
        (1..self.products)
            .contains(&product_id)
            .then(|| product_id - 1)
    }

    /// Checks that `product_id` names one of the modelled products.
    pub fn check_product(&self, product_id: usize) -> Result<()> {
        if product_id == 0 || product_id > self.products {
            return Err(MnlError::UnknownProduct {
                product_id,
                products: self.products,
            });
        }
        Ok(())
    }

    /// Checks that a coefficient vector has one entry per design column.
    pub fn check_beta_len(&self, found: usize) -> Result<()> {
        if found != self.column_count() {
            return Err(MnlError::dimension_mismatch(
                "coefficient vector length",
                self.column_count(),
                found,
            ));
        }
        Ok(())
    }

    /// Writes the design row for one (product, featured, price) observation.
    pub(crate) fn fill_row(&self, row: &mut [f64], product_id: usize, featured: f64, price: f64) {
        row.iter_mut().for_each(|value| *value = 0.0);
        if let Some(column) = self.brand_column(product_id) {
            row[column] = 1.0;
        }
        row[self.featured_column()] = featured;
        row[self.price_column()] = price;
    }

    /// Coefficient names in design order: `brand_1, .., brand_{J-1}, featured, price`.
    pub fn coefficient_names(&self) -> Vec<String> {
        (1..self.products)
            .map(|k| format!("brand_{k}"))
            .chain(["featured".to_string(), "price".to_string()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yogurt_layout_names_coefficients_in_order() {
        let layout = DesignLayout::new(4).unwrap();
        assert_eq!(layout.column_count(), 5);
        assert_eq!(
            layout.coefficient_names(),
            vec!["brand_1", "brand_2", "brand_3", "featured", "price"]
        );
        assert_eq!(layout.brand_column(1), Some(0));
        assert_eq!(layout.brand_column(4), None);
    }

    #[test]
    fn reference_product_row_has_no_brand_indicator() {
        let layout = DesignLayout::new(3).unwrap();
        let mut row = vec![9.0; layout.column_count()];
        layout.fill_row(&mut row, 3, 1.0, 0.25);
        assert_eq!(row, vec![0.0, 0.0, 1.0, 0.25]);
    }

    #[test]
    fn single_product_is_rejected() {
        assert!(matches!(
            DesignLayout::new(1),
            Err(MnlError::DimensionMismatch { .. })
        ));
    }
}
