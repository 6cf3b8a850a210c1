//! Consumer-level data containers and the wide-to-long reshaper used by the MNL estimator.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{MnlError, Result};
use crate::formulation::DesignLayout;

/// Column prefix for choice indicators (`y1..yJ`).
pub const CHOICE_PREFIX: &str = "y";
/// Column prefix for featured indicators (`f1..fJ`).
pub const FEATURED_PREFIX: &str = "f";
/// Column prefix for prices (`p1..pJ`).
pub const PRICE_PREFIX: &str = "p";

/// One record per consumer with named per-product columns, as produced by a loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WideTable {
    ids: Vec<String>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl WideTable {
    /// Number of consumers.
    pub fn consumer_count(&self) -> usize {
        self.ids.len()
    }

    /// Consumer identifiers in row order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Returns the values of a named column, if present.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Iterates over column names in sorted order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    fn checked_column(&self, name: &str) -> Result<&[f64]> {
        let values = self
            .column(name)
            .ok_or_else(|| MnlError::missing_column(name))?;
        if values.len() != self.ids.len() {
            return Err(MnlError::RaggedColumn {
                column: name.to_string(),
                expected: self.ids.len(),
                found: values.len(),
            });
        }
        Ok(values)
    }
}

/// Builder that assembles a [`WideTable`] column by column.
#[derive(Debug, Default)]
pub struct WideTableBuilder {
    ids: Vec<String>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl WideTableBuilder {
    /// Start building from the consumer identifiers.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            columns: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a named column.
    pub fn column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.columns.insert(name.into(), values);
        self
    }

    /// Finalizes the table after checking every column has one value per consumer.
    pub fn build(self) -> Result<WideTable> {
        let n = self.ids.len();
        for (name, values) in &self.columns {
            if values.len() != n {
                return Err(MnlError::RaggedColumn {
                    column: name.clone(),
                    expected: n,
                    found: values.len(),
                });
            }
        }
        Ok(WideTable {
            ids: self.ids,
            columns: self.columns,
        })
    }
}

/// One (consumer, product) observation of the long table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LongRow {
    pub consumer_id: String,
    /// Product identifier in `1..=J`.
    pub product_id: usize,
    pub chosen: bool,
    pub featured: f64,
    pub price: f64,
}

/// Converts wide per-consumer records into a [`LongTable`] for a fixed number of products.
#[derive(Clone, Copy, Debug)]
pub struct Reshaper {
    layout: DesignLayout,
}

impl Reshaper {
    /// Creates a reshaper for `products` alternatives.
    pub fn new(products: usize) -> Result<Self> {
        Ok(Self {
            layout: DesignLayout::new(products)?,
        })
    }

    /// Number of products this reshaper expects in the wide table.
    pub fn products(&self) -> usize {
        self.layout.products()
    }

    /// Emits `J` rows per consumer, in consumer order then product order.
    ///
    /// Only the structure is validated: every `y`, `f` and `p` column must be
    /// present and each consumer must choose exactly one product. Prices and
    /// featured flags are carried over untouched.
    pub fn reshape(&self, wide: &WideTable) -> Result<LongTable> {
        let choice = self.column_set(wide, CHOICE_PREFIX)?;
        let featured = self.column_set(wide, FEATURED_PREFIX)?;
        let price = self.column_set(wide, PRICE_PREFIX)?;

        let products = self.layout.products();
        let mut rows = Vec::with_capacity(wide.consumer_count() * products);

        for (consumer, consumer_id) in wide.ids().iter().enumerate() {
            let mut chosen = 0usize;
            for (offset, column) in choice.iter().enumerate() {
                let value = column[consumer];
                if value != 0.0 && value != 1.0 {
                    return Err(MnlError::InvalidIndicator {
                        column: format!("{CHOICE_PREFIX}{}", offset + 1),
                        consumer_id: consumer_id.clone(),
                        value,
                    });
                }
                if value == 1.0 {
                    chosen += 1;
                }
            }
            if chosen != 1 {
                return Err(MnlError::InvalidChoiceCount {
                    consumer_id: consumer_id.clone(),
                    chosen,
                });
            }

            for offset in 0..products {
                rows.push(LongRow {
                    consumer_id: consumer_id.clone(),
                    product_id: offset + 1,
                    chosen: choice[offset][consumer] == 1.0,
                    featured: featured[offset][consumer],
                    price: price[offset][consumer],
                });
            }
        }

        LongTable::from_rows(self.layout, rows)
    }

    fn column_set<'a>(&self, wide: &'a WideTable, prefix: &str) -> Result<Vec<&'a [f64]>> {
        (1..=self.layout.products())
            .map(|product| wide.checked_column(&format!("{prefix}{product}")))
            .collect()
    }
}

/// Long-format observations with the design matrix and consumer grouping precomputed.
#[derive(Clone, Debug)]
pub struct LongTable {
    layout: DesignLayout,
    rows: Vec<LongRow>,
    design: DMatrix<f64>,
    partition: ConsumerPartition,
}

impl LongTable {
    fn from_rows(layout: DesignLayout, rows: Vec<LongRow>) -> Result<Self> {
        let partition = ConsumerPartition::new(&rows, &layout)?;

        let columns = layout.column_count();
        let mut buffer = vec![0.0; rows.len() * columns];
        for (row, chunk) in rows.iter().zip(buffer.chunks_mut(columns)) {
            layout.fill_row(chunk, row.product_id, row.featured, row.price);
        }
        let design = DMatrix::from_row_slice(rows.len(), columns, &buffer);

        Ok(Self {
            layout,
            rows,
            design,
            partition,
        })
    }

    /// Column layout of the design matrix.
    pub fn layout(&self) -> &DesignLayout {
        &self.layout
    }

    /// Number of products `J`.
    pub fn products(&self) -> usize {
        self.layout.products()
    }

    /// Number of (consumer, product) rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of consumers.
    pub fn consumer_count(&self) -> usize {
        self.partition.consumer_count()
    }

    /// Raw long-format rows.
    pub fn rows(&self) -> &[LongRow] {
        &self.rows
    }

    /// Read-only design matrix with columns `[brand_1, .., brand_{J-1}, featured, price]`.
    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    /// Consumer grouping index shared by every likelihood evaluation.
    pub fn partition(&self) -> &ConsumerPartition {
        &self.partition
    }

    /// Brand indicator `is_brand_k` for a row; always false for the reference product.
    pub fn is_brand(&self, row_index: usize, brand: usize) -> bool {
        self.layout
            .brand_column(brand)
            .map_or(false, |column| self.design[(row_index, column)] == 1.0)
    }

    /// Returns a copy whose `price` is shifted by `delta` on every row of `product_id`.
    pub fn with_price_change(&self, product_id: usize, delta: f64) -> Result<Self> {
        self.layout.check_product(product_id)?;
        let mut shifted = self.clone();
        let price_column = self.layout.price_column();
        for (index, row) in shifted.rows.iter_mut().enumerate() {
            if row.product_id == product_id {
                row.price += delta;
                shifted.design[(index, price_column)] = row.price;
            }
        }
        Ok(shifted)
    }

    /// Re-aggregates the long rows into the wide `id, y*, f*, p*` layout.
    pub fn to_wide(&self) -> WideTable {
        let products = self.layout.products();
        let n = self.consumer_count();
        let mut choice = vec![vec![0.0; n]; products];
        let mut featured = vec![vec![0.0; n]; products];
        let mut price = vec![vec![0.0; n]; products];

        for (consumer, group) in self.partition.groups().enumerate() {
            for &row_index in group.rows() {
                let row = &self.rows[row_index];
                let offset = row.product_id - 1;
                choice[offset][consumer] = if row.chosen { 1.0 } else { 0.0 };
                featured[offset][consumer] = row.featured;
                price[offset][consumer] = row.price;
            }
        }

        let mut columns = BTreeMap::new();
        for (offset, ((y, f), p)) in choice.into_iter().zip(featured).zip(price).enumerate() {
            let product = offset + 1;
            columns.insert(format!("{CHOICE_PREFIX}{product}"), y);
            columns.insert(format!("{FEATURED_PREFIX}{product}"), f);
            columns.insert(format!("{PRICE_PREFIX}{product}"), p);
        }

        WideTable {
            ids: self.partition.groups().map(|g| g.id().to_string()).collect(),
            columns,
        }
    }
}

/// Builder for long tables whose rows arrive in arbitrary order.
#[derive(Debug)]
pub struct LongTableBuilder {
    products: usize,
    rows: Vec<LongRow>,
}

impl LongTableBuilder {
    /// Start building a long table for `products` alternatives.
    pub fn new(products: usize) -> Self {
        Self {
            products,
            rows: Vec::new(),
        }
    }

    /// Appends one observation.
    pub fn row(
        mut self,
        consumer_id: impl Into<String>,
        product_id: usize,
        chosen: bool,
        featured: f64,
        price: f64,
    ) -> Self {
        self.rows.push(LongRow {
            consumer_id: consumer_id.into(),
            product_id,
            chosen,
            featured,
            price,
        });
        self
    }

    /// Appends already-assembled rows.
    pub fn rows(mut self, rows: impl IntoIterator<Item = LongRow>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Validates grouping and builds the design matrix.
    pub fn build(self) -> Result<LongTable> {
        let layout = DesignLayout::new(self.products)?;
        LongTable::from_rows(layout, self.rows)
    }
}

/// Maps each consumer to the long-table rows that belong to it.
#[derive(Clone, Debug)]
pub struct ConsumerPartition {
    groups: Vec<ConsumerGroup>,
    row_count: usize,
}

impl ConsumerPartition {
    /// Groups rows by consumer in order of first appearance and validates each group.
    fn new(rows: &[LongRow], layout: &DesignLayout) -> Result<Self> {
        let mut groups: Vec<ConsumerGroup> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for (row_index, row) in rows.iter().enumerate() {
            layout.check_product(row.product_id)?;
            let group_index = *index.entry(row.consumer_id.as_str()).or_insert_with(|| {
                groups.push(ConsumerGroup {
                    consumer_id: row.consumer_id.clone(),
                    rows: Vec::with_capacity(layout.products()),
                    chosen_offset: 0,
                });
                groups.len() - 1
            });
            groups[group_index].rows.push(row_index);
        }

        for group in &mut groups {
            group.rows.sort_by_key(|&row_index| rows[row_index].product_id);
            for pair in group.rows.windows(2) {
                if rows[pair[0]].product_id == rows[pair[1]].product_id {
                    return Err(MnlError::DuplicateProduct {
                        consumer_id: group.consumer_id.clone(),
                        product_id: rows[pair[0]].product_id,
                    });
                }
            }
            if group.rows.len() != layout.products() {
                return Err(MnlError::UnbalancedConsumer {
                    consumer_id: group.consumer_id.clone(),
                    expected: layout.products(),
                    found: group.rows.len(),
                });
            }

            let chosen: Vec<usize> = group
                .rows
                .iter()
                .enumerate()
                .filter(|(_, &row_index)| rows[row_index].chosen)
                .map(|(offset, _)| offset)
                .collect();
            match chosen[..] {
                [offset] => group.chosen_offset = offset,
                _ => {
                    return Err(MnlError::InvalidChoiceCount {
                        consumer_id: group.consumer_id.clone(),
                        chosen: chosen.len(),
                    })
                }
            }
        }

        Ok(Self {
            groups,
            row_count: rows.len(),
        })
    }

    /// Returns the number of distinct consumers.
    pub fn consumer_count(&self) -> usize {
        self.groups.len()
    }

    /// Total number of long-table rows covered by the partition.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Iterates over consumer groups.
    pub fn groups(&self) -> impl Iterator<Item = &ConsumerGroup> {
        self.groups.iter()
    }

    /// Slice of all consumer groups, in first-appearance order.
    pub fn as_slice(&self) -> &[ConsumerGroup] {
        &self.groups
    }
}

/// Rows owned by a single consumer.
#[derive(Clone, Debug)]
pub struct ConsumerGroup {
    consumer_id: String,
    /// Row indices ordered by product id, so `rows[j - 1]` is product `j`.
    rows: Vec<usize>,
    /// Position of the chosen product inside `rows`.
    chosen_offset: usize,
}

impl ConsumerGroup {
    /// Returns the identifier of the consumer.
    pub fn id(&self) -> &str {
        &self.consumer_id
    }

    /// Row indices of this consumer, ordered by product id.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Row index of the product this consumer chose.
    pub fn chosen_row(&self) -> usize {
        self.rows[self.chosen_offset]
    }

    /// Position of the chosen row inside [`rows`](Self::rows).
    pub fn chosen_offset(&self) -> usize {
        self.chosen_offset
    }
}
