//! Weighted adoption analysis over the clean dataset.
//!
//! Selects records with a [`filter::FilterSpec`], folds them into weighted
//! rates per commune, department or nation, ranks groups, and derives
//! quarter-by-quarter trends, dispersion statistics and the department
//! prioritisation matrix.

pub mod aggregate;
pub mod filter;
pub mod priority;
pub mod trends;
pub mod types;
pub mod utility;
