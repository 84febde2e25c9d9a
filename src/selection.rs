//! Deterministic ranking over catalog candidates.
//!
//! Selection is a pure function of the candidate set: the same products in
//! any order always yield the same choice. There is no "first row wins";
//! every tie is broken explicitly, down to the product id.

use std::cmp::Ordering;

use crate::catalog::Product;
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Least cloud cover; ties broken by most recent acquisition, then by
    /// lexicographically smallest id.
    #[default]
    LeastCloudCover,
}

/// Candidates ordered best-first under `policy`.
pub fn rank<'a>(products: &'a [Product], policy: SelectionPolicy) -> Vec<&'a Product> {
    let mut ranked: Vec<&Product> = products.iter().collect();
    ranked.sort_by(|a, b| compare(a, b, policy));
    ranked
}

/// The single best candidate, or `NoMatch` when there are none.
pub fn select<'a>(
    products: &'a [Product],
    policy: SelectionPolicy,
) -> Result<&'a Product, FetchError> {
    products
        .iter()
        .min_by(|a, b| compare(a, b, policy))
        .ok_or(FetchError::NoMatch)
}

fn compare(a: &Product, b: &Product, policy: SelectionPolicy) -> Ordering {
    match policy {
        SelectionPolicy::LeastCloudCover => a
            .cloud_cover_percent
            .total_cmp(&b.cloud_cover_percent)
            .then_with(|| b.acquisition_date.cmp(&a.acquisition_date))
            .then_with(|| a.id.cmp(&b.id)),
    }
}
