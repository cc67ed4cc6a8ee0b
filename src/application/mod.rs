//! Collection, enrichment and flattening of upstream leads.

pub mod enricher;
pub mod error;
pub mod flatten;
pub mod paginator;
pub mod pipeline;
pub mod upstream;

#[cfg(test)]
pub(crate) mod fakes;
