//! Stale-while-revalidate cache of CRM leads, flattened into tabular rows.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
