//! Privacy-preserving clinic reporting.
//!
//! Sites turn raw observations into Laplace-perturbed, digest-stamped
//! records and deliver them at least once to a collector. The collector
//! deduplicates, aggregates per group and metric, and forecasts the
//! aggregated series with a small ARIMA model.

pub mod api;
pub mod collector;
pub mod config;
pub mod export;
pub mod privacy;
pub mod record;
pub mod site;
