//! spillway-core library.
//!
//! Freezes per-cycle committed-item snapshots for each group and derives
//! delivery and spillover KPIs from them.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums at module boundaries, `anyhow::Result`
//!   for plumbing that only needs context.
//! - **Logging**: use `tracing` macros with structured fields
//!   (`group`, `cycle`, ...).
//! - **Time**: every time-dependent operation takes `now` explicitly so runs
//!   are reproducible.

#![forbid(unsafe_code)]

pub mod cache;
pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod kpi;
pub mod lock;
pub mod model;
pub mod policy;
pub mod snapshot;
pub mod upstream;
