//! Market scanner core library.
//!
//! Exposes every module used by the `market-scanner` binary and by the
//! integration tests under `tests/`.

pub mod adapter;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod error;
pub mod factors;
pub mod manip;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod rules;
pub mod scoring;
