//! Kyma Lifecycle Operator
//!
//! Synchronizes the modules a Kyma resource declares onto the control-plane
//! cluster or a runtime cluster, tracks what was applied so it can be pruned,
//! and rolls per-module health into the Kyma status.

pub mod bridge;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;
pub mod telemetry;

pub use crate::error::{Error, Result};
