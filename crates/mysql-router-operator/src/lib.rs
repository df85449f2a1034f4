//! Operator logic for a MySQL Router workload running on Kubernetes or on machines.
//!
//! The crate is driven one [`Event`](event::Event) at a time. Each event is handled by a
//! [`Charm`](charm::Charm), which reconciles the persisted relation state in a
//! [`Model`](model::Model) into workload configuration through a [`Platform`](platform::Platform)
//! implementation, and drives the partition-gated in-place upgrade protocol in [`upgrade`].
//!
//! ## Modules
//!
//! - [`charm`] contains the per-event reconciler and the status computation.
//! - [`upgrade`] contains the compatibility check, the unit health state and the partition
//!   controller.
//! - [`relations`] contains the relation endpoints the reconciler consumes.
//! - [`workload`] contains the MySQL Router workload, its container abstraction and MySQL Shell.
//! - [`platform`] contains the Kubernetes and machine variants.
//! - [`run`] handles one event for the operator binary.

pub mod charm;
pub mod cli;
pub mod config;
pub mod event;
pub mod logging;
pub mod model;
pub mod platform;
pub mod relations;
pub mod run;
pub mod status;
pub mod unit;
pub mod upgrade;
pub mod versions;
pub mod workload;

// External re-exports
pub use k8s_openapi;
