//! Controller-manager runtime
//!
//! The substrate a controller binary is built on:
//!
//! - [`SchemeRegistry`] - known API kinds and their codecs
//! - [`WorkQueue`] - deduplicating, rate-limited queue of object keys
//! - [`Controller`] - a [`Reconciler`] bound to watch sources and a worker pool
//! - [`LeaderElector`] - lease-based leader election; only the leader runs controllers
//! - [`HealthChecks`] - `/healthz` and `/readyz` predicates
//! - [`Metrics`] - Prometheus registry served on `/metrics`
//! - [`Manager`] - ties it together and drains on shutdown
//!
//! A binary builds a [`Manager`], registers its types, checks and
//! controllers, then calls [`Manager::start`] with the token returned by
//! [`shutdown_on_signal`].

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod leader_election;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod scheme;
pub mod signal;
pub mod source;
pub mod workqueue;

pub use config::{parse_bind_address, ManagerConfig};
pub use controller::{
    Controller, ControllerBuilder, EnqueueHandle, ObjectKey, ReconcileError, ReconcileRequest,
    ReconcileResult, Reconciler,
};
pub use error::RuntimeError;
pub use health::{ping, CheckFamily, HealthChecks};
pub use leader_election::{LeaderElectionConfig, LeaderElector, LeaderState, LeadershipHandler};
pub use lease::{KubeLeaseStore, LeaseError, LeaseRecord, LeaseStore};
pub use manager::Manager;
pub use metrics::Metrics;
pub use scheme::{register_core_types, SchemeRegistry};
pub use signal::shutdown_on_signal;
pub use source::{owners_of_kind, KubeSource, Source};
pub use workqueue::WorkQueue;
