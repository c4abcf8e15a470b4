//! jobplane control plane library.
//!
//! Mutating requests against firewall rules and machines are accepted as
//! asynchronous jobs. Each resource admits at most one in-flight job; the
//! resource's visible fields change only when that job succeeds.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! library surface to enable integration testing and reuse.

pub mod actuation;
pub mod api;
pub mod config;
pub mod control;
pub mod executor;
pub mod grammar;
pub mod model;
pub mod resources;
pub mod state;
pub mod store;
