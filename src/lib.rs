//! kmm - race-safe bootstrap of shared control-plane PKI
//!
//! A set of master nodes start at the same time with no prior coordination.
//! Exactly one of them must generate the cluster's shared secrets (CA
//! material, front-proxy CA, service-account keys); every other node must
//! install those same secrets instead of generating its own.
//!
//! The nodes agree through a key-value store offering a create-only write and
//! a non-blocking lock (see [`kmm_store::CoordinationStore`]). No leader
//! election service is involved.
//!
//! # Modules
//!
//! - [`coordinator`] - the bootstrap protocol
//! - [`staging`] - local preconditions and CA staging
//! - [`provider`] - what the shared material is and how it lands on disk
//! - [`network`] - pod network plugin installed once per cluster
//! - [`cloud`] - saving CA inputs from the cloud environment
//! - [`retry`] - backoff policy and injectable sleeping
//! - [`config`] - bootstrap configuration
//! - [`cli`] - command-line interface
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cli;
pub mod cloud;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod kube_utils;
pub mod network;
pub mod provider;
pub mod retry;
pub mod staging;
pub mod yaml;

pub use config::{BootstrapConfig, StoreKeys};
pub use coordinator::{BootstrapOutcome, Coordinator};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
