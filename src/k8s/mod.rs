//! Kubernetes operations

pub mod client;
