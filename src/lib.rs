//! Kyma CLI - command-line client for Kyma clusters

pub mod commands;
pub mod config;
pub mod k8s;
pub mod registry;
pub mod utils;
