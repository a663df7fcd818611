//! Command implementations for kyma CLI

pub mod registry;
