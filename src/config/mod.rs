//! Configuration for kyma

pub mod settings;
