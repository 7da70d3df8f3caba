// src/config/mod.rs

//! Configuration loading and validation for batchrelay.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate invariants such as disjoint stage nodes (`validate.rs`).
//! - Resolve the per-activation node environment (`env.rs`).

pub mod env;
pub mod loader;
pub mod model;
pub mod validate;

pub use env::{NodeEnvironment, NodeProfile};
pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{
    BusSection, ConfigFile, NodeSection, PipelineSection, PipelineSettings, RawConfigFile,
    StageConfig, StoreSection, TopicsSection,
};
pub use validate::parse_duration;
