//! Shared types, error model, and configuration documents for spamflow.
//!
//! This crate is the foundation depended on by all other spamflow crates.
//! It provides:
//! - [`SpamflowError`]: the unified error type and stage failure taxonomy
//! - Domain types ([`Record`], [`Label`], [`MetricName`], [`MetricsReport`])
//! - The parameter document ([`ParamsDocument`], [`Params`])
//! - The pipeline graph document ([`PipelineDocument`], [`StageDef`])
//! - The conventional project [`layout`]

pub mod error;
pub mod graph;
pub mod layout;
pub mod params;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use error::{Result, SpamflowError};
pub use graph::{PIPELINE_FILE_NAME, PipelineDocument, RemoteConfig, StageDef};
pub use params::{
    Algorithm, DataIngestionParams, FeatureEngineeringParams, ModelBuildingParams,
    ModelEvaluationParams, NgramRange, PARAMS_FILE_NAME, Params, ParamsDocument,
    PreprocessingParams,
};
pub use types::{Label, MetricName, MetricsReport, Record};
