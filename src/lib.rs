// THEORY:
// This file is the main entry point for the `condition_vision` library crate.
// It exposes the `GradingPipeline` and its request/report types as the single
// high-level interface for turning a short handheld video of a collectible into
// golden frames, a fused defect map and a region-weighted condition grade.
//
// The algorithmic stages live in `core_modules` and are usable on their own
// (each is a pure function of pixel buffers plus configuration). The boundaries
// to the outside world (video ingress, staging, object storage, the external
// classifier and progress tracking) are traits in `collaborators`, so the
// pipeline can run against local directories in tests and real services in
// production without changing a line of the core.

pub mod collaborators;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::{GraderConfig, ItemType};
pub use error::PipelineError;
pub use pipeline::{GradingPipeline, GradingReport, GradingRequest};
