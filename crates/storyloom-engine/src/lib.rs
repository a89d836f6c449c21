//! # Storyloom Engine
//!
//! Builds story → storyboard → per-scene image → final composition task
//! graphs and drives them through a [`storyloom_core::Scheduler`].
//!
//! This crate contains:
//! - The workflow engine: graph construction, rollback on submit failure,
//!   per-task event aggregation into workflow-level completion
//! - The built-in mock stages and the default stage factory
//! - Configuration types and the YAML loader

pub mod config;
pub mod stages;
pub mod workflow;

pub use config::{load_config, ConfigError, EngineConfig, StoryloomConfig};
pub use stages::{mock_stage_factory, MockComposeStage, MockImageGenStage, MockStoryboardStage};
pub use workflow::{CompletionCallback, ProgressCallback, StageFactory, WorkflowEngine};
