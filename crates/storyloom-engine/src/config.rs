//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use storyloom_core::{ResourceDemand, SchedulerConfig, TaskType};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine-side knobs: per-task-type resource demands applied to the tasks
/// the workflow engine creates, plus the default workflow shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_scene_count: i32,
    pub storyboard_demand: ResourceDemand,
    pub image_gen_demand: ResourceDemand,
    pub compose_demand: ResourceDemand,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_scene_count: 4,
            storyboard_demand: ResourceDemand::default(),
            image_gen_demand: ResourceDemand::default(),
            compose_demand: ResourceDemand::default(),
        }
    }
}

impl EngineConfig {
    /// Demand assigned to a freshly created task of the given type.
    pub fn demand_for(&self, task_type: TaskType) -> ResourceDemand {
        match task_type {
            TaskType::Storyboard | TaskType::Tts => self.storyboard_demand,
            TaskType::ImageGen | TaskType::VideoClip => self.image_gen_demand,
            TaskType::Compose => self.compose_demand,
        }
    }
}

/// Root of the configuration file: scheduler and engine sections.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryloomConfig {
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<StoryloomConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(content: &str) -> Result<StoryloomConfig, ConfigError> {
    let config: StoryloomConfig = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &StoryloomConfig) -> Result<(), ConfigError> {
    if config.engine.default_scene_count < 1 {
        return Err(ConfigError::Invalid(
            "engine.default_scene_count must be at least 1".to_string(),
        ));
    }
    for (name, demand) in [
        ("storyboard", config.engine.storyboard_demand),
        ("image_gen", config.engine.image_gen_demand),
        ("compose", config.engine.compose_demand),
    ] {
        if demand.cpu_slots < 1 {
            return Err(ConfigError::Invalid(format!(
                "engine.{name}_demand.cpu_slots must be at least 1"
            )));
        }
        if demand.ram_mb < 0 || demand.vram_mb < 0 {
            return Err(ConfigError::Invalid(format!(
                "engine.{name}_demand memory fields must not be negative"
            )));
        }
    }
    if config.scheduler.worker_count < 0 {
        return Err(ConfigError::Invalid(
            "scheduler.worker_count must not be negative (0 selects automatically)".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config, StoryloomConfig::default());
        assert_eq!(config.engine.default_scene_count, 4);
    }

    #[test]
    fn test_partial_document_overrides_only_named_fields() {
        let config = parse_config(
            r#"
scheduler:
  worker_count: 3
  resource_budget:
    cpu_slots_hard: 2
    ram_soft_mb: 512
engine:
  default_scene_count: 6
  image_gen_demand:
    cpu_slots: 1
    ram_mb: 256
    vram_mb: 1024
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.worker_count, 3);
        assert_eq!(config.scheduler.resource_budget.cpu_slots_hard, 2);
        assert_eq!(config.scheduler.resource_budget.ram_soft_mb, 512);
        assert_eq!(config.engine.default_scene_count, 6);
        assert_eq!(config.engine.image_gen_demand.vram_mb, 1024);
        // Untouched section keeps its default.
        assert_eq!(config.engine.compose_demand, ResourceDemand::default());
    }

    #[test]
    fn test_invalid_scene_count_is_rejected() {
        let err = parse_config("engine:\n  default_scene_count: 0\n").expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_invalid_demand_is_rejected() {
        let err = parse_config(
            "engine:\n  compose_demand:\n    cpu_slots: 0\n    ram_mb: 0\n    vram_mb: 0\n",
        )
        .expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_yaml_is_a_parse_error() {
        let err = parse_config("scheduler: [not a map").expect_err("parse failure");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_demand_for_maps_every_task_type() {
        let engine = EngineConfig {
            image_gen_demand: ResourceDemand::new(1, 128, 2048),
            ..EngineConfig::default()
        };

        assert_eq!(engine.demand_for(TaskType::ImageGen).vram_mb, 2048);
        assert_eq!(engine.demand_for(TaskType::VideoClip).vram_mb, 2048);
        assert_eq!(
            engine.demand_for(TaskType::Storyboard),
            ResourceDemand::default()
        );
        assert_eq!(
            engine.demand_for(TaskType::Compose),
            ResourceDemand::default()
        );
    }
}
