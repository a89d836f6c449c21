//! Built-in mock stages.
//!
//! These simulate the real pipeline with short sleeps and progress
//! emission, checking the cancel token between steps. Real stage
//! implementations (HTTP-backed generation, ffmpeg composition) plug in
//! through the engine's stage factory and honour the same output keys:
//!
//! - Storyboard: consumes `story_text`, `style`, `scene_count`;
//!   produces `scenes` (list of per-scene prompts) and `storyboard_json`.
//! - ImageGen: consumes `scene_index` plus the storyboard outputs;
//!   produces `image_path`.
//! - Compose: consumes the image outputs; produces `output_path`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use storyloom_core::{Stage, StageContext, TaskError, TaskType};

fn simulate_steps(ctx: &mut StageContext, steps: u32, step_ms: u64) -> Result<(), TaskError> {
    for i in 0..steps {
        ctx.cancel_token.check_canceled()?;
        thread::sleep(Duration::from_millis(step_ms));
        ctx.report_progress((i + 1) as f32 / steps.max(1) as f32);
    }
    Ok(())
}

/// Mock storyboard generation: turns story text into a scene list.
#[derive(Debug, Default)]
pub struct MockStoryboardStage;

impl Stage for MockStoryboardStage {
    fn name(&self) -> &str {
        "MockStoryboard"
    }

    fn execute(&self, ctx: &mut StageContext) -> Result<(), TaskError> {
        simulate_steps(ctx, 5, 100)?;

        let scene_count = ctx.input_i64_or("scene_count", 4).max(0);
        let style = ctx.input_str_or("style", "default");
        let scenes: Vec<String> = (1..=scene_count)
            .map(|i| format!("scene {i} in {style} style"))
            .collect();

        ctx.set_output("scenes", json!(scenes));
        ctx.set_output(
            "storyboard_json",
            json!({ "scenes": scenes, "style": style }).to_string(),
        );
        Ok(())
    }
}

/// Mock image generation: produces one frame path per scene.
#[derive(Debug, Default)]
pub struct MockImageGenStage;

impl Stage for MockImageGenStage {
    fn name(&self) -> &str {
        "MockImageGen"
    }

    fn execute(&self, ctx: &mut StageContext) -> Result<(), TaskError> {
        simulate_steps(ctx, 3, 100)?;

        let scene_index = ctx.input_i64_or("scene_index", 0);
        ctx.set_output(
            "image_path",
            format!("/tmp/storyloom_mock/frame_{scene_index}.png"),
        );
        Ok(())
    }
}

/// Mock composition: assembles the final clip.
#[derive(Debug, Default)]
pub struct MockComposeStage;

impl Stage for MockComposeStage {
    fn name(&self) -> &str {
        "MockCompose"
    }

    fn execute(&self, ctx: &mut StageContext) -> Result<(), TaskError> {
        simulate_steps(ctx, 5, 100)?;

        ctx.set_output("output_path", "/tmp/storyloom_mock/final_output.mp4");
        Ok(())
    }
}

/// Default stage factory: mock stages for every task type.
///
/// TTS and VideoClip are not yet distinct pipelines; they map onto the
/// storyboard and image-gen mocks.
pub fn mock_stage_factory(task_type: TaskType) -> Arc<dyn Stage> {
    match task_type {
        TaskType::Storyboard | TaskType::Tts => Arc::new(MockStoryboardStage),
        TaskType::ImageGen | TaskType::VideoClip => Arc::new(MockImageGenStage),
        TaskType::Compose => Arc::new(MockComposeStage),
    }
}
