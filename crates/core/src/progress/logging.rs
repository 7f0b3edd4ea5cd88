//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::BuildStarted {
                image,
                build_id,
                total_steps,
            } => {
                info!(image = %image, build_id = %build_id, steps = total_steps, "Starting build");
            }
            ProgressEvent::StepStarted {
                index,
                total,
                step,
                description,
            } => {
                info!(
                    step = %step,
                    progress = format!("{}/{}", index, total),
                    "{}",
                    description
                );
            }
            ProgressEvent::StepCached {
                index,
                total,
                step,
                layer,
            } => {
                info!(
                    step = %step,
                    progress = format!("{}/{}", index, total),
                    layer = %layer,
                    "CACHED"
                );
            }
            ProgressEvent::StepCommitted {
                index,
                total,
                step,
                layer,
                size,
                duration,
            } => {
                info!(
                    step = %step,
                    progress = format!("{}/{}", index, total),
                    layer = %layer,
                    size_bytes = size,
                    duration_ms = duration.as_millis(),
                    "Layer committed"
                );
            }
            ProgressEvent::StepFailed { step, error } => {
                warn!(step = %step, error = %error, "Step failed");
            }
            ProgressEvent::BuildCompleted {
                image,
                id,
                cached_steps,
                total_time,
            } => {
                info!(
                    image = %image,
                    id = %id,
                    cached_steps,
                    total_time_ms = total_time.as_millis(),
                    "Build complete"
                );
            }
            ProgressEvent::BuildCancelled { step } => {
                warn!(step = %step, "Build cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::StepKind;
    use std::time::Duration;

    #[test]
    fn test_logging_all_events() {
        let handler = LoggingHandler;

        let events = vec![
            ProgressEvent::BuildStarted {
                image: "demo".to_string(),
                build_id: "b1".to_string(),
                total_steps: 6,
            },
            ProgressEvent::StepStarted {
                index: 1,
                total: 6,
                step: StepKind::BaseImage,
                description: "FROM python:3.11-slim".to_string(),
            },
            ProgressEvent::StepCached {
                index: 2,
                total: 6,
                step: StepKind::Stage,
                layer: "sha256:abc".to_string(),
            },
            ProgressEvent::StepCommitted {
                index: 3,
                total: 6,
                step: StepKind::Dependencies,
                layer: "sha256:def".to_string(),
                size: 1024,
                duration: Duration::from_millis(20),
            },
            ProgressEvent::StepFailed {
                step: StepKind::Dependencies,
                error: "Test error".to_string(),
            },
            ProgressEvent::BuildCompleted {
                image: "demo".to_string(),
                id: "sha256:123".to_string(),
                cached_steps: 1,
                total_time: Duration::from_secs(1),
            },
            ProgressEvent::BuildCancelled {
                step: StepKind::EnvVars,
            },
        ];

        for event in events {
            handler.on_progress(&event);
        }
    }
}
