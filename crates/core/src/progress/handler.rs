//! Progress handler trait and events

use crate::image::StepKind;
use std::time::Duration;

/// Events emitted while a layer chain is built
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Build started
    BuildStarted {
        image: String,
        build_id: String,
        total_steps: usize,
    },

    /// Step began executing (cache miss)
    StepStarted {
        index: usize,
        total: usize,
        step: StepKind,
        description: String,
    },

    /// Step replayed from the layer cache
    StepCached {
        index: usize,
        total: usize,
        step: StepKind,
        layer: String,
    },

    /// Step committed a new layer
    StepCommitted {
        index: usize,
        total: usize,
        step: StepKind,
        layer: String,
        size: u64,
        duration: Duration,
    },

    /// Step failed; nothing was committed for it
    StepFailed { step: StepKind, error: String },

    /// Build completed successfully
    BuildCompleted {
        image: String,
        id: String,
        cached_steps: usize,
        total_time: Duration,
    },

    /// Build aborted by the caller
    BuildCancelled { step: StepKind },
}

/// Trait for handling progress events during a build
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl ProgressHandler for CountingHandler {
        fn on_progress(&self, _event: &ProgressEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_noop_handler() {
        let handler = NoOpHandler;
        handler.on_progress(&ProgressEvent::BuildStarted {
            image: "demo".to_string(),
            build_id: "b1".to_string(),
            total_steps: 6,
        });
    }

    #[test]
    fn test_progress_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = CountingHandler {
            count: count.clone(),
        };

        handler.on_progress(&ProgressEvent::StepStarted {
            index: 1,
            total: 6,
            step: StepKind::BaseImage,
            description: "FROM python:3.11-slim".to_string(),
        });
        handler.on_progress(&ProgressEvent::StepCached {
            index: 2,
            total: 6,
            step: StepKind::Stage,
            layer: "sha256:abc".to_string(),
        });
        handler.on_progress(&ProgressEvent::BuildCancelled {
            step: StepKind::Dependencies,
        });

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_event_debug() {
        let event = ProgressEvent::StepFailed {
            step: StepKind::Dependencies,
            error: "boom".to_string(),
        };
        let debug_str = format!("{:?}", event);
        assert!(debug_str.contains("StepFailed"));
        assert!(debug_str.contains("Dependencies"));
    }
}
