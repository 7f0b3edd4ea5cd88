use super::context::BuildContext;
use super::phase_trait::BuildPhase;
use super::phases;
use crate::cancel::CancellationToken;
use crate::image_source::ImageSource;
use crate::installer::PackageInstaller;
use crate::plan::BuildPlan;
use crate::store::LayerStore;
use chrono::Utc;
use slipway_core::descriptor::BuildDescriptor;
use slipway_core::error::BuildError;
use slipway_core::image::{BuiltImage, LayerRecord};
use slipway_core::progress::{NoOpHandler, ProgressEvent, ProgressHandler};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Runs a descriptor's steps in order, replaying cached layers and
/// committing new ones.
///
/// A step is only committed after it finished and the build was not
/// cancelled; a failed or cancelled build leaves every earlier layer in the
/// store and writes no image record.
pub struct BuildEngine {
    store: Arc<LayerStore>,
    image_source: Arc<dyn ImageSource>,
    installer: Arc<dyn PackageInstaller>,
    progress: Arc<dyn ProgressHandler>,
    cancel: CancellationToken,
}

enum StepResult {
    Cached(LayerRecord),
    Committed(LayerRecord, Duration),
}

impl BuildEngine {
    pub fn new(
        store: Arc<LayerStore>,
        image_source: Arc<dyn ImageSource>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            store,
            image_source,
            installer,
            progress: Arc::new(NoOpHandler),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the running build at the next step boundary
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    pub async fn build(
        &self,
        descriptor: &BuildDescriptor,
        context_dir: &Path,
        name: &str,
    ) -> Result<BuiltImage, BuildError> {
        descriptor
            .validate()
            .map_err(|e| BuildError::InvalidDescriptor(e.to_string()))?;

        let start = Instant::now();
        let build_id = uuid::Uuid::new_v4().to_string();
        let plan = BuildPlan::from_descriptor(descriptor);
        let total = plan.len();

        info!(
            image = %name,
            build_id = %build_id,
            context = %context_dir.display(),
            steps = total,
            "Starting build"
        );
        self.progress.on_progress(&ProgressEvent::BuildStarted {
            image: name.to_string(),
            build_id: build_id.clone(),
            total_steps: total,
        });

        let mut context = BuildContext::new(
            context_dir,
            self.image_source.clone(),
            self.installer.clone(),
            self.store.clone(),
            self.cancel.clone(),
        );

        let mut cached_steps = 0;
        for (position, step) in plan.steps.iter().enumerate() {
            let index = position + 1;
            let phase = phases::for_step(step);
            let phase_name = phase.name();

            match self.run_step(phase.as_ref(), &mut context, index, total).await {
                Ok(StepResult::Cached(record)) => {
                    cached_steps += 1;
                    info!(phase = %phase_name, layer = %record.digest.short(), "Using cache");
                    self.progress.on_progress(&ProgressEvent::StepCached {
                        index,
                        total,
                        step: record.step,
                        layer: record.digest.to_string(),
                    });
                    context.push_layer(record);
                }
                Ok(StepResult::Committed(record, duration)) => {
                    info!(
                        phase = %phase_name,
                        layer = %record.digest.short(),
                        duration_ms = duration.as_millis(),
                        "Phase complete"
                    );
                    self.progress.on_progress(&ProgressEvent::StepCommitted {
                        index,
                        total,
                        step: record.step,
                        layer: record.digest.to_string(),
                        size: record.size,
                        duration,
                    });
                    context.push_layer(record);
                }
                Err(err) => {
                    match &err {
                        BuildError::Cancelled { step } => {
                            warn!(phase = %phase_name, "Build cancelled");
                            self.progress
                                .on_progress(&ProgressEvent::BuildCancelled { step: *step });
                        }
                        other => {
                            warn!(phase = %phase_name, error = %other, "Phase failed");
                            self.progress.on_progress(&ProgressEvent::StepFailed {
                                step: phase.kind(),
                                error: other.to_string(),
                            });
                        }
                    }
                    return Err(err);
                }
            }
        }

        let base = context.base.as_ref().ok_or_else(|| {
            BuildError::image_unavailable(
                descriptor.base.to_string(),
                "base image was not resolved",
            )
        })?;
        let id = context
            .parent()
            .cloned()
            .ok_or_else(|| BuildError::InvalidDescriptor("build produced no layers".to_string()))?;

        let image = BuiltImage {
            name: name.to_string(),
            id,
            base: base.reference.clone(),
            base_env: base.env.clone(),
            config: context.config.clone(),
            layers: std::mem::take(&mut context.layers),
            created: Utc::now(),
            build_id,
        };
        self.store.save_image(&image)?;

        let total_time = start.elapsed();
        info!(
            image = %image.name,
            id = %image.id,
            cached_steps,
            total_time_ms = total_time.as_millis(),
            "Build complete"
        );
        self.progress.on_progress(&ProgressEvent::BuildCompleted {
            image: image.name.clone(),
            id: image.id.to_string(),
            cached_steps,
            total_time,
        });

        Ok(image)
    }

    async fn run_step(
        &self,
        phase: &dyn BuildPhase,
        context: &mut BuildContext,
        index: usize,
        total: usize,
    ) -> Result<StepResult, BuildError> {
        let kind = phase.kind();
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled { step: kind });
        }

        phase.prepare(context).await?;
        let cache_key = phase.cache_key(context).await?;

        if let Some(record) = self.store.lookup(&cache_key)? {
            return Ok(StepResult::Cached(record));
        }

        info!(phase = %phase.name(), step = index, of = total, "Starting phase");
        self.progress.on_progress(&ProgressEvent::StepStarted {
            index,
            total,
            step: kind,
            description: phase.describe(),
        });

        let phase_start = Instant::now();
        let output = phase.execute(context).await?;

        // Nothing from a cancelled build may enter the store.
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled { step: kind });
        }

        let record = LayerStore::seal(
            context.parent(),
            kind,
            cache_key,
            output.diff.as_ref(),
            output.config,
            phase.describe(),
        );
        self.store.commit(&record, output.diff)?;

        Ok(StepResult::Committed(record, phase_start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::MockImageSource;
    use crate::installer::MockPackageInstaller;
    use crate::test_support::{FakeInstaller, TestBed};
    use slipway_core::image::StepKind;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressHandler for Recorder {
        fn on_progress(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn cached(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, ProgressEvent::StepCached { .. }))
                .count()
        }
    }

    fn engine(bed: &TestBed) -> BuildEngine {
        let context = bed.context();
        BuildEngine::new(context.store, context.image_source, Arc::new(FakeInstaller))
    }

    #[tokio::test]
    async fn test_full_build_produces_six_layers() {
        let bed = TestBed::new();
        let image = engine(&bed)
            .build(&BuildDescriptor::python_service(), &bed.context_dir(), "demo")
            .await
            .unwrap();

        let steps: Vec<StepKind> = image.layers.iter().map(|l| l.step).collect();
        assert_eq!(
            steps,
            vec![
                StepKind::BaseImage,
                StepKind::Stage,
                StepKind::Dependencies,
                StepKind::EnvVars,
                StepKind::Port,
                StepKind::Entrypoint
            ]
        );
        assert_eq!(image.id, image.layers[5].digest);
        assert_eq!(image.config.workdir, "/app");
        assert_eq!(image.config.entrypoint, vec!["python", "app.py"]);
        for pair in image.layers.windows(2) {
            assert_eq!(pair[1].parent.as_ref(), Some(&pair[0].digest));
        }
        assert_eq!(bed.store().load_image("demo").unwrap(), image);
    }

    #[tokio::test]
    async fn test_rebuild_hits_cache_for_every_step() {
        let bed = TestBed::new();
        let descriptor = BuildDescriptor::python_service();
        let first = engine(&bed)
            .build(&descriptor, &bed.context_dir(), "demo")
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let second = engine(&bed)
            .with_progress(recorder.clone())
            .build(&descriptor, &bed.context_dir(), "demo")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(recorder.cached(), 6);
    }

    #[tokio::test]
    async fn test_source_edit_invalidates_from_stage_on() {
        let bed = TestBed::new();
        let descriptor = BuildDescriptor::python_service();
        let first = engine(&bed)
            .build(&descriptor, &bed.context_dir(), "demo")
            .await
            .unwrap();

        fs::write(bed.context_dir().join("app.py"), "print('edited')\n").unwrap();
        let recorder = Arc::new(Recorder::default());
        let second = engine(&bed)
            .with_progress(recorder.clone())
            .build(&descriptor, &bed.context_dir(), "demo")
            .await
            .unwrap();

        assert_eq!(recorder.cached(), 1);
        assert_eq!(first.layers[0].digest, second.layers[0].digest);
        for (a, b) in first.layers.iter().zip(&second.layers).skip(1) {
            assert_ne!(a.digest, b.digest);
        }
    }

    #[tokio::test]
    async fn test_unavailable_base_writes_nothing() {
        let bed = TestBed::new();
        let mut source = MockImageSource::new();
        source.expect_name().return_const("mock");
        source
            .expect_resolve()
            .returning(|r| Err(BuildError::image_unavailable(r.to_string(), "offline")));

        let recorder = Arc::new(Recorder::default());
        let engine = BuildEngine::new(bed.store(), Arc::new(source), Arc::new(FakeInstaller))
            .with_progress(recorder.clone());
        let err = engine
            .build(&BuildDescriptor::python_service(), &bed.context_dir(), "demo")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::ImageUnavailable { .. }));
        assert!(bed.store().list_images().unwrap().is_empty());
        assert!(recorder.events.lock().unwrap().iter().any(|e| matches!(
            e,
            ProgressEvent::StepFailed {
                step: StepKind::BaseImage,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_install_failure_stops_before_entrypoint() {
        let bed = TestBed::new();
        let mut installer = MockPackageInstaller::new();
        installer
            .expect_identity()
            .return_const("broken-pip".to_string());
        installer
            .expect_install()
            .returning(|r| Err(BuildError::install(&r.manifest, "network unreachable")));

        let context = bed.context();
        let engine = BuildEngine::new(context.store, context.image_source, Arc::new(installer));
        let err = engine
            .build(&BuildDescriptor::python_service(), &bed.context_dir(), "demo")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::DependencyInstallFailure { .. }));
        assert!(bed.store().load_image("demo").is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let bed = TestBed::new();
        let engine = engine(&bed);
        engine.cancellation().cancel();
        let err = engine
            .build(&BuildDescriptor::python_service(), &bed.context_dir(), "demo")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::Cancelled {
                step: StepKind::BaseImage
            }
        ));
        assert!(bed.store().list_images().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected() {
        let bed = TestBed::new();
        let mut descriptor = BuildDescriptor::python_service();
        descriptor.runtime.entrypoint.clear();
        let err = engine(&bed)
            .build(&descriptor, &bed.context_dir(), "demo")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidDescriptor(_)));
    }
}
