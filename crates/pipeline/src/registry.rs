//! Named pipelines, built on first use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::builder::PipelineBuilder;
use crate::errors::{PipelineError, StepResult};
use crate::identifiers::PipelineName;
use crate::pipeline::Pipeline;
use crate::resolver::ResourceResolver;

type Configure = Arc<dyn Fn(&mut PipelineBuilder) + Send + Sync>;

struct Registration {
    configure: Configure,
    built: Option<Arc<Pipeline>>,
}

/// Maps names to pipeline configurations. Each pipeline is built the first
/// time it is requested and cached afterwards.
pub struct PipelineRegistry {
    resolver: Arc<dyn ResourceResolver>,
    pipelines: Mutex<HashMap<PipelineName, Registration>>,
}

impl PipelineRegistry {
    /// Creates a registry whose pipelines resolve resources from `resolver`.
    pub fn new(resolver: Arc<dyn ResourceResolver>) -> Self {
        Self {
            resolver,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) the configuration for `name`.
    pub fn register<C>(&self, name: PipelineName, configure: C)
    where
        C: Fn(&mut PipelineBuilder) + Send + Sync + 'static,
    {
        self.pipelines.lock().insert(
            name,
            Registration {
                configure: Arc::new(configure),
                built: None,
            },
        );
    }

    /// Names of every registered pipeline, sorted.
    pub fn names(&self) -> Vec<PipelineName> {
        let mut names: Vec<_> = self.pipelines.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the pipeline registered as `name`, building it if needed.
    pub fn get(&self, name: &PipelineName) -> Result<Arc<Pipeline>, PipelineError> {
        let configure = {
            let pipelines = self.pipelines.lock();
            let registration = pipelines
                .get(name)
                .ok_or_else(|| PipelineError::configuration(format!("no pipeline registered as '{name}'")))?;
            if let Some(built) = &registration.built {
                return Ok(Arc::clone(built));
            }
            Arc::clone(&registration.configure)
        };

        debug!(pipeline = %name, "building registered pipeline");
        let mut builder = PipelineBuilder::with_resolver(Arc::clone(&self.resolver));
        configure(&mut builder);
        let pipeline = Arc::new(builder.build()?);

        let mut pipelines = self.pipelines.lock();
        match pipelines.get_mut(name) {
            Some(registration) => Ok(Arc::clone(registration.built.get_or_insert(pipeline))),
            None => Ok(pipeline),
        }
    }

    /// Builds (if needed) and runs the pipeline registered as `name`.
    pub async fn run(&self, name: &PipelineName, cancellation: CancellationToken) -> StepResult {
        let pipeline = self.get(name)?;
        pipeline.run_with_cancellation(cancellation).await
    }
}
