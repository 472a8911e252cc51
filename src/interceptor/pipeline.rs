//! Assembly of the context and request pipelines.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;
use crate::interceptor::{
    AccessControl, ContextStage, DefaultsInstaller, DescriptorReader, Invoker, LoadOnStartup,
    LoaderAttacher, LoaderScope, PathMapper, PolicyAttacher, RequestStage, SessionBinder,
    SessionTracker, StaticContent, WorkDirAttacher,
};

/// The capability an interceptor was registered with.
#[derive(Clone)]
enum Capability {
    Context(Arc<dyn ContextStage>),
    Request(Arc<dyn RequestStage>),
    Both {
        context: Arc<dyn ContextStage>,
        request: Arc<dyn RequestStage>,
    },
}

impl Capability {
    fn name(&self) -> &'static str {
        match self {
            Self::Context(stage) => stage.name(),
            Self::Request(stage) => stage.name(),
            Self::Both { context, .. } => context.name(),
        }
    }

    fn set_debug(&self, level: u8) {
        match self {
            Self::Context(stage) => stage.set_debug(level),
            Self::Request(stage) => stage.set_debug(level),
            Self::Both { context, .. } => context.set_debug(level),
        }
    }
}

/// The frozen pipelines. Cheap to clone, never modified.
#[derive(Clone)]
pub struct Pipelines {
    context: Arc<[Arc<dyn ContextStage>]>,
    request: Arc<[Arc<dyn RequestStage>]>,
}

impl Pipelines {
    pub fn context(&self) -> &[Arc<dyn ContextStage>] {
        &self.context
    }

    pub fn request(&self) -> &[Arc<dyn RequestStage>] {
        &self.request
    }

    pub fn context_names(&self) -> Vec<&'static str> {
        self.context.iter().map(|s| s.name()).collect()
    }

    pub fn request_names(&self) -> Vec<&'static str> {
        self.request.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for Pipelines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipelines")
            .field("context", &self.context_names())
            .field("request", &self.request_names())
            .finish()
    }
}

/// Collects interceptor registrations and freezes them into [`Pipelines`].
///
/// Registration is append-only and closes once [`build`](Self::build) has
/// run; later registrations fail with [`EngineError::PipelineFrozen`]. Unless
/// disabled, the default stages are placed ahead of everything registered
/// here.
pub struct PipelineBuilder {
    debug: u8,
    use_defaults: bool,
    registrations: Vec<Capability>,
    frozen: Option<Pipelines>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            debug: 0,
            use_defaults: true,
            registrations: Vec::new(),
            frozen: None,
        }
    }

    /// Sets the verbosity pushed to every interceptor, including ones
    /// registered already.
    pub fn set_debug(&mut self, level: u8) {
        self.debug = level;
        for registration in &self.registrations {
            registration.set_debug(level);
        }
    }

    pub fn debug(&self) -> u8 {
        self.debug
    }

    pub fn use_defaults(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.ensure_open("default interceptors")?;
        self.use_defaults = enabled;
        Ok(())
    }

    pub fn add_context_stage(&mut self, stage: Arc<dyn ContextStage>) -> Result<(), EngineError> {
        self.register(Capability::Context(stage))
    }

    pub fn add_request_stage(&mut self, stage: Arc<dyn RequestStage>) -> Result<(), EngineError> {
        self.register(Capability::Request(stage))
    }

    /// Registers an interceptor in both pipelines.
    pub fn add_stage<T>(&mut self, stage: Arc<T>) -> Result<(), EngineError>
    where
        T: ContextStage + RequestStage + 'static,
    {
        let context: Arc<dyn ContextStage> = stage.clone();
        let request: Arc<dyn RequestStage> = stage;
        self.register(Capability::Both { context, request })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Names of host registrations, in order. Defaults are not listed.
    pub fn registered(&self) -> Vec<&'static str> {
        self.registrations.iter().map(Capability::name).collect()
    }

    /// Freezes registration and returns the pipelines. Calling it again
    /// returns the same pipelines.
    pub fn build(&mut self) -> Pipelines {
        if let Some(pipelines) = &self.frozen {
            return pipelines.clone();
        }

        let mut all = Vec::new();
        if self.use_defaults {
            for stage in default_stages() {
                stage.set_debug(self.debug);
                all.push(stage);
            }
        }
        all.extend(self.registrations.iter().cloned());

        let mut context = Vec::new();
        let mut request = Vec::new();
        for registration in all {
            match registration {
                Capability::Context(stage) => context.push(stage),
                Capability::Request(stage) => request.push(stage),
                Capability::Both {
                    context: c,
                    request: r,
                } => {
                    context.push(c);
                    request.push(r);
                }
            }
        }

        let pipelines = Pipelines {
            context: context.into(),
            request: request.into(),
        };
        tracing::debug!(
            context = ?pipelines.context_names(),
            request = ?pipelines.request_names(),
            "Pipelines frozen"
        );

        self.frozen = Some(pipelines.clone());
        pipelines
    }

    fn register(&mut self, registration: Capability) -> Result<(), EngineError> {
        self.ensure_open(registration.name())?;
        registration.set_debug(self.debug);
        self.registrations.push(registration);
        Ok(())
    }

    fn ensure_open(&self, what: &str) -> Result<(), EngineError> {
        if self.is_frozen() {
            return Err(EngineError::PipelineFrozen(what.to_string()));
        }
        Ok(())
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The thirteen default stages in their fixed order.
fn default_stages() -> Vec<Capability> {
    vec![
        Capability::Context(Arc::new(DescriptorReader::new(false))),
        Capability::Context(Arc::new(PolicyAttacher::default())),
        Capability::Context(Arc::new(LoaderAttacher::default())),
        Capability::Context(Arc::new(DefaultsInstaller::default())),
        Capability::Context(Arc::new(WorkDirAttacher::default())),
        Capability::Context(Arc::new(LoadOnStartup::default())),
        Capability::Request(Arc::new(SessionTracker::default())),
        Capability::Request(Arc::new(PathMapper::default())),
        Capability::Request(Arc::new(Invoker::default())),
        Capability::Request(Arc::new(StaticContent::default())),
        Capability::Request(Arc::new(SessionBinder::default())),
        Capability::Request(Arc::new(AccessControl::default())),
        Capability::Request(Arc::new(LoaderScope::default())),
    ]
}
