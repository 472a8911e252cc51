//! Default context stages: they configure a context as it is added, then
//! warm up its handlers when it is initialized.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::descriptor::Descriptor;
use crate::engine::static_content::{
    DEFAULT_HANDLER, INVOKER_CLASS, INVOKER_HANDLER, INVOKER_PREFIX, InvokerHandler,
    STATIC_CLASS, StaticHandler,
};
use crate::engine::{Context, EngineSettings, SecurityPolicy};
use crate::error::EngineError;
use crate::interceptor::{ContextStage, DebugLevel, Interceptor};
use crate::servlet::{HandlerWrapper, RegistryLoader};

macro_rules! impl_interceptor {
    ($ty:ty, $name:literal) => {
        impl Interceptor for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn set_debug(&self, level: u8) {
                self.debug.set(level);
            }

            fn debug(&self) -> u8 {
                self.debug.get()
            }
        }
    };
}
pub(crate) use impl_interceptor;

/// Reads `WEB-INF/web.yaml` and declares its handlers, mappings and
/// constraints on the context.
#[derive(Debug, Default)]
pub struct DescriptorReader {
    validate: bool,
    debug: DebugLevel,
}

impl DescriptorReader {
    /// With `validate`, a mapping to an undeclared handler fails the context.
    pub fn new(validate: bool) -> Self {
        Self {
            validate,
            debug: DebugLevel::default(),
        }
    }
}

impl_interceptor!(DescriptorReader, "descriptor-reader");

impl ContextStage for DescriptorReader {
    fn add_context(&self, _settings: &EngineSettings, ctx: &Arc<Context>) -> Result<(), EngineError> {
        let descriptor = Descriptor::load(ctx.doc_base())?;

        let builtin = |name: &str| {
            name == DEFAULT_HANDLER || name == INVOKER_HANDLER || ctx.handler(name).is_some()
        };
        for mapping in descriptor.undeclared_mappings(builtin) {
            if self.validate {
                return Err(EngineError::Descriptor {
                    path: Descriptor::path_in(ctx.doc_base()).display().to_string(),
                    reason: format!(
                        "mapping `{}` names undeclared handler `{}`",
                        mapping.pattern, mapping.handler
                    ),
                });
            }
            tracing::warn!(
                context = %ctx.path(),
                pattern = %mapping.pattern,
                handler = %mapping.handler,
                "Mapping names an undeclared handler"
            );
        }

        for decl in &descriptor.handlers {
            ctx.add_handler(decl.to_builder());
        }
        for mapping in &descriptor.mappings {
            ctx.add_mapping(&mapping.pattern, &mapping.handler);
        }
        for constraint in descriptor.constraints {
            ctx.add_constraint(constraint);
        }
        for name in descriptor.welcome_files {
            ctx.add_welcome_file(name);
        }
        if let Some(minutes) = descriptor.session_timeout {
            ctx.sessions().set_timeout(Duration::from_secs(minutes * 60));
        }

        if self.debug.enabled() {
            tracing::debug!(
                context = %ctx.path(),
                handlers = descriptor.handlers.len(),
                mappings = descriptor.mappings.len(),
                "Descriptor applied"
            );
        }
        Ok(())
    }
}

/// Grants the context read access to its own document base.
#[derive(Debug, Default)]
pub struct PolicyAttacher {
    debug: DebugLevel,
}

impl_interceptor!(PolicyAttacher, "policy-attacher");

impl ContextStage for PolicyAttacher {
    fn add_context(&self, _settings: &EngineSettings, ctx: &Arc<Context>) -> Result<(), EngineError> {
        ctx.set_policy(Arc::new(SecurityPolicy::new(ctx.doc_base())));
        if self.debug.enabled() {
            tracing::debug!(context = %ctx.path(), root = %ctx.doc_base().display(), "Policy attached");
        }
        Ok(())
    }
}

/// Gives the context its own loader over the engine's class registry.
#[derive(Debug, Default)]
pub struct LoaderAttacher {
    debug: DebugLevel,
}

impl_interceptor!(LoaderAttacher, "loader-attacher");

impl ContextStage for LoaderAttacher {
    fn add_context(&self, settings: &EngineSettings, ctx: &Arc<Context>) -> Result<(), EngineError> {
        ctx.set_loader(Arc::new(RegistryLoader::new(Arc::clone(&settings.registry))));
        if self.debug.enabled() {
            tracing::debug!(context = %ctx.path(), epoch = settings.registry.epoch(), "Loader attached");
        }
        Ok(())
    }
}

/// Installs the static-content and invoker handlers unless the descriptor
/// declared handlers under those names.
#[derive(Debug, Default)]
pub struct DefaultsInstaller {
    debug: DebugLevel,
}

impl_interceptor!(DefaultsInstaller, "defaults-installer");

impl ContextStage for DefaultsInstaller {
    fn add_context(&self, settings: &EngineSettings, ctx: &Arc<Context>) -> Result<(), EngineError> {
        if !settings.registry.contains(STATIC_CLASS) {
            settings.registry.register(STATIC_CLASS, || StaticHandler);
        }
        if !settings.registry.contains(INVOKER_CLASS) {
            settings.registry.register(INVOKER_CLASS, || InvokerHandler);
        }

        if ctx.handler(DEFAULT_HANDLER).is_none() {
            ctx.add_handler(HandlerWrapper::builder(DEFAULT_HANDLER).class(STATIC_CLASS));
        }
        if ctx.handler(INVOKER_HANDLER).is_none() {
            ctx.add_handler(HandlerWrapper::builder(INVOKER_HANDLER).class(INVOKER_CLASS));
        }

        let invoker_pattern = format!("{INVOKER_PREFIX}/*");
        if !ctx.has_mapping(&invoker_pattern) {
            ctx.add_mapping(&invoker_pattern, INVOKER_HANDLER);
        }

        if self.debug.enabled() {
            tracing::debug!(context = %ctx.path(), "Default handlers installed");
        }
        Ok(())
    }
}

/// Creates `<work_dir>/<host>_<port><encoded context path>` for the context
/// and grants it in the context's policy.
#[derive(Debug, Default)]
pub struct WorkDirAttacher {
    debug: DebugLevel,
}

impl WorkDirAttacher {
    pub fn work_dir_for(settings: &EngineSettings, ctx: &Context) -> PathBuf {
        let encoded: String = url::form_urlencoded::byte_serialize(ctx.path().as_bytes()).collect();
        let port = settings.default_port.unwrap_or(0);
        settings
            .work_dir
            .join(format!("{}_{}{}", settings.hostname, port, encoded))
    }
}

impl_interceptor!(WorkDirAttacher, "work-dir-attacher");

impl ContextStage for WorkDirAttacher {
    fn add_context(&self, settings: &EngineSettings, ctx: &Arc<Context>) -> Result<(), EngineError> {
        let dir = Self::work_dir_for(settings, ctx);
        std::fs::create_dir_all(&dir)?;

        if let Some(policy) = ctx.policy() {
            policy.grant(&dir);
        }
        if self.debug.enabled() {
            tracing::debug!(context = %ctx.path(), dir = %dir.display(), "Work directory attached");
        }
        ctx.set_work_dir(dir);
        Ok(())
    }
}

/// Initializes every handler flagged for eager loading, in registration
/// order, when the context is initialized.
#[derive(Debug, Default)]
pub struct LoadOnStartup {
    debug: DebugLevel,
}

impl_interceptor!(LoadOnStartup, "load-on-startup");

impl ContextStage for LoadOnStartup {
    fn context_init(&self, _settings: &EngineSettings, ctx: &Arc<Context>) -> Result<(), EngineError> {
        for handler in ctx.handlers() {
            let Some(level) = handler.load_on_startup() else {
                continue;
            };
            if self.debug.enabled() {
                tracing::debug!(context = %ctx.path(), handler = %handler.name(), level, "Loading on startup");
            }
            if let Err(e) = handler.init() {
                tracing::warn!(
                    context = %ctx.path(),
                    handler = %handler.name(),
                    error = %e,
                    "Load on startup failed"
                );
            }
        }
        Ok(())
    }
}
