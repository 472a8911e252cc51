use parking_lot::RwLock;
use std::sync::Arc;

use crate::engine::{Context, EngineSettings};
use crate::error::{EngineError, HandlerError, LifecycleError};
use crate::http::{Request, Response, StatusCode};
use crate::interceptor::{Flow, Pipelines};

/// Owns the mounted contexts and runs requests through the pipelines.
pub struct ContextManager {
    settings: Arc<RwLock<EngineSettings>>,
    pipelines: Pipelines,
    contexts: RwLock<Vec<Arc<Context>>>,
}

impl ContextManager {
    pub fn new(settings: Arc<RwLock<EngineSettings>>, pipelines: Pipelines) -> Self {
        Self {
            settings,
            pipelines,
            contexts: RwLock::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    /// Fires `engine_start` on every context stage.
    pub fn start(&self) -> Result<(), EngineError> {
        let settings = self.settings();
        for stage in self.pipelines.context() {
            stage.engine_start(&settings)?;
        }
        tracing::info!(contexts = self.contexts.read().len(), "Dispatch engine started");
        Ok(())
    }

    /// Fires `engine_stop` and destroys every handler. Stage failures are
    /// logged so every context still gets torn down.
    pub fn stop(&self) {
        let settings = self.settings();
        for stage in self.pipelines.context() {
            if let Err(e) = stage.engine_stop(&settings) {
                tracing::warn!(stage = stage.name(), error = %e, "engine_stop failed");
            }
        }
        for ctx in self.contexts() {
            ctx.destroy_handlers();
        }
        tracing::info!("Dispatch engine stopped");
    }

    /// Runs `ctx` through the context stages and mounts it.
    pub fn add_context(&self, ctx: Arc<Context>) -> Result<(), EngineError> {
        if self.context(ctx.path()).is_some() {
            return Err(EngineError::DuplicateContext(ctx.path().to_string()));
        }

        let settings = self.settings();
        for stage in self.pipelines.context() {
            stage.add_context(&settings, &ctx)?;
        }

        let mut contexts = self.contexts.write();
        if contexts.iter().any(|c| c.path() == ctx.path()) {
            return Err(EngineError::DuplicateContext(ctx.path().to_string()));
        }
        tracing::info!(context = %ctx.path(), doc_base = %ctx.doc_base().display(), "Context added");
        contexts.push(ctx);
        Ok(())
    }

    /// Runs the `context_init` stages and opens the context for requests.
    pub fn init_context(&self, path: &str) -> Result<Arc<Context>, EngineError> {
        let ctx = self
            .context(path)
            .ok_or_else(|| EngineError::UnknownContext(path.to_string()))?;

        let settings = self.settings();
        for stage in self.pipelines.context() {
            stage.context_init(&settings, &ctx)?;
        }

        ctx.set_initialized(true);
        tracing::info!(context = %ctx.path(), "Context initialized");
        Ok(ctx)
    }

    /// Unmounts a context and destroys its handlers.
    pub fn remove_context(&self, path: &str) -> Result<Arc<Context>, EngineError> {
        let ctx = {
            let mut contexts = self.contexts.write();
            let index = contexts
                .iter()
                .position(|c| c.path() == path)
                .ok_or_else(|| EngineError::UnknownContext(path.to_string()))?;
            contexts.remove(index)
        };
        ctx.set_initialized(false);

        let settings = self.settings();
        for stage in self.pipelines.context() {
            if let Err(e) = stage.remove_context(&settings, &ctx) {
                tracing::warn!(context = %ctx.path(), stage = stage.name(), error = %e, "remove_context failed");
            }
        }

        ctx.destroy_handlers();
        tracing::info!(context = %ctx.path(), "Context removed");
        Ok(ctx)
    }

    pub fn context(&self, path: &str) -> Option<Arc<Context>> {
        let path = path.trim_end_matches('/');
        self.contexts
            .read()
            .iter()
            .find(|c| c.path() == path)
            .cloned()
    }

    pub fn contexts(&self) -> Vec<Arc<Context>> {
        self.contexts.read().clone()
    }

    /// The initialized context with the longest path covering `request_path`.
    pub fn resolve(&self, request_path: &str) -> Option<Arc<Context>> {
        self.contexts
            .read()
            .iter()
            .filter(|c| c.is_initialized() && c.covers(request_path))
            .max_by_key(|c| c.path().len())
            .cloned()
    }

    /// Dispatches one request.
    ///
    /// Pre stages run in order until one halts; the handler runs only if
    /// none did. Post stages then run, in order, for every stage whose pre
    /// hook ran.
    pub fn service(&self, mut req: Request) -> Response {
        let Some(ctx) = self.resolve(&req.path) else {
            return Response::error(StatusCode::NotFound, &format!("no context for {}", req.path));
        };
        req.context = Some(ctx);

        let stages = self.pipelines.request();
        let mut res = Response::new();
        let mut ran = 0;
        let mut halted = false;

        for stage in stages {
            ran += 1;
            if stage.pre_service(&mut req, &mut res) == Flow::Halt {
                tracing::debug!(stage = stage.name(), path = %req.path, "Request halted");
                halted = true;
                break;
            }
        }

        if !halted {
            match req.handler.clone() {
                Some(handler) => {
                    if let Err(e) = handler.service(&mut req, &mut res) {
                        res = error_response(handler.name(), &e);
                    }
                }
                None => res = Response::error(StatusCode::NotFound, &format!("no handler for {}", req.path)),
            }
        }

        for stage in &stages[..ran] {
            stage.post_service(&mut req, &mut res);
        }
        res
    }
}

/// Translates a lifecycle failure into what the client sees.
pub fn error_response(handler: &str, error: &LifecycleError) -> Response {
    match error {
        LifecycleError::Unavailable {
            message,
            retry_after: Some(seconds),
        } => {
            tracing::info!(handler, retry_after = seconds, "Handler temporarily unavailable");
            Response::unavailable(message, *seconds)
        }
        LifecycleError::Unavailable {
            message,
            retry_after: None,
        } => {
            tracing::info!(handler, "Handler permanently unavailable");
            Response::error(StatusCode::NotFound, message)
        }
        LifecycleError::Fatal(cause) => {
            tracing::error!(handler, error = %cause, "Handler failed permanently");
            Response::error(StatusCode::InternalServerError, &cause.to_string())
        }
        LifecycleError::ClassResolution { .. } => {
            tracing::error!(handler, error = %error, "Handler class could not be resolved");
            Response::error(StatusCode::InternalServerError, &error.to_string())
        }
        LifecycleError::Handler(HandlerError::Io(e)) => {
            tracing::warn!(handler, error = %e, "I/O failure while servicing");
            Response::error(StatusCode::InternalServerError, "I/O failure")
        }
        LifecycleError::Handler(e) => {
            tracing::warn!(handler, error = %e, "Handler failed");
            Response::error(StatusCode::InternalServerError, &e.to_string())
        }
    }
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("settings", &*self.settings.read())
            .field("pipelines", &self.pipelines)
            .field("contexts", &self.contexts.read().len())
            .finish()
    }
}
