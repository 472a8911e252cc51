//! Host-facing API for running the engine inside another program.
//!
//! ```no_run
//! # async fn demo() -> Result<(), stagehand::error::EngineError> {
//! use stagehand::embed::EmbeddedEngine;
//!
//! let mut engine = EmbeddedEngine::new();
//! engine.set_work_dir("/tmp/stagehand");
//! engine.add_endpoint(8080, None, None);
//!
//! let ctx = engine.add_context("/", "file:///srv/site")?;
//! engine.init_context(&ctx)?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Interceptors must be registered before the first `add_context` or
//! `start`; that is when the pipelines are frozen.

use parking_lot::RwLock;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::engine::{Context, ContextManager, EngineSettings};
use crate::error::EngineError;
use crate::interceptor::{ContextStage, PipelineBuilder, RequestStage};
use crate::server::{Connector, ConnectorConfig, SocketFactory, TlsSocketFactory};
use crate::servlet::{ClassRegistry, Handler};

pub struct EmbeddedEngine {
    settings: Arc<RwLock<EngineSettings>>,
    pipeline: PipelineBuilder,
    connectors: Vec<Arc<Connector>>,
    manager: Option<Arc<ContextManager>>,
}

impl EmbeddedEngine {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let mut pipeline = PipelineBuilder::new();
        pipeline.set_debug(settings.debug_level);
        Self {
            settings: Arc::new(RwLock::new(settings)),
            pipeline,
            connectors: Vec::new(),
            manager: None,
        }
    }

    /// Sets the verbosity pushed to every interceptor.
    pub fn set_debug(&mut self, level: u8) {
        self.settings.write().debug_level = level;
        self.pipeline.set_debug(level);
    }

    pub fn set_work_dir(&mut self, dir: impl Into<PathBuf>) {
        self.settings.write().work_dir = dir.into();
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.settings.write().hostname = hostname.into();
    }

    /// Turns the thirteen default stages on or off.
    pub fn use_default_interceptors(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.pipeline.use_defaults(enabled)
    }

    pub fn registry(&self) -> Arc<ClassRegistry> {
        Arc::clone(&self.settings.read().registry)
    }

    /// Makes a handler class available to every context under `name`.
    pub fn register_class<F, H>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.registry().register(name, factory);
    }

    pub fn add_request_interceptor(&mut self, stage: Arc<dyn RequestStage>) -> Result<(), EngineError> {
        self.pipeline.add_request_stage(stage)
    }

    pub fn add_context_interceptor(&mut self, stage: Arc<dyn ContextStage>) -> Result<(), EngineError> {
        self.pipeline.add_context_stage(stage)
    }

    /// Registers an interceptor with both capabilities.
    pub fn add_interceptor<T>(&mut self, stage: Arc<T>) -> Result<(), EngineError>
    where
        T: ContextStage + RequestStage + 'static,
    {
        self.pipeline.add_stage(stage)
    }

    pub fn add_endpoint(
        &mut self,
        port: u16,
        bind_address: Option<IpAddr>,
        virtual_host: Option<&str>,
    ) -> Arc<Connector> {
        if self.debug() {
            tracing::debug!(port, ?bind_address, ?virtual_host, "add endpoint");
        }
        {
            let mut settings = self.settings.write();
            if settings.default_port.is_none() {
                settings.default_port = Some(port);
            }
        }

        let config = base_config(port, bind_address, virtual_host);
        self.push_connector(config)
    }

    /// Adds a TLS endpoint that does not ask for client certificates.
    pub fn add_secure_endpoint(
        &mut self,
        port: u16,
        bind_address: Option<IpAddr>,
        virtual_host: Option<&str>,
        key_store: impl Into<PathBuf>,
        key_password: &str,
    ) -> Arc<Connector> {
        self.add_secure_endpoint_with_client_auth(
            port,
            bind_address,
            virtual_host,
            key_store,
            key_password,
            false,
        )
    }

    /// Adds a TLS endpoint and records its port as the engine's secure port.
    pub fn add_secure_endpoint_with_client_auth(
        &mut self,
        port: u16,
        bind_address: Option<IpAddr>,
        virtual_host: Option<&str>,
        key_store: impl Into<PathBuf>,
        key_password: &str,
        require_client_auth: bool,
    ) -> Arc<Connector> {
        let key_store = key_store.into();
        if self.debug() {
            tracing::debug!(port, ?bind_address, key_store = %key_store.display(), require_client_auth, "add secure endpoint");
        }
        self.settings.write().secure_port = Some(port);

        let factory = TlsSocketFactory {
            key_store_path: key_store.clone(),
            key_store_password: key_password.to_string(),
            require_client_auth,
        };

        let mut config = base_config(port, bind_address, virtual_host);
        config.key_store_path = Some(key_store);
        config.key_store_password = Some(key_password.to_string());
        config.require_client_auth = require_client_auth;
        config.secure = true;
        config.socket_factory = Arc::new(factory);
        self.push_connector(config)
    }

    /// Adds an endpoint whose sockets come from `socket_factory`.
    pub fn add_custom_endpoint(
        &mut self,
        port: u16,
        bind_address: Option<IpAddr>,
        virtual_host: Option<&str>,
        secure: bool,
        socket_factory: Arc<dyn SocketFactory>,
    ) -> Arc<Connector> {
        if self.debug() {
            tracing::debug!(port, ?bind_address, secure, factory = ?socket_factory, "add custom endpoint");
        }
        if secure {
            self.settings.write().secure_port = Some(port);
        }

        let mut config = base_config(port, bind_address, virtual_host);
        config.secure = secure;
        config.socket_factory = socket_factory;
        self.push_connector(config)
    }

    /// Mounts a content root. `doc_root` must be a `file:` URL naming a directory.
    pub fn add_context(&mut self, path: &str, doc_root: &str) -> Result<Arc<Context>, EngineError> {
        if self.debug() {
            tracing::debug!(context = path, doc_root, "add context");
        }

        let url = Url::parse(doc_root).map_err(|_| EngineError::InvalidDocRoot(doc_root.to_string()))?;
        if url.scheme() != "file" {
            return Err(EngineError::UnsupportedDocRoot(doc_root.to_string()));
        }
        let doc_base = url
            .to_file_path()
            .map_err(|_| EngineError::InvalidDocRoot(doc_root.to_string()))?;
        if !doc_base.is_dir() {
            return Err(EngineError::InvalidDocRoot(doc_root.to_string()));
        }

        let manager = self.manager();
        let clock = Arc::clone(&self.settings.read().clock);
        let ctx = Context::new(path, doc_base, clock);
        manager.add_context(Arc::clone(&ctx))?;
        Ok(ctx)
    }

    /// Makes a mounted context available to requests.
    pub fn init_context(&mut self, ctx: &Arc<Context>) -> Result<(), EngineError> {
        self.manager().init_context(ctx.path())?;
        Ok(())
    }

    pub fn remove_context(&mut self, ctx: &Arc<Context>) -> Result<(), EngineError> {
        if self.debug() {
            tracing::debug!(context = %ctx.path(), "remove context");
        }
        self.manager().remove_context(ctx.path())?;
        Ok(())
    }

    pub fn context(&self, path: &str) -> Option<Arc<Context>> {
        self.manager.as_ref()?.context(path)
    }

    pub fn secure_port(&self) -> Option<u16> {
        self.settings.read().secure_port
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.connectors
    }

    /// The dispatch engine, created (and the pipelines frozen) on first use.
    pub fn manager(&mut self) -> Arc<ContextManager> {
        if let Some(manager) = &self.manager {
            return Arc::clone(manager);
        }

        let pipelines = self.pipeline.build();
        let manager = Arc::new(ContextManager::new(Arc::clone(&self.settings), pipelines));
        if self.debug() {
            tracing::debug!(?manager, "Dispatch engine created");
        }
        self.manager = Some(Arc::clone(&manager));
        manager
    }

    /// Starts the engine, then every endpoint. An endpoint that fails to bind
    /// is logged and skipped.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let manager = self.manager();
        manager.start()?;

        for connector in &self.connectors {
            match connector.start(Arc::clone(&manager)) {
                Ok(addr) => {
                    tracing::info!(%addr, secure = connector.is_secure(), "Endpoint started");
                }
                Err(e) => {
                    tracing::error!(port = connector.port(), error = %e, "Error starting endpoint");
                }
            }
        }
        Ok(())
    }

    /// Stops every endpoint and destroys all handlers.
    pub async fn stop(&mut self) {
        for connector in &self.connectors {
            connector.stop();
        }
        if let Some(manager) = &self.manager {
            manager.stop();
        }
    }

    fn debug(&self) -> bool {
        self.settings.read().debug_level > 0
    }

    fn push_connector(&mut self, config: ConnectorConfig) -> Arc<Connector> {
        let connector = Arc::new(Connector::new(config));
        self.connectors.push(Arc::clone(&connector));
        connector
    }
}

impl Default for EmbeddedEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn base_config(port: u16, bind_address: Option<IpAddr>, virtual_host: Option<&str>) -> ConnectorConfig {
    let mut config = ConnectorConfig::new(port);
    if let Some(addr) = bind_address {
        config.bind_address = addr;
    }
    config.virtual_host = virtual_host.map(str::to_string);
    config
}
