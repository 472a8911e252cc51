use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::TimeProvider;
use crate::engine::security::{SecurityConstraint, SecurityPolicy, extension};
use crate::engine::session::{MemorySessionStore, SessionStore};
use crate::servlet::{HandlerHost, HandlerLoader, HandlerWrapper, WrapperBuilder};

/// A handler chosen for a request path.
#[derive(Debug, Clone)]
pub struct MappedHandler {
    pub handler: Arc<HandlerWrapper>,
    pub servlet_path: String,
    pub path_info: Option<String>,
}

#[derive(Debug, Default)]
struct Mappings {
    exact: HashMap<String, String>,
    /// `(prefix, handler)`, prefix without the trailing `/*`.
    prefix: Vec<(String, String)>,
    extension: HashMap<String, String>,
    default: Option<String>,
}

impl Mappings {
    fn insert(&mut self, pattern: &str, name: String) {
        if pattern == "/" {
            self.default = Some(name);
        } else if let Some(ext) = pattern.strip_prefix("*.") {
            self.extension.insert(ext.to_string(), name);
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            self.prefix.retain(|(p, _)| p != prefix);
            self.prefix.push((prefix.to_string(), name));
        } else {
            self.exact.insert(pattern.to_string(), name);
        }
    }

    /// Servlet-style lookup: exact, then longest prefix, then extension, then default.
    fn lookup(&self, path: &str) -> Option<(&str, String, Option<String>)> {
        if let Some(name) = self.exact.get(path) {
            return Some((name, path.to_string(), None));
        }

        let longest = self
            .prefix
            .iter()
            .filter_map(|(prefix, name)| {
                let rest = path.strip_prefix(prefix.as_str())?;
                (rest.is_empty() || rest.starts_with('/')).then_some((prefix, name, rest))
            })
            .max_by_key(|(prefix, _, _)| prefix.len());
        if let Some((prefix, name, rest)) = longest {
            let info = (!rest.is_empty()).then(|| rest.to_string());
            return Some((name, prefix.clone(), info));
        }

        if let Some(name) = extension(path).and_then(|ext| self.extension.get(ext)) {
            return Some((name, path.to_string(), None));
        }

        self.default
            .as_deref()
            .map(|name| (name, path.to_string(), None))
    }

    fn contains(&self, pattern: &str) -> bool {
        if pattern == "/" {
            self.default.is_some()
        } else if let Some(ext) = pattern.strip_prefix("*.") {
            self.extension.contains_key(ext)
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            self.prefix.iter().any(|(p, _)| p == prefix)
        } else {
            self.exact.contains_key(pattern)
        }
    }
}

/// A content root mounted under a path prefix.
///
/// Stages fill most of a context in while it is being added: the descriptor
/// declares handlers and mappings, and later stages attach the loader, policy
/// and work directory.
pub struct Context {
    path: String,
    doc_base: PathBuf,
    me: Weak<Context>,
    clock: Arc<dyn TimeProvider>,
    reloadable: AtomicBool,
    initialized: AtomicBool,
    handlers: RwLock<Vec<Arc<HandlerWrapper>>>,
    mappings: RwLock<Mappings>,
    loader: RwLock<Option<Arc<dyn HandlerLoader>>>,
    policy: RwLock<Option<Arc<SecurityPolicy>>>,
    work_dir: RwLock<Option<PathBuf>>,
    constraints: RwLock<Vec<SecurityConstraint>>,
    welcome_files: RwLock<Vec<String>>,
    sessions: Arc<dyn SessionStore>,
}

impl Context {
    /// Creates a context. `/` and the empty string both mean the root context.
    pub fn new(
        path: impl Into<String>,
        doc_base: impl Into<PathBuf>,
        clock: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let mut path = path.into();
        while path.ends_with('/') {
            path.pop();
        }
        if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }

        let sessions = Arc::new(MemorySessionStore::new(Arc::clone(&clock)));
        Arc::new_cyclic(|me| Context {
            path,
            doc_base: doc_base.into(),
            me: me.clone(),
            clock,
            reloadable: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            handlers: RwLock::new(Vec::new()),
            mappings: RwLock::new(Mappings::default()),
            loader: RwLock::new(None),
            policy: RwLock::new(None),
            work_dir: RwLock::new(None),
            constraints: RwLock::new(Vec::new()),
            welcome_files: RwLock::new(Vec::new()),
            sessions,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn doc_base(&self) -> &Path {
        &self.doc_base
    }

    /// Whether `request_path` falls under this context.
    pub fn covers(&self, request_path: &str) -> bool {
        request_path
            .strip_prefix(self.path.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with(';'))
    }

    pub fn is_reloadable(&self) -> bool {
        self.reloadable.load(Ordering::SeqCst)
    }

    pub fn set_reloadable(&self, reloadable: bool) {
        self.reloadable.store(reloadable, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Registers a handler, replacing any handler of the same name.
    pub fn add_handler(&self, builder: WrapperBuilder) -> Arc<HandlerWrapper> {
        let host: Weak<dyn HandlerHost> = self.me.clone();
        let wrapper = Arc::new(
            builder
                .context_path(self.path.clone())
                .clock(Arc::clone(&self.clock))
                .host(host)
                .build(),
        );

        let mut handlers = self.handlers.write();
        match handlers.iter_mut().find(|h| h.name() == wrapper.name()) {
            Some(slot) => {
                tracing::debug!(context = %self.path, handler = %wrapper.name(), "Replacing handler");
                *slot = Arc::clone(&wrapper);
            }
            None => handlers.push(Arc::clone(&wrapper)),
        }
        wrapper
    }

    pub fn handler(&self, name: &str) -> Option<Arc<HandlerWrapper>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }

    /// Handlers in registration order.
    pub fn handlers(&self) -> Vec<Arc<HandlerWrapper>> {
        self.handlers.read().clone()
    }

    pub fn add_mapping(&self, pattern: &str, handler_name: impl Into<String>) {
        self.mappings.write().insert(pattern, handler_name.into());
    }

    pub fn has_mapping(&self, pattern: &str) -> bool {
        self.mappings.read().contains(pattern)
    }

    /// Maps a context-relative path to a handler.
    pub fn map_path(&self, path: &str) -> Option<MappedHandler> {
        let (name, servlet_path, path_info) = {
            let mappings = self.mappings.read();
            let (name, servlet_path, path_info) = mappings.lookup(path)?;
            (name.to_string(), servlet_path, path_info)
        };

        let handler = self.handler(&name)?;
        Some(MappedHandler {
            handler,
            servlet_path,
            path_info,
        })
    }

    pub fn loader(&self) -> Option<Arc<dyn HandlerLoader>> {
        self.loader.read().clone()
    }

    pub fn set_loader(&self, loader: Arc<dyn HandlerLoader>) {
        *self.loader.write() = Some(loader);
    }

    pub fn policy(&self) -> Option<Arc<SecurityPolicy>> {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: Arc<SecurityPolicy>) {
        *self.policy.write() = Some(policy);
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        self.work_dir.read().clone()
    }

    pub fn set_work_dir(&self, dir: PathBuf) {
        *self.work_dir.write() = Some(dir);
    }

    pub fn add_constraint(&self, constraint: SecurityConstraint) {
        self.constraints.write().push(constraint);
    }

    /// First constraint covering `path`.
    pub fn constraint_for(&self, path: &str) -> Option<SecurityConstraint> {
        self.constraints
            .read()
            .iter()
            .find(|c| c.covers(path))
            .cloned()
    }

    pub fn add_welcome_file(&self, name: impl Into<String>) {
        self.welcome_files.write().push(name.into());
    }

    pub fn welcome_files(&self) -> Vec<String> {
        self.welcome_files.read().clone()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Destroys every handler, draining each one first.
    pub fn destroy_handlers(&self) {
        for handler in self.handlers() {
            handler.destroy();
        }
    }
}

impl HandlerHost for Context {
    fn loader(&self) -> Option<Arc<dyn HandlerLoader>> {
        Context::loader(self)
    }

    fn class_of(&self, handler_name: &str) -> Option<String> {
        self.handler(handler_name)?.class_name()
    }

    fn reloadable(&self) -> bool {
        self.is_reloadable()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("path", &self.path)
            .field("doc_base", &self.doc_base)
            .field("reloadable", &self.is_reloadable())
            .field("initialized", &self.is_initialized())
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}
