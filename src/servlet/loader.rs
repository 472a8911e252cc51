//! Class-loading collaborator.
//!
//! Rust has no runtime class loading, so a "class" here is a named factory the
//! host registers up front in a [`ClassRegistry`]. The registry keeps a
//! generation counter (the reload epoch); replacing a class bumps it, and every
//! [`RegistryLoader`] that observed an older epoch reports a pending reload.

use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HandlerError, LoaderError};
use crate::servlet::Handler;

pub type HandlerFactory =
    Arc<dyn Fn() -> Result<Box<dyn Handler>, HandlerError> + Send + Sync>;

/// A resolved handler class.
#[derive(Clone)]
pub struct HandlerClass {
    name: Arc<str>,
    factory: HandlerFactory,
    epoch: u64,
}

impl HandlerClass {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Epoch of the registry when this class was resolved.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn instantiate(&self) -> Result<Box<dyn Handler>, LoaderError> {
        (self.factory)().map_err(|e| LoaderError::Instantiation {
            class: self.name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for HandlerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerClass")
            .field("name", &self.name)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// What the handler lifecycle needs from a class loader.
pub trait HandlerLoader: Send + Sync {
    fn load_class(&self, class_name: &str) -> Result<HandlerClass, LoaderError>;

    /// Whether classes resolved earlier are stale.
    fn should_reload(&self) -> bool;

    /// Current class generation. A [`HandlerClass`] resolved at an older epoch
    /// is stale.
    fn epoch(&self) -> u64;

    /// Starts a new generation; afterwards `should_reload` is false until the
    /// registry changes again.
    fn reload(&self) -> Result<(), LoaderError>;
}

/// Host-populated table of handler classes shared by every context.
#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, HandlerFactory>>,
    epoch: AtomicU64,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`. Replacing an existing class starts a
    /// new epoch so reloadable contexts pick up the new code.
    pub fn register<F, H>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.register_factory(
            name,
            Arc::new(move || Ok(Box::new(factory()) as Box<dyn Handler>)),
        );
    }

    /// Registers a factory that may itself fail to instantiate.
    pub fn register_factory(&self, name: impl Into<String>, factory: HandlerFactory) {
        let name = name.into();
        let replaced = self.classes.write().insert(name.clone(), factory).is_some();
        if replaced {
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(class = %name, epoch, "Handler class replaced");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    /// Marks every class as changed without replacing any.
    pub fn touch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn resolve(&self, name: &str) -> Result<HandlerClass, LoaderError> {
        let factory = self
            .classes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LoaderError::ClassNotFound(name.to_string()))?;

        Ok(HandlerClass {
            name: Arc::from(name),
            factory,
            epoch: self.epoch(),
        })
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.classes.read().len())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Per-context loader over a shared [`ClassRegistry`].
#[derive(Debug)]
pub struct RegistryLoader {
    registry: Arc<ClassRegistry>,
    seen_epoch: AtomicU64,
}

impl RegistryLoader {
    pub fn new(registry: Arc<ClassRegistry>) -> Self {
        let seen_epoch = AtomicU64::new(registry.epoch());
        Self {
            registry,
            seen_epoch,
        }
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }
}

impl HandlerLoader for RegistryLoader {
    fn load_class(&self, class_name: &str) -> Result<HandlerClass, LoaderError> {
        self.registry.resolve(class_name)
    }

    fn should_reload(&self) -> bool {
        self.registry.epoch() != self.seen_epoch.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.registry.epoch()
    }

    fn reload(&self) -> Result<(), LoaderError> {
        self.seen_epoch.store(self.registry.epoch(), Ordering::SeqCst);
        Ok(())
    }
}

thread_local! {
    static CURRENT_LOADER: RefCell<Option<Arc<dyn HandlerLoader>>> = const { RefCell::new(None) };
}

/// Loader of the context whose handler is running on this thread, if any.
pub fn current_loader() -> Option<Arc<dyn HandlerLoader>> {
    CURRENT_LOADER.with(|slot| slot.borrow().clone())
}

/// Installs `loader` as this thread's execution loader, returning the previous one.
pub fn set_current_loader(
    loader: Option<Arc<dyn HandlerLoader>>,
) -> Option<Arc<dyn HandlerLoader>> {
    CURRENT_LOADER.with(|slot| slot.replace(loader))
}
