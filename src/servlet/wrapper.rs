//! Lifecycle of a single registered handler.
//!
//! ```text
//!  Unloaded ──load──▶ Loaded ──init──▶ Initialized ──service──▶ (servicing)
//!                                │               │
//!                                ▼               ▼
//!                           Unavailable ◀── handler reports unavailable
//!                                │
//!              window expires ───┘   (permanent: only destroy/reload leaves)
//!
//!  any loaded state ──destroy/reload──▶ Destroyed ──load──▶ Loaded
//! ```
//!
//! All mutable state sits behind one per-handler lock. `init` runs inside it,
//! which gives at-most-once initialization; the handler body itself runs
//! outside it so requests are serviced concurrently.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::clock::{SystemTimeProvider, TimeProvider};
use crate::error::{HandlerError, LifecycleError};
use crate::http::{Request, Response};
use crate::servlet::{Handler, HandlerClass, HandlerConfig, HandlerLoader};

/// How long `destroy` waits for in-flight requests before tearing down anyway.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the sibling handler that compiles template-backed handlers.
pub const TEMPLATE_HANDLER: &str = "jsp";

pub const INCLUDE_REQUEST_URI: &str = "include.request_uri";
pub const INCLUDE_SERVLET_PATH: &str = "include.servlet_path";

/// What a wrapper needs from the content root that owns it.
pub trait HandlerHost: Send + Sync {
    fn loader(&self) -> Option<Arc<dyn HandlerLoader>>;

    /// Class configured for another handler in the same content root.
    fn class_of(&self, handler_name: &str) -> Option<String>;

    /// Whether handlers here should pick up new class generations.
    fn reloadable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Unloaded,
    Loaded,
    Initialized,
    Unavailable,
    /// Instance released by destroy or reload; the next request loads a new one.
    Destroyed,
}

struct UnavailableWindow {
    cause: Arc<HandlerError>,
    /// `None` means permanent.
    until: Option<Instant>,
}

impl UnavailableWindow {
    fn permanent_error(&self) -> LifecycleError {
        match self.cause.as_ref() {
            HandlerError::Unavailable { message, .. } => LifecycleError::Unavailable {
                message: message.clone(),
                retry_after: None,
            },
            _ => LifecycleError::Fatal(Arc::clone(&self.cause)),
        }
    }
}

struct Instance {
    handler: Box<dyn Handler>,
    single_threaded: bool,
    /// Serializes the handler body for non-reentrant handlers.
    body_lock: Mutex<()>,
}

impl Instance {
    fn new(handler: Box<dyn Handler>) -> Self {
        let single_threaded = handler.single_threaded();
        Self {
            handler,
            single_threaded,
            body_lock: Mutex::new(()),
        }
    }

    fn call(&self, req: &mut Request, res: &mut Response) -> Result<(), HandlerError> {
        if self.single_threaded {
            let _guard = self.body_lock.lock();
            self.handler.service(req, res)
        } else {
            self.handler.service(req, res)
        }
    }

    fn teardown(&self, name: &str) {
        if let Err(e) = self.handler.destroy() {
            tracing::error!(handler = %name, error = %e, "Error in destroy");
        }
    }
}

#[derive(Default)]
struct State {
    class_name: Option<String>,
    class: Option<HandlerClass>,
    instance: Option<Arc<Instance>>,
    initialized: bool,
    unavailable: Option<UnavailableWindow>,
    in_flight: usize,
    destroyed: bool,
}

/// Builder for a [`HandlerWrapper`].
pub struct WrapperBuilder {
    name: String,
    class_name: Option<String>,
    template_path: Option<String>,
    description: Option<String>,
    init_params: HashMap<String, String>,
    load_on_startup: Option<i32>,
    role_refs: HashMap<String, String>,
    context_path: String,
    reloadable: bool,
    drain_timeout: Duration,
    loader: Option<Arc<dyn HandlerLoader>>,
    host: Option<Weak<dyn HandlerHost>>,
    clock: Arc<dyn TimeProvider>,
}

impl WrapperBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: None,
            template_path: None,
            description: None,
            init_params: HashMap::new(),
            load_on_startup: None,
            role_refs: HashMap::new(),
            context_path: String::new(),
            reloadable: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            loader: None,
            host: None,
            clock: Arc::new(SystemTimeProvider),
        }
    }

    pub fn class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Path of a generated resource; the class then comes from the template handler.
    pub fn template_path(mut self, path: impl Into<String>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn init_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(name.into(), value.into());
        self
    }

    pub fn load_on_startup(mut self, level: i32) -> Self {
        self.load_on_startup = Some(level);
        self
    }

    /// Maps a role name used by the handler to a role known to the server.
    pub fn role_ref(mut self, name: impl Into<String>, role: impl Into<String>) -> Self {
        self.role_refs.insert(name.into(), role.into());
        self
    }

    pub fn context_path(mut self, path: impl Into<String>) -> Self {
        self.context_path = path.into();
        self
    }

    pub fn reloadable(mut self, reloadable: bool) -> Self {
        self.reloadable = reloadable;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Uses `loader` instead of asking the host for one.
    pub fn loader(mut self, loader: Arc<dyn HandlerLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn host(mut self, host: Weak<dyn HandlerHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build(self) -> HandlerWrapper {
        let config = HandlerConfig {
            handler_name: self.name.clone(),
            context_path: self.context_path,
            init_params: self.init_params,
        };

        HandlerWrapper {
            name: self.name,
            template_path: self.template_path,
            description: self.description,
            config,
            load_on_startup: self.load_on_startup,
            role_refs: self.role_refs,
            reloadable: self.reloadable,
            drain_timeout: self.drain_timeout,
            loader: self.loader,
            host: self.host,
            clock: self.clock,
            state: Mutex::new(State {
                class_name: self.class_name,
                ..State::default()
            }),
            drained: Condvar::new(),
        }
    }
}

/// One handler registered in a content root, plus everything needed to load,
/// initialize, service, back off and tear it down.
pub struct HandlerWrapper {
    name: String,
    template_path: Option<String>,
    description: Option<String>,
    config: HandlerConfig,
    load_on_startup: Option<i32>,
    role_refs: HashMap<String, String>,
    reloadable: bool,
    drain_timeout: Duration,
    loader: Option<Arc<dyn HandlerLoader>>,
    host: Option<Weak<dyn HandlerHost>>,
    clock: Arc<dyn TimeProvider>,
    state: Mutex<State>,
    drained: Condvar,
}

impl HandlerWrapper {
    pub fn builder(name: impl Into<String>) -> WrapperBuilder {
        WrapperBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> Option<String> {
        self.state.lock().class_name.clone()
    }

    /// Points the wrapper at another class, dropping any loaded instance.
    pub fn set_class_name(&self, class_name: impl Into<String>) {
        let mut state = self.state.lock();
        if let Some(instance) = state.instance.take() {
            instance.teardown(&self.name);
        }
        state.class_name = Some(class_name.into());
        state.class = None;
        state.initialized = false;
    }

    pub fn template_path(&self) -> Option<&str> {
        self.template_path.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn load_on_startup(&self) -> Option<i32> {
        self.load_on_startup
    }

    pub fn security_role(&self, name: &str) -> Option<&str> {
        self.role_refs.get(name).map(|r| r.as_str())
    }

    pub fn is_reloadable(&self) -> bool {
        self.reloadable
            || self
                .host
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|host| host.reloadable())
    }

    pub fn state(&self) -> HandlerState {
        let state = self.state.lock();
        if state.unavailable.is_some() {
            HandlerState::Unavailable
        } else if state.initialized {
            HandlerState::Initialized
        } else if state.instance.is_some() {
            HandlerState::Loaded
        } else if state.destroyed {
            HandlerState::Destroyed
        } else {
            HandlerState::Unloaded
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().instance.is_some()
    }

    /// Whether a class has been resolved for this handler.
    pub fn has_class(&self) -> bool {
        self.state.lock().class.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// End of the current unavailability window. `Some(None)` is permanent.
    pub fn unavailable_until(&self) -> Option<Option<Instant>> {
        self.state.lock().unavailable.as_ref().map(|w| w.until)
    }

    /// Resolves the class if needed and creates an instance.
    pub fn load(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if state.instance.is_none() {
            self.load_locked(&mut state)?;
        }
        Ok(())
    }

    /// Loads and initializes the handler unless that already happened.
    ///
    /// Concurrent callers block until the first one finishes; the handler's
    /// own `init` runs at most once per instance.
    pub fn init(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        self.check_available_locked(&mut state)?;
        self.init_locked(&mut state)
    }

    /// Runs one request through the handler.
    pub fn service(&self, req: &mut Request, res: &mut Response) -> Result<(), LifecycleError> {
        if self.is_reloadable() {
            self.handle_reload();
        }

        if let Some(path) = &self.template_path {
            let uri = if path.starts_with('/') {
                format!("{}{}", self.config.context_path, path)
            } else {
                format!("{}/{}", self.config.context_path, path)
            };
            req.set_attribute(INCLUDE_REQUEST_URI, uri);
            req.set_attribute(INCLUDE_SERVLET_PATH, path.clone());
        }

        // Window check and init share one critical section, so no caller can
        // slip past a window another caller is about to open.
        let instance = {
            let mut state = self.state.lock();
            self.check_available_locked(&mut state)?;
            self.init_locked(&mut state)?;
            let instance = state
                .instance
                .clone()
                .ok_or_else(|| LifecycleError::class_resolution(&self.name, "instance released"))?;
            state.in_flight += 1;
            instance
        };

        let result = self.invoke(&instance, req, res);

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.drained.notify_all();
        }

        result
    }

    /// Releases the instance.
    ///
    /// Waits up to the drain timeout for in-flight requests, then tears down
    /// regardless. This is best effort: a slow request may still be running
    /// inside the handler when its `destroy` is called.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        self.destroy_locked(&mut state);
    }

    fn invoke(
        &self,
        instance: &Instance,
        req: &mut Request,
        res: &mut Response,
    ) -> Result<(), LifecycleError> {
        match instance.call(req, res) {
            Ok(()) => {
                let mut state = self.state.lock();
                if state.unavailable.as_ref().is_some_and(|w| w.until.is_some()) {
                    state.unavailable = None;
                }
                Ok(())
            }
            Err(HandlerError::Unavailable { message, seconds }) => {
                let mut state = self.state.lock();
                if state.unavailable.is_some() {
                    return Err(LifecycleError::Unavailable {
                        message,
                        retry_after: seconds,
                    });
                }

                let cause = HandlerError::Unavailable { message, seconds };
                let error = self.record_failure(&mut state, cause);
                if error.retry_after().is_none() {
                    // Permanently gone: release the instance without draining,
                    // this request is itself still in flight.
                    state.initialized = false;
                    if let Some(released) = state.instance.take() {
                        drop(state);
                        released.teardown(&self.name);
                    }
                }
                Err(error)
            }
            Err(other) => Err(LifecycleError::Handler(other)),
        }
    }

    fn loader(&self) -> Option<Arc<dyn HandlerLoader>> {
        self.loader
            .clone()
            .or_else(|| self.host.as_ref()?.upgrade()?.loader())
    }

    fn load_locked(&self, state: &mut State) -> Result<(), LifecycleError> {
        let class_name = state.class_name.clone().ok_or_else(|| {
            LifecycleError::class_resolution(&self.name, "no handler class configured")
        })?;

        let class = match &state.class {
            Some(class) => class.clone(),
            None => {
                let loader = self.loader().ok_or_else(|| {
                    LifecycleError::class_resolution(&class_name, "no class loader attached")
                })?;
                let class = loader
                    .load_class(&class_name)
                    .map_err(|e| LifecycleError::class_resolution(&class_name, e))?;
                state.class = Some(class.clone());
                class
            }
        };

        let handler = class
            .instantiate()
            .map_err(|e| LifecycleError::class_resolution(&class_name, e))?;
        state.instance = Some(Arc::new(Instance::new(handler)));
        state.destroyed = false;

        tracing::debug!(handler = %self.name, class = %class_name, "Handler loaded");
        Ok(())
    }

    fn init_locked(&self, state: &mut State) -> Result<(), LifecycleError> {
        if state.initialized {
            return Ok(());
        }

        if state.instance.is_none() && self.template_path.is_some() && state.class_name.is_none()
        {
            state.class_name = Some(self.template_class()?);
        }

        if state.instance.is_none() {
            self.load_locked(state)?;
        }

        let instance = state
            .instance
            .clone()
            .ok_or_else(|| LifecycleError::class_resolution(&self.name, "instance released"))?;

        match instance.handler.init(&self.config) {
            Ok(()) => {
                state.initialized = true;
                tracing::debug!(handler = %self.name, "Handler initialized");
                Ok(())
            }
            Err(e) => {
                state.instance = None;
                tracing::warn!(handler = %self.name, error = %e, "Handler init failed");
                Err(self.record_failure(state, e))
            }
        }
    }

    /// Class of the template handler, for handlers backed by a generated resource.
    fn template_class(&self) -> Result<String, LifecycleError> {
        self.host
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|host| host.class_of(TEMPLATE_HANDLER))
            .ok_or_else(|| {
                LifecycleError::class_resolution(
                    TEMPLATE_HANDLER,
                    format!("no template handler registered for `{}`", self.name),
                )
            })
    }

    /// Turns a handler failure into an unavailability window.
    ///
    /// A window too long to represent as an `Instant` is treated as permanent.
    fn record_failure(&self, state: &mut State, error: HandlerError) -> LifecycleError {
        match error {
            HandlerError::Unavailable {
                message,
                seconds: Some(seconds),
            } => match self.clock.now().checked_add(Duration::from_secs(seconds)) {
                Some(until) => {
                    state.unavailable = Some(UnavailableWindow {
                        cause: Arc::new(HandlerError::unavailable(message.clone(), seconds)),
                        until: Some(until),
                    });
                    LifecycleError::Unavailable {
                        message,
                        retry_after: Some(seconds),
                    }
                }
                None => {
                    tracing::warn!(
                        handler = %self.name,
                        seconds,
                        "Unavailable window out of range, treating as permanent"
                    );
                    let window = UnavailableWindow {
                        cause: Arc::new(HandlerError::permanently_unavailable(message)),
                        until: None,
                    };
                    let error = window.permanent_error();
                    state.unavailable = Some(window);
                    error
                }
            },
            other => {
                let window = UnavailableWindow {
                    cause: Arc::new(other),
                    until: None,
                };
                let error = window.permanent_error();
                state.unavailable = Some(window);
                error
            }
        }
    }

    /// Fails while inside an unavailability window; clears an expired one.
    fn check_available_locked(&self, state: &mut State) -> Result<(), LifecycleError> {
        let Some(window) = &state.unavailable else {
            return Ok(());
        };

        let Some(until) = window.until else {
            return Err(window.permanent_error());
        };

        let remaining = until.saturating_duration_since(self.clock.now());
        if !remaining.is_zero() {
            let seconds = remaining.as_nanos().div_ceil(1_000_000_000) as u64;
            return Err(LifecycleError::Unavailable {
                message: window.cause.to_string(),
                retry_after: Some(seconds),
            });
        }

        state.unavailable = None;
        tracing::info!(handler = %self.name, "Unavailable time expired, trying again");
        Ok(())
    }

    fn destroy_locked(&self, state: &mut MutexGuard<'_, State>) {
        let deadline = Instant::now() + self.drain_timeout;
        while state.in_flight > 0 {
            if self.drained.wait_until(state, deadline).timed_out() {
                tracing::warn!(
                    handler = %self.name,
                    in_flight = state.in_flight,
                    "Drain timeout elapsed, destroying with requests in flight"
                );
                break;
            }
        }

        if let Some(instance) = state.instance.take() {
            instance.teardown(&self.name);
            state.destroyed = true;
        }
        state.initialized = false;
        state.unavailable = None;
    }

    /// Swaps in a fresh class generation when the loader reports one.
    ///
    /// Done under the handler lock so only one caller performs the swap.
    fn handle_reload(&self) {
        let Some(loader) = self.loader() else {
            return;
        };

        let mut state = self.state.lock();
        let pending = loader.should_reload();
        let stale = state
            .class
            .as_ref()
            .is_some_and(|class| class.epoch() != loader.epoch());
        if !pending && !stale {
            return;
        }

        tracing::info!(handler = %self.name, "Reloading handler class");
        self.destroy_locked(&mut state);

        if pending {
            if let Err(e) = loader.reload() {
                tracing::warn!(handler = %self.name, error = %e, "Reload failed");
            }
        }

        state.instance = None;
        state.class = None;
    }
}

impl fmt::Debug for HandlerWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerWrapper")
            .field("name", &self.name)
            .field("template_path", &self.template_path)
            .field("state", &self.state())
            .finish()
    }
}
