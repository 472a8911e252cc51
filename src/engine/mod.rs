//! The dispatch engine.
//!
//! - **`context`**: content roots with their handlers and URL mappings
//! - **`descriptor`**: the per-context `WEB-INF/web.yaml` declaration file
//! - **`manager`**: mounts contexts and runs requests through the pipelines
//! - **`security`**: file-access policy and role constraints
//! - **`session`**: session id storage
//! - **`static_content`**: built-in handlers installed into every context

pub mod context;
pub mod descriptor;
pub mod manager;
pub mod security;
pub mod session;
pub mod static_content;

pub use context::{Context, MappedHandler};
pub use manager::ContextManager;
pub use security::{SecurityConstraint, SecurityPolicy};
pub use session::{MemorySessionStore, SessionStore};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::{SystemTimeProvider, TimeProvider};
use crate::servlet::ClassRegistry;

/// Engine-wide settings, owned by the embedding facade and shared with the
/// dispatch engine. Stages receive a snapshot with every hook.
#[derive(Clone)]
pub struct EngineSettings {
    pub debug_level: u8,
    pub work_dir: PathBuf,
    /// Port of the secure endpoint, if one was registered.
    pub secure_port: Option<u16>,
    /// Port of the first plain endpoint, used to name work directories.
    pub default_port: Option<u16>,
    pub hostname: String,
    pub clock: Arc<dyn TimeProvider>,
    pub registry: Arc<ClassRegistry>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debug_level: 0,
            work_dir: PathBuf::from("work"),
            secure_port: None,
            default_port: None,
            hostname: "localhost".to_string(),
            clock: Arc::new(SystemTimeProvider),
            registry: Arc::new(ClassRegistry::new()),
        }
    }
}

impl fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSettings")
            .field("debug_level", &self.debug_level)
            .field("work_dir", &self.work_dir)
            .field("secure_port", &self.secure_port)
            .field("default_port", &self.default_port)
            .field("hostname", &self.hostname)
            .field("registry", &self.registry)
            .finish()
    }
}
