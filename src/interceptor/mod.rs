//! Pluggable pipeline stages.
//!
//! An interceptor implements [`ContextStage`], [`RequestStage`], or both. The
//! [`PipelineBuilder`] sorts registrations into the two pipelines by the
//! capability they were registered with, keeping registration order.
//!
//! The default stages, in order:
//!
//! | #  | Stage               | Pipeline |
//! |----|---------------------|----------|
//! | 1  | `DescriptorReader`  | context  |
//! | 2  | `PolicyAttacher`    | context  |
//! | 3  | `LoaderAttacher`    | context  |
//! | 4  | `DefaultsInstaller` | context  |
//! | 5  | `WorkDirAttacher`   | context  |
//! | 6  | `LoadOnStartup`     | context  |
//! | 7  | `SessionTracker`    | request  |
//! | 8  | `PathMapper`        | request  |
//! | 9  | `Invoker`           | request  |
//! | 10 | `StaticContent`     | request  |
//! | 11 | `SessionBinder`     | request  |
//! | 12 | `AccessControl`     | request  |
//! | 13 | `LoaderScope`       | request  |
//!
//! Later stages rely on what earlier ones set up, so the order is fixed.

pub mod context_stages;
pub mod pipeline;
pub mod request_stages;

pub use context_stages::{
    DefaultsInstaller, DescriptorReader, LoadOnStartup, LoaderAttacher, PolicyAttacher,
    WorkDirAttacher,
};
pub use pipeline::{PipelineBuilder, Pipelines};
pub use request_stages::{
    AccessControl, Invoker, LoaderScope, PathMapper, SessionBinder, SessionTracker, StaticContent,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::engine::{Context, EngineSettings};
use crate::error::EngineError;
use crate::http::{Request, Response};

/// Whether request processing goes on after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop here; the response as it stands is sent.
    Halt,
}

/// What every interceptor shares: a name and a verbosity level.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Receives the engine's verbosity. Stages without a level ignore it.
    fn set_debug(&self, _level: u8) {}

    fn debug(&self) -> u8 {
        0
    }
}

/// Hooks run as contexts come and go.
pub trait ContextStage: Interceptor {
    fn engine_start(&self, _settings: &EngineSettings) -> Result<(), EngineError> {
        Ok(())
    }

    fn engine_stop(&self, _settings: &EngineSettings) -> Result<(), EngineError> {
        Ok(())
    }

    fn add_context(&self, _settings: &EngineSettings, _ctx: &Arc<Context>) -> Result<(), EngineError> {
        Ok(())
    }

    fn context_init(&self, _settings: &EngineSettings, _ctx: &Arc<Context>) -> Result<(), EngineError> {
        Ok(())
    }

    fn remove_context(&self, _settings: &EngineSettings, _ctx: &Arc<Context>) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Hooks run around every request.
pub trait RequestStage: Interceptor {
    fn pre_service(&self, _req: &mut Request, _res: &mut Response) -> Flow {
        Flow::Continue
    }

    /// Runs after the handler, or after a later stage halted.
    fn post_service(&self, _req: &mut Request, _res: &mut Response) {}
}

/// Verbosity storage for stages.
#[derive(Debug, Default)]
pub struct DebugLevel(AtomicU8);

impl DebugLevel {
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, level: u8) {
        self.0.store(level, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.get() > 0
    }
}
