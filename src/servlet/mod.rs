//! Handlers and their lifecycle.
//!
//! - **`handler`**: the contract pluggable handlers implement
//! - **`loader`**: named handler classes and per-context loaders
//! - **`wrapper`**: load/init/service/destroy around one handler

pub mod handler;
pub mod loader;
pub mod wrapper;

pub use handler::{Handler, HandlerConfig};
pub use loader::{
    ClassRegistry, HandlerClass, HandlerFactory, HandlerLoader, RegistryLoader, current_loader,
    set_current_loader,
};
pub use wrapper::{
    DEFAULT_DRAIN_TIMEOUT, HandlerHost, HandlerState, HandlerWrapper, INCLUDE_REQUEST_URI,
    INCLUDE_SERVLET_PATH, TEMPLATE_HANDLER, WrapperBuilder,
};
