use std::collections::HashMap;

use crate::error::HandlerError;
use crate::http::{Request, Response};

/// The contract every pluggable request handler implements.
///
/// One instance may be serviced from many worker threads at once, so state
/// lives behind interior mutability. A handler that cannot cope with that
/// returns `true` from [`single_threaded`](Handler::single_threaded) and the
/// lifecycle serializes calls into [`service`](Handler::service).
pub trait Handler: Send + Sync {
    /// Called once before the first request.
    ///
    /// Return [`HandlerError::Unavailable`] to ask for a back-off; any other
    /// error makes the handler permanently unavailable.
    fn init(&self, _config: &HandlerConfig) -> Result<(), HandlerError> {
        Ok(())
    }

    fn service(&self, req: &mut Request, res: &mut Response) -> Result<(), HandlerError>;

    /// Called when the instance is released. Failures are logged, never propagated.
    fn destroy(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    fn single_threaded(&self) -> bool {
        false
    }
}

/// Configuration handed to [`Handler::init`].
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub handler_name: String,
    pub context_path: String,
    pub init_params: HashMap<String, String>,
}

impl HandlerConfig {
    pub fn init_param(&self, name: &str) -> Option<&str> {
        self.init_params.get(name).map(|v| v.as_str())
    }
}
