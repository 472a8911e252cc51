//! The per-context declaration file, `WEB-INF/web.yaml`.
//!
//! ```yaml
//! handlers:
//!   - name: hello
//!     class: hello
//!     load_on_startup: 1
//!     init_params:
//!       greeting: Hi
//! mappings:
//!   - pattern: /hello/*
//!     handler: hello
//! constraints:
//!   - patterns: [/admin/*]
//!     roles: [admin]
//! welcome_files: [index.html]
//! session_timeout: 30
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::engine::security::SecurityConstraint;
use crate::error::EngineError;
use crate::servlet::WrapperBuilder;

pub const DESCRIPTOR_PATH: &str = "WEB-INF/web.yaml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    #[serde(default)]
    pub handlers: Vec<HandlerDecl>,
    #[serde(default)]
    pub mappings: Vec<MappingDecl>,
    #[serde(default)]
    pub constraints: Vec<SecurityConstraint>,
    #[serde(default)]
    pub welcome_files: Vec<String>,
    /// Idle timeout in minutes.
    pub session_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HandlerDecl {
    pub name: String,
    pub class: Option<String>,
    pub template: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub init_params: HashMap<String, String>,
    pub load_on_startup: Option<i32>,
    #[serde(default)]
    pub role_refs: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MappingDecl {
    pub pattern: String,
    pub handler: String,
}

impl HandlerDecl {
    pub fn to_builder(&self) -> WrapperBuilder {
        let mut builder = WrapperBuilder::new(&self.name);
        if let Some(class) = &self.class {
            builder = builder.class(class);
        }
        if let Some(template) = &self.template {
            builder = builder.template_path(template);
        }
        if let Some(description) = &self.description {
            builder = builder.description(description);
        }
        if let Some(level) = self.load_on_startup {
            builder = builder.load_on_startup(level);
        }
        for (name, value) in &self.init_params {
            builder = builder.init_param(name, value);
        }
        for (name, role) in &self.role_refs {
            builder = builder.role_ref(name, role);
        }
        builder
    }
}

impl Descriptor {
    pub fn path_in(doc_base: &Path) -> PathBuf {
        doc_base.join(DESCRIPTOR_PATH)
    }

    /// Reads the descriptor under `doc_base`. A missing file declares nothing.
    pub fn load(doc_base: &Path) -> Result<Self, EngineError> {
        let path = Self::path_in(doc_base);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        Self::parse(&raw).map_err(|reason| EngineError::Descriptor {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Mappings naming a handler that is neither declared here nor `known`.
    pub fn undeclared_mappings<'a>(
        &'a self,
        known: impl Fn(&str) -> bool,
    ) -> Vec<&'a MappingDecl> {
        self.mappings
            .iter()
            .filter(|m| !self.handlers.iter().any(|h| h.name == m.handler) && !known(&m.handler))
            .collect()
    }
}
