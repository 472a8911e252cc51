//! Built-in handlers every context gets.

use std::path::{Path, PathBuf};

use crate::engine::Context;
use crate::error::HandlerError;
use crate::http::{Method, Request, Response, StatusCode};
use crate::servlet::Handler;

pub const DEFAULT_HANDLER: &str = "default";
pub const INVOKER_HANDLER: &str = "invoker";

pub const STATIC_CLASS: &str = "stagehand.StaticHandler";
pub const INVOKER_CLASS: &str = "stagehand.InvokerHandler";

/// Prefix under which handlers can be invoked by class name.
pub const INVOKER_PREFIX: &str = "/servlet";

const DEFAULT_WELCOME_FILES: &[&str] = &["index.html", "index.htm"];

/// Serves files from the context's document base.
#[derive(Debug, Default)]
pub struct StaticHandler;

impl Handler for StaticHandler {
    fn service(&self, req: &mut Request, res: &mut Response) -> Result<(), HandlerError> {
        if !matches!(req.method, Method::GET | Method::HEAD) {
            *res = Response::error(StatusCode::MethodNotAllowed, "only GET and HEAD are served");
            res.set_header("Allow", "GET, HEAD");
            return Ok(());
        }

        let Some(ctx) = req.context.clone() else {
            *res = Response::not_found();
            return Ok(());
        };

        let Some(file) = resolve(&ctx, req.context_relative_path()) else {
            *res = Response::not_found();
            return Ok(());
        };

        if let Some(policy) = ctx.policy() {
            if !policy.permits(&file) {
                tracing::warn!(context = %ctx.path(), file = %file.display(), "Refusing file outside granted roots");
                *res = Response::not_found();
                return Ok(());
            }
        }

        let body = std::fs::read(&file)?;
        res.set_status(StatusCode::Ok);
        res.set_content_type(content_type(&file));
        if req.method == Method::HEAD {
            res.set_header("Content-Length", body.len().to_string());
        } else {
            res.write(body);
        }
        Ok(())
    }
}

/// Answers `/servlet/...` requests the invoker stage could not resolve.
#[derive(Debug, Default)]
pub struct InvokerHandler;

impl Handler for InvokerHandler {
    fn service(&self, req: &mut Request, res: &mut Response) -> Result<(), HandlerError> {
        let class = req
            .path_info
            .as_deref()
            .and_then(|info| info.trim_start_matches('/').split('/').next())
            .unwrap_or("");
        *res = Response::error(
            StatusCode::NotFound,
            &format!("no handler class `{class}` is registered"),
        );
        Ok(())
    }
}

/// Maps a context-relative path to an existing file under the doc base.
fn resolve(ctx: &Context, relative: &str) -> Option<PathBuf> {
    let mut file = ctx.doc_base().to_path_buf();
    for (i, segment) in relative.split('/').filter(|s| !s.is_empty()).enumerate() {
        if segment == ".." || segment == "." || segment.contains('\\') {
            return None;
        }
        if i == 0 && (segment.eq_ignore_ascii_case("WEB-INF") || segment.eq_ignore_ascii_case("META-INF")) {
            return None;
        }
        file.push(segment);
    }

    if file.is_file() {
        return Some(file);
    }

    if file.is_dir() {
        let configured = ctx.welcome_files();
        let names: Vec<&str> = if configured.is_empty() {
            DEFAULT_WELCOME_FILES.to_vec()
        } else {
            configured.iter().map(|s| s.as_str()).collect()
        };
        return names
            .into_iter()
            .map(|name| file.join(name))
            .find(|candidate| candidate.is_file());
    }

    None
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
