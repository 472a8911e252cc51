//! Default request stages. Together they turn a request with a resolved
//! context into one with a handler, a session and a verdict on access.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::engine::Context;
use crate::engine::session::{SESSION_COOKIE, SESSION_PATH_PARAM};
use crate::engine::static_content::{DEFAULT_HANDLER, INVOKER_HANDLER, INVOKER_PREFIX};
use crate::http::{Request, Response, StatusCode};
use crate::interceptor::context_stages::impl_interceptor;
use crate::interceptor::{DebugLevel, Flow, Interceptor, RequestStage};
use crate::servlet::{HandlerWrapper, set_current_loader};

fn context_of(req: &Request) -> Option<Arc<Context>> {
    req.context.clone()
}

/// Picks up the session id a client sent, from the `JSESSIONID` cookie or a
/// `;jsessionid=` path parameter. The path parameter is removed from the
/// path either way.
#[derive(Debug, Default)]
pub struct SessionTracker {
    debug: DebugLevel,
}

impl_interceptor!(SessionTracker, "session-tracker");

impl RequestStage for SessionTracker {
    fn pre_service(&self, req: &mut Request, _res: &mut Response) -> Flow {
        if let Some(start) = req.path.find(SESSION_PATH_PARAM) {
            let rest = &req.path[start + SESSION_PATH_PARAM.len()..];
            let end = rest.find(['/', ';']).unwrap_or(rest.len());
            let id = rest[..end].to_string();
            let tail = rest[end..].to_string();

            req.path.truncate(start);
            req.path.push_str(&tail);
            if !id.is_empty() {
                req.requested_session_id = Some(id);
                req.session_id_from_url = true;
            }
        }

        let cookie = req.cookie(SESSION_COOKIE).map(str::to_string);
        if let Some(id) = cookie {
            req.requested_session_id = Some(id);
            req.session_id_from_url = false;
        }

        if self.debug.enabled() {
            tracing::debug!(
                path = %req.path,
                session = ?req.requested_session_id,
                from_url = req.session_id_from_url,
                "Session id"
            );
        }
        Flow::Continue
    }
}

/// Maps the request to a handler through the context's URL mappings.
#[derive(Debug, Default)]
pub struct PathMapper {
    debug: DebugLevel,
}

impl_interceptor!(PathMapper, "path-mapper");

impl RequestStage for PathMapper {
    fn pre_service(&self, req: &mut Request, _res: &mut Response) -> Flow {
        if req.handler.is_some() {
            return Flow::Continue;
        }
        let Some(ctx) = context_of(req) else {
            return Flow::Continue;
        };

        if let Some(mapped) = ctx.map_path(req.context_relative_path()) {
            if self.debug.enabled() {
                tracing::debug!(
                    path = %req.path,
                    handler = %mapped.handler.name(),
                    servlet_path = %mapped.servlet_path,
                    "Mapped"
                );
            }
            req.handler = Some(mapped.handler);
            req.servlet_path = mapped.servlet_path;
            req.path_info = mapped.path_info;
        }
        Flow::Continue
    }
}

/// Serves `/servlet/<class>/...` by registering a handler for `<class>` on
/// first use, when the context's loader knows the class.
#[derive(Debug, Default)]
pub struct Invoker {
    debug: DebugLevel,
    registering: Mutex<()>,
}

impl_interceptor!(Invoker, "invoker");

impl Invoker {
    fn handler_for(&self, ctx: &Context, class: &str) -> Option<Arc<HandlerWrapper>> {
        let name = format!("{INVOKER_PREFIX}/{class}");

        let _guard = self.registering.lock();
        if let Some(existing) = ctx.handler(&name) {
            return Some(existing);
        }

        let loader = ctx.loader()?;
        if let Err(e) = loader.load_class(class) {
            if self.debug.enabled() {
                tracing::debug!(context = %ctx.path(), class, error = %e, "Invoker cannot resolve class");
            }
            return None;
        }

        tracing::info!(context = %ctx.path(), class, "Registering invoked handler");
        let wrapper = ctx.add_handler(HandlerWrapper::builder(&name).class(class));
        ctx.add_mapping(&format!("{name}/*"), &name);
        Some(wrapper)
    }
}

impl RequestStage for Invoker {
    fn pre_service(&self, req: &mut Request, _res: &mut Response) -> Flow {
        if req.handler.as_ref().is_some_and(|h| h.name() != INVOKER_HANDLER) {
            return Flow::Continue;
        }
        let Some(ctx) = context_of(req) else {
            return Flow::Continue;
        };

        let relative = req.context_relative_path().to_string();
        let Some(rest) = relative
            .strip_prefix(INVOKER_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Flow::Continue;
        };
        let (class, info) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if class.is_empty() {
            return Flow::Continue;
        }

        if let Some(handler) = self.handler_for(&ctx, class) {
            req.servlet_path = format!("{INVOKER_PREFIX}/{class}");
            req.path_info = (!info.is_empty()).then(|| info.to_string());
            req.handler = Some(handler);
        }
        Flow::Continue
    }
}

/// Routes whatever is still unmapped to the context's `default` handler.
#[derive(Debug, Default)]
pub struct StaticContent {
    debug: DebugLevel,
}

impl_interceptor!(StaticContent, "static-content");

impl RequestStage for StaticContent {
    fn pre_service(&self, req: &mut Request, _res: &mut Response) -> Flow {
        if req.handler.is_some() {
            return Flow::Continue;
        }
        let Some(ctx) = context_of(req) else {
            return Flow::Continue;
        };

        if let Some(handler) = ctx.handler(DEFAULT_HANDLER) {
            if self.debug.enabled() {
                tracing::debug!(path = %req.path, "Serving as static content");
            }
            req.servlet_path = req.context_relative_path().to_string();
            req.path_info = None;
            req.handler = Some(handler);
        }
        Flow::Continue
    }
}

/// Binds the requested session id to a live session, and hands new session
/// ids to the client on the way out.
#[derive(Debug, Default)]
pub struct SessionBinder {
    debug: DebugLevel,
}

impl_interceptor!(SessionBinder, "session-binder");

impl RequestStage for SessionBinder {
    fn pre_service(&self, req: &mut Request, _res: &mut Response) -> Flow {
        let (Some(ctx), Some(id)) = (context_of(req), req.requested_session_id.clone()) else {
            return Flow::Continue;
        };

        if ctx.sessions().touch(&id) {
            req.session_id = Some(id);
        } else if self.debug.enabled() {
            tracing::debug!(context = %ctx.path(), session = %id, "Requested session is not valid");
        }
        Flow::Continue
    }

    fn post_service(&self, req: &mut Request, res: &mut Response) {
        if !req.session_created {
            return;
        }
        let (Some(ctx), Some(id)) = (context_of(req), req.session_id.as_deref()) else {
            return;
        };

        let path = if ctx.path().is_empty() { "/" } else { ctx.path() };
        res.set_header("Set-Cookie", format!("{SESSION_COOKIE}={id}; Path={path}; HttpOnly"));
    }
}

/// Enforces the context's security constraints.
#[derive(Debug, Default)]
pub struct AccessControl {
    debug: DebugLevel,
}

impl_interceptor!(AccessControl, "access-control");

impl RequestStage for AccessControl {
    fn pre_service(&self, req: &mut Request, res: &mut Response) -> Flow {
        let Some(ctx) = context_of(req) else {
            return Flow::Continue;
        };
        let Some(constraint) = ctx.constraint_for(req.context_relative_path()) else {
            return Flow::Continue;
        };

        if req.remote_user.is_none() {
            let realm = if ctx.path().is_empty() { "/" } else { ctx.path() };
            *res = Response::error(StatusCode::Unauthorized, "authentication required");
            res.set_header("WWW-Authenticate", format!("Basic realm=\"{realm}\""));
            if self.debug.enabled() {
                tracing::debug!(path = %req.path, "No authenticated user for protected resource");
            }
            return Flow::Halt;
        }

        if !constraint.allows(&req.roles) {
            tracing::info!(
                path = %req.path,
                user = ?req.remote_user,
                required = ?constraint.roles,
                "Access denied"
            );
            *res = Response::error(StatusCode::Forbidden, "access denied");
            return Flow::Halt;
        }

        Flow::Continue
    }
}

/// Makes the context's loader the current thread's loader while the handler runs.
#[derive(Debug, Default)]
pub struct LoaderScope {
    debug: DebugLevel,
}

impl_interceptor!(LoaderScope, "loader-scope");

impl RequestStage for LoaderScope {
    fn pre_service(&self, req: &mut Request, _res: &mut Response) -> Flow {
        let loader = req.context.as_ref().and_then(|ctx| ctx.loader());
        set_current_loader(loader);
        Flow::Continue
    }

    fn post_service(&self, _req: &mut Request, _res: &mut Response) {
        set_current_loader(None);
    }
}
