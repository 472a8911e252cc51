use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::Context;
use crate::servlet::HandlerWrapper;

/// HTTP request methods.
///
/// Every method is passed through to the handler; it is up to the handler to
/// reject the ones it does not implement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Example
    ///
    /// ```
    /// # use stagehand::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

/// A request as it travels through the dispatch engine.
///
/// The wire fields (`method` through `body`) come from the connector. The
/// remaining fields are filled in by request interceptors: the engine resolves
/// `context`, the mapper resolves `handler`, the session stages fill the
/// session fields, and so on.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request path without the query string.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,

    /// Set by the connector for requests received on a secure endpoint.
    pub secure: bool,
    pub attributes: HashMap<String, String>,

    pub context: Option<Arc<Context>>,
    pub handler: Option<Arc<HandlerWrapper>>,
    pub servlet_path: String,
    pub path_info: Option<String>,

    pub requested_session_id: Option<String>,
    pub session_id_from_url: bool,
    pub session_id: Option<String>,
    /// Set by a handler that created a session the client does not know yet.
    pub session_created: bool,

    /// Authenticated principal, filled in by an authentication interceptor.
    pub remote_user: Option<String>,
    pub roles: Vec<String>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    secure: bool,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: None,
            headers: HashMap::new(),
            body: Vec::new(),
            secure: false,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Request target; a `?query` suffix is split off into [`Request::query`].
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let method = self.method.ok_or("method missing")?;
        let target = self.path.ok_or("path missing")?;

        let mut request = Request::new(method, target);
        if let Some(version) = self.version {
            request.version = version;
        }
        request.headers = self.headers;
        request.body = self.body;
        request.secure = self.secure;
        Ok(request)
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    /// A bare request for `target`; a `?query` suffix is split off.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        let target = target.into();
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target, None),
        };

        Request {
            method,
            path,
            query,
            version: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            secure: false,
            attributes: HashMap::new(),
            context: None,
            handler: None,
            servlet_path: String::new(),
            path_info: None,
            requested_session_id: None,
            session_id_from_url: false,
            session_id: None,
            session_created: false,
            remote_user: None,
            roles: Vec::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Parsed Content-Length; 0 when missing or not a number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(true)
    }

    /// Value of a named cookie from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("Cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Path relative to the mounted context.
    pub fn context_relative_path(&self) -> &str {
        let prefix = self.context.as_ref().map(|c| c.path()).unwrap_or("");
        let rest = self.path.strip_prefix(prefix).unwrap_or(&self.path);
        if rest.is_empty() { "/" } else { rest }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|v| v.as_str())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Returns the current session id, starting a session in the request's
    /// context if there is none. The client learns a new id through
    /// `Set-Cookie` once the handler returns.
    pub fn session(&mut self) -> Option<String> {
        if let Some(id) = &self.session_id {
            return Some(id.clone());
        }
        let id = self.context.as_ref()?.sessions().create();
        self.session_id = Some(id.clone());
        self.session_created = true;
        Some(id)
    }

    pub fn is_user_in_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
