//! Read-only view of an inbound request.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// The narrow slice of a request the limiter needs.
///
/// Web frameworks own their request types; implementing this trait is all it
/// takes to feed them to a [`KeyExtractor`](super::KeyExtractor).
pub trait RequestView {
    fn method(&self) -> &str;

    fn path(&self) -> &str;

    /// Header value by case-insensitive name.
    fn header(&self, name: &str) -> Option<&str>;

    fn remote_addr(&self) -> Option<IpAddr>;

    /// Identifier of the authenticated caller, if any.
    fn principal(&self) -> Option<&str>;

    /// Name of the matched route, when the framework exposes one.
    fn route(&self) -> Option<&str> {
        None
    }
}

/// Client address, inserted into `http::Request` extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub IpAddr);

/// Authenticated principal id, inserted by an authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Matched route name, inserted by a router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteName(pub String);

impl<B> RequestView for http::Request<B> {
    fn method(&self) -> &str {
        self.method().as_str()
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        let extensions = self.extensions();
        extensions
            .get::<RemoteAddr>()
            .map(|addr| addr.0)
            .or_else(|| extensions.get::<SocketAddr>().map(SocketAddr::ip))
    }

    fn principal(&self) -> Option<&str> {
        self.extensions().get::<Principal>().map(|p| p.0.as_str())
    }

    fn route(&self) -> Option<&str> {
        self.extensions().get::<RouteName>().map(|r| r.0.as_str())
    }
}

/// Owned request description, for callers without an `http::Request` at hand.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    /// Header names are stored lowercase
    pub headers: HashMap<String, String>,
    pub remote_addr: Option<IpAddr>,
    pub principal: Option<String>,
    pub route: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

impl RequestView for RequestInfo {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }
}
