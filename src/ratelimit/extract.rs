//! Key extraction: turning a request into counter key components.

use std::fmt;
use std::sync::Arc;

use super::request::RequestView;

/// Strategy that derives key components from a request.
///
/// Components are rendered as `"{prefix}={value}"`. A request that lacks the
/// dimension (no header, no principal) contributes no component.
pub trait KeyExtractor: Send + Sync {
    /// Name of the dimension this extractor reads.
    fn prefix(&self) -> &str;

    fn extract(&self, request: &dyn RequestView) -> Vec<String>;
}

fn component(prefix: &str, value: impl fmt::Display) -> String {
    format!("{}={}", prefix, value)
}

/// Keys by client IP address.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostExtractor;

impl KeyExtractor for HostExtractor {
    fn prefix(&self) -> &str {
        "host"
    }

    fn extract(&self, request: &dyn RequestView) -> Vec<String> {
        request
            .remote_addr()
            .map(|ip| component(self.prefix(), ip))
            .into_iter()
            .collect()
    }
}

/// Keys by the value of a request header, e.g. an API key.
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    name: String,
}

impl HeaderExtractor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
        }
    }
}

impl KeyExtractor for HeaderExtractor {
    fn prefix(&self) -> &str {
        &self.name
    }

    fn extract(&self, request: &dyn RequestView) -> Vec<String> {
        request
            .header(&self.name)
            .map(|value| component(self.prefix(), value.trim()))
            .into_iter()
            .collect()
    }
}

/// Keys by route name, falling back to the request path.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteExtractor;

impl KeyExtractor for RouteExtractor {
    fn prefix(&self) -> &str {
        "route"
    }

    fn extract(&self, request: &dyn RequestView) -> Vec<String> {
        let route = request.route().unwrap_or_else(|| request.path());
        vec![component(self.prefix(), route)]
    }
}

/// Keys by HTTP method.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodExtractor;

impl KeyExtractor for MethodExtractor {
    fn prefix(&self) -> &str {
        "method"
    }

    fn extract(&self, request: &dyn RequestView) -> Vec<String> {
        vec![component(self.prefix(), request.method().to_ascii_uppercase())]
    }
}

/// Keys by authenticated principal.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalExtractor;

impl KeyExtractor for PrincipalExtractor {
    fn prefix(&self) -> &str {
        "principal"
    }

    fn extract(&self, request: &dyn RequestView) -> Vec<String> {
        request
            .principal()
            .map(|p| component(self.prefix(), p))
            .into_iter()
            .collect()
    }
}

/// Concatenates the components of several extractors in declared order.
///
/// All dimensions end up in a single key, so one counter tracks the full
/// combination (e.g. API key *and* route). Independent per-dimension quotas
/// need separate `LimitConfig`s.
#[derive(Clone, Default)]
pub struct MultiExtractor {
    extractors: Vec<Arc<dyn KeyExtractor>>,
    prefix: String,
}

impl MultiExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extractor.
    pub fn with(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.push(Arc::new(extractor));
        self
    }

    pub fn push(&mut self, extractor: Arc<dyn KeyExtractor>) {
        if !self.prefix.is_empty() {
            self.prefix.push('+');
        }
        self.prefix.push_str(extractor.prefix());
        self.extractors.push(extractor);
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl fmt::Debug for MultiExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiExtractor")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl KeyExtractor for MultiExtractor {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn extract(&self, request: &dyn RequestView) -> Vec<String> {
        self.extractors
            .iter()
            .flat_map(|e| e.extract(request))
            .collect()
    }
}
