//! Limit definitions, key extraction and the limiter engine.

mod extract;
mod interval;
mod limiter;
mod request;
mod rules;

pub use extract::{
    HeaderExtractor, HostExtractor, KeyExtractor, MethodExtractor, MultiExtractor,
    PrincipalExtractor, RouteExtractor,
};
pub use interval::{Interval, TimeUnit};
pub use limiter::{LimiterEngine, LimiterResult};
pub use request::{Principal, RemoteAddr, RequestInfo, RequestView, RouteName};
pub use rules::{Limit, LimitConfig, COMPONENT_SEPARATOR, KEY_SEPARATOR};
