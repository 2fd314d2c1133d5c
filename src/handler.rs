//! Violation policy applied by the framework adapters.

use std::fmt;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::adapters::apply_rate_limit_headers;
use crate::backend::LimitMeta;
use crate::ratelimit::LimiterResult;

/// What an adapter does with a request that exceeded a limit.
pub enum ErrorHandler<E = TooManyRequests> {
    /// Build an error from the result and return it instead of running the
    /// handler.
    RaiseException(Arc<dyn Fn(&LimiterResult) -> E + Send + Sync>),
    /// Hand the result to a callback and let the request through.
    Consume(Arc<dyn Fn(&LimiterResult) + Send + Sync>),
}

impl<E> ErrorHandler<E> {
    pub fn raise<F>(factory: F) -> Self
    where
        F: Fn(&LimiterResult) -> E + Send + Sync + 'static,
    {
        ErrorHandler::RaiseException(Arc::new(factory))
    }

    pub fn consume<F>(callback: F) -> Self
    where
        F: Fn(&LimiterResult) + Send + Sync + 'static,
    {
        ErrorHandler::Consume(Arc::new(callback))
    }

    /// Apply the policy to a violating result. Returns the error to surface,
    /// or `None` when the request should proceed.
    pub fn on_violation(&self, result: &LimiterResult) -> Option<E> {
        match self {
            ErrorHandler::RaiseException(factory) => Some(factory(result)),
            ErrorHandler::Consume(callback) => {
                callback(result);
                None
            }
        }
    }
}

impl<E> Clone for ErrorHandler<E> {
    fn clone(&self) -> Self {
        match self {
            ErrorHandler::RaiseException(factory) => ErrorHandler::RaiseException(factory.clone()),
            ErrorHandler::Consume(callback) => ErrorHandler::Consume(callback.clone()),
        }
    }
}

impl<E> fmt::Debug for ErrorHandler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorHandler::RaiseException(_) => f.write_str("ErrorHandler::RaiseException"),
            ErrorHandler::Consume(_) => f.write_str("ErrorHandler::Consume"),
        }
    }
}

impl Default for ErrorHandler<TooManyRequests> {
    fn default() -> Self {
        ErrorHandler::raise(TooManyRequests::from_result)
    }
}

/// Conversion of a rejection into an HTTP response.
pub trait IntoResponse<B> {
    fn into_response(self) -> http::Response<B>;
}

/// Built-in rejection: HTTP 429 with the violated limit's description.
#[derive(Debug, Clone, Error)]
#[error("{status}: {description}")]
pub struct TooManyRequests {
    pub status: StatusCode,
    pub description: String,
    pub result: LimiterResult,
}

impl TooManyRequests {
    pub const DEFAULT_DESCRIPTION: &'static str = "Too Many Requests";

    pub fn from_result(result: &LimiterResult) -> Self {
        let description = if result.description.is_empty() {
            Self::DEFAULT_DESCRIPTION.to_string()
        } else {
            result.description.clone()
        };
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            description,
            result: result.clone(),
        }
    }

    pub fn per_limit_meta(&self) -> &[LimitMeta] {
        &self.result.per_limit_meta
    }
}

#[derive(Serialize)]
struct RejectionBody<'a> {
    status: u16,
    error: &'a str,
    description: &'a str,
    limits: &'a [LimitMeta],
}

impl<B: From<String>> IntoResponse<B> for TooManyRequests {
    fn into_response(self) -> http::Response<B> {
        let body = RejectionBody {
            status: self.status.as_u16(),
            error: self.status.canonical_reason().unwrap_or(Self::DEFAULT_DESCRIPTION),
            description: &self.description,
            limits: &self.result.per_limit_meta,
        };
        // A plain-text fallback keeps the description even if encoding fails.
        let (content_type, body) = match serde_json::to_string(&body) {
            Ok(json) => ("application/json", json),
            Err(_) => ("text/plain; charset=utf-8", self.description.clone()),
        };

        let mut response = http::Response::new(B::from(body));
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        apply_rate_limit_headers(response.headers_mut(), &self.result);
        response
    }
}
