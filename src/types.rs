//! Core type definitions and aliases used throughout the daemon.
//!
//! These aliases standardize the request, response, and error types shared by
//! the listener, dispatcher, and renderer, hiding the generic parameters of
//! the underlying Hyper types.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;

use crate::body::HookBody;

/// HTTP request type with a streaming body as received from Hyper.
pub type Request = hyper::Request<Incoming>;

/// HTTP response type carrying the daemon's body wrapper.
pub type Response = hyper::Response<HookBody>;

/// Boxed body type used internally for response composition.
pub type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe error propagation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
