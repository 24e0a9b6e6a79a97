//! Response descriptors produced by hook functions.
//!
//! A [`ResponseDescriptor`] is the value object a hook chain hands back to
//! the dispatcher: status, payload, MIME type, extra headers, entity tag,
//! cache lifetime, an optional manual-delegation target, and a fatal-error
//! indicator. The renderer turns it into a Hyper response; the cache stores
//! eligible descriptors verbatim.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::types::BoxError;

/// Default cache lifetime, in seconds, for descriptors that do not set one.
pub const DEFAULT_MAX_AGE: u64 = 300;

/// Streaming payload source. Not cloneable and never cached.
pub struct PayloadStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>,
}

impl PayloadStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + Sync + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub fn into_inner(self) -> Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>> {
        self.inner
    }
}

impl std::fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadStream")
    }
}

/// Tagged response payload.
#[derive(Debug)]
pub enum Payload {
    /// Raw bytes; rendered with an exact `Content-Length`.
    Bytes(Bytes),
    /// Text; encoded UTF-8 with an exact `Content-Length`.
    Text(String),
    /// Streaming source; piped to the client, never cached.
    Stream(PayloadStream),
    /// No payload; the renderer emits a plain error body for the status.
    None,
}

impl Payload {
    /// Byte length for sized payloads; `None` for streams and empty data.
    pub fn sized_len(&self) -> Option<u64> {
        match self {
            Payload::Bytes(b) => Some(b.len() as u64),
            Payload::Text(s) => Some(s.len() as u64),
            Payload::Stream(_) | Payload::None => None,
        }
    }

    fn clone_sized(&self) -> Option<Payload> {
        match self {
            Payload::Bytes(b) => Some(Payload::Bytes(b.clone())),
            Payload::Text(s) => Some(Payload::Text(s.clone())),
            Payload::Stream(_) | Payload::None => None,
        }
    }
}

/// Value object returned by hooks describing the HTTP response to produce.
#[derive(Debug)]
pub struct ResponseDescriptor {
    /// HTTP status; valid range is 100..600.
    pub status: Option<u16>,
    /// Response payload.
    pub data: Payload,
    /// MIME type for the payload; falls back to `application/octet-stream`
    /// when absent or unparseable.
    pub data_type: Option<String>,
    /// Declared length for streaming payloads.
    pub data_length: Option<u64>,
    /// Extra headers, applied case-insensitively one at a time.
    pub headers: Vec<(String, String)>,
    /// Opaque entity tag; presence is required for cacheability.
    pub entity_tag: Option<String>,
    /// Cache lifetime in seconds. `None` marks the response not-cacheable.
    pub max_age: Option<u64>,
    /// Hook name to delegate full response writing to.
    pub manual: Option<String>,
    /// Fatal-error indicator; the dispatcher renders 500.
    pub error: bool,
}

impl Default for ResponseDescriptor {
    fn default() -> Self {
        Self {
            status: None,
            data: Payload::None,
            data_type: None,
            data_length: None,
            headers: Vec::new(),
            entity_tag: None,
            max_age: Some(DEFAULT_MAX_AGE),
            manual: None,
            error: false,
        }
    }
}

impl ResponseDescriptor {
    /// Descriptor with a status and no payload.
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Descriptor carrying a text payload.
    pub fn text(status: u16, data_type: &str, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            data: Payload::Text(body.into()),
            data_type: Some(data_type.to_owned()),
            ..Self::default()
        }
    }

    /// Descriptor carrying a byte payload.
    pub fn bytes(status: u16, data_type: &str, body: Bytes) -> Self {
        Self {
            status: Some(status),
            data: Payload::Bytes(body),
            data_type: Some(data_type.to_owned()),
            ..Self::default()
        }
    }

    /// Descriptor with the fatal-error indicator set.
    pub fn fatal() -> Self {
        Self {
            error: true,
            max_age: None,
            ..Self::default()
        }
    }

    pub fn status_is_valid(&self) -> bool {
        matches!(self.status, Some(s) if (100..600).contains(&s))
    }

    /// Cache-insertion predicate: valid status, sized payload, entity tag
    /// present, and a numeric max-age.
    pub fn is_cacheable(&self) -> bool {
        self.status_is_valid()
            && self.data.sized_len().is_some()
            && self.entity_tag.is_some()
            && self.max_age.is_some()
    }

    /// Deep-copies the descriptor for cache storage. `None` when the payload
    /// is not sized (streams and empty payloads never enter the cache).
    pub fn clone_sized(&self) -> Option<ResponseDescriptor> {
        Some(ResponseDescriptor {
            status: self.status,
            data: self.data.clone_sized()?,
            data_type: self.data_type.clone(),
            data_length: self.data_length,
            headers: self.headers.clone(),
            entity_tag: self.entity_tag.clone(),
            max_age: self.max_age,
            manual: self.manual.clone(),
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_not_cacheable() {
        let d = ResponseDescriptor::default();
        assert!(!d.status_is_valid());
        assert!(!d.is_cacheable());
        assert_eq!(d.max_age, Some(DEFAULT_MAX_AGE));
    }

    #[test]
    fn cacheable_requires_etag_and_max_age() {
        let mut d = ResponseDescriptor::text(200, "text/plain", "hi");
        assert!(!d.is_cacheable());
        d.entity_tag = Some("v1".into());
        assert!(d.is_cacheable());
        d.max_age = None;
        assert!(!d.is_cacheable());
    }

    #[test]
    fn stream_payloads_never_clone() {
        let d = ResponseDescriptor {
            status: Some(200),
            data: Payload::Stream(PayloadStream::new(futures_util::stream::empty())),
            entity_tag: Some("v1".into()),
            ..ResponseDescriptor::default()
        };
        assert!(!d.is_cacheable());
        assert!(d.clone_sized().is_none());
    }

    #[test]
    fn status_bounds() {
        assert!(ResponseDescriptor::with_status(100).status_is_valid());
        assert!(ResponseDescriptor::with_status(599).status_is_valid());
        assert!(!ResponseDescriptor::with_status(600).status_is_valid());
        assert!(!ResponseDescriptor::with_status(99).status_is_valid());
    }
}
