//! Response rendering: descriptor → HTTP response.
//!
//! The renderer validates the descriptor, applies its headers one at a
//! time (invalid entries are skipped with a log line, the rest still
//! apply), stamps cache and timing metadata, and materializes the body per
//! payload kind. It also decides whether the rendered response is eligible
//! for cache insertion.

use std::time::Instant;

use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use http::{HeaderName, HeaderValue, StatusCode};
use tracing::warn;

use crate::body::HookBody;
use crate::descriptor::{Payload, ResponseDescriptor};
use crate::types::Response;

/// Timing header emitted on every rendered response.
pub const X_GMETRICS: &str = "x-gmetrics";

/// Per-request timing marks backing the `X-GMetrics` header: request
/// arrival and hook entry, both monotonic.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub arrival: Instant,
    pub hook_entry: Instant,
}

impl Timing {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            arrival: now,
            hook_entry: now,
        }
    }

    /// Marks the transition from request plumbing to hook execution.
    pub fn mark_hook_entry(&mut self) {
        self.hook_entry = Instant::now();
    }

    fn header_value(&self) -> HeaderValue {
        let stage1 = self.hook_entry.duration_since(self.arrival).as_micros();
        let stage2 = self.hook_entry.elapsed().as_micros();
        HeaderValue::from_str(&format!("{stage1}us, {stage2}us"))
            .unwrap_or_else(|_| HeaderValue::from_static("0us, 0us"))
    }
}

/// A rendered response plus the descriptor clone to insert into the cache,
/// when the descriptor qualifies.
pub struct Rendered {
    pub response: Response,
    pub cacheable: Option<CacheInsert>,
}

/// Cache-insertion payload produced by rendering.
pub struct CacheInsert {
    pub descriptor: ResponseDescriptor,
    pub size: u64,
    pub max_age: u64,
}

/// Plain error response for a status code; used for protocol-level
/// failures (405, 406, 500, ...) and for descriptors without a payload.
pub fn error_response(status: StatusCode, timing: Option<&Timing>) -> Response {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!("{} {}\n", status.as_u16(), reason);
    let mut res = hyper::Response::new(HookBody::from(body.clone()));
    *res.status_mut() = status;
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    if let Some(timing) = timing {
        headers.insert(
            HeaderName::from_static(X_GMETRICS),
            timing.header_value(),
        );
    }
    res
}

/// Renders a hook descriptor into a response.
///
/// Fatal-error descriptors and out-of-range statuses degrade to 500;
/// `manual` delegation is resolved by the dispatcher before rendering.
pub fn render(descriptor: ResponseDescriptor, timing: &Timing) -> Rendered {
    if descriptor.error {
        warn!("hook signalled a fatal error");
        return Rendered {
            response: error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(timing)),
            cacheable: None,
        };
    }
    let status = match descriptor.status {
        Some(s) if (100..600).contains(&s) => {
            StatusCode::from_u16(s).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        other => {
            warn!(status = ?other, "hook descriptor carried an invalid status");
            return Rendered {
                response: error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(timing)),
                cacheable: None,
            };
        }
    };

    let cacheable = if descriptor.is_cacheable() {
        descriptor.clone_sized().map(|clone| CacheInsert {
            size: clone.data.sized_len().unwrap_or(0),
            max_age: clone.max_age.unwrap_or(0),
            descriptor: clone,
        })
    } else {
        None
    };

    let mut res = hyper::Response::new(HookBody::empty());
    *res.status_mut() = status;

    // User headers first, one at a time; a bad entry is logged and skipped
    // without affecting the rest.
    for (name, value) in &descriptor.headers {
        let parsed_name = HeaderName::from_bytes(name.as_bytes());
        let parsed_value = HeaderValue::from_str(value);
        match (parsed_name, parsed_value) {
            (Ok(name), Ok(value)) => {
                res.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid response header"),
        }
    }

    if let Some(etag) = &descriptor.entity_tag {
        match HeaderValue::from_str(etag) {
            Ok(value) => {
                res.headers_mut().insert(ETAG, value);
            }
            Err(_) => warn!(etag = %etag, "skipping invalid entity tag"),
        }
    }
    if let Some(age) = descriptor.max_age {
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={age}, must-revalidate")) {
            res.headers_mut().insert(CACHE_CONTROL, value);
        }
    }

    let content_type = descriptor
        .data_type
        .as_deref()
        .and_then(|t| t.parse::<mime::Mime>().ok())
        .map(|m| m.to_string())
        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        res.headers_mut().insert(CONTENT_TYPE, value);
    }

    res.headers_mut().insert(
        HeaderName::from_static(X_GMETRICS),
        timing.header_value(),
    );

    match descriptor.data {
        Payload::Bytes(bytes) => {
            res.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            *res.body_mut() = HookBody::from(bytes);
        }
        Payload::Text(text) => {
            res.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(text.len()));
            *res.body_mut() = HookBody::from(text);
        }
        Payload::Stream(stream) => {
            match descriptor.data_length {
                Some(len) if len > 0 => {
                    res.headers_mut()
                        .insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
                _ => {}
            }
            *res.body_mut() = HookBody::from_stream(stream.into_inner());
        }
        Payload::None => {
            // header-only descriptor: fall back to a plain error body
            let headers = res.headers_mut();
            headers.remove(CONTENT_TYPE);
            headers.remove(ETAG);
            headers.remove(CACHE_CONTROL);
            let reason = status.canonical_reason().unwrap_or("Error");
            let body = format!("{} {}\n", status.as_u16(), reason);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            *res.body_mut() = HookBody::from(body);
            return Rendered {
                response: res,
                cacheable: None,
            };
        }
    }

    Rendered {
        response: res,
        cacheable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn timing() -> Timing {
        Timing::start()
    }

    #[test]
    fn bytes_payload_sets_exact_content_length() {
        let d = ResponseDescriptor::bytes(200, "application/json", Bytes::from_static(b"{}"));
        let rendered = render(d, &timing());
        let res = rendered.response;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get(CONTENT_LENGTH).unwrap(), "2");
        assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(res.headers().get(X_GMETRICS).is_some());
    }

    #[test]
    fn invalid_status_degrades_to_500() {
        let d = ResponseDescriptor::with_status(777);
        let res = render(d, &timing()).response;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn fatal_descriptor_degrades_to_500() {
        let res = render(ResponseDescriptor::fatal(), &timing()).response;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn invalid_headers_are_skipped_not_fatal() {
        let mut d = ResponseDescriptor::text(200, "text/plain", "ok");
        d.headers.push(("x-good".into(), "yes".into()));
        d.headers.push(("bad header name".into(), "v".into()));
        d.headers.push(("x-bad-value".into(), "line\nbreak".into()));
        d.headers.push(("x-also-good".into(), "sure".into()));

        let res = render(d, &timing()).response;
        assert_eq!(res.headers().get("x-good").unwrap(), "yes");
        assert_eq!(res.headers().get("x-also-good").unwrap(), "sure");
        assert!(res.headers().get("x-bad-value").is_none());
    }

    #[test]
    fn etag_and_max_age_mark_cacheable() {
        let mut d = ResponseDescriptor::text(200, "text/plain", "cached");
        d.entity_tag = Some("\"v1\"".into());
        d.max_age = Some(120);

        let rendered = render(d, &timing());
        assert_eq!(
            rendered.response.headers().get(ETAG).unwrap(),
            "\"v1\""
        );
        assert_eq!(
            rendered.response.headers().get(CACHE_CONTROL).unwrap(),
            "max-age=120, must-revalidate"
        );
        let insert = rendered.cacheable.expect("eligible for cache");
        assert_eq!(insert.size, 6);
        assert_eq!(insert.max_age, 120);
    }

    #[test]
    fn missing_etag_is_not_cacheable() {
        let d = ResponseDescriptor::text(200, "text/plain", "plain");
        assert!(render(d, &timing()).cacheable.is_none());
    }

    #[test]
    fn unparseable_mime_falls_back_to_octet_stream() {
        let d = ResponseDescriptor::text(200, "not a mime", "x");
        let res = render(d, &timing()).response;
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
    }

    #[test]
    fn none_payload_clears_cache_headers() {
        let mut d = ResponseDescriptor::with_status(404);
        d.entity_tag = Some("\"v\"".into());
        d.data_type = Some("text/html".into());

        let rendered = render(d, &timing());
        let res = rendered.response;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.headers().get(ETAG).is_none());
        assert!(res.headers().get(CACHE_CONTROL).is_none());
        assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(rendered.cacheable.is_none());
    }

    #[test]
    fn stream_payload_without_length_omits_content_length() {
        use crate::descriptor::{Payload, PayloadStream};
        let mut d = ResponseDescriptor::with_status(200);
        d.data = Payload::Stream(PayloadStream::new(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"chunk")),
        ])));
        let rendered = render(d, &timing());
        assert!(rendered.response.headers().get(CONTENT_LENGTH).is_none());
        assert!(rendered.cacheable.is_none(), "streams are never cached");
    }

    #[test]
    fn stream_payload_with_length_sets_content_length() {
        use crate::descriptor::{Payload, PayloadStream};
        let mut d = ResponseDescriptor::with_status(200);
        d.data = Payload::Stream(PayloadStream::new(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"chunk")),
        ])));
        d.data_length = Some(5);
        let rendered = render(d, &timing());
        assert_eq!(rendered.response.headers().get(CONTENT_LENGTH).unwrap(), "5");
    }
}
