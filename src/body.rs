//! HTTP response body handling.
//!
//! `HookBody` wraps the boxed-body machinery of `http-body-util` behind a
//! small set of constructors: static bytes and strings for rendered
//! descriptors, streams for streaming payloads, and an empty body for
//! header-only responses. It integrates with Hyper's body system while
//! keeping the daemon's response type concrete.

use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, SizeHint};

use crate::types::{BoxBody, BoxError};

/// Response body with streaming and conversion support.
pub struct HookBody(BoxBody);

impl HookBody {
    /// Wraps any `Body` implementation with error mapping and type erasure.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(|e| e.into()).boxed_unsync())
    }

    /// Creates a body from a stream of byte chunks.
    ///
    /// Used to pipe a hook's streaming payload to the client without
    /// buffering it; errors from the source terminate the response body.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + Debug + 'static,
    {
        let stream = stream.map_err(Into::into).map_ok(Frame::data);
        Self(StreamBody::new(stream).boxed_unsync())
    }

    /// Creates an empty body that immediately signals end-of-stream.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for HookBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&str> for HookBody {
    fn from(buf: &str) -> Self {
        let owned = buf.to_owned();
        Self::new(http_body_util::Full::from(owned))
    }
}

macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for HookBody {
            fn from(buf: $ty) -> Self {
                Self::new(http_body_util::Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl Body for HookBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}
