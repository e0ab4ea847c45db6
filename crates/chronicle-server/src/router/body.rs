//! Response body that writes the request's completion record.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Frame, SizeHint};

use crate::log::{Fields, Log};
use crate::serialize::ResponseSummary;

/// Wraps a buffered response body and logs `Response sent.` once hyper
/// releases it.
///
/// Hyper releases the body after taking its last frame, which can be before
/// those bytes are flushed to the socket. `Response sent.` therefore means
/// the whole body was handed to the connection, not that the client has it.
///
/// A body released before its last byte was taken (client went away) logs
/// `Response aborted.` instead. Either way exactly one record is written.
pub struct LoggedBody {
    inner: Full<Bytes>,
    completion: Option<Completion>,
}

struct Completion {
    log: Log,
    response: ResponseSummary,
    /// HEAD responses are never polled for their body.
    head: bool,
}

impl LoggedBody {
    pub(crate) fn new(inner: Full<Bytes>, log: Log, response: ResponseSummary, head: bool) -> Self {
        Self {
            inner,
            completion: Some(Completion { log, response, head }),
        }
    }
}

impl Body for LoggedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        let Some(completion) = self.completion.take() else {
            return;
        };
        let fields = Fields::new().with("response", &completion.response);
        if completion.head || self.inner.is_end_stream() {
            completion.log.info(fields, "Response sent.");
        } else {
            completion.log.warn(fields, "Response aborted.");
        }
    }
}
