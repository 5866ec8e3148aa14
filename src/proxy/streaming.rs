//! Response-body tee
//!
//! Wraps a body stream so every chunk is forwarded to the client with no
//! added buffering while a copy accumulates into a capped buffer. When the
//! stream completes, a one-shot callback receives the captured bytes, or
//! `None` if the cap was exceeded or the stream errored. If the client
//! disconnects the stream is dropped and the callback never fires, so
//! aborted exchanges are neither cached nor reported as complete.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use pin_project_lite::pin_project;

type OnDone = Box<dyn FnOnce(Option<Bytes>) + Send>;

pin_project! {
    pub struct CaptureStream<S> {
        #[pin]
        inner: S,
        buffer: Option<BytesMut>,
        cap: usize,
        overflowed: bool,
        on_done: Option<OnDone>,
    }
}

impl<S> CaptureStream<S> {
    pub fn new(inner: S, cap: usize, on_done: impl FnOnce(Option<Bytes>) + Send + 'static) -> Self {
        Self {
            inner,
            buffer: Some(BytesMut::new()),
            cap,
            overflowed: false,
            on_done: Some(Box::new(on_done)),
        }
    }
}

impl<S, E> Stream for CaptureStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !*this.overflowed {
                    if let Some(buffer) = this.buffer.as_mut() {
                        if buffer.len() + chunk.len() > *this.cap {
                            // Cap exceeded: stop capturing, keep streaming
                            *this.overflowed = true;
                            *this.buffer = None;
                        } else {
                            buffer.extend_from_slice(&chunk);
                        }
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                // Incomplete body: discard the capture
                *this.overflowed = true;
                *this.buffer = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(on_done) = this.on_done.take() {
                    let captured = if *this.overflowed {
                        None
                    } else {
                        this.buffer.take().map(BytesMut::freeze)
                    };
                    on_done(captured);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn forwards_all_chunks_and_captures_body() {
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = Arc::clone(&captured);
        let stream = CaptureStream::new(chunks(&[b"hello ", b"world"]), 1024, move |bytes| {
            *captured_clone.lock().unwrap() = Some(bytes);
        });

        let forwarded: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(forwarded, vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]);
        assert_eq!(
            captured.lock().unwrap().take().unwrap().unwrap(),
            Bytes::from_static(b"hello world")
        );
    }

    #[tokio::test]
    async fn cap_exceeded_discards_capture_but_streams_on() {
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = Arc::clone(&captured);
        // 12 bytes total, cap of 8: capture discarded mid-stream
        let stream = CaptureStream::new(chunks(&[b"123456", b"789012"]), 8, move |bytes| {
            *captured_clone.lock().unwrap() = Some(bytes);
        });

        let forwarded: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
        let total: usize = forwarded.iter().map(|c| c.len()).sum();
        assert_eq!(total, 12, "client still receives every byte");
        assert_eq!(*captured.lock().unwrap(), Some(None), "capture discarded");
    }

    #[tokio::test]
    async fn body_exactly_at_cap_is_captured() {
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = Arc::clone(&captured);
        let stream = CaptureStream::new(chunks(&[b"12345678"]), 8, move |bytes| {
            *captured_clone.lock().unwrap() = Some(bytes);
        });
        let _: Vec<_> = stream.collect().await;
        assert_eq!(
            captured.lock().unwrap().take().unwrap().unwrap(),
            Bytes::from_static(b"12345678")
        );
    }

    #[tokio::test]
    async fn dropped_stream_never_fires_callback() {
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = Arc::clone(&fired);
        let mut stream = CaptureStream::new(chunks(&[b"a", b"b"]), 1024, move |_| {
            *fired_clone.lock().unwrap() = true;
        });

        // Client reads one chunk then disconnects
        let _ = stream.next().await;
        drop(stream);
        assert!(!*fired.lock().unwrap());
    }

    #[tokio::test]
    async fn errored_stream_reports_no_capture() {
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = Arc::clone(&captured);
        let inner = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err("upstream reset"),
            Ok(Bytes::from_static(b"after")),
        ]);
        let stream = CaptureStream::new(inner, 1024, move |bytes| {
            *captured_clone.lock().unwrap() = Some(bytes);
        });
        let results: Vec<Result<Bytes, &str>> = stream.collect().await;
        assert!(results.iter().any(|r| r.is_err()));
        assert_eq!(*captured.lock().unwrap(), Some(None));
    }
}
