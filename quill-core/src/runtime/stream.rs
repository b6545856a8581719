//! Caller-facing chunk stream.

use crate::error::AiError;
use crate::types::{AiResponse, FinishReason, OutputChunk, TextChunk, Usage};
use futures::Stream;
use pin_project::pin_project;
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// Item delivered by a [`ResponseStream`].
///
/// Zero or more `Chunk`s are followed by exactly one `Done`.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Chunk(OutputChunk),
    Done(AiResponse),
}

impl StreamItem {
    pub fn as_chunk(&self) -> Option<&OutputChunk> {
        match self {
            StreamItem::Chunk(chunk) => Some(chunk),
            StreamItem::Done(_) => None,
        }
    }

    pub fn into_response(self) -> Option<AiResponse> {
        match self {
            StreamItem::Done(response) => Some(response),
            StreamItem::Chunk(_) => None,
        }
    }
}

/// Lazy, finite, non-restartable sequence of output chunks.
///
/// Dropping it early closes the backend transport and frees the request's
/// concurrency slots.
pub struct ResponseStream {
    inner: Pin<Box<dyn Stream<Item = StreamItem> + Send>>,
}

impl ResponseStream {
    pub(crate) fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = StreamItem> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Drain the stream and return the terminal response
    pub async fn collect_response(mut self) -> Option<AiResponse> {
        use futures::StreamExt;

        let mut last = None;
        while let Some(item) = self.next().await {
            if let StreamItem::Done(response) = item {
                last = Some(response);
            }
        }
        last
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}

impl Stream for ResponseStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Backend delta after sequencing
#[derive(Debug, Clone, Default)]
pub(crate) struct SequencedChunk {
    /// `None` for deltas that carry only metadata
    pub output: Option<OutputChunk>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

/// Numbers non-empty deltas 0, 1, 2, ... in arrival order.
#[pin_project]
pub(crate) struct Sequenced<S> {
    #[pin]
    inner: S,
    next: u64,
}

impl<S> Sequenced<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner, next: 0 }
    }
}

impl<S> Stream for Sequenced<S>
where
    S: Stream<Item = Result<TextChunk, AiError>>,
{
    type Item = Result<SequencedChunk, AiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = match ready!(this.inner.poll_next(cx)) {
            None => return Poll::Ready(None),
            Some(Err(err)) => return Poll::Ready(Some(Err(err))),
            Some(Ok(chunk)) => chunk,
        };

        let output = if item.delta.is_empty() {
            None
        } else {
            let sequence = *this.next;
            *this.next += 1;
            Some(OutputChunk {
                sequence,
                delta: item.delta,
            })
        };

        Poll::Ready(Some(Ok(SequencedChunk {
            output,
            finish_reason: item.finish_reason,
            usage: item.usage,
        })))
    }
}
