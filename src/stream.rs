//! The abortable streamer: wraps an upstream token producer, tears the
//! stream down on a fatal constraint error, and supports cooperative
//! cancellation.

use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::processor::LogitProcessor;
use crate::tokenizer::TokenId;

/// A single step of the underlying token producer: the model has already
/// sampled `token_id` (the caller is expected to have called
/// [`LogitProcessor::process`] beforehand to shape the logits it sampled
/// from); the streamer commits it via [`LogitProcessor::did_sample`] and
/// decides whether to keep going.
pub trait TokenProducer {
    /// Produce the next token, or `None` at natural end of generation.
    /// Returns `Err` if the upstream model/runtime itself failed.
    fn next_token(&mut self) -> Result<Option<TokenId>, String>;
}

/// Outcome of a single [`AbortableStream`] step.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// A token was produced and committed to the processor.
    Token(TokenId),
    /// The DPDA reached `error` (non-fatal); generation continues
    /// with an EOS boost applied on the next `process` call.
    RecoveredInvalidPhase,
}

/// Wraps a [`TokenProducer`] and a [`LogitProcessor`], polling the processor
/// for a fatal error after every committed token and tearing the stream
/// down with [`StreamError::AbortedDueToError`] if one is found.
pub struct AbortableStream<P> {
    producer: P,
    cancel: CancellationToken,
    position: usize,
    done: bool,
}

impl<P: TokenProducer> AbortableStream<P> {
    /// Wrap `producer`, cooperatively cancellable via `cancel`.
    #[must_use]
    pub fn new(producer: P, cancel: CancellationToken) -> Self {
        Self {
            producer,
            cancel,
            position: 0,
            done: false,
        }
    }

    /// A token to use for cancellation without sharing one across requests.
    #[must_use]
    pub fn new_uncancellable(producer: P) -> Self {
        Self::new(producer, CancellationToken::new())
    }

    /// Produce and commit the next token against `processor`, or signal
    /// end-of-stream / abort.
    ///
    /// After committing a token, `processor.has_fatal_error()` is checked;
    /// a fatal error tears the stream down at this position with the
    /// recorded error attached. A non-fatal `invalidPhase` error is taken
    /// and surfaced as [`StreamItem::RecoveredInvalidPhase`] without ending
    /// the stream — the caller relies on the EOS bias applied by the next
    /// `process` call to steer generation back to completion.
    pub fn step(&mut self, processor: &mut LogitProcessor) -> Option<Result<StreamItem, StreamError>> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(StreamError::Cancelled));
        }

        let token_id = match self.producer.next_token() {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(message) => {
                self.done = true;
                return Some(Err(StreamError::Producer(message)));
            }
        };

        processor.did_sample(token_id);
        self.position += 1;

        if processor.has_fatal_error() {
            self.done = true;
            let source = processor
                .take_last_error()
                .expect("has_fatal_error implies a recorded error");
            return Some(Err(StreamError::AbortedDueToError {
                position: self.position,
                source,
            }));
        }

        if processor.has_error() {
            processor.take_last_error();
            return Some(Ok(StreamItem::RecoveredInvalidPhase));
        }

        Some(Ok(StreamItem::Token(token_id)))
    }

    /// Request cooperative cancellation; takes effect on the next `step`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Tokens committed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Adapt an [`AbortableStream`] plus its [`LogitProcessor`] into a
/// `futures`-style [`Stream`] for callers that drive generation through
/// `tokio_stream` combinators rather than manual polling.
pub struct AbortableTokenStream<P> {
    inner: AbortableStream<P>,
    processor: LogitProcessor,
}

impl<P: TokenProducer> AbortableTokenStream<P> {
    /// Build a stream wrapping `producer` and `processor`.
    #[must_use]
    pub fn new(producer: P, processor: LogitProcessor, cancel: CancellationToken) -> Self {
        Self {
            inner: AbortableStream::new(producer, cancel),
            processor,
        }
    }

    /// Cancel the underlying stream.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Borrow the processor, e.g. to call `process` on fresh logits before
    /// asking the producer to sample the next token.
    pub fn processor_mut(&mut self) -> &mut LogitProcessor {
        &mut self.processor
    }
}

impl<P: TokenProducer + Unpin> Stream for AbortableTokenStream<P> {
    type Item = Result<StreamItem, StreamError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::task::Poll::Ready(this.inner.step(&mut this.processor))
    }
}
