//! Per-fragment callbacks invoked while a response streams in.

use tokio::sync::mpsc;

use tsumugi_core::error::BoxError;

/// Receives each text fragment, in order, as soon as it is assembled.
///
/// Returning an error aborts the stream; the error is handed back to the
/// caller unchanged as the terminal failure.
pub trait StreamingSink: Send {
    fn on_text(&mut self, fragment: &str) -> Result<(), BoxError>;
}

impl<F> StreamingSink for F
where
    F: FnMut(&str) -> Result<(), BoxError> + Send,
{
    fn on_text(&mut self, fragment: &str) -> Result<(), BoxError> {
        self(fragment)
    }
}

/// Pin a closure to the sink signature so its argument type is inferred.
pub fn sink_fn<F>(f: F) -> F
where
    F: FnMut(&str) -> Result<(), BoxError> + Send,
{
    f
}

/// Forwards fragments into an unbounded channel.
///
/// Dropping the receiver makes the next fragment fail, which stops the stream.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamingSink for ChannelSink {
    fn on_text(&mut self, fragment: &str) -> Result<(), BoxError> {
        self.tx
            .send(fragment.to_string())
            .map_err(|_| "fragment receiver dropped".into())
    }
}

/// Wraps another sink and records each fragment with `tracing`.
pub struct TracedSink {
    inner: Box<dyn StreamingSink>,
    fragments: usize,
    bytes: usize,
}

impl TracedSink {
    pub fn new(inner: impl StreamingSink + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            fragments: 0,
            bytes: 0,
        }
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl StreamingSink for TracedSink {
    fn on_text(&mut self, fragment: &str) -> Result<(), BoxError> {
        self.fragments += 1;
        self.bytes += fragment.len();
        tracing::trace!(
            fragment = self.fragments,
            len = fragment.len(),
            "text fragment"
        );
        self.inner.on_text(fragment).inspect_err(|e| {
            tracing::warn!(fragment = self.fragments, error = %e, "sink rejected fragment");
        })
    }
}
