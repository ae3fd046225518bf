//! Runs a response body through the assembler on a background task.

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use tsumugi_core::config::StreamConfig;
use tsumugi_core::error::{BoxError, Result, StreamError};

use super::accumulator::StreamedMessage;
use super::dispatcher::{DiagnosticHook, Flow, MessageAssembler};
use crate::sink::StreamingSink;
use crate::sse::{response_lines, sse_lines};

/// Builder for one streamed message assembly.
///
/// ```ignore
/// let (sink, mut tokens) = ChannelSink::new();
/// let message = StreamDriver::new(StreamConfig::default())
///     .with_sink(sink)
///     .run_response(response)
///     .await?;
/// ```
pub struct StreamDriver {
    config: StreamConfig,
    sink: Option<Box<dyn StreamingSink>>,
    diagnostics: Option<DiagnosticHook>,
    cancel: CancellationToken,
}

impl StreamDriver {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            sink: None,
            diagnostics: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl StreamingSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_diagnostics(mut self, hook: DiagnosticHook) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    /// Use an externally owned token; cancelling it stops the read loop.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Start consuming `body` on a new task and return a handle to its result.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, B, E>(self, body: S) -> PendingMessage
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let lines = sse_lines(body, self.config.max_line_bytes);
        self.spawn_lines(lines)
    }

    fn spawn_lines<L>(self, lines: L) -> PendingMessage
    where
        L: Stream<Item = std::result::Result<String, StreamError>> + Send + 'static,
    {
        let StreamDriver {
            config,
            sink,
            diagnostics,
            cancel,
        } = self;

        let mut assembler = MessageAssembler::new();
        if let Some(sink) = sink {
            assembler = assembler.with_sink(sink);
        }
        if let Some(hook) = diagnostics {
            assembler = assembler.with_diagnostics(hook);
        }

        let trace = config.trace.clone().unwrap_or_default();
        let span = tracing::info_span!(
            "stream_assembly",
            run_id = %config.run_id,
            span_name = %trace.span_name,
            provider = %trace.provider,
            model = %trace.model_name,
            model_type = %trace.model_type,
            tags = ?config.tags,
            metadata = ?config.metadata,
        );

        let (tx, rx) = oneshot::channel();
        let task_cancel = cancel.clone();
        tokio::spawn(
            async move {
                tracing::debug!("stream assembly started");
                let result = drive(lines, assembler, task_cancel).await;
                match &result {
                    Ok(message) => tracing::info!(
                        id = %message.id,
                        segments = message.content.len(),
                        input_tokens = message.usage.input_tokens,
                        output_tokens = message.usage.output_tokens,
                        stop_reason = ?message.stop_reason,
                        "stream assembly finished"
                    ),
                    Err(e) => tracing::warn!(error = %e, "stream assembly failed"),
                }
                if tx.send(result).is_err() {
                    tracing::debug!("caller went away before the result was ready");
                }
            }
            .instrument(span),
        );

        PendingMessage { rx, cancel }
    }

    /// Assemble a body and wait for the final message.
    pub async fn run<S, B, E>(self, body: S) -> Result<StreamedMessage>
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.spawn(body).finish().await
    }

    /// Assemble the body of a `reqwest` response.
    pub async fn run_response(self, response: reqwest::Response) -> Result<StreamedMessage> {
        let lines = response_lines(response, self.config.max_line_bytes);
        self.spawn_lines(lines).finish().await
    }
}

/// Read, decode, and dispatch until a terminal event, error, EOF, or cancellation.
///
/// `lines` is owned here and dropped on return, which releases the body.
async fn drive<L>(
    lines: L,
    mut assembler: MessageAssembler,
    cancel: CancellationToken,
) -> std::result::Result<StreamedMessage, StreamError>
where
    L: Stream<Item = std::result::Result<String, StreamError>>,
{
    let mut lines = std::pin::pin!(lines);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            next = lines.next() => next,
        };
        let Some(line) = next else {
            break;
        };
        if assembler.handle_line(&line?)? == Flow::Done {
            break;
        }
    }
    assembler.finish()
}

/// Handle to an assembly running in the background.
pub struct PendingMessage {
    rx: oneshot::Receiver<std::result::Result<StreamedMessage, StreamError>>,
    cancel: CancellationToken,
}

impl PendingMessage {
    /// Ask the background task to stop at its next read.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the final message or the terminal error.
    pub async fn finish(self) -> Result<StreamedMessage> {
        match self.rx.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(StreamError::Interrupted.into()),
        }
    }
}
