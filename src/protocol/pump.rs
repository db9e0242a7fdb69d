//! Byte pumps between the HTTP layer and the backend.
//!
//! - `pump_request` copies the inbound body into the backend's stdin and closes it.
//! - `response_body` turns the backend's stdout (minus the consumed header block) into
//!   the outbound body stream, and reaps the backend once stdout closes.
//!
//! Neither side buffers more than one read, so pack transfers of any size stream through.

use std::io;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::http::{GatewayState, log_transition};
use super::process::BackendProcess;
use super::types::BodyStream;
use crate::errors::GatewayError;

/// Copy `body` into `stdin` byte-for-byte, then flush and close it so the backend sees
/// end-of-input. Returns the number of bytes written.
pub async fn pump_request<W>(mut body: BodyStream, mut stdin: W) -> Result<u64, GatewayError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        stdin.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    stdin.flush().await?;
    stdin.shutdown().await?;
    tracing::debug!(bytes = written, "request body written to backend");
    Ok(written)
}

struct ResponsePump {
    prefix: Option<Bytes>,
    stdout: ReaderStream<ChildStdout>,
    process: BackendProcess,
    cancel: Option<CancellationToken>,
    span: Span,
    done: bool,
}

impl ResponsePump {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, GatewayError> {
        if let Some(prefix) = self.prefix.take().filter(|p| !p.is_empty()) {
            return Ok(Some(prefix));
        }
        let item = match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(GatewayError::Cancelled),
                item = self.stdout.next() => item,
            },
            None => self.stdout.next().await,
        };
        match item {
            Some(chunk) => Ok(Some(chunk?)),
            None => {
                self.complete().await?;
                Ok(None)
            }
        }
    }

    /// Stdout closed: the request pump must have succeeded and the backend is reaped.
    ///
    /// A backend may finish its reply without reading all of stdin; the resulting broken
    /// pipe does not invalidate a response it has already completed.
    async fn complete(&mut self) -> Result<(), GatewayError> {
        match self.process.join_request_pump().await {
            Err(GatewayError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::warn!("backend closed stdin before the request body was consumed");
            }
            other => {
                other?;
            }
        }
        self.process.finish().await?;
        log_transition(GatewayState::StreamingBody, GatewayState::Completed);
        Ok(())
    }
}

/// Stream `prefix` followed by everything else the backend writes to stdout.
///
/// The stream owns `process`; dropping it early (client gone, cancellation) kills the
/// backend. A failed request pump or a cancellation surfaces as a body error. Each poll
/// runs inside the span that was current when the stream was created.
pub fn response_body(
    prefix: Bytes,
    stdout: ChildStdout,
    process: BackendProcess,
    read_size: usize,
    cancel: Option<CancellationToken>,
) -> BodyStream {
    let pump = ResponsePump {
        prefix: Some(prefix),
        stdout: ReaderStream::with_capacity(stdout, read_size),
        process,
        cancel,
        span: Span::current(),
        done: false,
    };

    Box::pin(stream::unfold(pump, |mut pump| {
        let span = pump.span.clone();
        async move {
            if pump.done {
                return None;
            }
            match pump.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), pump)),
                Ok(None) => None,
                Err(e) => {
                    tracing::error!("Response body aborted: {}", e);
                    pump.done = true;
                    pump.process.kill();
                    Some((Err(e.into_io()), pump))
                }
            }
        }
        .instrument(span)
    }))
}
