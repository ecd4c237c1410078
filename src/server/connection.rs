//! Per-connection state machine.
//!
//! ```text
//! Idle -> HeadersReceived -> BodyStreaming -> Dispatching -> Writing        -> Idle
//!                                                         \-> AwaitingAsync -> Idle
//! any state --on_disconnect--> Closed
//! ```
//!
//! The transport owns the socket and calls the `on_*` entry points. A
//! connection serves one request at a time: new headers are refused until the
//! previous request has been written and cleaned up.
//!
//! While a deferred response is pending, its request context sits in a slot
//! shared by the handler and the completion callback. Whichever side takes it
//! first releases it, so a disconnect frees the decoder and its spill files
//! even if the computation never finishes.

use super::response::WriteOutcome;
use super::service::AppService;
use crate::context::{RequestContext, RequestHead};
use crate::fault::ConnectionError;
use crate::response::Outcome;
use may::sync::mpsc;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    HeadersReceived,
    BodyStreaming,
    Dispatching,
    Writing,
    AwaitingAsync,
    /// The peer went away; the handler accepts nothing further
    Closed,
}

/// Result of the end-of-body event.
pub enum Dispatched<W> {
    /// Response written synchronously; the connection is idle again
    Written(WriteOutcome),
    /// Response is being computed on the background pool
    Parked(AsyncWait<W>),
}

/// Returned to the connection when a deferred response has been written.
pub struct AsyncDone<W> {
    writer: W,
    outcome: WriteOutcome,
}

impl<W> AsyncDone<W> {
    #[must_use]
    pub fn outcome(&self) -> WriteOutcome {
        self.outcome
    }
}

/// Rendezvous with a deferred response's completion.
pub struct AsyncWait<W> {
    rx: mpsc::Receiver<AsyncDone<W>>,
}

impl<W> AsyncWait<W> {
    /// Park until the completion callback has written the response.
    ///
    /// Inside a coroutine this yields instead of blocking the thread.
    /// `None` when the completion was lost; the connection must be closed.
    #[must_use]
    pub fn wait(self) -> Option<AsyncDone<W>> {
        self.rx.recv().ok()
    }

    /// Non-blocking variant of [`wait`](Self::wait).
    pub fn try_wait(&self) -> Option<AsyncDone<W>> {
        self.rx.try_recv().ok()
    }
}

type PendingSlot = Arc<Mutex<Option<RequestContext>>>;

pub struct ConnectionHandler<W> {
    service: AppService,
    writer: Option<W>,
    ctx: Option<RequestContext>,
    pending: Option<PendingSlot>,
    state: ConnectionState,
}

impl<W: Write + Send + 'static> ConnectionHandler<W> {
    pub fn new(service: AppService, writer: W) -> Self {
        Self {
            service,
            writer: Some(writer),
            ctx: None,
            pending: None,
            state: ConnectionState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> Option<&RequestContext> {
        self.ctx.as_ref()
    }

    /// The writer, unless it is parked with a deferred response.
    #[must_use]
    pub fn writer(&self) -> Option<&W> {
        self.writer.as_ref()
    }

    pub fn into_writer(self) -> Option<W> {
        self.writer
    }

    /// Request line and headers arrived.
    pub fn on_headers(&mut self, head: RequestHead) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            warn!("Request headers refused - connection closed");
            return Err(ConnectionError::Closed);
        }
        if self.state != ConnectionState::Idle {
            warn!(state = ?self.state, "Request headers refused - previous request not finished");
            return Err(ConnectionError::Busy(self.state));
        }
        let ctx = self.service.new_context(head);
        info!(
            request_id = %ctx.id(),
            method = %ctx.method(),
            path = %ctx.path(),
            "Request received"
        );
        self.ctx = Some(ctx);
        self.state = ConnectionState::HeadersReceived;
        Ok(())
    }

    /// A piece of the request body arrived. Only POST and PUT bodies are
    /// decoded; other bodies are discarded.
    pub fn on_body_chunk(&mut self, chunk: &[u8]) {
        let Some(ctx) = self.ctx.as_mut() else {
            warn!(bytes = chunk.len(), "Body chunk without a request in progress - ignored");
            return;
        };
        if !ctx.head().has_decodable_body() {
            debug!(request_id = %ctx.id(), bytes = chunk.len(), "Body ignored for method");
            return;
        }
        ctx.decode_content(chunk);
        self.state = ConnectionState::BodyStreaming;
    }

    /// The request is complete: dispatch it and write or park the response.
    pub fn on_body_end(&mut self) -> Result<Dispatched<W>, ConnectionError> {
        let Some(mut ctx) = self.ctx.take() else {
            return Err(ConnectionError::NoRequest);
        };
        if ctx.head().has_decodable_body() {
            ctx.finish_decoding();
        }

        self.state = ConnectionState::Dispatching;
        match self.service.dispatcher().dispatch(&mut ctx) {
            Outcome::Ready(response) => {
                self.state = ConnectionState::Writing;
                let Some(writer) = self.writer.as_mut() else {
                    ctx.cleanup();
                    self.state = ConnectionState::Idle;
                    return Err(ConnectionError::WriterParked);
                };
                let outcome = self
                    .service
                    .response_writer()
                    .write_or_fallback(&ctx, response, writer);
                ctx.cleanup();
                self.state = ConnectionState::Idle;
                Ok(Dispatched::Written(outcome))
            }
            Outcome::Deferred(deferred) => {
                let Some(mut writer) = self.writer.take() else {
                    ctx.cleanup();
                    self.state = ConnectionState::Idle;
                    return Err(ConnectionError::WriterParked);
                };
                self.state = ConnectionState::AwaitingAsync;
                let (tx, rx) = mpsc::channel();
                let response_writer = *self.service.response_writer();
                let request_id = ctx.id();
                let slot: PendingSlot = Arc::new(Mutex::new(Some(ctx)));
                self.pending = Some(Arc::clone(&slot));
                self.service
                    .bridge()
                    .bridge(deferred, request_id, move |resolved| {
                        let Some(mut ctx) = slot.lock().take() else {
                            debug!(
                                request_id = %request_id,
                                "Deferred response dropped - connection already closed"
                            );
                            return;
                        };
                        let outcome = response_writer.write_resolved(&ctx, resolved, &mut writer);
                        ctx.cleanup();
                        drop(ctx);
                        if tx.send(AsyncDone { writer, outcome }).is_err() {
                            debug!(
                                request_id = %request_id,
                                "Connection went away before its deferred response completed"
                            );
                        }
                    });
                Ok(Dispatched::Parked(AsyncWait { rx }))
            }
        }
    }

    /// Take the writer back after a deferred response was written.
    pub fn resume(&mut self, done: AsyncDone<W>) -> WriteOutcome {
        self.writer = Some(done.writer);
        self.pending = None;
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Idle;
        }
        done.outcome
    }

    /// The peer went away. Releases the request in progress, if any,
    /// including one parked on the background pool; its completion then
    /// finds nothing to write.
    pub fn on_disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            info!(
                request_id = %ctx.id(),
                state = ?self.state,
                "Connection closed with a request in progress"
            );
            ctx.cleanup();
        }
        if let Some(slot) = self.pending.take() {
            let parked = slot.lock().take();
            match parked {
                Some(mut ctx) => {
                    info!(
                        request_id = %ctx.id(),
                        "Connection closed while awaiting a deferred response - request released"
                    );
                    ctx.cleanup();
                }
                None => debug!("Connection closed after its deferred response completed"),
            }
        }
        self.state = ConnectionState::Closed;
    }
}
