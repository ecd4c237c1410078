//! Fault taxonomy.
//!
//! Expected conditions (no route, no negotiation match) are plain `Option`s
//! elsewhere in the crate. The types here cover the genuinely unexpected:
//! a route handler failing, a malformed body, a body that cannot be
//! rendered, and a request stream the transport cannot decode.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Failure raised by [`Route::invoke`](crate::router::Route::invoke).
///
/// A handler may wrap the real cause with extra context, either explicitly
/// with [`wrap`](Self::wrap) or through `anyhow::Context`; the dispatcher
/// reports and routes the cause, never the wrapper.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("{context}")]
    Wrapped {
        context: String,
        #[source]
        cause: anyhow::Error,
    },
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl InvocationError {
    /// Wrap `cause` with a context message.
    pub fn wrap(context: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        InvocationError::Wrapped {
            context: context.into(),
            cause: cause.into(),
        }
    }

    /// True when this fault carries a wrapped cause.
    #[must_use]
    pub fn has_cause(&self) -> bool {
        match self {
            InvocationError::Wrapped { .. } => true,
            InvocationError::Fault(fault) => fault.source().is_some(),
        }
    }

    /// The immediate cause when present, otherwise the fault itself.
    ///
    /// Exactly one layer is peeled. For an `anyhow` chain the result is a
    /// [`FaultCause`] that displays as the cause and still owns the chain.
    #[must_use]
    pub fn into_cause(self) -> anyhow::Error {
        match self {
            InvocationError::Wrapped { cause, .. } => cause,
            InvocationError::Fault(fault) if fault.source().is_some() => {
                anyhow::Error::new(FaultCause { chain: fault })
            }
            InvocationError::Fault(fault) => fault,
        }
    }
}

/// Immediate cause of a context-wrapped handler error.
#[derive(Debug)]
pub struct FaultCause {
    chain: anyhow::Error,
}

impl FaultCause {
    /// The cause itself; downcast it to recover the concrete error type.
    #[must_use]
    pub fn cause(&self) -> &(dyn StdError + 'static) {
        match self.chain.chain().nth(1) {
            Some(cause) => cause,
            None => &*self.chain,
        }
    }

    /// The original error, context included.
    #[must_use]
    pub fn wrapper(&self) -> &anyhow::Error {
        &self.chain
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.cause(), f)
    }
}

impl StdError for FaultCause {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.chain.chain().nth(2)
    }
}

/// Malformed or oversized request body.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("form body exceeds {limit} bytes")]
    FormTooLarge { limit: usize },
    #[error("multipart body is malformed: {0}")]
    Multipart(String),
    #[error("multipart content type has no boundary")]
    MissingBoundary,
    #[error("no body parser registered for content type {0:?}")]
    NoParser(String),
    #[error("body parser for {content_type:?} failed: {source}")]
    Parse {
        content_type: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("body could not be converted: {0}")]
    Convert(#[from] serde_json::Error),
    #[error("body storage failed: {0}")]
    Io(#[from] io::Error),
}

/// Serialization or body materialization failed while writing a response.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("serializer for {content_type:?} failed: {source}")]
    Serialize {
        content_type: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("body could not be rendered: {0}")]
    Body(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Inbound byte stream is not valid HTTP/1.1.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed request head: {0}")]
    Head(#[from] httparse::Error),
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("unsupported HTTP method {0:?}")]
    Method(String),
    #[error("invalid content-length {0:?}")]
    ContentLength(String),
    #[error("malformed chunked body")]
    Chunked,
}

/// A transport drove the connection state machine out of order.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is {0:?} and cannot accept request headers")]
    Busy(crate::server::ConnectionState),
    #[error("no request in progress")]
    NoRequest,
    #[error("connection writer is parked on a deferred response")]
    WriterParked,
    #[error("connection is closed")]
    Closed,
}
