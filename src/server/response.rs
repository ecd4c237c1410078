//! Renders a [`HandlerResponse`] onto the wire.

use crate::bridge::Resolved;
use crate::context::RequestContext;
use crate::fault::RenderError;
use crate::response::{BodyStream, HandlerResponse};
use crate::runtime_config::{ConnectionPolicy, EngineConfig};
use bytes::{BufMut, BytesMut};
use http::{StatusCode, Version};
use std::io::{self, Read, Write};
use tracing::{debug, error, warn};

/// Status written when a body cannot be rendered.
pub const RENDER_FAILURE_STATUS: StatusCode = StatusCode::BAD_REQUEST;

/// What happened on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: StatusCode,
    /// The request asked for a persistent connection
    pub keep_alive: bool,
    /// The transport should close the connection now
    pub close: bool,
    pub render_failed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseWriter {
    chunk_bytes: usize,
    policy: ConnectionPolicy,
}

impl ResponseWriter {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            chunk_bytes: config.write_chunk_bytes.max(1),
            policy: config.connection_policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    /// Write `response` for the request in `ctx`.
    ///
    /// Render faults never surface here: they degrade to an empty body with
    /// [`RENDER_FAILURE_STATUS`]. Only transport errors are returned.
    pub fn write<W: Write + ?Sized>(
        &self,
        ctx: &RequestContext,
        mut response: HandlerResponse,
        handle_session_cookies: bool,
        out: &mut W,
    ) -> io::Result<WriteOutcome> {
        let keep_alive = ctx.keep_alive();

        let (body, render_failed): (Option<BodyStream>, bool) =
            match Self::render(ctx, &mut response) {
                Ok(body) => (Some(body), false),
                Err(e) => {
                    ctx.stats().record_render_failure();
                    warn!(
                        request_id = %ctx.id(),
                        original_status = response.status.as_u16(),
                        error = %e,
                        "Response body could not be rendered - sending empty body"
                    );
                    (None, true)
                }
            };

        let status = if render_failed {
            RENDER_FAILURE_STATUS
        } else {
            response.status
        };
        let length = if render_failed {
            0
        } else {
            response.renderable.length()
        };

        let content_type = response
            .full_content_type()
            .unwrap_or_else(|| response.renderable.mime_type().to_string());
        response.set_header("Content-Type", content_type);
        if keep_alive {
            response.set_header("Content-Length", length.to_string());
            response.set_header("Connection", "keep-alive".to_string());
        }

        if handle_session_cookies {
            ctx.flash().save(&mut response);
            ctx.session().save(&mut response);
        }

        let head = encode_head(ctx.head().version, status, &response);
        out.write_all(&head)?;
        if let Some(body) = body {
            self.stream_body(body, out)?;
        }
        out.flush()?;

        let close = self.policy.close_after_write(keep_alive);
        debug!(
            request_id = %ctx.id(),
            status = status.as_u16(),
            content_length = length,
            keep_alive = keep_alive,
            close = close,
            cookies = response.cookies.len(),
            "Response written"
        );
        Ok(WriteOutcome {
            status,
            keep_alive,
            close,
            render_failed,
        })
    }

    /// Negotiate if needed, then materialize the body.
    fn render(
        ctx: &RequestContext,
        response: &mut HandlerResponse,
    ) -> Result<BodyStream, RenderError> {
        if response.renderable.requires_serializer() {
            let content_type = response
                .content_type
                .as_deref()
                .or_else(|| ctx.content_type());
            let serializer =
                content_type.and_then(|ct| ctx.content_engine().find_serializer(ct));
            if let Some(serializer) = serializer {
                serializer
                    .serialize(response.renderable.as_mut())
                    .map_err(|source| RenderError::Serialize {
                        content_type: serializer.content_type().to_string(),
                        source,
                    })?;
            } else {
                debug!(
                    request_id = %ctx.id(),
                    content_type = ?content_type,
                    "No serializer matched - rendering raw"
                );
            }
        }
        response.renderable.render(ctx)
    }

    /// Copy the body in `chunk_bytes` pieces. The stream is dropped on
    /// every path out of this function.
    fn stream_body<W: Write + ?Sized>(&self, mut body: BodyStream, out: &mut W) -> io::Result<()> {
        let mut buf = vec![0_u8; self.chunk_bytes];
        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            out.write_all(&buf[..n])?;
        }
    }

    /// Synchronous path: write, and on a transport error try once more with
    /// a server fault and without touching session state.
    pub fn write_or_fallback<W: Write + ?Sized>(
        &self,
        ctx: &RequestContext,
        response: HandlerResponse,
        out: &mut W,
    ) -> WriteOutcome {
        match self.write(ctx, response, true, out) {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.stats().record_write_failure();
                warn!(request_id = %ctx.id(), error = %e, "Response write failed - sending server fault");
                let fallback = HandlerResponse::internal_server_error(anyhow::Error::new(e));
                self.write(ctx, fallback, false, out)
                    .unwrap_or_else(|e| self.abandon(ctx, &e))
            }
        }
    }

    /// Async path: the bridge already turned failures into a server fault.
    pub fn write_resolved<W: Write + ?Sized>(
        &self,
        ctx: &RequestContext,
        resolved: Resolved,
        out: &mut W,
    ) -> WriteOutcome {
        self.write(ctx, resolved.response, resolved.handle_session_cookies, out)
            .unwrap_or_else(|e| self.abandon(ctx, &e))
    }

    fn abandon(&self, ctx: &RequestContext, e: &io::Error) -> WriteOutcome {
        ctx.stats().record_write_failure();
        error!(request_id = %ctx.id(), error = %e, "Response write failed - closing connection");
        WriteOutcome {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            keep_alive: ctx.keep_alive(),
            close: true,
            render_failed: false,
        }
    }
}

fn encode_head(version: Version, status: StatusCode, response: &HandlerResponse) -> BytesMut {
    let mut head = BytesMut::with_capacity(256);
    head.put_slice(if version == Version::HTTP_10 {
        b"HTTP/1.0 "
    } else {
        b"HTTP/1.1 "
    });
    head.put_slice(status.as_str().as_bytes());
    head.put_u8(b' ');
    head.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    head.put_slice(b"\r\n");
    for (name, value) in &response.headers {
        put_header(&mut head, name, value);
    }
    for cookie in &response.cookies {
        put_header(&mut head, "Set-Cookie", &cookie.to_header_value());
    }
    head.put_slice(b"\r\n");
    head
}

fn put_header(head: &mut BytesMut, name: &str, value: &str) {
    head.put_slice(name.as_bytes());
    head.put_slice(b": ");
    head.put_slice(value.as_bytes());
    head.put_slice(b"\r\n");
}
