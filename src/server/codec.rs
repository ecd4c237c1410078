//! Incremental HTTP/1.x request decoder.
//!
//! Turns the inbound byte stream of one connection into the events the
//! connection state machine consumes: a request head, zero or more body
//! chunks, then an end marker. Pipelined requests are decoded one after the
//! other from the same buffer.

use crate::context::RequestHead;
use crate::fault::CodecError;
use crate::response::HeaderVec;
use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Version};
use memchr::memmem;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of headers accepted in a request head.
pub const MAX_REQUEST_HEADERS: usize = 64;

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug)]
pub enum RequestEvent {
    Head(RequestHead),
    Chunk(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Length(usize),
    Chunked(ChunkState),
    End,
}

#[derive(Debug)]
pub struct RequestCodec {
    max_head_bytes: usize,
    state: DecodeState,
}

impl RequestCodec {
    #[must_use]
    pub fn new(max_head_bytes: usize) -> Self {
        Self {
            max_head_bytes,
            state: DecodeState::Head,
        }
    }

    /// Between requests: nothing of the next request has been decoded yet.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Head
    }

    /// Decode the next event from `buf`, consuming the bytes it covers.
    ///
    /// `Ok(None)` means more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestEvent>, CodecError> {
        loop {
            match self.state {
                DecodeState::Head => return self.decode_head(buf),
                DecodeState::End => {
                    self.state = DecodeState::Head;
                    return Ok(Some(RequestEvent::End));
                }
                DecodeState::Length(remaining) => {
                    let Some(chunk) = take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len();
                    self.state = if left == 0 {
                        DecodeState::End
                    } else {
                        DecodeState::Length(left)
                    };
                    return Ok(Some(RequestEvent::Chunk(chunk)));
                }
                DecodeState::Chunked(ChunkState::Data(remaining)) => {
                    let Some(chunk) = take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len();
                    self.state = DecodeState::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(Some(RequestEvent::Chunk(chunk)));
                }
                DecodeState::Chunked(ChunkState::DataEnd) => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CodecError::Chunked);
                    }
                    buf.advance(2);
                    self.state = DecodeState::Chunked(ChunkState::Size);
                }
                DecodeState::Chunked(ChunkState::Size) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = DecodeState::Chunked(if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    });
                }
                DecodeState::Chunked(ChunkState::Trailers) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = DecodeState::End;
                    }
                }
            }
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<RequestEvent>, CodecError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let consumed = match req.parse(&buf[..])? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if buf.len() > self.max_head_bytes {
                    return Err(CodecError::HeadTooLarge {
                        limit: self.max_head_bytes,
                    });
                }
                return Ok(None);
            }
        };
        if consumed > self.max_head_bytes {
            return Err(CodecError::HeadTooLarge {
                limit: self.max_head_bytes,
            });
        }

        let method_str = req.method.unwrap_or_default();
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|_| CodecError::Method(method_str.to_string()))?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let header_vec: HeaderVec = req
            .headers
            .iter()
            .map(|h| {
                (
                    Arc::<str>::from(h.name),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();
        let head = RequestHead::new(method, req.path.unwrap_or("/"), version, header_vec);
        buf.advance(consumed);

        self.state = body_framing(&head)?;
        debug!(
            method = %head.method,
            path = %head.path,
            framing = ?self.state,
            "Request head decoded"
        );
        Ok(Some(RequestEvent::Head(head)))
    }
}

fn body_framing(head: &RequestHead) -> Result<DecodeState, CodecError> {
    if let Some(te) = head.header("transfer-encoding") {
        if te
            .split(',')
            .map(str::trim)
            .any(|t| t.eq_ignore_ascii_case("chunked"))
        {
            return Ok(DecodeState::Chunked(ChunkState::Size));
        }
    }
    match head.header("content-length") {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| CodecError::ContentLength(raw.to_string()))?;
            Ok(if len == 0 {
                DecodeState::End
            } else {
                DecodeState::Length(len)
            })
        }
        None => Ok(DecodeState::End),
    }
}

fn take_body(buf: &mut BytesMut, remaining: usize) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }
    let n = remaining.min(buf.len());
    Some(buf.split_to(n).freeze())
}

/// Next CRLF-terminated line, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
    match memmem::find(&buf[..], b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(CodecError::Chunked),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, CodecError> {
    let line = std::str::from_utf8(line).map_err(|_| CodecError::Chunked)?;
    let size = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size, 16).map_err(|_| CodecError::Chunked)
}
