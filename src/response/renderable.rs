//! Lazy response bodies.
//!
//! A [`Renderable`] is attached to every [`HandlerResponse`](super::HandlerResponse).
//! Nothing is materialized until the response writer calls
//! [`Renderable::render`]; bodies that require negotiation are first handed
//! to a [`ContentSerializer`](crate::content::ContentSerializer), which
//! replaces their representation in place.

use crate::context::RequestContext;
use crate::fault::RenderError;
use bytes::{Buf, Bytes};
use serde_json::Value;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Body stream handed to the response writer.
pub type BodyStream = Box<dyn Read + Send>;

pub trait Renderable: Send {
    /// Whether a serializer should be looked up before rendering.
    fn requires_serializer(&self) -> bool {
        false
    }

    /// Mime type advertised when the response carries no explicit content type.
    fn mime_type(&self) -> &str;

    /// Body length in bytes. Only meaningful after [`render`](Self::render).
    fn length(&self) -> u64;

    fn render(&mut self, ctx: &RequestContext) -> Result<BodyStream, RenderError>;

    /// The structured value a serializer should encode, if any.
    fn object(&self) -> Option<&Value> {
        None
    }

    /// Replace the body with serializer output.
    fn set_serialized(&mut self, _bytes: Vec<u8>, _mime_type: &str) {}
}

fn stream(bytes: Bytes) -> BodyStream {
    Box::new(bytes.reader())
}

/// Empty body.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBody;

impl Renderable for NoBody {
    fn mime_type(&self) -> &str {
        "text/plain"
    }

    fn length(&self) -> u64 {
        0
    }

    fn render(&mut self, _ctx: &RequestContext) -> Result<BodyStream, RenderError> {
        Ok(stream(Bytes::new()))
    }
}

/// Ready bytes with a fixed mime type.
#[derive(Debug, Clone)]
pub struct RenderableBytes {
    bytes: Bytes,
    mime_type: String,
}

impl RenderableBytes {
    pub fn new(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text.into(), "text/plain")
    }
}

impl Renderable for RenderableBytes {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn length(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn render(&mut self, _ctx: &RequestContext) -> Result<BodyStream, RenderError> {
        Ok(stream(self.bytes.clone()))
    }
}

/// A structured value whose wire form is chosen by content negotiation.
///
/// Without a matching serializer the value is rendered raw: strings
/// verbatim, anything else as JSON text.
#[derive(Debug, Clone)]
pub struct RenderableObject {
    value: Value,
    serialized: Option<Bytes>,
    mime_type: String,
}

impl RenderableObject {
    #[must_use]
    pub fn new(value: Value) -> Self {
        let mime_type = if value.is_string() {
            "text/plain"
        } else {
            "application/json"
        };
        Self {
            value,
            serialized: None,
            mime_type: mime_type.to_string(),
        }
    }

    fn raw(&self) -> Result<Bytes, RenderError> {
        match &self.value {
            Value::String(s) => Ok(Bytes::from(s.clone())),
            other => serde_json::to_vec(other)
                .map(Bytes::from)
                .map_err(|e| RenderError::Body(e.to_string())),
        }
    }
}

impl Renderable for RenderableObject {
    fn requires_serializer(&self) -> bool {
        true
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn length(&self) -> u64 {
        self.serialized.as_ref().map_or(0, |b| b.len() as u64)
    }

    fn render(&mut self, _ctx: &RequestContext) -> Result<BodyStream, RenderError> {
        let bytes = match &self.serialized {
            Some(bytes) => bytes.clone(),
            None => {
                let raw = self.raw()?;
                self.serialized = Some(raw.clone());
                raw
            }
        };
        Ok(stream(bytes))
    }

    fn object(&self) -> Option<&Value> {
        Some(&self.value)
    }

    fn set_serialized(&mut self, bytes: Vec<u8>, mime_type: &str) {
        self.serialized = Some(Bytes::from(bytes));
        self.mime_type = mime_type.to_string();
    }
}

/// A file streamed from disk.
#[derive(Debug, Clone)]
pub struct RenderableFile {
    path: PathBuf,
    mime_type: String,
    length: u64,
}

impl RenderableFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mime_type = mime_for_path(&path).to_string();
        Self {
            path,
            mime_type,
            length: 0,
        }
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

impl Renderable for RenderableFile {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn render(&mut self, _ctx: &RequestContext) -> Result<BodyStream, RenderError> {
        let file = File::open(&self.path).map_err(|e| {
            RenderError::Io(io::Error::new(
                e.kind(),
                format!("{}: {e}", self.path.display()),
            ))
        })?;
        self.length = file.metadata()?.len();
        Ok(Box::new(file))
    }
}

/// Mime type guessed from a file extension.
#[must_use]
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}
