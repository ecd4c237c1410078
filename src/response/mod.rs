//! # Response Module
//!
//! What a route (or an error handler) produces: a [`HandlerResponse`] ready
//! to be written, or an [`AsyncResponse`] whose value is computed later on
//! the background pool. Both travel as an [`Outcome`].

mod cookie;
mod renderable;

pub use cookie::Cookie;
pub use renderable::{
    mime_for_path, BodyStream, NoBody, Renderable, RenderableBytes, RenderableFile,
    RenderableObject,
};

use http::StatusCode;
use serde_json::Value;
use smallvec::SmallVec;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Maximum inline headers before heap allocation
/// Most requests have ≤16 headers
pub const MAX_INLINE_HEADERS: usize = 16;

/// Stack-allocated header/cookie storage for the hot path
///
/// Header names use `Arc<str>`: they repeat across requests and cloning
/// them is an atomic increment rather than a copy.
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Case-insensitive lookup in a [`HeaderVec`].
#[inline]
#[must_use]
pub fn find_header<'a>(headers: &'a HeaderVec, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Result of serving a request.
pub struct HandlerResponse {
    pub status: StatusCode,
    /// Response headers, names unique (case-insensitive)
    pub headers: HeaderVec,
    /// Cookies, each written as its own `Set-Cookie` header
    pub cookies: Vec<Cookie>,
    /// Explicit content type; overrides the renderable's mime type
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub renderable: Box<dyn Renderable>,
    /// Fault this response reports, for server-fault responses
    pub fault: Option<Arc<anyhow::Error>>,
}

impl fmt::Debug for HandlerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("content_type", &self.content_type)
            .field("charset", &self.charset)
            .field("mime_type", &self.renderable.mime_type())
            .field("fault", &self.fault.as_ref().map(|f| f.to_string()))
            .finish()
    }
}

impl HandlerResponse {
    /// Empty response with the given status.
    #[must_use]
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderVec::new(),
            cookies: Vec::new(),
            content_type: None,
            charset: None,
            renderable: Box::new(NoBody),
            fault: None,
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::status(StatusCode::OK)
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self::status(StatusCode::NOT_FOUND)
    }

    #[must_use]
    pub fn bad_request() -> Self {
        Self::status(StatusCode::BAD_REQUEST)
    }

    /// Generic server fault carrying `fault`. The body is the fault message.
    pub fn internal_server_error(fault: impl Into<Arc<anyhow::Error>>) -> Self {
        let fault = fault.into();
        let mut response = Self::status(StatusCode::INTERNAL_SERVER_ERROR).with_text(fault.to_string());
        response.fault = Some(fault);
        response
    }

    /// `303 See Other` to `location`.
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::status(StatusCode::SEE_OTHER).with_header("Location", location.to_string())
    }

    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_renderable(RenderableBytes::text(text))
    }

    #[must_use]
    pub fn with_bytes(self, bytes: impl Into<bytes::Bytes>, mime_type: &str) -> Self {
        self.with_renderable(RenderableBytes::new(bytes, mime_type))
    }

    /// Pre-encoded JSON body, no negotiation.
    #[must_use]
    pub fn with_json(self, value: &Value) -> Self {
        self.with_bytes(value.to_string(), "application/json")
    }

    /// Body rendered through whichever serializer negotiation selects.
    #[must_use]
    pub fn render(self, value: Value) -> Self {
        self.with_renderable(RenderableObject::new(value))
    }

    #[must_use]
    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_renderable(RenderableFile::new(path))
    }

    #[must_use]
    pub fn with_renderable(mut self, renderable: impl Renderable + 'static) -> Self {
        self.renderable = Box::new(renderable);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: String) -> Self {
        self.set_header(name, value);
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    #[must_use]
    pub fn discard_cookie(self, name: &str) -> Self {
        self.with_cookie(Cookie::discard(name))
    }

    #[must_use]
    pub fn as_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    #[must_use]
    pub fn with_charset(mut self, charset: &str) -> Self {
        self.charset = Some(charset.to_string());
        self
    }

    /// Get a header by name
    #[inline]
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Add or update a header
    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((Arc::from(name), value));
    }

    /// The explicit content type with its charset, if one was set.
    #[must_use]
    pub fn full_content_type(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        Some(match &self.charset {
            Some(charset) => format!("{content_type}; charset={charset}"),
            None => content_type.to_string(),
        })
    }
}

/// Deferred computation resolved on the background pool.
pub struct AsyncResponse {
    task: Box<dyn FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static>,
}

impl AsyncResponse {
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static,
    {
        Self {
            task: Box::new(task),
        }
    }

    #[must_use]
    pub fn into_task(self) -> Box<dyn FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static> {
        self.task
    }
}

impl fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse { .. }")
    }
}

/// What dispatch hands back to the connection.
#[derive(Debug)]
pub enum Outcome {
    Ready(HandlerResponse),
    Deferred(AsyncResponse),
}

impl Outcome {
    pub fn deferred<F>(task: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static,
    {
        Outcome::Deferred(AsyncResponse::new(task))
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred(_))
    }
}

impl From<HandlerResponse> for Outcome {
    fn from(response: HandlerResponse) -> Self {
        Outcome::Ready(response)
    }
}
