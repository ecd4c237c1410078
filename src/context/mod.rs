//! # Request Context
//!
//! Everything the engine knows about the request in flight: the parsed head,
//! query and cookies, the incrementally populated [`BodyDecoder`], the
//! session and flash stores, and the resolved route.
//!
//! The context is passed explicitly through dispatch, response writing and
//! cleanup; nothing looks it up from ambient state. Its tracing span is the
//! per-request scoped registration and lives until [`RequestContext::cleanup`].

mod decoder;
mod session;

pub use decoder::{Attributes, BodyDecoder, FileItem, SpillBuffer};
pub use session::{Flash, Session, FLASH_COOKIE, SESSION_COOKIE};

use crate::content::ContentEngine;
use crate::fault::DecodeError;
use crate::ids::RequestId;
use crate::response::{find_header, HeaderVec};
use crate::router::Route;
use crate::runtime_config::DecoderConfig;
use crate::stats::EngineStats;
use http::{Method, Version};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Span};

/// Query parameters, stack-allocated for the common case.
pub type ParamVec = SmallVec<[(String, String); 8]>;

/// Request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target as sent, query string included
    pub uri: String,
    /// Path without the query string
    pub path: String,
    pub version: Version,
    /// Header names lowercased
    pub headers: HeaderVec,
}

impl RequestHead {
    #[must_use]
    pub fn new(method: Method, uri: &str, version: Version, headers: HeaderVec) -> Self {
        let path = uri.split('?').next().unwrap_or("/").to_string();
        let headers = headers
            .into_iter()
            .map(|(k, v)| {
                if k.bytes().any(|b| b.is_ascii_uppercase()) {
                    (Arc::from(k.to_ascii_lowercase()), v)
                } else {
                    (k, v)
                }
            })
            .collect();
        Self {
            method,
            uri: uri.to_string(),
            path,
            version,
            headers,
        }
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Raw `Content-Type` header, parameters included.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Whether the client asked to keep the connection open.
    ///
    /// `Connection: close` wins, then `Connection: keep-alive`; otherwise
    /// HTTP/1.1 defaults to persistent and HTTP/1.0 does not.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        if let Some(connection) = self.header("connection") {
            let mut tokens = connection.split(',').map(str::trim);
            if tokens.clone().any(|t| t.eq_ignore_ascii_case("close")) {
                return false;
            }
            if tokens.any(|t| t.eq_ignore_ascii_case("keep-alive")) {
                return true;
            }
        }
        self.version >= Version::HTTP_11
    }

    /// POST and PUT are the only methods whose bodies are decoded.
    #[must_use]
    pub fn has_decodable_body(&self) -> bool {
        self.method == Method::POST || self.method == Method::PUT
    }
}

/// Split a `Cookie` header into name/value pairs.
#[must_use]
pub fn parse_cookies(header: Option<&str>) -> HeaderVec {
    header
        .map(|c| {
            c.split(';')
                .filter_map(|pair| {
                    let mut parts = pair.trim().splitn(2, '=');
                    let name = parts.next()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    let value = parts.next().unwrap_or("").trim();
                    Some((Arc::from(name), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse query string parameters from a request target.
#[must_use]
pub fn parse_query_params(uri: &str) -> ParamVec {
    match uri.split_once('?') {
        Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => ParamVec::new(),
    }
}

/// State of one request, from headers received to cleanup.
pub struct RequestContext {
    id: RequestId,
    head: RequestHead,
    query: ParamVec,
    cookies: HeaderVec,
    keep_alive: bool,
    route: Option<Arc<dyn Route>>,
    decoder: Option<BodyDecoder>,
    decode_error: Option<DecodeError>,
    parsed_body: Option<Value>,
    session: Session,
    flash: Flash,
    content: Arc<dyn ContentEngine>,
    decoder_config: DecoderConfig,
    stats: Arc<EngineStats>,
    span: Option<Span>,
    cleaned: bool,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", &self.head.method)
            .field("path", &self.head.path)
            .field("keep_alive", &self.keep_alive)
            .field("has_decoder", &self.decoder.is_some())
            .field("cleaned", &self.cleaned)
            .finish()
    }
}

impl RequestContext {
    pub fn new(
        head: RequestHead,
        content: Arc<dyn ContentEngine>,
        decoder_config: DecoderConfig,
        stats: Arc<EngineStats>,
    ) -> Self {
        let id = RequestId::from_header_or_new(head.header("x-request-id"));
        let query = parse_query_params(&head.uri);
        let cookies = parse_cookies(head.header("cookie"));
        let session = Session::from_cookie(find_header(&cookies, SESSION_COOKIE));
        let flash = Flash::from_cookie(find_header(&cookies, FLASH_COOKIE));
        let keep_alive = head.keep_alive();
        let span = info_span!(
            "request",
            request_id = %id,
            method = %head.method,
            path = %head.path,
        );
        stats.record_request();
        debug!(
            request_id = %id,
            method = %head.method,
            path = %head.path,
            keep_alive = keep_alive,
            header_count = head.headers.len(),
            cookie_count = cookies.len(),
            "Request context created"
        );
        Self {
            id,
            head,
            query,
            cookies,
            keep_alive,
            route: None,
            decoder: None,
            decode_error: None,
            parsed_body: None,
            session,
            flash,
            content,
            decoder_config,
            stats,
            span: Some(span),
            cleaned: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.head.path
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// Get a query parameter by name. The last occurrence wins.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .rfind(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Media type of the body, without parameters.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.head
            .content_type()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[must_use]
    pub fn route(&self) -> Option<&Arc<dyn Route>> {
        self.route.as_ref()
    }

    pub(crate) fn bind_route(&mut self, route: Arc<dyn Route>) {
        self.route = Some(route);
    }

    #[must_use]
    pub fn content_engine(&self) -> &Arc<dyn ContentEngine> {
        &self.content
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    #[must_use]
    pub fn flash(&self) -> &Flash {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut Flash {
        &mut self.flash
    }

    /// Span covering this request's log events.
    #[must_use]
    pub fn span(&self) -> Span {
        self.span.clone().unwrap_or_else(Span::none)
    }

    /// Feed one body chunk, creating the decoder on first use.
    ///
    /// A decode fault is recorded, not raised; later chunks are ignored and
    /// dispatch reports the fault.
    pub fn decode_content(&mut self, chunk: &[u8]) {
        if self.decode_error.is_some() || self.cleaned {
            return;
        }
        if self.decoder.is_none() {
            match BodyDecoder::new(
                self.head.content_type(),
                &self.decoder_config,
                Arc::clone(&self.stats),
            ) {
                Ok(decoder) => {
                    debug!(
                        request_id = %self.id,
                        content_type = ?self.head.content_type(),
                        "Body decoder created"
                    );
                    self.decoder = Some(decoder);
                }
                Err(e) => {
                    warn!(request_id = %self.id, error = %e, "Body decoder rejected request");
                    self.decode_error = Some(e);
                    return;
                }
            }
        }
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.offer(chunk) {
                warn!(request_id = %self.id, error = %e, "Body decoding failed");
                self.decode_error = Some(e);
            }
        }
    }

    /// Signal that the body is complete.
    pub fn finish_decoding(&mut self) {
        if self.decode_error.is_some() {
            return;
        }
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.finish() {
                warn!(request_id = %self.id, error = %e, "Body decoding failed at end of body");
                self.decode_error = Some(e);
            }
        }
    }

    #[must_use]
    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.decode_error.as_ref()
    }

    pub(crate) fn take_decode_error(&mut self) -> Option<DecodeError> {
        self.decode_error.take()
    }

    #[must_use]
    pub fn decoder(&self) -> Option<&BodyDecoder> {
        self.decoder.as_ref()
    }

    /// Form fields from a urlencoded or multipart body.
    #[must_use]
    pub fn form(&self) -> &[(String, String)] {
        match &self.decoder {
            Some(decoder) => decoder.attributes(),
            None => &[],
        }
    }

    /// First form field named `name`.
    #[must_use]
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn files(&self) -> &[FileItem] {
        match &self.decoder {
            Some(decoder) => decoder.files(),
            None => &[],
        }
    }

    #[must_use]
    pub fn file(&self, field: &str) -> Option<&FileItem> {
        self.files().iter().find(|f| f.field == field)
    }

    /// Reader over a raw (non-form) body.
    pub fn raw_body(&self) -> std::io::Result<Option<Box<dyn Read + Send>>> {
        match &self.decoder {
            Some(decoder) => decoder.raw_reader(),
            None => Ok(None),
        }
    }

    /// The body as a structured value.
    ///
    /// Raw bodies go through the [`BodyParser`](crate::content::BodyParser)
    /// registered for the request's exact media type; form bodies become an
    /// object of their fields. `None` when there is no body or no parser.
    pub fn parsed_body(&mut self) -> Result<Option<&Value>, DecodeError> {
        if self.parsed_body.is_none() {
            self.parsed_body = self.parse_body()?;
        }
        Ok(self.parsed_body.as_ref())
    }

    /// The body converted into `T`.
    pub fn body<T: DeserializeOwned>(&mut self) -> Result<Option<T>, DecodeError> {
        match self.parsed_body()? {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    fn parse_body(&self) -> Result<Option<Value>, DecodeError> {
        let Some(decoder) = self.decoder.as_ref() else {
            return Ok(None);
        };
        if !decoder.is_raw() {
            let fields: Map<String, Value> = decoder
                .attributes()
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            return Ok(Some(Value::Object(fields)));
        }
        let Some(content_type) = self.content_type() else {
            debug!(request_id = %self.id, "Raw body without content type left unparsed");
            return Ok(None);
        };
        let Some(parser) = self.content.find_parser(content_type) else {
            return Ok(None);
        };
        let Some(mut reader) = decoder.raw_reader()? else {
            return Ok(None);
        };
        parser
            .parse(&mut reader)
            .map(Some)
            .map_err(|source| DecodeError::Parse {
                content_type: content_type.to_string(),
                source,
            })
    }

    /// Release per-request resources. Idempotent; returns `true` on the call
    /// that did the work.
    ///
    /// Order: negotiation state, then the decoder and its temporary files,
    /// then the scoped registration.
    pub fn cleanup(&mut self) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;

        self.parsed_body = None;
        self.decode_error = None;
        if let Some(mut decoder) = self.decoder.take() {
            decoder.destroy();
        }
        self.route = None;
        self.span = None;

        self.stats.record_cleanup();
        debug!(request_id = %self.id, "Request resources released");
        true
    }

    #[must_use]
    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.cleanup();
    }
}
