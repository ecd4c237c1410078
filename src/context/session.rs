//! Session and flash stores, carried in cookies.
//!
//! Both payloads are `application/x-www-form-urlencoded` maps. Signing and
//! encryption are not handled here.

use crate::response::{Cookie, HandlerResponse};
use std::collections::BTreeMap;
use tracing::debug;

pub const SESSION_COOKIE: &str = "BRRTE_SESSION";
pub const FLASH_COOKIE: &str = "BRRTE_FLASH";

fn decode(payload: Option<&str>) -> BTreeMap<String, String> {
    payload
        .map(|p| {
            url::form_urlencoded::parse(p.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn encode(data: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(data.iter())
        .finish()
}

/// Per-client string map that survives across requests.
#[derive(Debug, Default, Clone)]
pub struct Session {
    data: BTreeMap<String, String>,
    dirty: bool,
}

impl Session {
    /// Load from the inbound session cookie value.
    #[must_use]
    pub fn from_cookie(value: Option<&str>) -> Self {
        Self {
            data: decode(value),
            dirty: false,
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.data.is_empty() {
            self.data.clear();
            self.dirty = true;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Emit the session cookie on `response` if the session changed.
    pub fn save(&self, response: &mut HandlerResponse) {
        if !self.dirty {
            return;
        }
        let cookie = if self.data.is_empty() {
            Cookie::discard(SESSION_COOKIE)
        } else {
            Cookie::new(SESSION_COOKIE, encode(&self.data)).http_only(true)
        };
        debug!(entries = self.data.len(), "Session cookie written");
        response.cookies.push(cookie);
    }
}

/// Values that live for exactly one follow-up request.
#[derive(Debug, Default, Clone)]
pub struct Flash {
    incoming: BTreeMap<String, String>,
    outgoing: BTreeMap<String, String>,
}

impl Flash {
    #[must_use]
    pub fn from_cookie(value: Option<&str>) -> Self {
        Self {
            incoming: decode(value),
            outgoing: BTreeMap::new(),
        }
    }

    /// A value put during this request, else one carried from the previous request.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.outgoing
            .get(key)
            .or_else(|| self.incoming.get(key))
            .map(String::as_str)
    }

    /// Make `value` available to the next request.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing.insert(key.into(), value.into());
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.put("success", message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.put("error", message);
    }

    /// Carry every inbound value over to the next request as well.
    pub fn keep(&mut self) {
        for (k, v) in &self.incoming {
            self.outgoing.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn discard(&mut self) {
        self.outgoing.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }

    /// Emit the flash cookie: new values are written, a consumed inbound
    /// flash is discarded.
    pub fn save(&self, response: &mut HandlerResponse) {
        if !self.outgoing.is_empty() {
            response
                .cookies
                .push(Cookie::new(FLASH_COOKIE, encode(&self.outgoing)).http_only(true));
        } else if !self.incoming.is_empty() {
            response.cookies.push(Cookie::discard(FLASH_COOKIE));
        }
    }
}
