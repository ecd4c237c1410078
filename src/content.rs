//! # Content Module
//!
//! Content negotiation: picking the [`BodyParser`] that decodes a request
//! body and the [`ContentSerializer`] that encodes a response body, by
//! content type.
//!
//! Matching is exact string equality: no case folding, no wildcards, no
//! quality values. Callers pass the bare media type (the request context
//! drops `; charset=...` style parameters before lookup). `text/xml` and
//! `text/xml+custom` are unrelated types. When several collaborators declare
//! the same type, the first registered wins.
//!
//! The registry is read on every request and written only when codecs are
//! plugged in or out, so it is a copy-on-write list behind an `ArcSwap`:
//! readers take a snapshot without locking, writers swap in a new list.

use crate::response::Renderable;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

/// Decodes a request body of one content type into a structured value.
pub trait BodyParser: Send + Sync {
    fn content_type(&self) -> &str;
    fn parse(&self, body: &mut dyn Read) -> anyhow::Result<Value>;
}

/// Encodes a renderable's structured value into bytes of one content type.
pub trait ContentSerializer: Send + Sync {
    fn content_type(&self) -> &str;

    /// Replace the renderable's representation with this serializer's output.
    fn serialize(&self, renderable: &mut dyn Renderable) -> anyhow::Result<()>;
}

/// Read side of the negotiation registry; all the core depends on.
pub trait ContentEngine: Send + Sync {
    fn find_serializer(&self, content_type: &str) -> Option<Arc<dyn ContentSerializer>>;
    fn find_parser(&self, content_type: &str) -> Option<Arc<dyn BodyParser>>;
}

/// Copy-on-write list of registered collaborators.
struct Registry<T: ?Sized> {
    items: ArcSwap<Vec<Arc<T>>>,
    write_lock: Mutex<()>,
}

impl<T: ?Sized> Registry<T> {
    fn new() -> Self {
        Self {
            items: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.items.load_full()
    }

    fn register(&self, item: Arc<T>) {
        let _guard = self.write_lock.lock();
        let mut next = Vec::clone(&self.items.load());
        next.push(item);
        self.items.store(Arc::new(next));
    }

    fn unregister(&self, item: &Arc<T>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.items.load();
        let next: Vec<Arc<T>> = current
            .iter()
            .filter(|existing| !Arc::ptr_eq(existing, item))
            .cloned()
            .collect();
        let removed = next.len() != current.len();
        if removed {
            self.items.store(Arc::new(next));
        }
        removed
    }
}

/// Thread-safe parser/serializer registry.
pub struct ContentRegistry {
    parsers: Registry<dyn BodyParser>,
    serializers: Registry<dyn ContentSerializer>,
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parsers: Registry::new(),
            serializers: Registry::new(),
        }
    }

    pub fn register_parser(&self, parser: Arc<dyn BodyParser>) {
        info!(content_type = %parser.content_type(), "Body parser registered");
        self.parsers.register(parser);
    }

    /// Returns `false` when `parser` was not registered.
    pub fn unregister_parser(&self, parser: &Arc<dyn BodyParser>) -> bool {
        let removed = self.parsers.unregister(parser);
        if removed {
            info!(content_type = %parser.content_type(), "Body parser unregistered");
        }
        removed
    }

    pub fn register_serializer(&self, serializer: Arc<dyn ContentSerializer>) {
        info!(content_type = %serializer.content_type(), "Content serializer registered");
        self.serializers.register(serializer);
    }

    /// Returns `false` when `serializer` was not registered.
    pub fn unregister_serializer(&self, serializer: &Arc<dyn ContentSerializer>) -> bool {
        let removed = self.serializers.unregister(serializer);
        if removed {
            info!(content_type = %serializer.content_type(), "Content serializer unregistered");
        }
        removed
    }
}

impl ContentEngine for ContentRegistry {
    fn find_serializer(&self, content_type: &str) -> Option<Arc<dyn ContentSerializer>> {
        let found = self
            .serializers
            .snapshot()
            .iter()
            .find(|s| s.content_type() == content_type)
            .cloned();
        if found.is_none() {
            debug!(content_type = %content_type, "Cannot find a content serializer");
        }
        found
    }

    fn find_parser(&self, content_type: &str) -> Option<Arc<dyn BodyParser>> {
        let found = self
            .parsers
            .snapshot()
            .iter()
            .find(|p| p.content_type() == content_type)
            .cloned();
        if found.is_none() {
            debug!(content_type = %content_type, "Cannot find a body parser");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    impl BodyParser for Named {
        fn content_type(&self) -> &str {
            self.0
        }

        fn parse(&self, _body: &mut dyn Read) -> anyhow::Result<Value> {
            Ok(Value::String(self.1.to_string()))
        }
    }

    fn tag(parser: &Arc<dyn BodyParser>) -> Value {
        parser.parse(&mut std::io::empty()).unwrap()
    }

    #[test]
    fn test_first_registered_wins() {
        let registry = ContentRegistry::new();
        registry.register_parser(Arc::new(Named("text/xml", "first")));
        registry.register_parser(Arc::new(Named("text/xml", "second")));
        for _ in 0..3 {
            let parser = registry.find_parser("text/xml").unwrap();
            assert_eq!(tag(&parser), Value::String("first".into()));
        }
    }

    #[test]
    fn test_exact_match_only() {
        let registry = ContentRegistry::new();
        registry.register_parser(Arc::new(Named("text/xml", "xml")));
        assert!(registry.find_parser("text/xml").is_some());
        assert!(registry.find_parser("TEXT/XML").is_none());
        assert!(registry.find_parser("text/xml+custom").is_none());
        assert!(registry.find_parser("text/xml; charset=utf-8").is_none());
        assert!(registry.find_parser("text/*").is_none());
    }

    #[test]
    fn test_unregister_by_identity() {
        let registry = ContentRegistry::new();
        let first: Arc<dyn BodyParser> = Arc::new(Named("text/xml", "first"));
        let second: Arc<dyn BodyParser> = Arc::new(Named("text/xml", "second"));
        registry.register_parser(Arc::clone(&first));
        registry.register_parser(Arc::clone(&second));

        assert!(registry.unregister_parser(&first));
        assert!(!registry.unregister_parser(&first));
        let parser = registry.find_parser("text/xml").unwrap();
        assert_eq!(tag(&parser), Value::String("second".into()));
    }
}
