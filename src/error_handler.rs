//! # Error Handler Chain
//!
//! Ordered collaborators consulted when no route matches and when a route
//! invocation fails.
//!
//! Every registered handler is called, in registration order, and each
//! answer overwrites the previous one, so whenever several handlers are
//! registered only the last answering handler's decision is observable.
//! A handler that returns `None` leaves the running result untouched.

use crate::context::RequestContext;
use crate::response::HandlerResponse;
use crate::router::Route;
use arc_swap::ArcSwap;
use http::Method;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub trait ErrorHandler: Send + Sync {
    /// Called when no route matches `method` + `path`.
    fn on_no_route(&self, _method: &Method, _path: &str) -> Option<HandlerResponse> {
        None
    }

    /// Called when `route` failed while serving `ctx`. `fault` is already
    /// unwrapped to its immediate cause.
    fn on_error(
        &self,
        _ctx: &RequestContext,
        _route: &dyn Route,
        _fault: &Arc<anyhow::Error>,
    ) -> Option<HandlerResponse> {
        None
    }
}

/// Thread-safe, copy-on-write list of [`ErrorHandler`]s.
pub struct ErrorHandlerChain {
    handlers: ArcSwap<Vec<Arc<dyn ErrorHandler>>>,
    write_lock: Mutex<()>,
}

impl Default for ErrorHandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandlerChain {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn register(&self, handler: Arc<dyn ErrorHandler>) {
        let _guard = self.write_lock.lock();
        let mut next = Vec::clone(&self.handlers.load());
        next.push(handler);
        info!(total_handlers = next.len(), "Error handler registered");
        self.handlers.store(Arc::new(next));
    }

    /// Returns `false` when `handler` was not registered.
    pub fn unregister(&self, handler: &Arc<dyn ErrorHandler>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.handlers.load();
        let next: Vec<Arc<dyn ErrorHandler>> = current
            .iter()
            .filter(|h| !Arc::ptr_eq(h, handler))
            .cloned()
            .collect();
        if next.len() == current.len() {
            return false;
        }
        info!(total_handlers = next.len(), "Error handler unregistered");
        self.handlers.store(Arc::new(next));
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every handler about a missing route. Starts from `fallback`; each
    /// handler's answer replaces the running result.
    pub fn no_route(
        &self,
        method: &Method,
        path: &str,
        fallback: HandlerResponse,
    ) -> HandlerResponse {
        let handlers = self.handlers.load_full();
        let mut result = fallback;
        for (idx, handler) in handlers.iter().enumerate() {
            let answer = handler.on_no_route(method, path);
            debug!(
                handler_idx = idx,
                answered = answer.is_some(),
                "Error handler consulted for missing route"
            );
            if let Some(answer) = answer {
                result = answer;
            }
        }
        result
    }

    /// Ask every handler about a failed invocation; same overwrite semantics
    /// as [`no_route`](Self::no_route), starting from nothing.
    pub fn error(
        &self,
        ctx: &RequestContext,
        route: &dyn Route,
        fault: &Arc<anyhow::Error>,
    ) -> Option<HandlerResponse> {
        let handlers = self.handlers.load_full();
        let mut result = None;
        for (idx, handler) in handlers.iter().enumerate() {
            let answer = handler.on_error(ctx, route, fault);
            debug!(
                handler_idx = idx,
                answered = answer.is_some(),
                "Error handler consulted for fault"
            );
            if answer.is_some() {
                result = answer;
            }
        }
        result
    }
}
