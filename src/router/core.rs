use crate::context::RequestContext;
use crate::fault::InvocationError;
use crate::response::Outcome;
use http::Method;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A resolved (method, path pattern, handler) triple.
pub trait Route: Send + Sync {
    fn method(&self) -> &Method;
    fn path_pattern(&self) -> &str;

    /// Run the handler against `ctx`.
    ///
    /// The context is mutable so the handler can read the decoded body and
    /// touch the session and flash stores.
    fn invoke(&self, ctx: &mut RequestContext) -> Result<Outcome, InvocationError>;
}

impl fmt::Debug for dyn Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({} {})", self.method(), self.path_pattern())
    }
}

/// Resolves a route for a request. Matching strategy belongs to the implementor.
pub trait Router: Send + Sync {
    fn route_for(&self, method: &Method, path: &str) -> Option<Arc<dyn Route>>;
}

type HandlerFn = dyn Fn(&mut RequestContext) -> Result<Outcome, InvocationError> + Send + Sync;

/// Adapts a closure into a [`Route`].
pub struct FnRoute {
    method: Method,
    path: String,
    handler: Box<HandlerFn>,
}

impl FnRoute {
    pub fn new<F>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<Outcome, InvocationError> + Send + Sync + 'static,
    {
        Self {
            method,
            path: path.into(),
            handler: Box::new(handler),
        }
    }
}

impl Route for FnRoute {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path_pattern(&self) -> &str {
        &self.path
    }

    fn invoke(&self, ctx: &mut RequestContext) -> Result<Outcome, InvocationError> {
        (self.handler)(ctx)
    }
}

/// Exact-match routing table: method and path must both be equal.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Arc<dyn Route>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. A later route with the same method and path shadows nothing;
    /// the first one added keeps matching.
    pub fn add(&mut self, route: Arc<dyn Route>) {
        if self
            .routes
            .iter()
            .any(|r| r.method() == route.method() && r.path_pattern() == route.path_pattern())
        {
            warn!(
                method = %route.method(),
                path = %route.path_pattern(),
                "Duplicate route ignored by lookup"
            );
        }
        info!(
            method = %route.method(),
            path = %route.path_pattern(),
            total_routes = self.routes.len() + 1,
            "Route registered"
        );
        self.routes.push(route);
    }

    #[must_use]
    pub fn with_route(mut self, route: Arc<dyn Route>) -> Self {
        self.add(route);
        self
    }

    /// Register a closure for `method` + `path`.
    #[must_use]
    pub fn route<F>(self, method: Method, path: &str, handler: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<Outcome, InvocationError> + Send + Sync + 'static,
    {
        self.with_route(Arc::new(FnRoute::new(method, path, handler)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Router for RouteTable {
    fn route_for(&self, method: &Method, path: &str) -> Option<Arc<dyn Route>> {
        let found = self
            .routes
            .iter()
            .find(|r| r.method() == method && r.path_pattern() == path)
            .cloned();
        debug!(
            method = %method,
            path = %path,
            matched = found.is_some(),
            "Route lookup"
        );
        found
    }
}
