//! Dispatcher core - resolves, invokes, and recovers.

use crate::context::RequestContext;
use crate::error_handler::ErrorHandlerChain;
use crate::response::{HandlerResponse, Outcome};
use crate::router::{Route, Router};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Turns a request context into an [`Outcome`].
///
/// Never fails: a missing route and every invocation fault are converted
/// into a response here, through the [`ErrorHandlerChain`].
#[derive(Clone)]
pub struct Dispatcher {
    router: Arc<dyn Router>,
    error_handlers: Arc<ErrorHandlerChain>,
}

impl Dispatcher {
    pub fn new(router: Arc<dyn Router>, error_handlers: Arc<ErrorHandlerChain>) -> Self {
        Self {
            router,
            error_handlers,
        }
    }

    #[must_use]
    pub fn error_handlers(&self) -> &Arc<ErrorHandlerChain> {
        &self.error_handlers
    }

    /// Resolve a route for `ctx`, invoke it, and recover from any fault.
    ///
    /// The caller branches on the result: a ready response is written
    /// immediately, a deferred one goes to the background pool.
    pub fn dispatch(&self, ctx: &mut RequestContext) -> Outcome {
        let span = ctx.span();
        let _entered = span.enter();
        let method = ctx.method().clone();
        let path = ctx.path().to_string();

        let Some(route) = self.router.route_for(&method, &path) else {
            info!(
                request_id = %ctx.id(),
                method = %method,
                path = %path,
                error_handlers = self.error_handlers.len(),
                "No route found"
            );
            let response = self
                .error_handlers
                .no_route(&method, &path, HandlerResponse::not_found());
            return Outcome::Ready(response);
        };

        debug!(
            request_id = %ctx.id(),
            method = %method,
            path = %path,
            route = %route.path_pattern(),
            "Route resolved"
        );
        ctx.bind_route(Arc::clone(&route));

        if let Some(decode_error) = ctx.take_decode_error() {
            warn!(
                request_id = %ctx.id(),
                error = %decode_error,
                "Body could not be decoded - route not invoked"
            );
            let fault = anyhow::Error::new(decode_error);
            return Outcome::Ready(self.recover(ctx, route.as_ref(), fault));
        }

        let start = Instant::now();
        let invoked = catch_unwind(AssertUnwindSafe(|| route.invoke(ctx)));
        let latency_ms = start.elapsed().as_millis() as u64;

        match invoked {
            Ok(Ok(outcome)) => {
                info!(
                    request_id = %ctx.id(),
                    route = %route.path_pattern(),
                    latency_ms = latency_ms,
                    deferred = outcome.is_deferred(),
                    "Route invoked"
                );
                outcome
            }
            Ok(Err(fault)) => {
                let wrapped = fault.has_cause();
                let cause = fault.into_cause();
                error!(
                    request_id = %ctx.id(),
                    route = %route.path_pattern(),
                    latency_ms = latency_ms,
                    unwrapped = wrapped,
                    error = %cause,
                    "Route invocation failed"
                );
                Outcome::Ready(self.recover(ctx, route.as_ref(), cause))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    request_id = %ctx.id(),
                    route = %route.path_pattern(),
                    panic_message = %message,
                    "Route handler panicked"
                );
                let fault = anyhow::anyhow!("route handler panicked: {message}");
                Outcome::Ready(self.recover(ctx, route.as_ref(), fault))
            }
        }
    }

    /// Ask the error handlers for a response; fall back to a server fault
    /// carrying `fault`.
    fn recover(
        &self,
        ctx: &RequestContext,
        route: &dyn Route,
        fault: anyhow::Error,
    ) -> HandlerResponse {
        let fault = Arc::new(fault);
        match self.error_handlers.error(ctx, route, &fault) {
            Some(response) => response,
            None => {
                debug!(request_id = %ctx.id(), "No error handler answered - generic server fault");
                HandlerResponse::internal_server_error(fault)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
