//! # Dispatcher Module
//!
//! Resolves a [`Route`](crate::router::Route) for the request in a
//! [`RequestContext`](crate::context::RequestContext), invokes it inside a
//! failure boundary, and converts every failure into a response.
//!
//! ## Request Flow
//!
//! 1. The router resolves a route for (method, path)
//! 2. No route: start from `404 Not Found` and consult every error handler's
//!    `on_no_route`; the last answer wins
//! 3. Route found: bind it to the context and invoke it
//! 4. A recorded body decode fault is reported instead of invoking
//! 5. Invocation fault: unwrap the immediate cause, consult every error
//!    handler's `on_error`; when nobody answers, respond with a generic
//!    server fault carrying the cause
//!
//! ## Error Handling
//!
//! - Handler panics are caught and treated as faults without a wrapped cause
//! - The dispatcher never returns an error; the caller only branches on
//!   [`Outcome::Ready`](crate::response::Outcome) versus
//!   [`Outcome::Deferred`](crate::response::Outcome)

mod core;

pub use core::Dispatcher;
