//! # Router Module
//!
//! The routing boundary. The engine only needs two things from routing: a
//! [`Router`] that resolves a [`Route`] for (method, path), and the route's
//! `invoke`. How routes are matched belongs to the router.
//!
//! [`RouteTable`] is a small exact-match implementation so the engine works
//! out of the box; [`FnRoute`] turns a closure into a route.
//!
//! ```rust,ignore
//! use brrtengine::router::RouteTable;
//! use brrtengine::response::HandlerResponse;
//! use http::Method;
//!
//! let table = RouteTable::new().route(Method::GET, "/hello", |_ctx| {
//!     Ok(HandlerResponse::ok().with_text("hello").into())
//! });
//! ```

mod core;

pub use core::{FnRoute, Route, RouteTable, Router};
