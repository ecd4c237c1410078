//! # brrtengine
//!
//! **brrtengine** is the per-connection request/response engine of a
//! coroutine-powered HTTP/1.1 server built on the `may` runtime. It sits
//! between the transport and the application: it turns decoded request
//! events into a [`RequestContext`](context::RequestContext), finds a
//! route, invokes it, and writes whatever the route produced back to the
//! connection.
//!
//! ## Architecture
//!
//! - **[`server`]** - Connection state machine, response writer, request
//!   codec, the [`AppService`](server::AppService) wiring and a TCP transport
//! - **[`context`]** - Per-request state: head, query, cookies, body
//!   decoding with disk spill, session and flash scopes
//! - **[`dispatcher`]** - Route lookup, invocation and fault recovery
//! - **[`router`]** - The [`Route`](router::Route) and
//!   [`Router`](router::Router) seams plus an exact-match table
//! - **[`content`]** - Body parsers and response serializers selected by
//!   media type
//! - **[`error_handler`]** - Ordered chain of application error hooks
//! - **[`bridge`]** / **[`worker_pool`]** - Deferred responses computed on a
//!   bounded pool of worker coroutines
//! - **[`response`]** - What routes return, and how bodies render
//! - **[`runtime_config`]** / **[`logging`]** - `BRRTE_*` configuration and
//!   structured tracing
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Transport
//!     participant Conn as ConnectionHandler
//!     participant Ctx as RequestContext
//!     participant Disp as Dispatcher
//!     participant Route
//!     participant Pool as WorkerPool
//!     participant Writer as ResponseWriter
//!
//!     Transport->>Conn: on_headers(head)
//!     Conn->>Ctx: new (request_id, span)
//!     Transport->>Conn: on_body_chunk(bytes)
//!     Conn->>Ctx: decode_content (POST/PUT)
//!     Transport->>Conn: on_body_end()
//!     Conn->>Disp: dispatch(ctx)
//!     Disp->>Route: invoke(ctx)
//!     alt Ready
//!         Route-->>Disp: HandlerResponse
//!         Disp-->>Conn: Outcome::Ready
//!         Conn->>Writer: write(ctx, response)
//!     else Deferred
//!         Route-->>Disp: AsyncResponse
//!         Disp-->>Conn: Outcome::Deferred
//!         Conn->>Pool: submit
//!         Pool-->>Writer: completion: write(ctx, response)
//!     end
//!     Writer-->>Transport: bytes
//!     Conn->>Ctx: cleanup()
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use brrtengine::response::{HandlerResponse, Outcome};
//! use brrtengine::router::RouteTable;
//! use brrtengine::server::{AppService, HttpServer};
//! use http::Method;
//!
//! let routes = RouteTable::new()
//!     .route(Method::GET, "/hello", |_ctx| {
//!         Ok(HandlerResponse::ok().with_text("hello").into())
//!     })
//!     .route(Method::GET, "/slow", |_ctx| {
//!         Ok(Outcome::deferred(|| Ok(HandlerResponse::ok().with_text("done"))))
//!     });
//!
//! let service = AppService::builder().routes(routes).build();
//! let handle = HttpServer(service).start("127.0.0.1:8080").unwrap();
//! handle.join().unwrap();
//! ```
//!
//! ## Runtime Considerations
//!
//! The engine uses the `may` coroutine runtime, not tokio:
//!
//! - Connections and pool workers are coroutines
//! - Worker stack size is configurable via `BRRTE_STACK_SIZE`
//! - A connection parked on a deferred response yields its coroutine until
//!   the pool finishes the computation

pub mod bridge;
pub mod content;
pub mod context;
pub mod dispatcher;
pub mod error_handler;
pub mod fault;
pub mod ids;
pub mod logging;
pub mod response;
pub mod router;
pub mod runtime_config;
pub mod server;
pub mod stats;
pub mod worker_pool;

pub use content::{BodyParser, ContentEngine, ContentRegistry, ContentSerializer};
pub use context::{RequestContext, RequestHead};
pub use dispatcher::Dispatcher;
pub use error_handler::{ErrorHandler, ErrorHandlerChain};
pub use ids::RequestId;
pub use response::{AsyncResponse, HandlerResponse, Outcome};
pub use runtime_config::EngineConfig;
pub use server::{AppService, ConnectionHandler, HttpServer};
