//! Connection-level request handling and the TCP transport around it.

pub mod codec;
pub mod connection;
pub mod http_server;
pub mod response;
pub mod service;

pub use codec::{RequestCodec, RequestEvent, MAX_REQUEST_HEADERS};
pub use connection::{AsyncDone, AsyncWait, ConnectionHandler, ConnectionState, Dispatched};
pub use http_server::{HttpServer, ServerHandle};
pub use response::{ResponseWriter, WriteOutcome, RENDER_FAILURE_STATUS};
pub use service::{AppService, AppServiceBuilder};
