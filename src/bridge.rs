//! Deferred responses: hand the computation to the background pool and bind
//! its completion back into the response pipeline.
//!
//! A failed computation becomes a generic server fault directly. The
//! [`ErrorHandlerChain`](crate::error_handler::ErrorHandlerChain) is not
//! consulted for it, unlike a failed synchronous invocation.
//!
//! There is no timeout and no cancellation. A computation that never
//! finishes leaves its connection parked.

use crate::ids::RequestId;
use crate::response::{AsyncResponse, HandlerResponse};
use crate::stats::EngineStats;
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use tracing::{error, info};

/// What the completion callback receives.
#[derive(Debug)]
pub struct Resolved {
    pub response: HandlerResponse,
    /// `false` for fault responses, so session state is left untouched
    pub handle_session_cookies: bool,
}

impl Resolved {
    fn from_result(request_id: RequestId, result: anyhow::Result<HandlerResponse>) -> Self {
        match result {
            Ok(response) => {
                info!(
                    request_id = %request_id,
                    status = response.status.as_u16(),
                    "Deferred response computed"
                );
                Resolved {
                    response,
                    handle_session_cookies: true,
                }
            }
            Err(fault) => {
                error!(
                    request_id = %request_id,
                    error = %fault,
                    "Deferred computation failed"
                );
                Resolved {
                    response: HandlerResponse::internal_server_error(fault),
                    handle_session_cookies: false,
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct AsyncResultBridge {
    pool: Arc<WorkerPool>,
    stats: Arc<EngineStats>,
}

impl AsyncResultBridge {
    pub fn new(pool: Arc<WorkerPool>, stats: Arc<EngineStats>) -> Self {
        Self { pool, stats }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Submit `deferred` and call `completion` exactly once with the outcome.
    ///
    /// Returns as soon as the task is enqueued. `completion` runs on the
    /// pool worker that finished the task, or on the caller when the pool
    /// rejected it.
    pub fn bridge<C>(&self, deferred: AsyncResponse, request_id: RequestId, completion: C)
    where
        C: FnOnce(Resolved) + Send + 'static,
    {
        self.stats.record_async_submitted();
        let handle = self.pool.submit(deferred.into_task());
        info!(
            request_id = %request_id,
            task_id = handle.id(),
            pool_name = %self.pool.name(),
            "Deferred response submitted"
        );
        let stats = Arc::clone(&self.stats);
        handle.on_complete(move |result| {
            stats.record_async_completed();
            completion(Resolved::from_result(request_id, result));
        });
    }
}
