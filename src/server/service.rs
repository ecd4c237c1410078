use super::connection::ConnectionHandler;
use super::response::ResponseWriter;
use crate::bridge::AsyncResultBridge;
use crate::content::{ContentEngine, ContentRegistry};
use crate::context::{RequestContext, RequestHead};
use crate::dispatcher::Dispatcher;
use crate::error_handler::ErrorHandlerChain;
use crate::router::{RouteTable, Router};
use crate::runtime_config::EngineConfig;
use crate::stats::EngineStats;
use crate::worker_pool::WorkerPool;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

struct ServiceInner {
    dispatcher: Dispatcher,
    content: Arc<ContentRegistry>,
    error_handlers: Arc<ErrorHandlerChain>,
    bridge: AsyncResultBridge,
    pool: Arc<WorkerPool>,
    writer: ResponseWriter,
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

/// Process-wide engine service: routing, negotiation registries, the error
/// handler chain, the background pool, configuration and counters.
///
/// Cloning is cheap; every connection holds a clone.
#[derive(Clone)]
pub struct AppService {
    inner: Arc<ServiceInner>,
}

impl AppService {
    #[must_use]
    pub fn builder() -> AppServiceBuilder {
        AppServiceBuilder::default()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Parser and serializer registry.
    #[must_use]
    pub fn content(&self) -> &Arc<ContentRegistry> {
        &self.inner.content
    }

    #[must_use]
    pub fn error_handlers(&self) -> &Arc<ErrorHandlerChain> {
        &self.inner.error_handlers
    }

    #[must_use]
    pub fn bridge(&self) -> &AsyncResultBridge {
        &self.inner.bridge
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    #[must_use]
    pub fn response_writer(&self) -> &ResponseWriter {
        &self.inner.writer
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.inner.stats
    }

    /// Fresh context for a request whose headers just arrived.
    #[must_use]
    pub fn new_context(&self, head: RequestHead) -> RequestContext {
        let content: Arc<dyn ContentEngine> = Arc::clone(&self.inner.content) as _;
        RequestContext::new(
            head,
            content,
            self.inner.config.decoder.clone(),
            Arc::clone(&self.inner.stats),
        )
    }

    /// State machine for a new connection writing to `writer`.
    pub fn connection<W: Write + Send + 'static>(&self, writer: W) -> ConnectionHandler<W> {
        ConnectionHandler::new(self.clone(), writer)
    }

    /// Stop the background pool. Deferred responses already queued still
    /// complete; new ones fail with a server fault.
    pub fn shutdown(&self) {
        info!(
            requests_started = self.inner.stats.requests_started(),
            cleanups = self.inner.stats.cleanups(),
            "Engine service shutting down"
        );
        self.inner.pool.shutdown();
    }
}

/// Explicit initialization of an [`AppService`].
#[derive(Default)]
pub struct AppServiceBuilder {
    router: Option<Arc<dyn Router>>,
    config: Option<EngineConfig>,
    content: Option<Arc<ContentRegistry>>,
    error_handlers: Option<Arc<ErrorHandlerChain>>,
    pool_name: Option<String>,
}

impl AppServiceBuilder {
    #[must_use]
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    #[must_use]
    pub fn routes(self, table: RouteTable) -> Self {
        self.router(Arc::new(table))
    }

    /// Defaults to [`EngineConfig::from_env`].
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share an existing registry instead of starting with an empty one.
    #[must_use]
    pub fn content(mut self, content: Arc<ContentRegistry>) -> Self {
        self.content = Some(content);
        self
    }

    #[must_use]
    pub fn error_handlers(mut self, chain: Arc<ErrorHandlerChain>) -> Self {
        self.error_handlers = Some(chain);
        self
    }

    #[must_use]
    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = Some(name.into());
        self
    }

    /// Spawns the background pool; requires the `may` runtime.
    #[must_use]
    pub fn build(self) -> AppService {
        let config = self.config.unwrap_or_else(EngineConfig::from_env);
        let router = self
            .router
            .unwrap_or_else(|| Arc::new(RouteTable::new()) as Arc<dyn Router>);
        let content = self.content.unwrap_or_default();
        let error_handlers = self.error_handlers.unwrap_or_default();
        let stats = Arc::new(EngineStats::new());
        let pool = Arc::new(WorkerPool::new(
            self.pool_name.unwrap_or_else(|| "brrte-async".to_string()),
            config.pool.clone(),
        ));

        info!(
            connection_policy = ?config.connection_policy,
            spill_threshold = config.decoder.spill_threshold,
            async_workers = config.pool.num_workers,
            "Engine service initialized"
        );

        AppService {
            inner: Arc::new(ServiceInner {
                dispatcher: Dispatcher::new(router, Arc::clone(&error_handlers)),
                content,
                error_handlers,
                bridge: AsyncResultBridge::new(Arc::clone(&pool), Arc::clone(&stats)),
                pool,
                writer: ResponseWriter::new(&config),
                config,
                stats,
            }),
        }
    }
}
