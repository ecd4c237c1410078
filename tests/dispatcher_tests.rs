#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use brrtengine::context::RequestContext;
use brrtengine::error_handler::{ErrorHandler, ErrorHandlerChain};
use anyhow::Context;
use brrtengine::fault::{FaultCause, InvocationError};
use brrtengine::response::{HandlerResponse, Outcome};
use brrtengine::router::{Route, RouteTable};
use brrtengine::server::AppService;
use common::engine::{service, service_with, test_config};
use common::wire::{head, parse_response, RawResponse};
use http::{Method, StatusCode};
use std::io;
use std::sync::{Arc, Mutex};

/// Error handler that records every call and answers with a fixed response.
struct Recording {
    answer: Option<(StatusCode, &'static str)>,
    calls: Mutex<Vec<String>>,
}

impl Recording {
    fn new(answer: Option<(StatusCode, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self) -> Option<HandlerResponse> {
        self.answer
            .map(|(status, text)| HandlerResponse::status(status).with_text(text))
    }
}

impl ErrorHandler for Recording {
    fn on_no_route(&self, method: &Method, path: &str) -> Option<HandlerResponse> {
        self.calls.lock().unwrap().push(format!("no_route {method} {path}"));
        self.respond()
    }

    fn on_error(
        &self,
        _ctx: &RequestContext,
        route: &dyn Route,
        fault: &Arc<anyhow::Error>,
    ) -> Option<HandlerResponse> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("error {} {fault}", route.path_pattern()));
        self.respond()
    }
}

fn chain_of(handlers: &[Arc<Recording>]) -> Arc<ErrorHandlerChain> {
    let chain = Arc::new(ErrorHandlerChain::new());
    for h in handlers {
        chain.register(Arc::clone(h) as Arc<dyn ErrorHandler>);
    }
    chain
}

fn ready(outcome: Outcome) -> HandlerResponse {
    match outcome {
        Outcome::Ready(response) => response,
        Outcome::Deferred(_) => panic!("expected a ready response"),
    }
}

fn written(service: &AppService, ctx: &RequestContext, response: HandlerResponse) -> RawResponse {
    let mut out = Vec::new();
    service
        .response_writer()
        .write(ctx, response, true, &mut out)
        .unwrap();
    parse_response(&out)
}

fn dispatch_get(service: &AppService, path: &str) -> (RequestContext, HandlerResponse) {
    let mut ctx = service.new_context(head(Method::GET, path, &[]));
    let response = ready(service.dispatcher().dispatch(&mut ctx));
    (ctx, response)
}

#[test]
fn test_no_route_uses_error_handler_answer() {
    let handler = Recording::new(Some((StatusCode::NOT_FOUND, "not found")));
    let svc = service_with(RouteTable::new(), chain_of(&[Arc::clone(&handler)]), test_config());

    let (ctx, response) = dispatch_get(&svc, "/missing");
    let raw = written(&svc, &ctx, response);

    assert_eq!(raw.status, 404);
    assert_eq!(raw.body_text(), "not found");
    assert_eq!(handler.calls(), vec!["no_route GET /missing".to_string()]);
}

#[test]
fn test_no_route_without_handlers_is_plain_not_found() {
    let svc = service(RouteTable::new());
    let (ctx, response) = dispatch_get(&svc, "/nothing");
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(ctx.route().is_none());
}

#[test]
fn test_last_answering_handler_wins() {
    let first = Recording::new(Some((StatusCode::NOT_FOUND, "first")));
    let second = Recording::new(Some((StatusCode::GONE, "second")));
    let silent = Recording::new(None);
    let chain = chain_of(&[Arc::clone(&first), Arc::clone(&second), Arc::clone(&silent)]);
    let svc = service_with(RouteTable::new(), chain, test_config());

    let (ctx, response) = dispatch_get(&svc, "/x");
    let raw = written(&svc, &ctx, response);

    assert_eq!(raw.status, 410);
    assert_eq!(raw.body_text(), "second");
    // every handler is consulted
    assert_eq!(first.calls().len(), 1);
    assert_eq!(second.calls().len(), 1);
    assert_eq!(silent.calls().len(), 1);
}

#[test]
fn test_failed_route_reports_unwrapped_cause() {
    let handler = Recording::new(Some((StatusCode::SERVICE_UNAVAILABLE, "try later")));
    let routes = RouteTable::new().route(Method::GET, "/boom", |_ctx| {
        Err(InvocationError::wrap(
            "controller failed",
            anyhow::anyhow!("database unreachable"),
        ))
    });
    let svc = service_with(routes, chain_of(&[Arc::clone(&handler)]), test_config());

    let (_ctx, response) = dispatch_get(&svc, "/boom");

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        handler.calls(),
        vec!["error /boom database unreachable".to_string()]
    );
}

#[test]
fn test_context_wrapped_error_reports_its_cause() {
    let handler = Recording::new(None);
    let routes = RouteTable::new().route(Method::GET, "/ctx", |_ctx| {
        Err::<(), _>(io::Error::other("db down")).context("controller failed")?;
        Ok(HandlerResponse::ok().into())
    });
    let svc = service_with(routes, chain_of(&[Arc::clone(&handler)]), test_config());

    let (ctx, response) = dispatch_get(&svc, "/ctx");

    assert_eq!(handler.calls(), vec!["error /ctx db down".to_string()]);
    let fault = response.fault.clone().unwrap();
    let cause = fault.downcast_ref::<FaultCause>().unwrap();
    assert!(cause.cause().downcast_ref::<io::Error>().is_some());
    let raw = written(&svc, &ctx, response);
    assert_eq!(raw.status, 500);
    assert_eq!(raw.body_text(), "db down");
}

#[test]
fn test_failed_route_without_answer_is_server_fault() {
    let silent = Recording::new(None);
    let routes = RouteTable::new().route(Method::GET, "/boom", |_ctx| {
        Err(anyhow::anyhow!("kaput").into())
    });
    let svc = service_with(routes, chain_of(&[Arc::clone(&silent)]), test_config());

    let (ctx, response) = dispatch_get(&svc, "/boom");
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.fault.as_ref().map(|f| f.to_string()),
        Some("kaput".to_string())
    );
    let raw = written(&svc, &ctx, response);
    assert_eq!(raw.status, 500);
    assert_eq!(raw.body_text(), "kaput");
    assert_eq!(silent.calls().len(), 1);
}

#[test]
fn test_panicking_route_is_recovered() {
    let routes = RouteTable::new().route(Method::GET, "/panic", |_ctx| {
        panic!("handler bug");
    });
    let svc = service(routes);

    let (_ctx, response) = dispatch_get(&svc, "/panic");
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    let message = response.fault.as_ref().unwrap().to_string();
    assert!(message.contains("handler bug"), "{message}");
}

#[test]
fn test_matched_route_is_bound_to_context() {
    let routes = RouteTable::new().route(Method::GET, "/bound", |ctx| {
        let pattern = ctx.route().map(|r| r.path_pattern().to_string()).unwrap();
        Ok(HandlerResponse::ok().with_text(pattern).into())
    });
    let svc = service(routes);

    let (ctx, response) = dispatch_get(&svc, "/bound?ignored=1");
    assert_eq!(ctx.route().unwrap().path_pattern(), "/bound");
    assert_eq!(written(&svc, &ctx, response).body_text(), "/bound");
}

#[test]
fn test_method_must_match() {
    let routes = RouteTable::new().route(Method::POST, "/only-post", |_ctx| {
        Ok(HandlerResponse::ok().into())
    });
    let svc = service(routes);
    let (_ctx, response) = dispatch_get(&svc, "/only-post");
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[test]
fn test_decode_failure_skips_route_and_reaches_error_handlers() {
    let handler = Recording::new(Some((StatusCode::BAD_REQUEST, "bad body")));
    let invoked = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&invoked);
    let routes = RouteTable::new().route(Method::POST, "/upload", move |_ctx| {
        *flag.lock().unwrap() = true;
        Ok(HandlerResponse::ok().into())
    });
    let svc = service_with(routes, chain_of(&[Arc::clone(&handler)]), test_config());

    let mut ctx = svc.new_context(head(
        Method::POST,
        "/upload",
        &[("Content-Type", "multipart/form-data")],
    ));
    ctx.decode_content(b"whatever");
    ctx.finish_decoding();
    let response = ready(svc.dispatcher().dispatch(&mut ctx));

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(!*invoked.lock().unwrap());
    let calls = handler.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("error /upload"), "{calls:?}");
}

#[test]
fn test_deferred_outcome_is_passed_through() {
    let routes = RouteTable::new().route(Method::GET, "/later", |_ctx| {
        Ok(Outcome::deferred(|| Ok(HandlerResponse::ok())))
    });
    let svc = service(routes);
    let mut ctx = svc.new_context(head(Method::GET, "/later", &[]));
    assert!(svc.dispatcher().dispatch(&mut ctx).is_deferred());
}

#[test]
fn test_unregistered_handler_is_no_longer_consulted() {
    let handler = Recording::new(Some((StatusCode::IM_A_TEAPOT, "teapot")));
    let chain = chain_of(&[Arc::clone(&handler)]);
    let svc = service_with(RouteTable::new(), Arc::clone(&chain), test_config());

    let as_dyn: Arc<dyn ErrorHandler> = Arc::clone(&handler) as _;
    assert!(chain.unregister(&as_dyn));

    let (_ctx, response) = dispatch_get(&svc, "/x");
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(handler.calls().is_empty());
}
