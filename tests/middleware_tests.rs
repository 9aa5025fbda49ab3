//! Discovery middleware over an axum router

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Extension, Json, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::post,
};
use serde_json::{Value, json};
use tower::ServiceExt;

use vmcp_gateway::aggregator::Aggregator;
use vmcp_gateway::context::{CallContext, Identity};
use vmcp_gateway::discovery::{
    DefaultManager, DiscoveryLayerState, DiscoveryOptions, SESSION_ID_HEADER, with_discovery,
};
use vmcp_gateway::session::SessionManager;
use vmcp_gateway::vmcp::{
    AggregatedCapabilities, Backend, BackendTarget, ImmutableRegistry, RoutingTable, Tool,
};
use vmcp_gateway::{Error, Result};

struct StubAggregator {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl StubAggregator {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: false,
        }
    }
}

#[async_trait]
impl Aggregator for StubAggregator {
    async fn aggregate_capabilities(
        &self,
        _ctx: &CallContext,
        backends: &[Backend],
    ) -> Result<AggregatedCapabilities> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::BackendUnavailable("backend down".into()));
        }

        let mut routing_table = RoutingTable::default();
        let mut tools = Vec::new();
        for backend in backends {
            let name = format!("{}_search", backend.id);
            routing_table.tools.insert(
                name.clone(),
                BackendTarget {
                    workload_id: backend.id.clone(),
                    original_capability_name: Some("search".into()),
                    ..BackendTarget::default()
                },
            );
            tools.push(Tool {
                name,
                backend_id: backend.id.clone(),
                ..Tool::default()
            });
        }
        Ok(AggregatedCapabilities {
            tools,
            routing_table,
            ..AggregatedCapabilities::default()
        })
    }
}

async fn authenticate(mut request: Request<Body>, next: Next) -> Response {
    request.extensions_mut().insert(Identity::new("alice"));
    next.run(request).await
}

async fn handler(Extension(ctx): Extension<CallContext>) -> Json<Value> {
    let tools: Vec<String> = ctx
        .capabilities()
        .map(|caps| caps.tools.iter().map(|t| t.name.clone()).collect())
        .unwrap_or_default();
    Json(json!({
        "tools": tools,
        "session": ctx.session_id(),
        "user": ctx.identity().map(|i| i.subject.clone()),
    }))
}

struct Harness {
    app: Router,
    aggregator: Arc<StubAggregator>,
    sessions: Arc<SessionManager>,
}

fn harness(aggregator: StubAggregator, timeout: Duration) -> Harness {
    let aggregator = Arc::new(aggregator);
    let manager = Arc::new(DefaultManager::new(
        aggregator.clone(),
        DiscoveryOptions::default(),
    ));
    let registry = Arc::new(ImmutableRegistry::new(vec![Backend::new("github", "GitHub")]));
    let sessions = Arc::new(SessionManager::default());
    let state = DiscoveryLayerState::new(manager, registry, Arc::clone(&sessions))
        .with_timeout(timeout);

    let app = with_discovery(Router::new().route("/mcp", post(handler)), state)
        .layer(middleware::from_fn(authenticate));
    Harness {
        app,
        aggregator,
        sessions,
    }
}

fn request(session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/mcp");
    if let Some(id) = session {
        builder = builder.header(SESSION_ID_HEADER, id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn initialize_discovers_and_creates_session() {
    let h = harness(StubAggregator::new(), Duration::from_secs(5));

    let response = h.app.clone().oneshot(request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .expect("session header");

    let body = body_json(response).await;
    assert_eq!(body["tools"], json!(["github_search"]));
    assert_eq!(body["user"], "alice");

    let session = h.sessions.get(&session_id).expect("stored session");
    let table = session.routing_table().expect("routing table");
    assert!(table.tools.contains_key("github_search"));
    assert_eq!(h.aggregator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subsequent_requests_reuse_the_session_table() {
    let h = harness(StubAggregator::new(), Duration::from_secs(5));

    let first = h.app.clone().oneshot(request(None)).await.unwrap();
    let session_id = first.headers()[SESSION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    for _ in 0..3 {
        let response = h
            .app
            .clone()
            .oneshot(request(Some(&session_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tools"], json!(["github_search"]));
        assert_eq!(body["session"], session_id.as_str());
    }
    assert_eq!(h.aggregator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_session_is_unauthorized() {
    let h = harness(StubAggregator::new(), Duration::from_secs(5));

    let response = h.app.oneshot(request(Some("nope"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Session not found");
    assert_eq!(h.aggregator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_without_table_is_internal_error() {
    let h = harness(StubAggregator::new(), Duration::from_secs(5));
    let session = h.sessions.create();

    let response = h.app.oneshot(request(Some(session.id()))).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn discovery_timeout_maps_to_gateway_timeout() {
    let slow = StubAggregator {
        delay: Duration::from_secs(5),
        ..StubAggregator::new()
    };
    let h = harness(slow, Duration::from_millis(20));

    let response = h.app.oneshot(request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn discovery_failure_maps_to_service_unavailable() {
    let failing = StubAggregator {
        fail: true,
        ..StubAggregator::new()
    };
    let h = harness(failing, Duration::from_secs(5));

    let response = h.app.oneshot(request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Service Unavailable")
    );
}
