//! The HTTP front door. Every declared endpoint becomes a route that forwards
//! the request to its sandbox's invocation endpoint and turns the response
//! envelope back into a plain HTTP response.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use axum::{
    body::{Body, Bytes},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
    routing::{MethodFilter, MethodRouter},
    Router,
};
use axum_server::Handle;
use container_runtime::INVOCATION_PATH;
use data_model::Endpoint;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::http_objects::{InvocationResponse, RouterError};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Method name that matches every HTTP method.
const ANY_METHOD: &str = "any";

/// Sent to the sandbox when the inbound request carries no payload.
const EMPTY_EVENT: &str = "{}";

#[derive(Debug, Clone)]
struct RouteDefinition {
    endpoint: Endpoint,
    port: u16,
}

/// Where one route's requests go.
#[derive(Clone)]
struct InvocationTarget {
    client: reqwest::Client,
    endpoint: Arc<Endpoint>,
    url: Arc<str>,
}

struct RunningServer {
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

pub struct RequestRouter {
    listen_addr: SocketAddr,
    sandbox_host: String,
    shutdown_timeout: Duration,
    client: reqwest::Client,
    routes: Mutex<Vec<RouteDefinition>>,
    started: AtomicBool,
    server: Mutex<Option<RunningServer>>,
}

impl RequestRouter {
    pub fn new(listen_addr: SocketAddr, sandbox_host: &str, shutdown_timeout: Duration) -> Self {
        Self {
            listen_addr,
            sandbox_host: sandbox_host.to_string(),
            shutdown_timeout,
            client: reqwest::Client::new(),
            routes: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            server: Mutex::new(None),
        }
    }

    /// Register a route. Only valid before [`RequestRouter::run`].
    pub fn add_route(&self, method: &str, path: &str, port: u16) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            bail!("cannot add route {} {} to a running router", method, path);
        }
        let endpoint = Endpoint::new(method, path);
        method_filter(&endpoint.method)?;
        let segments = parse_path(&endpoint.url_path)?;

        let mut routes = self.routes.lock().map_err(|_| anyhow!("route table poisoned"))?;
        if routes.iter().any(|r| r.endpoint == endpoint) {
            bail!("route {} is already registered", endpoint);
        }
        for route in routes.iter() {
            if paths_conflict(&parse_path(&route.endpoint.url_path)?, &segments) {
                bail!(
                    "route {} conflicts with {}: parameters at the same position must share a name",
                    endpoint,
                    route.endpoint
                );
            }
        }
        debug!(endpoint = %endpoint, port = port, "adding route");
        routes.push(RouteDefinition { endpoint, port });
        Ok(())
    }

    fn create_routes(&self) -> Result<Router> {
        let routes = self.routes.lock().map_err(|_| anyhow!("route table poisoned"))?;

        let mut by_path: BTreeMap<String, Vec<&RouteDefinition>> = BTreeMap::new();
        for route in routes.iter() {
            by_path
                .entry(route.endpoint.url_path.clone())
                .or_default()
                .push(route);
        }

        let mut router = Router::new();
        for (path, definitions) in by_path {
            let mut method_router = MethodRouter::new();
            for definition in definitions {
                let target = InvocationTarget {
                    client: self.client.clone(),
                    endpoint: Arc::new(definition.endpoint.clone()),
                    url: Arc::from(invocation_url(&self.sandbox_host, definition.port)),
                };
                let handler = move |method: Method, body: Bytes| {
                    let target = target.clone();
                    async move { invoke(target, method, body).await }
                };
                method_router = match method_filter(&definition.endpoint.method)? {
                    Some(filter) => method_router.on(filter, handler),
                    None => method_router.fallback(handler),
                };
            }
            router = router.route(&axum_path(&path)?, method_router);
        }
        Ok(router.layer(TraceLayer::new_for_http()))
    }

    /// Bind and start serving in the background. Returns the bound address.
    pub async fn run(&self) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("router is already running");
        }
        let routes = self.create_routes()?;

        let handle = Handle::new();
        let task = tokio::spawn(
            axum_server::bind(self.listen_addr)
                .handle(handle.clone())
                .serve(routes.into_make_service()),
        );

        let addr = match handle.listening().await {
            Some(addr) => addr,
            None => {
                let err = match task.await {
                    Ok(Err(e)) => anyhow!(e),
                    Ok(Ok(())) => anyhow!("server exited before listening"),
                    Err(e) => anyhow!(e),
                };
                return Err(err.context(format!("binding router to {}", self.listen_addr)));
            }
        };
        info!("router listening on {}", addr);

        let mut server = self.server.lock().map_err(|_| anyhow!("router state poisoned"))?;
        *server = Some(RunningServer { handle, task });
        Ok(addr)
    }

    /// Stop accepting connections and let in-flight requests finish, bounded
    /// by the shutdown timeout. A router that never ran stops immediately.
    pub async fn shutdown(&self) -> Result<()> {
        let server = self
            .server
            .lock()
            .map_err(|_| anyhow!("router state poisoned"))?
            .take();
        let Some(server) = server else {
            return Ok(());
        };

        info!("shutting down router");
        server.handle.graceful_shutdown(Some(self.shutdown_timeout));
        server
            .task
            .await
            .context("router task failed")?
            .context("router server failed")?;
        Ok(())
    }
}

fn invocation_url(sandbox_host: &str, port: u16) -> String {
    format!("http://{}:{}{}", sandbox_host, port, INVOCATION_PATH)
}

/// `None` means the route accepts every method.
fn method_filter(method: &str) -> Result<Option<MethodFilter>> {
    if method == ANY_METHOD {
        return Ok(None);
    }
    let parsed = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid HTTP method {}", method))?;
    let filter =
        MethodFilter::try_from(parsed).map_err(|_| anyhow!("unsupported HTTP method {}", method))?;
    Ok(Some(filter))
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    /// `{name+}`, matches the rest of the path.
    Greedy(&'a str),
}

fn parse_segment(segment: &str) -> Result<Segment<'_>> {
    let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
        if segment.contains(['{', '}']) {
            bail!("unsupported path segment {}", segment);
        }
        return Ok(Segment::Literal(segment));
    };
    let (name, greedy) = match inner.strip_suffix('+') {
        Some(name) => (name, true),
        None => (inner, false),
    };
    if name.is_empty() || name.contains(['{', '}', '*', '+']) {
        bail!("invalid path parameter {}", segment);
    }
    Ok(if greedy {
        Segment::Greedy(name)
    } else {
        Segment::Param(name)
    })
}

/// A greedy parameter may only be the last segment, and parameter names are
/// unique within a path.
fn parse_path(path: &str) -> Result<Vec<Segment<'_>>> {
    if !path.starts_with('/') {
        bail!("route path {} must start with '/'", path);
    }
    let segments = path
        .split('/')
        .map(parse_segment)
        .collect::<Result<Vec<_>>>()?;

    let mut names = BTreeSet::new();
    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Literal(_) => {}
            Segment::Greedy(_) if i + 1 != segments.len() => {
                bail!("greedy parameter {} must end the route path {}", segment_str(segment), path);
            }
            Segment::Param(name) | Segment::Greedy(name) => {
                if !names.insert(*name) {
                    bail!("parameter {{{}}} appears twice in {}", name, path);
                }
            }
        }
    }
    Ok(segments)
}

fn segment_str(segment: &Segment) -> String {
    match segment {
        Segment::Literal(literal) => literal.to_string(),
        Segment::Param(name) => format!("{{{}}}", name),
        Segment::Greedy(name) => format!("{{{}+}}", name),
    }
}

/// Two paths conflict when they share every segment up to a position that
/// both capture with a different parameter.
fn paths_conflict(a: &[Segment], b: &[Segment]) -> bool {
    for (x, y) in a.iter().zip(b) {
        match (x, y) {
            (x, y) if x == y => continue,
            (Segment::Literal(_), _) | (_, Segment::Literal(_)) => return false,
            _ => return true,
        }
    }
    false
}

/// Greedy template parameters (`{proxy+}`) become axum wildcards.
fn axum_path(path: &str) -> Result<String> {
    let segments: Vec<String> = parse_path(path)?
        .iter()
        .map(|segment| match segment {
            Segment::Greedy(name) => format!("{{*{}}}", name),
            other => segment_str(other),
        })
        .collect();
    Ok(segments.join("/"))
}

fn carries_body(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    )
}

async fn invoke(
    target: InvocationTarget,
    method: Method,
    body: Bytes,
) -> Result<Response, RouterError> {
    debug!(endpoint = %target.endpoint, %method, "got request");

    let payload = if carries_body(&method) && !body.is_empty() {
        body
    } else {
        Bytes::from_static(EMPTY_EVENT.as_bytes())
    };

    let upstream = target
        .client
        .post(target.url.as_ref())
        .body(payload)
        .send()
        .await
        .map_err(|e| {
            warn!(endpoint = %target.endpoint, error = %e, "could not reach sandbox");
            RouterError::internal_error_str("error sending request")
        })?;

    if upstream.status() != StatusCode::OK {
        warn!(endpoint = %target.endpoint, status = %upstream.status(), "bad status from sandbox");
        return Err(RouterError::internal_error_str("bad status from lambda"));
    }

    let raw = upstream.bytes().await.map_err(|e| {
        warn!(endpoint = %target.endpoint, error = %e, "could not read sandbox response");
        RouterError::internal_error_str("could not read response from lambda")
    })?;
    let envelope: InvocationResponse = serde_json::from_slice(&raw).map_err(|e| {
        warn!(endpoint = %target.endpoint, error = %e, "could not parse sandbox response");
        RouterError::internal_error_str("invalid lambda response")
    })?;

    if envelope.status_code == 0 {
        return Err(RouterError::bad_request(&envelope.body));
    }
    let status = StatusCode::from_u16(envelope.status_code).map_err(|_| {
        warn!(endpoint = %target.endpoint, status = envelope.status_code, "invalid status code in sandbox response");
        RouterError::internal_error_str("invalid lambda response")
    })?;

    let mut response = Response::new(Body::from(envelope.body));
    *response.status_mut() = status;
    for (name, value) in envelope.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(endpoint = %target.endpoint, header = %name, "skipping invalid header"),
        }
    }
    debug!(endpoint = %target.endpoint, status = %status, "response ok");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode as AxumStatus, routing::post, Json};
    use serde_json::{json, Value};

    use super::*;
    use crate::testing::spawn_upstream;

    /// Fake sandbox that always answers with `status` and `payload`.
    async fn fixed_upstream(status: AxumStatus, payload: &'static str) -> u16 {
        let router = Router::new().route(
            INVOCATION_PATH,
            post(move || async move { (status, payload) }),
        );
        spawn_upstream(router).await.port()
    }

    /// Fake sandbox that returns the event it received as the body.
    async fn echo_upstream() -> u16 {
        let router = Router::new().route(
            INVOCATION_PATH,
            post(|event: String| async move {
                Json(json!({"statusCode": 200, "body": event}))
            }),
        );
        spawn_upstream(router).await.port()
    }

    fn router() -> RequestRouter {
        RequestRouter::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1",
            DEFAULT_SHUTDOWN_TIMEOUT,
        )
    }

    async fn serve_one(method: &str, path: &str, port: u16) -> (RequestRouter, String) {
        let router = router();
        router.add_route(method, path, port).unwrap();
        let addr = router.run().await.unwrap();
        (router, format!("http://{}", addr))
    }

    #[tokio::test]
    async fn test_pass_through_response() {
        let port = fixed_upstream(
            AxumStatus::OK,
            r#"{"statusCode":200,"body":"hi","headers":{"X":"1"}}"#,
        )
        .await;
        let (router, base) = serve_one("GET", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("x").unwrap(), "1");
        assert_eq!(resp.text().await.unwrap(), "hi");

        router.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_status_is_forwarded() {
        let port = fixed_upstream(
            AxumStatus::OK,
            r#"{"statusCode":201,"body":"created"}"#,
        )
        .await;
        let (_router, base) = serve_one("post", "/items", port).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/items", base))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.text().await.unwrap(), "created");
    }

    #[tokio::test]
    async fn test_null_envelope_fields_pass_through() {
        let port = fixed_upstream(
            AxumStatus::OK,
            r#"{"statusCode":204,"body":null,"headers":null}"#,
        )
        .await;
        let (_router, base) = serve_one("get", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 204);
        assert_eq!(resp.text().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_logical_status_is_bad_request() {
        let port = fixed_upstream(AxumStatus::OK, r#"{"statusCode":0,"body":"boom"}"#).await;
        let (_router, base) = serve_one("get", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.text().await.unwrap(), "boom");
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_internal_error() {
        let port = fixed_upstream(AxumStatus::SERVICE_UNAVAILABLE, "unavailable").await;
        let (_router, base) = serve_one("get", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), "bad status from lambda");
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_internal_error() {
        let port = fixed_upstream(AxumStatus::OK, "not json").await;
        let (_router, base) = serve_one("get", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), "invalid lambda response");
    }

    #[tokio::test]
    async fn test_out_of_range_status_is_internal_error() {
        let port = fixed_upstream(AxumStatus::OK, r#"{"statusCode":1000,"body":"x"}"#).await;
        let (_router, base) = serve_one("get", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 500);
    }

    #[tokio::test]
    async fn test_unreachable_sandbox_is_internal_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (_router, base) = serve_one("get", "/hello", port).await;

        let resp = reqwest::get(format!("{}/hello", base)).await.unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), "error sending request");
    }

    #[tokio::test]
    async fn test_event_body() {
        let port = echo_upstream().await;
        let router = router();
        router.add_route("post", "/echo", port).unwrap();
        router.add_route("get", "/echo", port).unwrap();
        let base = format!("http://{}", router.run().await.unwrap());
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/echo", base))
            .body(r#"{"name":"world"}"#)
            .send()
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body, json!({"name": "world"}));

        let resp = client.post(format!("{}/echo", base)).send().await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "{}");

        let resp = client.get(format!("{}/echo", base)).send().await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_method_matching() {
        let port = echo_upstream().await;
        let router = router();
        router.add_route("get", "/only-get", port).unwrap();
        router.add_route("any", "/anything", port).unwrap();
        router.add_route("get", "/items/{id}", port).unwrap();
        router.add_route("get", "/files/{proxy+}", port).unwrap();
        let base = format!("http://{}", router.run().await.unwrap());
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/only-get", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client.post(format!("{}/only-get", base)).send().await.unwrap();
        assert_eq!(resp.status(), 405);

        for method in [reqwest::Method::GET, reqwest::Method::PUT, reqwest::Method::PATCH] {
            let resp = client
                .request(method, format!("{}/anything", base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let resp = client.get(format!("{}/items/42", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client.get(format!("{}/files/a/b/c.txt", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client.get(format!("{}/missing", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        router.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_route_registration_rules() {
        let router = router();
        router.add_route("GET", "/hello", 9001).unwrap();
        assert!(router.add_route("get", "/hello", 9002).is_err());
        assert!(router.add_route("get", "hello", 9002).is_err());
        assert!(router.add_route("not a method", "/x", 9002).is_err());

        router.run().await.unwrap();
        assert!(router.add_route("post", "/late", 9003).is_err());
        assert!(router.run().await.is_err());
        router.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let port = echo_upstream().await;
        let (router, base) = serve_one("get", "/hello", port).await;
        router.shutdown().await.unwrap();

        // A fresh client so no pooled connection survives.
        let result = reqwest::Client::new()
            .get(format!("{}/hello", base))
            .send()
            .await;
        assert!(result.is_err());

        // Stopping twice, or a router that never ran, is fine.
        router.shutdown().await.unwrap();
        self::router().shutdown().await.unwrap();
    }

    #[test]
    fn test_axum_path() {
        assert_eq!(axum_path("/items/{id}").unwrap(), "/items/{id}");
        assert_eq!(axum_path("/{proxy+}").unwrap(), "/{*proxy}");
        assert_eq!(axum_path("/").unwrap(), "/");
        assert!(axum_path("relative").is_err());
        assert!(axum_path("/a/{proxy+}/b").is_err());
        assert!(axum_path("/a/{}").is_err());
        assert!(axum_path("/a/x{id}").is_err());
        assert!(axum_path("/a/{id}/{id}").is_err());
    }

    #[test]
    fn test_paths_conflict() {
        let conflict = |a: &str, b: &str| {
            paths_conflict(&parse_path(a).unwrap(), &parse_path(b).unwrap())
        };
        assert!(conflict("/items/{id}", "/items/{itemId}"));
        assert!(conflict("/items/{id}/tags", "/items/{itemId}/owner"));
        assert!(conflict("/files/{proxy+}", "/files/{path+}"));
        assert!(conflict("/files/{name}", "/files/{proxy+}"));
        assert!(!conflict("/items/{id}", "/items/{id}/tags"));
        assert!(!conflict("/items/{id}", "/items/latest"));
        assert!(!conflict("/items/{id}", "/orders/{orderId}"));
        assert!(!conflict("/items/{id}", "/items/{id}"));
    }

    #[tokio::test]
    async fn test_conflicting_routes_are_rejected_before_run() {
        let router = router();
        router.add_route("get", "/items/{id}", 9001).unwrap();
        assert!(router.add_route("delete", "/items/{itemId}", 9002).is_err());
        assert!(router.add_route("get", "/a/{proxy+}/b", 9003).is_err());
        router.add_route("delete", "/items/{id}", 9002).unwrap();
        router.add_route("get", "/items/{id}/tags", 9004).unwrap();

        router.run().await.unwrap();
        router.shutdown().await.unwrap();
    }

    #[test]
    fn test_carries_body() {
        assert!(carries_body(&Method::POST));
        assert!(carries_body(&Method::PUT));
        assert!(!carries_body(&Method::GET));
        assert!(!carries_body(&Method::DELETE));
    }
}
