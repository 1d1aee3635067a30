//! End-to-end tests for the request pipeline
//!
//! A fake wwwhisper backend is served by axum on a random port; the
//! application is an in-process router wrapped by the gateway middleware and
//! driven with `oneshot`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tower::ServiceExt;
use url::Url;

use wwwhisper_gateway::config::GatewayMode;
use wwwhisper_gateway::gateway::decision::{CLIENT_AGENT, IS_AUTHORIZED_PATH};
use wwwhisper_gateway::gateway::rewrite::INJECTED_SNIPPET;
use wwwhisper_gateway::gateway::{Gateway, RemoteUser, create_router};

const TEST_USER: &str = "foo@example.com";
const HTML_DOC: &str = "<html><body><b>Hello World</body></html>";

/// One request as seen by the fake backend
#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query_path: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last(&self) -> Recorded {
        self.requests.lock().unwrap().last().cloned().expect("backend not called")
    }
}

/// Serve a fake auth backend answering every request with `reply`
async fn spawn_backend<F>(reply: F) -> (Url, Recorder)
where
    F: Fn(&Recorded) -> Response + Clone + Send + Sync + 'static,
{
    let recorder = Recorder::default();
    let rec = recorder.clone();

    let router = Router::new().fallback(move |request: Request<Body>| {
        let rec = rec.clone();
        let reply = reply.clone();
        async move {
            let (parts, body) = request.into_parts();
            let body = to_bytes(body, usize::MAX).await.unwrap();
            let query_path = parts.uri.query().and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == "path")
                    .map(|(_, v)| v.into_owned())
            });
            let recorded = Recorded {
                method: parts.method,
                path: parts.uri.path().to_string(),
                query_path,
                headers: parts.headers,
                body,
            };
            let response = reply(&recorded);
            rec.requests.lock().unwrap().push(recorded);
            response
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (Url::parse(&format!("http://{addr}")).unwrap(), recorder)
}

fn granted(_: &Recorded) -> Response {
    (StatusCode::OK, [("User", TEST_USER)]).into_response()
}

fn open_location_granted(_: &Recorded) -> Response {
    StatusCode::OK.into_response()
}

fn login_required(_: &Recorded) -> Response {
    (StatusCode::UNAUTHORIZED, "Login required").into_response()
}

fn denied(_: &Recorded) -> Response {
    (StatusCode::FORBIDDEN, "Not authorized").into_response()
}

/// Application counting its invocations and recording the identity it saw
#[derive(Clone, Default)]
struct TestApp {
    calls: Arc<AtomicUsize>,
    seen_user: Arc<Mutex<Option<Option<String>>>>,
}

impl TestApp {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen_user(&self) -> Option<String> {
        self.seen_user
            .lock()
            .unwrap()
            .clone()
            .expect("application not invoked")
    }

    /// Router answering every request with `respond`
    fn router<F>(&self, respond: F) -> Router
    where
        F: Fn() -> Response + Clone + Send + Sync + 'static,
    {
        let app = self.clone();
        Router::new().fallback(move |request: Request<Body>| {
            let app = app.clone();
            let respond = respond.clone();
            async move {
                app.calls.fetch_add(1, Ordering::SeqCst);
                let user = request
                    .extensions()
                    .get::<RemoteUser>()
                    .map(|u| u.as_str().to_string());
                *app.seen_user.lock().unwrap() = Some(user);
                respond()
            }
        })
    }
}

fn html_doc() -> Response {
    ([(header::CONTENT_TYPE, "text/html")], HTML_DOC).into_response()
}

fn enforcing(backend_url: Url) -> Gateway {
    Gateway::new(
        GatewayMode::Enforcing { backend_url },
        Duration::from_secs(5),
        1024 * 1024,
    )
    .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_string(response: Response) -> String {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_disabled_gateway_bypasses_backend() {
    let (_, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let gateway = Gateway::new(GatewayMode::Disabled, Duration::from_secs(5), 1024).unwrap();
    let router = create_router(gateway, app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, HTML_DOC);
    assert_eq!(backend.calls(), 0);
    assert_eq!(app.calls(), 1);
    assert_eq!(app.seen_user(), None);
}

#[tokio::test]
async fn test_request_allowed() {
    let (url, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(backend.calls(), 1);
    let query = backend.last();
    assert_eq!(query.path, IS_AUTHORIZED_PATH);
    assert_eq!(query.query_path.as_deref(), Some("/foo/bar"));

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["user"], TEST_USER);
    assert!(body_string(response).await.contains("Hello World"));
    assert_eq!(app.seen_user().as_deref(), Some(TEST_USER));
}

#[tokio::test]
async fn test_open_location_request_allowed() {
    let (url, backend) = spawn_backend(open_location_granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/")).await.unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.last().query_path.as_deref(), Some("/"));
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("user").is_none());
    assert!(body_string(response).await.contains("Hello World"));
    assert_eq!(app.seen_user(), None);
}

#[tokio::test]
async fn test_login_required() {
    let (url, backend) = spawn_backend(login_required).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("user").is_none());
    assert_eq!(body_string(response).await, "Login required");
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_request_denied() {
    let (url, backend) = spawn_backend(denied).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().get("user").is_none());
    assert_eq!(body_string(response).await, "Not authorized");
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_blocked_response_keeps_backend_content_type() {
    let (url, _backend) = spawn_backend(|_: &Recorded| {
        (
            StatusCode::UNAUTHORIZED,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            "<html><body>Sign in</body></html>",
        )
            .into_response()
    })
    .await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/admin")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );
    assert_eq!(body_string(response).await, "<html><body>Sign in</body></html>");
}

#[tokio::test]
async fn test_script_injected_to_html_response() {
    let (url, _backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_length = response.headers()[header::CONTENT_LENGTH].clone();
    let body = body_string(response).await;
    assert!(body.contains("Hello World"));
    assert_eq!(body.matches(r#"<script type="text/javascript" src="/wwwhisper/"#).count(), 1);
    assert_eq!(
        body,
        format!("<html><body><b>Hello World{INJECTED_SNIPPET}</body></html>")
    );
    assert_eq!(content_length, body.len().to_string().as_str());
}

#[tokio::test]
async fn test_non_html_response_unchanged() {
    let (url, _backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(
        enforcing(url),
        app.router(|| ([(header::CONTENT_TYPE, "text/plain")], HTML_DOC).into_response()),
    );

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, HTML_DOC);
    assert_eq!(app.seen_user().as_deref(), Some(TEST_USER));
}

#[tokio::test]
async fn test_head_response_for_html_left_untouched() {
    let (url, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(
        enforcing(url),
        app.router(|| {
            let mut response = Response::new(Body::empty());
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(HTML_DOC.len()));
            response
        }),
    );

    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/foo/bar")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["user"], TEST_USER);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        HTML_DOC.len().to_string()
    );
    assert_eq!(body_string(response).await, "");
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_response_body_combined() {
    let (url, _backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(
        enforcing(url),
        app.router(|| {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(b"abc")),
                Ok(Bytes::from_static(b"def")),
                Ok(Bytes::from_static(b"ghi")),
            ];
            (
                [(header::CONTENT_TYPE, "text/plain")],
                Body::from_stream(futures::stream::iter(chunks)),
            )
                .into_response()
        }),
    );

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "abcdefghi");
}

#[tokio::test]
async fn test_auth_query_not_sent_for_login_request() {
    let (url, backend) = spawn_backend(|_: &Recorded| {
        ([(header::CONTENT_TYPE, "text/plain")], "Login page").into_response()
    })
    .await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router
        .oneshot(get("/wwwhisper/auth/api/login"))
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.last().path, "/wwwhisper/auth/api/login");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("user").is_none());
    assert_eq!(body_string(response).await, "Login page");
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_passthrough_forwards_verbatim() {
    let (url, backend) = spawn_backend(|_: &Recorded| {
        (
            StatusCode::FOUND,
            [
                (header::LOCATION, "/wwwhisper/admin/"),
                (header::SET_COOKIE, "wwwhisper-auth=new; Path=/"),
                (header::CONTENT_TYPE, "text/html"),
            ],
            "<html><body>moved</body></html>",
        )
            .into_response()
    })
    .await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/wwwhisper/auth/api/login/?next=%2Fadmin")
        .header(header::COOKIE, "session=1; wwwhisper-csrftoken=abc")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"email":"foo@example.com"}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    let seen = backend.last();
    assert_eq!(backend.calls(), 1);
    assert_eq!(seen.method, Method::POST);
    assert_eq!(seen.path, "/wwwhisper/auth/api/login/");
    assert_eq!(&seen.body[..], br#"{"email":"foo@example.com"}"#);
    assert_eq!(seen.headers[header::COOKIE], "session=1; wwwhisper-csrftoken=abc");
    assert_eq!(seen.headers[header::CONTENT_TYPE], "application/json");

    // Redirect is relayed, not followed, and HTML is not rewritten.
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/wwwhisper/admin/");
    assert_eq!(
        response.headers()[header::SET_COOKIE],
        "wwwhisper-auth=new; Path=/"
    );
    assert_eq!(body_string(response).await, "<html><body>moved</body></html>");
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_auth_cookies_passed_to_backend() {
    let (url, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let request = Request::builder()
        .uri("/foo/bar")
        .header(header::COOKIE, "wwwhisper-auth=xyz; wwwhisper-csrftoken=abc")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        backend.last().headers[header::COOKIE],
        "wwwhisper-auth=xyz; wwwhisper-csrftoken=abc"
    );
}

#[tokio::test]
async fn test_non_auth_cookies_not_passed_to_backend() {
    let (url, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let request = Request::builder()
        .uri("/foo/bar")
        .header(
            header::COOKIE,
            "session=123; wwwhisper-auth=xyz; settings=foobar; wwwhisper-csrftoken=abc",
        )
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        backend.last().headers[header::COOKIE],
        "wwwhisper-auth=xyz; wwwhisper-csrftoken=abc"
    );
    assert!(body_string(response).await.contains("Hello World"));
}

#[tokio::test]
async fn test_no_cookie_header_when_nothing_to_forward() {
    let (url, backend) = spawn_backend(open_location_granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let request = Request::builder()
        .uri("/")
        .header(header::COOKIE, "session=123")
        .body(Body::empty())
        .unwrap();
    router.oneshot(request).await.unwrap();

    assert!(backend.last().headers.get(header::COOKIE).is_none());
}

#[tokio::test]
async fn test_library_version_passed_to_backend() {
    let (url, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.last().headers[header::USER_AGENT], CLIENT_AGENT);
}

#[tokio::test]
async fn test_auth_query_ignores_request_method_and_body() {
    let (url, backend) = spawn_backend(granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/items/42?force=true")
        .body(Body::from("payload"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    let query = backend.last();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(query.method, Method::GET);
    assert!(query.body.is_empty());
    assert_eq!(query.query_path.as_deref(), Some("/items/42"));
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_backend_unreachable_fails_closed() {
    // Reserve a port, then free it so nothing listens there.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);

    let app = TestApp::default();
    let url = Url::parse(&format!("http://{addr}")).unwrap();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_unexpected_backend_status_is_error_not_denial() {
    let (url, backend) = spawn_backend(|_: &Recorded| {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
    })
    .await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let response = router.oneshot(get("/foo/bar")).await.unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_ne!(body_string(response).await, "boom");
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_one_backend_call_per_request() {
    let (url, backend) = spawn_backend(denied).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    for expected in 1..=3 {
        let response = router.clone().oneshot(get("/secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(backend.calls(), expected);
    }
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_client_supplied_user_header_is_not_identity() {
    let (url, _backend) = spawn_backend(open_location_granted).await;
    let app = TestApp::default();
    let router = create_router(enforcing(url), app.router(html_doc));

    let request = Request::builder()
        .uri("/")
        .header("User", "mallory@example.com")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("user").is_none());
    assert_eq!(app.seen_user(), None);
}
