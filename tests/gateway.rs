//! Integration tests that drive the gateway end to end against a `sh -c` stand-in for
//! `git http-backend`, covering body round trips in both pump modes, the CGI environment,
//! header edge cases, cancellation, and the axum router.

use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use git_http_gateway::{
    GatewayConfig, GatewayError, GitHttpGateway, GitHttpRequest, HeaderPolicy, PumpMode,
    protocol::{
        BodyStream, Identity, RequestMethod,
        core::{FsRepositoryResolver, StaticIdentityProvider},
        params::RequestHead,
        router,
    },
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

type StubGateway = GitHttpGateway<FsRepositoryResolver, StaticIdentityProvider>;

const ECHO_AFTER_HEADERS: &str =
    r"printf 'Content-Type: application/x-git-upload-pack-result\r\nCache-Control: no-cache\r\n\r\n'; cat";

/// Gateway whose backend is `sh -c <script>`, serving a `demo` repository in a temp dir.
fn stub_gateway(
    script: &str,
    pump_mode: PumpMode,
    header_policy: HeaderPolicy,
) -> (TempDir, StubGateway) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("demo.git")).unwrap();
    let config = GatewayConfig {
        base_path: dir.path().to_path_buf(),
        git_binary: "sh".to_string(),
        backend_args: vec!["-c".to_string(), script.to_string()],
        pump_mode,
        header_policy,
        ..GatewayConfig::default()
    };
    let gateway = GitHttpGateway::new(
        config,
        FsRepositoryResolver::new(dir.path()),
        StaticIdentityProvider::new(Identity::new("alice", "Alice", "alice@example.com")),
    );
    (dir, gateway)
}

fn request(
    method: RequestMethod,
    path_info: &str,
    headers: HeaderMap,
    body: Vec<Bytes>,
) -> GitHttpRequest {
    GitHttpRequest {
        head: RequestHead {
            method,
            repository: "demo".to_string(),
            path_info: path_info.to_string(),
            query: String::new(),
            headers,
            remote_addr: Some("127.0.0.1:40000".parse().unwrap()),
        },
        body: Box::pin(futures::stream::iter(
            body.into_iter().map(Ok::<_, io::Error>),
        )),
    }
}

fn get(path_info: &str) -> GitHttpRequest {
    request(RequestMethod::Get, path_info, HeaderMap::new(), vec![])
}

fn post(path_info: &str, body: Vec<Bytes>) -> GitHttpRequest {
    request(RequestMethod::Post, path_info, HeaderMap::new(), body)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) + 7) as u8).collect()
}

fn chunked(data: &[u8], size: usize) -> Vec<Bytes> {
    data.chunks(size).map(Bytes::copy_from_slice).collect()
}

async fn collect(mut body: BodyStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[tokio::test]
async fn test_round_trip_concurrent_large_payload() {
    let (_dir, gateway) =
        stub_gateway(ECHO_AFTER_HEADERS, PumpMode::Concurrent, HeaderPolicy::Strict);
    // Far larger than a pipe buffer: only works if stdout is read while stdin is written.
    let data = payload(2 * 1024 * 1024);
    let response = gateway.serve(post("/git-upload-pack", chunked(&data, 7919))).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.headers.get("content-type").unwrap(),
        "application/x-git-upload-pack-result"
    );
    assert_eq!(response.headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(collect(response.body).await.unwrap(), data);
}

#[tokio::test]
async fn test_round_trip_sequential() {
    let (_dir, gateway) =
        stub_gateway(ECHO_AFTER_HEADERS, PumpMode::Sequential, HeaderPolicy::Strict);
    let data = payload(4096);
    let response = gateway.serve(post("/git-receive-pack", chunked(&data, 100))).await.unwrap();
    assert_eq!(collect(response.body).await.unwrap(), data);
}

#[tokio::test]
async fn test_info_refs_environment() {
    let script = r#"printf 'X-Protocol: %s\r\nX-Path: %s\r\nX-Root: %s\r\nX-Cwd: %s\r\nX-Method: %s\r\nX-User: %s\r\n\r\n' "$HTTP_GIT_PROTOCOL" "$PATH_INFO" "$GIT_PROJECT_ROOT" "$PWD" "$REQUEST_METHOD" "$REMOTE_USER""#;
    let (dir, gateway) = stub_gateway(script, PumpMode::Concurrent, HeaderPolicy::Strict);
    let mut headers = HeaderMap::new();
    headers.insert("Git-Protocol", HeaderValue::from_static("version=2"));

    let response = gateway
        .serve(request(RequestMethod::Get, "/info/refs", headers, vec![]))
        .await
        .unwrap();
    let header = |name: &str| response.headers.get(name).unwrap().to_str().unwrap().to_string();

    let root = dir.path().join("demo.git");
    assert_eq!(header("x-protocol"), "version=2");
    assert_eq!(header("x-path"), "/info/refs");
    assert_eq!(header("x-root"), root.to_string_lossy());
    assert_eq!(
        Path::new(&header("x-cwd")).canonicalize().unwrap(),
        root.canonicalize().unwrap()
    );
    assert_eq!(header("x-method"), "GET");
    assert_eq!(header("x-user"), "alice");
    assert!(collect(response.body).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_terminator_then_eof_gives_empty_body() {
    let (_dir, gateway) =
        stub_gateway(r"printf 'A: 1\r\n\r\n'", PumpMode::Concurrent, HeaderPolicy::Strict);
    let response = gateway.serve(get("/HEAD")).await.unwrap();
    assert_eq!(response.headers.get("a").unwrap(), "1");
    assert!(collect(response.body).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_eof_before_terminator_is_permissive() {
    for script in ["true", r"printf 'A: 1'"] {
        let (_dir, gateway) =
            stub_gateway(script, PumpMode::Concurrent, HeaderPolicy::Permissive);
        let response = gateway.serve(get("/info/refs")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.is_empty(), "{script}");
        assert!(collect(response.body).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_malformed_header_strict_policy() {
    let (_dir, gateway) =
        stub_gateway(r"printf 'bogus\r\n\r\nbody'", PumpMode::Concurrent, HeaderPolicy::Strict);
    let err = gateway.serve(get("/info/refs")).await.err().unwrap();
    assert!(matches!(err, GatewayError::MalformedHeaders(_)));
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_malformed_header_permissive_policy() {
    let (_dir, gateway) = stub_gateway(
        r"printf 'A: 1\r\nbogus\r\n\r\nbody'",
        PumpMode::Concurrent,
        HeaderPolicy::Permissive,
    );
    let response = gateway.serve(get("/info/refs")).await.unwrap();
    assert_eq!(response.headers.get("a").unwrap(), "1");
    assert!(collect(response.body).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cgi_status_header() {
    let (_dir, gateway) = stub_gateway(
        r"printf 'Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nRepository not exported.'",
        PumpMode::Concurrent,
        HeaderPolicy::Strict,
    );
    let response = gateway.serve(get("/info/refs")).await.unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(response.headers.get("status").is_none());
    assert_eq!(collect(response.body).await.unwrap(), b"Repository not exported.");
}

#[tokio::test]
async fn test_concurrent_invocations_are_independent() {
    let (_dir, gateway) =
        stub_gateway(ECHO_AFTER_HEADERS, PumpMode::Concurrent, HeaderPolicy::Strict);
    let first = vec![b'a'; 300_000];
    let second = vec![b'b'; 200_000];

    let run = |data: Vec<u8>| {
        let gateway = &gateway;
        async move {
            let response = gateway
                .serve(post("/git-upload-pack", chunked(&data, 4096)))
                .await
                .unwrap();
            collect(response.body).await.unwrap()
        }
    };
    let (out_first, out_second) = tokio::join!(run(first.clone()), run(second.clone()));
    assert_eq!(out_first, first);
    assert_eq!(out_second, second);
}

#[tokio::test]
async fn test_missing_repository_never_spawns() {
    let (_dir, gateway) = stub_gateway("true", PumpMode::Concurrent, HeaderPolicy::Strict);
    let mut req = get("/info/refs");
    req.head.repository = "absent".to_string();

    let err = gateway.serve(req).await.err().unwrap();
    assert!(matches!(err, GatewayError::RepositoryNotFound(name) if name == "absent"));
}

#[tokio::test]
async fn test_wrong_method_and_unknown_endpoint() {
    let (_dir, gateway) = stub_gateway("true", PumpMode::Concurrent, HeaderPolicy::Strict);
    let err = gateway.serve(get("/git-receive-pack")).await.err().unwrap();
    assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);

    let err = gateway.serve(get("/config")).await.err().unwrap();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_spawn_failure_is_surfaced() {
    let (dir, _) = stub_gateway("true", PumpMode::Concurrent, HeaderPolicy::Strict);
    let config = GatewayConfig {
        base_path: dir.path().to_path_buf(),
        git_binary: "no-such-git-binary-on-path".to_string(),
        ..GatewayConfig::default()
    };
    let gateway = GitHttpGateway::new(
        config,
        FsRepositoryResolver::new(dir.path()),
        StaticIdentityProvider::new(Identity::default()),
    );
    let err = gateway.serve(get("/info/refs")).await.err().unwrap();
    assert!(matches!(err, GatewayError::Spawn { .. }));
}

/// Pid the stub backend wrote to `{dir}/backend.pid`, waiting for it to appear.
#[cfg(target_os = "linux")]
async fn backend_pid(dir: &Path) -> u32 {
    let path = dir.join("backend.pid");
    for _ in 0..500 {
        if let Some(pid) = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
        {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("backend never wrote {}", path.display());
}

/// A killed but not yet reaped child shows up as a zombie, which counts as stopped.
#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn wait_until_stopped(pid: u32) -> bool {
    for _ in 0..500 {
        if !is_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancel_while_parsing_headers() {
    let (dir, gateway) = stub_gateway(
        "echo $$ > ../backend.pid; exec sleep 30",
        PumpMode::Concurrent,
        HeaderPolicy::Strict,
    );
    let token = CancellationToken::new();
    let trigger = token.clone();
    let pid_dir = dir.path().to_path_buf();
    let watcher = tokio::spawn(async move {
        let pid = backend_pid(&pid_dir).await;
        assert!(is_running(pid));
        trigger.cancel();
        pid
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        gateway.serve_with_cancellation(get("/info/refs"), token),
    )
    .await
    .expect("cancellation did not abort the invocation");
    assert!(matches!(result, Err(GatewayError::Cancelled)));

    let pid = watcher.await.unwrap();
    assert!(wait_until_stopped(pid).await, "backend {pid} survived cancellation");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancel_while_streaming_body() {
    let (dir, gateway) = stub_gateway(
        r"echo $$ > ../backend.pid; printf 'A: 1\r\n\r\n'; exec sleep 30",
        PumpMode::Concurrent,
        HeaderPolicy::Strict,
    );
    let token = CancellationToken::new();
    let response = gateway
        .serve_with_cancellation(get("/info/refs"), token.clone())
        .await
        .unwrap();
    let pid = backend_pid(dir.path()).await;
    assert!(is_running(pid));

    token.cancel();
    let mut body = response.body;
    let item = tokio::time::timeout(Duration::from_secs(10), body.next())
        .await
        .expect("cancellation did not end the body stream");
    assert!(matches!(item, Some(Err(_))));
    assert!(body.next().await.is_none());
    assert!(wait_until_stopped(pid).await, "backend {pid} survived cancellation");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropping_body_mid_stream_kills_backend() {
    let (dir, gateway) = stub_gateway(
        r"echo $$ > ../backend.pid; printf 'A: 1\r\n\r\nfirst'; exec sleep 30",
        PumpMode::Concurrent,
        HeaderPolicy::Strict,
    );
    let response = gateway.serve(get("/info/refs")).await.unwrap();
    let pid = backend_pid(dir.path()).await;

    let mut body = response.body;
    assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"first"));
    assert!(is_running(pid));

    drop(body);
    assert!(wait_until_stopped(pid).await, "backend {pid} survived a dropped body");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_router_serves_repository_paths() {
    let script = r#"printf 'Content-Type: text/plain\r\n\r\n%s %s %s' "$QUERY_STRING" "$REMOTE_ADDR" "$PATH_INFO""#;
    let (_dir, gateway) = stub_gateway(script, PumpMode::Concurrent, HeaderPolicy::Strict);
    let app = router(Arc::new(gateway));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    let (body, missing, unknown) = tokio::task::spawn_blocking(move || {
        let mut ok = ureq::get(format!("http://{addr}/demo/info/refs?service=git-upload-pack"))
            .call()
            .unwrap();
        let body = ok.body_mut().read_to_string().unwrap();
        let missing = ureq::get(format!("http://{addr}/absent/info/refs")).call();
        let unknown = ureq::get(format!("http://{addr}/demo/objects/zz/nothex")).call();
        (body, missing, unknown)
    })
    .await
    .unwrap();

    assert_eq!(body, "service=git-upload-pack 127.0.0.1 /info/refs");
    assert!(matches!(missing, Err(ureq::Error::StatusCode(404))));
    assert!(matches!(unknown, Err(ureq::Error::StatusCode(400))));
}
