//! Integration tests for the explicit proxy

mod common;

use bytes::Bytes;
use common::*;
use mitm_hijack::http1::read_response_head;
use mitm_hijack::{
  basic_auth, CertificateManager, Hooks, HttpHijacker, MitmConfig, ProxyAuth, SniResolver,
  DROPPED_REQUEST_MESSAGE, DROPPED_RESPONSE_MESSAGE, LOOPBACK_MESSAGE,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};

/// Uppercases "origin" in responses, keeping the length
struct ShoutOrigin;

#[async_trait::async_trait]
impl HttpHijacker for ShoutOrigin {
  async fn hijack_response(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    _response: &http::Response<Bytes>,
    raw: Bytes,
    _remote_addr: Option<SocketAddr>,
  ) -> Option<Bytes> {
    Some(Bytes::from(
      String::from_utf8_lossy(&raw).replace("origin", "ORIGIN"),
    ))
  }
}

struct DropRequests;

#[async_trait::async_trait]
impl HttpHijacker for DropRequests {
  async fn hijack_request(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    _raw: Bytes,
  ) -> Option<Bytes> {
    None
  }
}

struct DropResponses;

#[async_trait::async_trait]
impl HttpHijacker for DropResponses {
  async fn hijack_response(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    _response: &http::Response<Bytes>,
    _raw: Bytes,
    _remote_addr: Option<SocketAddr>,
  ) -> Option<Bytes> {
    None
  }
}

struct Explodes;

#[async_trait::async_trait]
impl HttpHijacker for Explodes {
  async fn hijack_response(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    _response: &http::Response<Bytes>,
    _raw: Bytes,
    _remote_addr: Option<SocketAddr>,
  ) -> Option<Bytes> {
    panic!("hijacker bug")
  }
}

fn with_http(config: MitmConfig, hijacker: Arc<dyn HttpHijacker>) -> MitmConfig {
  MitmConfig {
    hooks: Hooks {
      http: Some(hijacker),
      ..config.hooks.clone()
    },
    ..config
  }
}

fn absolute_get(port: u16, path: &str) -> String {
  format!(
    "GET http://{host}:{port}{path} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n",
    host = ORIGIN_HOST,
    port = port,
    path = path
  )
}

#[tokio::test]
async fn test_root_persists_across_reloads() {
  let dir = temp_dir("persist");
  let first = CertificateManager::new(&dir).await.unwrap();
  let pem = first.ca_cert_pem().to_string();
  assert!(pem.contains("BEGIN CERTIFICATE"), "Invalid PEM format");
  assert!(dir.join("ca_cert.pem").exists(), "CA certificate file not created");
  assert!(dir.join("ca_key.pem").exists(), "CA key file not created");
  drop(first);

  let second = CertificateManager::new(&dir).await.unwrap();
  assert_eq!(second.ca_cert_pem(), pem, "reloaded root should be identical");
  cleanup(&dir);
}

#[tokio::test]
async fn test_leaf_cache_issues_once_per_host() {
  let dir = temp_dir("leaf-cache");
  let manager = Arc::new(CertificateManager::new(&dir).await.unwrap());

  let lookups = (0..16).map(|i| {
    let manager = manager.clone();
    async move {
      let host = if i % 2 == 0 { "a.test" } else { "b.test" };
      manager.leaf(host).await.unwrap()
    }
  });
  let leaves = futures::future::join_all(lookups).await;
  assert_eq!(manager.issued_count(), 2, "one issuance per distinct host");
  for pair in leaves.chunks(2).collect::<Vec<_>>().windows(2) {
    assert_eq!(pair[0][0].chain(), pair[1][0].chain(), "a.test leaves differ");
    assert_eq!(pair[0][1].chain(), pair[1][1].chain(), "b.test leaves differ");
  }
  assert_eq!(leaves[0].chain().len(), 2, "Expected leaf + root in chain");
  cleanup(&dir);
}

#[tokio::test]
async fn test_plaintext_end_to_end_with_keep_alive() {
  let dir = temp_dir("plaintext");
  let origin = spawn_origin(None).await;
  let (mirror, mut flows) = channel_mirror();
  let mut config = config(&dir);
  config.hooks.mirror = Some(mirror);
  let (proxy, _) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  for path in ["/hello", "/again"] {
    let response = round_trip(&mut client, &absolute_get(origin.port(), path)).await;
    assert_eq!(
      response.raw,
      Bytes::from(origin_response("GET", path, 0)),
      "pass-through must be byte identical"
    );
    let flow = next_flow(&mut flows).await;
    assert_eq!(
      flow.url,
      format!("http://{}:{}{}", ORIGIN_HOST, origin.port(), path)
    );
    assert!(
      !text(&flow.request).contains("Proxy-Connection"),
      "hop-by-hop headers must be stripped"
    );
    assert!(
      text(&flow.request).starts_with(&format!("GET {} HTTP/1.1\r\n", path)),
      "absolute-form must become origin-form"
    );
  }
  assert_eq!(origin.hits(), 2);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_https_end_to_end_with_response_hijack() {
  let dir = temp_dir("https");
  let origin_dir = temp_dir("https-origin");
  let origin = spawn_origin(Some(origin_tls_config(&origin_dir).await)).await;
  let (origin_mirror, mut origin_flows) = channel_mirror();
  let (mirror, mut flows) = channel_mirror();
  let mut config = with_http(config(&dir), Arc::new(ShoutOrigin));
  config.hooks.origin_mirror = Some(origin_mirror);
  config.hooks.mirror = Some(mirror);
  let (proxy, certs) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  let connect_request = format!(
    "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
    host = ORIGIN_HOST,
    port = origin.port()
  );
  client.get_mut().write_all(connect_request.as_bytes()).await.unwrap();
  let (head, _) = read_response_head(&mut client).await.unwrap();
  assert_eq!(head.status, http::StatusCode::OK, "CONNECT should be accepted");

  let tls = trusting_connector(&certs)
    .connect(server_name(ORIGIN_HOST), client.into_inner())
    .await
    .expect("client should trust the forged leaf");
  let mut tls = BufReader::new(tls);
  let request = format!(
    "GET /page HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
    ORIGIN_HOST,
    origin.port()
  );
  let response = round_trip(&mut tls, &request).await;
  assert_eq!(
    body_text(&response),
    "Example ORIGIN saw GET /page (0 body bytes)",
    "client should see the hijacked response"
  );

  let origin_flow = next_flow(&mut origin_flows).await;
  assert!(origin_flow.is_tls);
  assert!(
    text(&origin_flow.response).contains("Example origin saw GET /page"),
    "origin mirror should see the unmodified response"
  );
  let flow = next_flow(&mut flows).await;
  assert!(text(&flow.response).contains("Example ORIGIN saw"));
  assert_eq!(
    flow.url,
    format!("https://{}:{}/page", ORIGIN_HOST, origin.port())
  );
  assert_eq!(certs.issued_count(), 1);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
  cleanup(&origin_dir);
}

#[tokio::test]
async fn test_dropped_request_never_reaches_origin() {
  let dir = temp_dir("drop-request");
  let origin = spawn_origin(None).await;
  let (proxy, _) = start_proxy(with_http(config(&dir), Arc::new(DropRequests))).await;

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(&mut client, &absolute_get(origin.port(), "/secret")).await;
  assert_eq!(response.response.status(), http::StatusCode::OK);
  assert!(body_text(&response).contains(DROPPED_REQUEST_MESSAGE));
  assert_eq!(origin.hits(), 0, "dropped request must not be sent upstream");

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_dropped_response_sends_placeholder() {
  let dir = temp_dir("drop-response");
  let origin = spawn_origin(None).await;
  let (proxy, _) = start_proxy(with_http(config(&dir), Arc::new(DropResponses))).await;

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(&mut client, &absolute_get(origin.port(), "/")).await;
  let body = body_text(&response);
  assert!(body.contains(DROPPED_RESPONSE_MESSAGE));
  assert!(!body.contains("Example origin"), "no byte of the real body");
  assert_eq!(origin.hits(), 1);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_panicking_hijacker_passes_through() {
  let dir = temp_dir("panic");
  let origin = spawn_origin(None).await;
  let (proxy, _) = start_proxy(with_http(config(&dir), Arc::new(Explodes))).await;

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(&mut client, &absolute_get(origin.port(), "/p")).await;
  assert_eq!(response.raw, Bytes::from(origin_response("GET", "/p", 0)));

  let again = round_trip(&mut client, &absolute_get(origin.port(), "/q")).await;
  assert_eq!(
    again.raw,
    Bytes::from(origin_response("GET", "/q", 0)),
    "connection should survive a hook panic"
  );

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_oversized_response_is_streamed_unhijacked() {
  let dir = temp_dir("oversized");
  let origin = spawn_origin(None).await;
  let (mirror, mut flows) = channel_mirror();
  let mut config = with_http(config(&dir), Arc::new(ShoutOrigin));
  config.max_content_length = 1024;
  config.hooks.mirror = Some(mirror);
  let (proxy, _) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(&mut client, &absolute_get(origin.port(), "/big")).await;
  assert_eq!(response.response.body().len(), 4096);
  let flow = next_flow(&mut flows).await;
  assert!(flow.response_truncated, "flow should be marked truncated");
  assert!(text(&flow.response).ends_with("\r\n\r\n"), "only the head is recorded");

  let small = round_trip(&mut client, &absolute_get(origin.port(), "/small")).await;
  assert!(
    body_text(&small).contains("ORIGIN"),
    "small responses are still hijacked"
  );

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_proxy_auth_required() {
  let dir = temp_dir("auth");
  let origin = spawn_origin(None).await;
  let mut config = config(&dir);
  config.proxy_auth = Some(ProxyAuth::new("user", "pass"));
  let (proxy, _) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(&mut client, &absolute_get(origin.port(), "/")).await;
  assert_eq!(
    response.response.status(),
    http::StatusCode::PROXY_AUTHENTICATION_REQUIRED
  );
  let challenge = response
    .response
    .headers()
    .get("Proxy-Authenticate")
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default()
    .to_string();
  assert_eq!(challenge, "Basic realm=\"mitm-hijack proxy\", charset=\"UTF-8\"");
  assert_eq!(origin.hits(), 0);

  let mut client = connect(proxy.local_addr()).await;
  let request = format!(
    "GET http://{host}:{port}/ HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Authorization: {auth}\r\n\r\n",
    host = ORIGIN_HOST,
    port = origin.port(),
    auth = basic_auth("user", "pass")
  );
  let response = round_trip(&mut client, &request).await;
  assert_eq!(response.response.status(), http::StatusCode::OK);
  assert_eq!(origin.hits(), 1);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_control_plane_serves_root_certificate() {
  let dir = temp_dir("control");
  let (proxy, certs) = start_proxy(config(&dir)).await;

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(
    &mut client,
    "GET http://mitm.local/download-ca HTTP/1.1\r\nHost: mitm.local\r\n\r\n",
  )
  .await;
  assert_eq!(body_text(&response), certs.ca_cert_pem());
  let disposition = response
    .response
    .headers()
    .get("Content-Disposition")
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default()
    .to_string();
  assert!(disposition.contains("mitm-server.crt"));

  let status = round_trip(
    &mut client,
    "GET http://download-mitm-ca.com/ HTTP/1.1\r\nHost: download-mitm-ca.com\r\n\r\n",
  )
  .await;
  assert!(body_text(&status).contains("/download-ca"));

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_gm_tls_is_rejected() {
  let dir = temp_dir("gm");
  let config = MitmConfig {
    gm_tls: true,
    ..config(&dir)
  };
  let result = mitm_hijack::ProxyServer::builder().config(config).build().await;
  assert!(
    matches!(result, Err(mitm_hijack::Error::ConfigError(_))),
    "GM TLS must be rejected at build time"
  );
  cleanup(&dir);
}

fn absolute_post(port: u16, path: &str, body: &str) -> String {
  format!(
    "POST http://{host}:{port}{path} HTTP/1.1\r\nHost: {host}:{port}\r\nContent-Length: {len}\r\n\r\n{body}",
    host = ORIGIN_HOST,
    port = port,
    path = path,
    len = body.len(),
    body = body
  )
}

#[tokio::test]
async fn test_absurd_content_length_is_refused_and_proxy_survives() {
  let dir = temp_dir("huge-length");
  let origin = spawn_origin(None).await;
  let (proxy, _) = start_proxy(config(&dir)).await;

  let mut client = connect(proxy.local_addr()).await;
  let request = format!(
    "POST http://{host}:{port}/ HTTP/1.1\r\nHost: {host}:{port}\r\nContent-Length: 100000000000000\r\n\r\nabc",
    host = ORIGIN_HOST,
    port = origin.port()
  );
  let response = round_trip(&mut client, &request).await;
  assert_eq!(response.response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
  assert_eq!(origin.hits(), 0);

  let mut other = connect(proxy.local_addr()).await;
  let response = round_trip(&mut other, &absolute_get(origin.port(), "/after")).await;
  assert_eq!(
    body_text(&response),
    "Example origin saw GET /after (0 body bytes)",
    "other clients are still served"
  );

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_request_body_limit_is_configurable() {
  let dir = temp_dir("request-limit");
  let origin = spawn_origin(None).await;
  let config = MitmConfig {
    max_request_body: 16,
    ..config(&dir)
  };
  let (proxy, _) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  let fits = round_trip(&mut client, &absolute_post(origin.port(), "/up", &"a".repeat(16))).await;
  assert_eq!(body_text(&fits), "Example origin saw POST /up (16 body bytes)");
  let over = round_trip(&mut client, &absolute_post(origin.port(), "/up", &"a".repeat(17))).await;
  assert_eq!(over.response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
  assert_eq!(origin.hits(), 1);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_sni_remap_applies_to_upstream_handshake() {
  let dir = temp_dir("sni-remap");
  let origin_dir = temp_dir("sni-remap-origin");
  let origin = spawn_origin(Some(origin_tls_config(&origin_dir).await)).await;
  let config = MitmConfig {
    sni: SniResolver::builder()
      .exact(ORIGIN_HOST, "renamed.test")
      .build()
      .unwrap(),
    ..config(&dir)
  };
  let (proxy, certs) = start_proxy(config).await;

  let tunnel = open_tunnel(proxy.local_addr(), ORIGIN_HOST, origin.port()).await;
  let tls = trusting_connector(&certs)
    .connect(server_name(ORIGIN_HOST), tunnel)
    .await
    .expect("client should trust the forged leaf");
  let mut tls = BufReader::new(tls);
  let request = format!(
    "GET /renamed HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
    ORIGIN_HOST,
    origin.port()
  );
  let response = round_trip(&mut tls, &request).await;
  assert_eq!(
    body_text(&response),
    "Example origin saw GET /renamed (0 body bytes)"
  );

  let snis = origin.snis();
  assert!(!snis.is_empty());
  assert!(
    snis.iter().all(|sni| sni == "renamed.test"),
    "upstream saw SNI {:?}",
    snis
  );

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
  cleanup(&origin_dir);
}

#[tokio::test]
async fn test_failed_post_on_reused_connection_is_not_resent() {
  let dir = temp_dir("no-resend");
  let origin = spawn_one_answer_origin().await;
  let (proxy, _) = start_proxy(config(&dir)).await;

  let mut client = connect(proxy.local_addr()).await;
  let first = round_trip(&mut client, &absolute_get(origin.port(), "/first")).await;
  assert_eq!(first.response.status(), http::StatusCode::OK);
  let post = round_trip(&mut client, &absolute_post(origin.port(), "/pay", "x")).await;
  assert_eq!(post.response.status(), http::StatusCode::BAD_GATEWAY);
  assert_eq!(origin.hits(), 2, "the POST reached the origin exactly once");

  let mut client = connect(proxy.local_addr()).await;
  round_trip(&mut client, &absolute_get(origin.port(), "/one")).await;
  let retried = round_trip(&mut client, &absolute_get(origin.port(), "/two")).await;
  assert_eq!(
    body_text(&retried),
    "Example origin saw GET /two (0 body bytes)",
    "GET is redialed after the kept-alive connection fails"
  );
  assert_eq!(origin.hits(), 5);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_request_for_the_proxy_itself_is_answered_locally() {
  let dir = temp_dir("explicit-loopback");
  let mut config = config(&dir);
  config
    .hosts
    .insert("loop.test".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST));
  let (proxy, _) = start_proxy(config).await;
  let port = proxy.local_addr().port();

  let mut client = connect(proxy.local_addr()).await;
  let origin_form = format!("GET / HTTP/1.1\r\nHost: loop.test:{}\r\n\r\n", port);
  let response = round_trip(&mut client, &origin_form).await;
  assert_eq!(response.response.status(), http::StatusCode::OK);
  assert!(body_text(&response).contains(LOOPBACK_MESSAGE));

  let mut client = connect(proxy.local_addr()).await;
  let absolute = format!(
    "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
    port = port
  );
  let response = round_trip(&mut client, &absolute).await;
  assert!(body_text(&response).contains(LOOPBACK_MESSAGE));

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

